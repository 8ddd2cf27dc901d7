//! Per-CPU register snapshots from the kernel's crash_notes ELF notes.
use crate::arch::eframe::PtRegs;
use crate::error::AnalysisError;
use crate::memory::KernelMemory;
use crate::symbols::{SymbolLookup, TypeInfo};
use goblin::elf::note::NT_PRSTATUS;
use log::debug;

const NOTE_HEADER_SIZE: usize = 12; // n_namesz, n_descsz, n_type
const DEFAULT_NOTE_BUF_SIZE: u64 = 424;
const DEFAULT_PR_REG_OFFSET: u64 = 0x70;
/// x0..x30, sp, pc, pstate
const ELF_NGREG: usize = 34;

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

/// Read the NT_PRSTATUS note of every CPU. Any bad note discards the whole
/// set; callers treat that as "panic registers unavailable".
pub fn extract_panic_regs(
    mem: &dyn KernelMemory,
    symbols: &dyn SymbolLookup,
    types: &dyn TypeInfo,
    cpus: usize,
) -> Result<Vec<PtRegs>, AnalysisError> {
    let crash_notes = symbols
        .symbol_value("crash_notes")
        .ok_or_else(|| AnalysisError::SymbolNotFound("crash_notes".to_string()))?;

    let base = mem
        .read_kernel_u64(crash_notes)
        .map_err(|_| AnalysisError::InvalidCrashNote("cannot read crash_notes".to_string()))?;

    let per_cpu_offset = symbols.symbol_value("__per_cpu_offset");
    let note_buf_size = types.struct_size("note_buf_t").unwrap_or(DEFAULT_NOTE_BUF_SIZE) as usize;
    let pr_reg = types
        .member_offset("elf_prstatus", "pr_reg")
        .unwrap_or(DEFAULT_PR_REG_OFFSET) as usize;

    let mut regs = Vec::with_capacity(cpus);
    for cpu in 0..cpus {
        let note_addr = match per_cpu_offset {
            Some(table) => {
                let offset = mem.read_kernel_u64(table + cpu as u64 * 8).map_err(|_| {
                    AnalysisError::InvalidCrashNote(format!("cannot read __per_cpu_offset[{}]", cpu))
                })?;
                base.wrapping_add(offset)
            }
            None => base,
        };

        let buf = mem
            .read_kernel_bytes(note_addr, note_buf_size)
            .map_err(|_| AnalysisError::InvalidCrashNote(format!("failed to read note_buf_t for cpu {}", cpu)))?;
        regs.push(parse_note(&buf, pr_reg, cpu)?);
        debug!("cpu {}: crash note at {:x}", cpu, note_addr);
    }

    Ok(regs)
}

fn parse_note(buf: &[u8], pr_reg: usize, cpu: usize) -> Result<PtRegs, AnalysisError> {
    if buf.len() < NOTE_HEADER_SIZE + 4 {
        return Err(AnalysisError::InvalidCrashNote(format!("cpu {}: note too short", cpu)));
    }

    let namesz = u32_at(buf, 0) as usize;
    let n_type = u32_at(buf, 8);
    if n_type != NT_PRSTATUS {
        return Err(AnalysisError::InvalidCrashNote(format!(
            "cpu {}: n_type != NT_PRSTATUS",
            cpu
        )));
    }
    if &buf[NOTE_HEADER_SIZE..NOTE_HEADER_SIZE + 4] != b"CORE" {
        return Err(AnalysisError::InvalidCrashNote(format!(
            "cpu {}: name != \"CORE\"",
            cpu
        )));
    }

    let payload = (NOTE_HEADER_SIZE + namesz + 3) & !3;
    let start = payload + pr_reg;
    let end = start + ELF_NGREG * 8;
    if end > buf.len() {
        return Err(AnalysisError::InvalidCrashNote(format!(
            "cpu {}: pr_reg outside note buffer",
            cpu
        )));
    }

    let mut raw = buf[start..end].to_vec();
    // orig_x0 and syscallno are not part of the ELF register set
    raw.resize(raw.len() + 16, 0);
    PtRegs::from_bytes(&raw)
        .ok_or_else(|| AnalysisError::InvalidCrashNote(format!("cpu {}: short register block", cpu)))
}

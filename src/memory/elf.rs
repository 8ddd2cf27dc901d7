//! ELF vmcore (kdump) support: physical segments and the VMCOREINFO note
use crate::error::AnalysisError;
use crate::memory::MemoryRegion;
use goblin::elf::header::EM_AARCH64;
use goblin::elf::program_header::{PT_LOAD, PT_NOTE};
use goblin::elf::Elf;
use std::collections::HashMap;

/// Segments and metadata extracted from an ELF vmcore header.
pub struct ElfVmcore {
    pub regions: Vec<MemoryRegion>,
    pub vmcoreinfo: HashMap<String, String>,
}

pub fn is_elf(data: &[u8]) -> bool {
    data.len() >= 4 && &data[0..4] == b"\x7fELF"
}

/// Parse the program headers of an ELF vmcore.
///
/// PT_LOAD segments are indexed by their physical address; segments without a
/// usable `p_paddr` (all ones, as /proc/kcore reports for non-linear areas)
/// are skipped.
pub fn parse_vmcore(data: &[u8]) -> Result<ElfVmcore, AnalysisError> {
    let elf = Elf::parse(data)
        .map_err(|e| AnalysisError::ParseError(format!("invalid ELF vmcore: {}", e)))?;

    if elf.header.e_machine != EM_AARCH64 {
        log::warn!(
            "ELF vmcore machine type is {} (expected EM_AARCH64)",
            elf.header.e_machine
        );
    }

    let mut regions: Vec<MemoryRegion> = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0 && ph.p_paddr != u64::MAX)
        .map(|ph| MemoryRegion {
            start: ph.p_paddr,
            end: ph.p_paddr + ph.p_filesz - 1,
            file_offset: ph.p_offset,
        })
        .collect();
    regions.sort_by_key(|r| r.start);

    if regions.is_empty() {
        return Err(AnalysisError::MemoryMapError(
            "ELF vmcore has no loadable physical segments".to_string(),
        ));
    }

    let mut vmcoreinfo = HashMap::new();
    if elf.program_headers.iter().any(|ph| ph.p_type == PT_NOTE) {
        if let Some(notes) = elf.iter_note_headers(data) {
            for note in notes.flatten() {
                if note.name.trim_end_matches('\0') == "VMCOREINFO" {
                    let text = String::from_utf8_lossy(note.desc);
                    vmcoreinfo.extend(parse_vmcoreinfo(&text));
                }
            }
        }
    }

    log::debug!(
        "ELF vmcore: {} PT_LOAD segments, {} VMCOREINFO entries",
        regions.len(),
        vmcoreinfo.len()
    );

    Ok(ElfVmcore {
        regions,
        vmcoreinfo,
    })
}

/// Parse the `KEY=VALUE` lines of a VMCOREINFO note.
pub fn parse_vmcoreinfo(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

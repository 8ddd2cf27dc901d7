//! Exception frames (struct pt_regs) found on kernel stacks and in crash notes.
use crate::arch::stack::StackBuffer;
use crate::symbols::SymbolLookup;
use serde::Serialize;
use std::io::Write;

pub const PT_REGS_SIZE: u64 = 288;
/// The user-mode frame sits this far below the top of the kernel stack.
pub const USER_EFRAME_OFFSET: u64 = 304;

const PSR_MODE32_BIT: u64 = 0x10;
const PSR_MODE_MASK: u64 = 0xf;
const PSR_MODE_EL0T: u64 = 0x0;
const PSR_MODE_EL1T: u64 = 0x4;
const PSR_MODE_EL1H: u64 = 0x5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExceptionMode {
    Kernel,
    User,
}

/// Saved register state: x0..x30, sp, pc, pstate, orig_x0, syscallno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PtRegs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub orig_x0: u64,
    pub syscallno: u64,
}

impl PtRegs {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PT_REGS_SIZE as usize {
            return None;
        }
        let word = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(buf)
        };

        let mut regs = [0u64; 31];
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = word(i);
        }
        Some(PtRegs {
            regs,
            sp: word(31),
            pc: word(32),
            pstate: word(33),
            orig_x0: word(34),
            syscallno: word(35),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PT_REGS_SIZE as usize);
        for value in self
            .regs
            .iter()
            .chain([self.sp, self.pc, self.pstate, self.orig_x0, self.syscallno].iter())
        {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn fp(&self) -> u64 {
        self.regs[29]
    }

    pub fn lr(&self) -> u64 {
        self.regs[30]
    }

    pub fn is_compat(&self) -> bool {
        self.pstate & PSR_MODE32_BIT != 0
    }

    pub fn is_user_mode(&self) -> bool {
        self.is_compat() || self.pstate & PSR_MODE_MASK == PSR_MODE_EL0T
    }

    /// Plausibility test for a kernel-mode frame at an arbitrary stack slot.
    pub fn is_kernel_exception_frame(&self, stack: &StackBuffer, symbols: &dyn SymbolLookup) -> bool {
        if !stack.contains(self.sp) || !stack.contains(self.fp()) {
            return false;
        }
        if self.pstate & (0xffff_ffff_0000_0000 | PSR_MODE32_BIT) != 0 {
            return false;
        }
        if !symbols.is_kernel_text(self.pc) || !symbols.is_kernel_text(self.lr()) {
            return false;
        }
        matches!(self.pstate & PSR_MODE_MASK, PSR_MODE_EL1T | PSR_MODE_EL1H)
    }

    /// (lr, sp, highest printed register) for the frame's instruction set.
    fn frame_registers(&self, compat: bool) -> (u64, u64, usize) {
        if compat {
            (self.regs[14], self.regs[13], 12)
        } else {
            (self.lr(), self.sp, 29)
        }
    }

    /// Every value a reference search compares: pc, lr, sp, pstate, the
    /// general registers, and orig_x0/syscallno for 64-bit frames.
    pub fn reference_values(&self, mode: ExceptionMode) -> Vec<u64> {
        let compat = mode == ExceptionMode::User && self.is_compat();
        let (lr, sp, top_reg) = self.frame_registers(compat);

        let mut values = vec![self.pc, lr, sp, self.pstate];
        values.extend_from_slice(&self.regs[..=top_reg]);
        if !compat {
            values.push(self.orig_x0);
            values.push(self.syscallno);
        }
        values
    }

    /// The register set in crash-style layout.
    pub fn render(
        &self,
        mode: ExceptionMode,
        symbols: &dyn SymbolLookup,
        line_numbers: bool,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        let compat = mode == ExceptionMode::User && self.is_compat();
        let (lr, sp, top_reg) = self.frame_registers(compat);
        let rows = if compat { 4 } else { 3 };

        match mode {
            ExceptionMode::User if compat => write!(
                out,
                "     PC: {:08x}  LR: {:08x}  SP: {:08x}  PSTATE: {:08x}\n    ",
                self.pc, lr, sp, self.pstate
            )?,
            ExceptionMode::User => write!(
                out,
                "     PC: {:016x}   LR: {:016x}   SP: {:016x}\n    ",
                self.pc, lr, sp
            )?,
            ExceptionMode::Kernel => {
                writeln!(out, "     PC: {:016x}  {}", self.pc, text_label(symbols, self.pc))?;
                writeln!(out, "     LR: {:016x}  {}", lr, text_label(symbols, lr))?;
                write!(out, "     SP: {:016x}  PSTATE: {:08x}\n    ", sp, self.pstate)?;
            }
        }

        for (r, i) in (0..=top_reg).rev().enumerate() {
            let r = r + 1;
            write!(out, "{}X{}: ", if i < 10 { " " } else { "" }, i)?;
            if compat {
                write!(out, "{:08x}", self.regs[i])?;
            } else {
                write!(out, "{:016x}", self.regs[i])?;
            }

            if i == 0 && compat {
                writeln!(out)?;
            } else if i == 0 || r % rows == 0 {
                write!(out, "\n    ")?;
            } else {
                write!(out, "{}", if compat { " " } else { "  " })?;
            }
        }

        if !compat {
            write!(out, "ORIG_X0: {:016x}  SYSCALLNO: {:x}", self.orig_x0, self.syscallno)?;
            if mode == ExceptionMode::User {
                write!(out, "  PSTATE: {:08x}", self.pstate)?;
            }
            writeln!(out)?;
        }

        if line_numbers && symbols.is_kernel_text(self.pc) {
            if let Some(line) = symbols.line_number(self.pc) {
                writeln!(out, "  {}", line)?;
            }
        }

        Ok(())
    }
}

fn text_label(symbols: &dyn SymbolLookup, addr: u64) -> String {
    if symbols.is_kernel_text(addr) {
        if let Some(m) = symbols.value_search(addr) {
            return format!("[{}]", m.to_symstr());
        }
    }
    "[unknown or invalid address]".to_string()
}

/// An exception frame located on a stack.
#[derive(Debug, Clone, Serialize)]
pub struct EframeHit {
    pub addr: u64,
    pub mode: ExceptionMode,
    pub regs: PtRegs,
}

/// Parse the frame at `addr` if it lies entirely in the stack buffer.
pub fn frame_at(stack: &StackBuffer, addr: u64, size: u64) -> Option<PtRegs> {
    stack
        .slice(addr, size.max(PT_REGS_SIZE) as usize)
        .and_then(PtRegs::from_bytes)
}

/// Every aligned slot in [base, top - size) that holds a plausible
/// kernel-mode frame, followed by the user-mode frame for user tasks.
pub fn search(
    stack: &StackBuffer,
    symbols: &dyn SymbolLookup,
    pt_regs_size: u64,
    kernel_thread: bool,
) -> Vec<EframeHit> {
    let mut hits = Vec::new();
    let limit = stack.top().saturating_sub(pt_regs_size);

    let mut ptr = stack.base();
    while ptr < limit {
        if let Some(regs) = frame_at(stack, ptr, pt_regs_size) {
            if regs.is_kernel_exception_frame(stack, symbols) {
                hits.push(EframeHit {
                    addr: ptr,
                    mode: ExceptionMode::Kernel,
                    regs,
                });
            }
        }
        ptr += 8;
    }

    if !kernel_thread {
        let addr = stack.top() - USER_EFRAME_OFFSET;
        if let Some(regs) = frame_at(stack, addr, pt_regs_size) {
            hits.push(EframeHit {
                addr,
                mode: ExceptionMode::User,
                regs,
            });
        }
    }

    hits
}

/// Render search results the way `eframes` prints them.
pub fn render_hits(
    hits: &[EframeHit],
    symbols: &dyn SymbolLookup,
    out: &mut dyn Write,
) -> std::io::Result<()> {
    for (count, hit) in hits.iter().enumerate() {
        match hit.mode {
            ExceptionMode::Kernel => {
                writeln!(out, "\nKERNEL-MODE EXCEPTION FRAME AT: {:x}", hit.addr)?
            }
            ExceptionMode::User => writeln!(
                out,
                "{}USER-MODE EXCEPTION FRAME AT: {:x}",
                if count > 0 { "\n" } else { "" },
                hit.addr
            )?,
        }
        hit.regs.render(hit.mode, symbols, false, out)?;
    }
    Ok(())
}

//! Frame-pointer stack unwinding for arm64 kernel stacks.
//!
//! A frame record is two words, `[fp, lr]`, pointed to by x29. Walking the
//! chain gives (sp, fp, pc) triples; exception frames are recognised when a
//! return address lies in the exception entry text, and the user-mode frame
//! is always found at a fixed offset below the stack top.
use crate::arch::eframe::{frame_at, EframeHit, ExceptionMode, PT_REGS_SIZE, USER_EFRAME_OFFSET};
use crate::arch::layout::ARM64_STACK_SIZE;
use crate::arch::stack::StackBuffer;
use crate::error::AnalysisError;
use crate::symbols::{SymbolLookup, TypeInfo};
use bitflags::bitflags;
use log::{debug, warn};
use serde::Serialize;
use std::io::Write;

/// Functions that mark the outermost frame of a kernel thread.
const SENTINEL_FUNCTIONS: [&str; 4] = ["start_kernel", "secondary_start_kernel", "kthread", "kthreadd"];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BacktraceFlags: u32 {
        /// Dump every stack word between frames
        const FULL = 1 << 0;
        const LINE_NUMBERS = 1 << 1;
        const SYMBOL_OFFSET = 1 << 2;
        /// List every stack word that is a text address
        const TEXT_SYMBOLS = 1 << 3;
        /// TEXT_SYMBOLS starting from the stack base
        const TEXT_SYMBOLS_ALL = 1 << 4;
        /// The task was running in user space
        const USER_SPACE = 1 << 5;
        /// Start from a return address into crash_kexec/crash_save_cpu
        const KDUMP_ADJUST = 1 << 6;
        const REGS_NOT_FOUND = 1 << 7;
    }
}

/// What a reference search looks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtReference {
    Symbol(String),
    HexValue(u64),
}

impl BtReference {
    /// Hex values are given with a 0x prefix or as bare hex digits.
    pub fn parse(arg: &str) -> Self {
        let hex = arg.strip_prefix("0x").unwrap_or(arg);
        if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Ok(value) = u64::from_str_radix(hex, 16) {
                return BtReference::HexValue(value);
            }
        }
        BtReference::Symbol(arg.to_string())
    }

    fn matches(&self, symbols: &dyn SymbolLookup, text: u64, name: Option<&str>) -> bool {
        match self {
            BtReference::Symbol(wanted) => match name {
                Some(name) => name == wanted.as_str(),
                None => symbols
                    .value_search(text)
                    .map_or(false, |m| m.offset == 0 && m.name == wanted.as_str()),
            },
            BtReference::HexValue(value) => *value == text,
        }
    }
}

/// Starting stack pointer (and optionally pc) supplied by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackHook {
    pub sp: u64,
    pub pc: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub fp: u64,
    pub sp: u64,
    pub pc: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnwindState {
    Searching,
    InException(u64),
    DoneKernel,
    DoneUser,
}

/// Offsets of the saved fp/sp/pc inside task_struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOffsets {
    pub fp: u64,
    pub sp: u64,
    pub pc: u64,
}

/// Symbol ranges and structure layout the unwinder depends on.
#[derive(Debug, Clone)]
pub struct UnwindConfig {
    pub exception_text: Option<(u64, u64)>,
    pub crash_kexec: Option<(u64, u64)>,
    pub crash_save_cpu: Option<(u64, u64)>,
    pub context: Option<ContextOffsets>,
    pub pt_regs_size: u64,
}

impl UnwindConfig {
    pub fn init(symbols: &dyn SymbolLookup, types: &dyn TypeInfo) -> Self {
        let exception_text = match (
            symbols.symbol_value("__exception_text_start"),
            symbols.symbol_value("__exception_text_end"),
        ) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        };

        let range = |name: &str| Some((symbols.symbol_value(name)?, symbols.next_symbol_value(name)?));
        let (crash_kexec, crash_save_cpu) = match (range("crash_kexec"), range("crash_save_cpu")) {
            (Some(kexec), Some(save)) => (Some(kexec), Some(save)),
            _ => (None, None),
        };

        UnwindConfig {
            exception_text,
            crash_kexec,
            crash_save_cpu,
            context: Self::context_offsets(types),
            pt_regs_size: types.struct_size("pt_regs").unwrap_or(PT_REGS_SIZE),
        }
    }

    fn context_offsets(types: &dyn TypeInfo) -> Option<ContextOffsets> {
        let (thread, cpu_context) = match (
            types.member_offset("task_struct", "thread"),
            types.member_offset("thread_struct", "cpu_context"),
        ) {
            (Some(thread), Some(cpu_context)) => (thread, cpu_context),
            _ => {
                warn!("cannot determine task_struct.thread.context offset");
                return None;
            }
        };

        // The frame record is read as fp, sp, pc words
        for (field, expected) in [("fp", 0u64), ("sp", 8), ("pc", 16)] {
            if let Some(offset) = types.member_offset("stackframe", field) {
                if offset != expected {
                    warn!("builtin stackframe.{} offset incorrect!", field);
                    return None;
                }
            }
        }

        let mut offsets = [0u64; 3];
        for (slot, field) in offsets.iter_mut().zip(["fp", "sp", "pc"]) {
            match types.member_offset("cpu_context", field) {
                Some(offset) => *slot = thread + cpu_context + offset,
                None => {
                    warn!("cannot determine cpu_context.{} offset", field);
                    return None;
                }
            }
        }

        Some(ContextOffsets {
            fp: offsets[0],
            sp: offsets[1],
            pc: offsets[2],
        })
    }

    pub fn kdump_enabled(&self) -> bool {
        self.crash_kexec.is_some() && self.crash_save_cpu.is_some()
    }

    pub fn in_exception_text(&self, pc: u64) -> bool {
        self.exception_text
            .map_or(false, |(start, end)| pc >= start && pc < end)
    }

    fn in_kdump_functions(&self, value: u64) -> bool {
        [self.crash_kexec, self.crash_save_cpu]
            .iter()
            .flatten()
            .any(|&(start, end)| value >= start && value < end)
    }
}

/// One line of a backtrace.
#[derive(Debug, Clone, Serialize)]
pub struct BacktraceEntry {
    pub level: usize,
    pub sp: u64,
    pub pc: u64,
    pub symbol: Option<String>,
    pub offset: u64,
    pub module: Option<String>,
    pub line: Option<String>,
}

/// A stack word that points into kernel text.
#[derive(Debug, Clone, Serialize)]
pub struct TextSymbolEntry {
    pub addr: u64,
    pub value: u64,
    pub symbol: Option<String>,
    pub module: Option<String>,
}

/// Structured result of one backtrace; the text form goes to the caller's sink.
#[derive(Debug, Clone, Serialize)]
pub struct BacktraceReport {
    pub entries: Vec<BacktraceEntry>,
    pub exception_frames: Vec<EframeHit>,
    pub text_symbols: Vec<TextSymbolEntry>,
    pub final_state: UnwindState,
    pub reference_found: bool,
}

impl BacktraceReport {
    fn new() -> Self {
        BacktraceReport {
            entries: Vec::new(),
            exception_frames: Vec::new(),
            text_symbols: Vec::new(),
            final_state: UnwindState::Searching,
            reference_found: false,
        }
    }
}

/// Everything known about the task being unwound.
pub struct BacktraceRequest<'r> {
    pub stack: &'r StackBuffer,
    /// Frame from the saved context or the panic registers
    pub start: StackFrame,
    pub flags: BacktraceFlags,
    /// Return-address slot found by `Unwinder::in_kdump_text`
    pub kdump_bptr: Option<u64>,
    pub hook: Option<StackHook>,
    pub reference: Option<&'r BtReference>,
    pub kernel_thread: bool,
    /// Running at capture time on a non-live image
    pub active_on_dump: bool,
}

pub struct Unwinder<'a> {
    config: &'a UnwindConfig,
    symbols: &'a dyn SymbolLookup,
}

impl<'a> Unwinder<'a> {
    pub fn new(config: &'a UnwindConfig, symbols: &'a dyn SymbolLookup) -> Self {
        Unwinder { config, symbols }
    }

    /// Advance one frame record. Fails when fp is outside the 16K stack
    /// window above sp, misaligned, or its record cannot be read.
    pub fn unwind_frame(&self, stack: &StackBuffer, frame: &mut StackFrame) -> bool {
        let stack_mask = ARM64_STACK_SIZE - 1;
        let fp = frame.fp;
        let low = frame.sp;
        let high = match low.checked_add(stack_mask) {
            Some(end) => end & !stack_mask,
            None => return false,
        };

        if fp < low || fp > high || fp & 0xf != 0 {
            return false;
        }

        match (stack.word(fp), stack.word(fp + 8)) {
            (Some(next_fp), Some(pc)) => {
                frame.sp = fp + 0x10;
                frame.fp = next_fp;
                frame.pc = pc;
                true
            }
            _ => false,
        }
    }

    /// Scan down from just below the frame (or the stack top) for a return
    /// address into crash_kexec or crash_save_cpu.
    pub fn in_kdump_text(&self, stack: &StackBuffer, frame: &StackFrame, user_space: bool) -> Option<u64> {
        if !self.config.kdump_enabled() {
            return None;
        }

        let start = if !user_space && stack.contains(frame.fp) {
            frame.fp
        } else {
            stack.top()
        };

        let mut ptr = start.checked_sub(8 * 8)?;
        while ptr >= stack.base() {
            if let Some(value) = stack.word(ptr) {
                if self.config.in_kdump_functions(value) {
                    debug!("kdump return address {:x} at {:x}", value, ptr);
                    return Some(ptr);
                }
            }
            if ptr < stack.base() + 8 {
                break;
            }
            ptr -= 8;
        }
        None
    }

    /// Unwind a task, writing crash-style text to `out`.
    pub fn backtrace(
        &self,
        req: &BacktraceRequest<'_>,
        out: &mut dyn Write,
    ) -> Result<BacktraceReport, AnalysisError> {
        let stack = req.stack;
        let mut report = BacktraceReport::new();

        let mut frame = if let (true, Some(bptr)) =
            (req.flags.contains(BacktraceFlags::KDUMP_ADJUST), req.kdump_bptr)
        {
            StackFrame {
                fp: self.stack_word(stack, bptr.wrapping_sub(8))?,
                pc: self.stack_word(stack, bptr)?,
                sp: bptr.wrapping_add(8),
            }
        } else if let Some(hook) = req.hook {
            StackFrame {
                fp: self.stack_word(stack, hook.sp.wrapping_sub(8))?,
                pc: match hook.pc {
                    Some(pc) => pc,
                    None => self.stack_word(stack, hook.sp)?,
                },
                sp: hook.sp.wrapping_add(8),
            }
        } else {
            req.start
        };

        if req.flags.contains(BacktraceFlags::TEXT_SYMBOLS) {
            self.text_symbols(req, &frame, &mut report, out)?;
            report.final_state = UnwindState::DoneKernel;
            return Ok(report);
        }

        if req.flags.contains(BacktraceFlags::REGS_NOT_FOUND) {
            return Ok(report);
        }

        let kdump_adjust = req.flags.contains(BacktraceFlags::KDUMP_ADJUST);
        let mut state = UnwindState::Searching;

        if !kdump_adjust {
            if req.flags.contains(BacktraceFlags::USER_SPACE) {
                state = UnwindState::DoneUser;
            } else if req.active_on_dump {
                let addr = frame.fp.wrapping_sub(self.config.pt_regs_size);
                if let Some(regs) = frame_at(stack, addr, self.config.pt_regs_size) {
                    if regs.is_kernel_exception_frame(stack, self.symbols) {
                        self.exception_frame(req, addr, ExceptionMode::Kernel, &mut report, out)?;
                    }
                }
            }
        }

        let mut level = 0usize;
        let mut pending: Option<u64> = None;
        let mut full_from = req.start.fp;

        loop {
            state = match state {
                UnwindState::Searching => {
                    if req.flags.contains(BacktraceFlags::FULL) {
                        self.full_frame(stack, full_from, frame.sp, out)?;
                        full_from = frame.sp;
                    }
                    if self.entry(req, level, &frame, &mut report, out)? {
                        UnwindState::DoneKernel
                    } else if let Some(addr) = pending.take() {
                        UnwindState::InException(addr)
                    } else {
                        self.advance(req, &mut frame, &mut pending, &mut level)
                    }
                }
                UnwindState::InException(addr) => {
                    self.exception_frame(req, addr, ExceptionMode::Kernel, &mut report, out)?;
                    self.advance(req, &mut frame, &mut pending, &mut level)
                }
                UnwindState::DoneKernel => break,
                UnwindState::DoneUser => {
                    let addr = stack.top() - USER_EFRAME_OFFSET;
                    self.exception_frame(req, addr, ExceptionMode::User, &mut report, out)?;
                    if req.flags & (BacktraceFlags::USER_SPACE | BacktraceFlags::KDUMP_ADJUST)
                        == BacktraceFlags::USER_SPACE
                    {
                        writeln!(out, " #0 [user space]")?;
                    }
                    break;
                }
            };
        }

        report.final_state = state;
        Ok(report)
    }

    /// Step to the caller's frame. An exception frame is pending when the
    /// frame just left returned into the exception vectors.
    fn advance(
        &self,
        req: &BacktraceRequest<'_>,
        frame: &mut StackFrame,
        pending: &mut Option<u64>,
        level: &mut usize,
    ) -> UnwindState {
        let pc = frame.pc;
        if !self.unwind_frame(req.stack, frame) {
            return if req.kernel_thread {
                UnwindState::DoneKernel
            } else {
                UnwindState::DoneUser
            };
        }

        if self.config.in_exception_text(pc) && req.stack.contains(frame.fp) {
            *pending = Some(frame.fp.wrapping_sub(self.config.pt_regs_size));
        }
        *level += 1;
        UnwindState::Searching
    }

    fn stack_word(&self, stack: &StackBuffer, addr: u64) -> Result<u64, AnalysisError> {
        stack.word(addr).ok_or_else(|| {
            AnalysisError::BacktraceError(format!("starting address {:x} is not on the stack", addr))
        })
    }

    fn check_reference(&self, req: &BacktraceRequest<'_>, report: &mut BacktraceReport, text: u64, name: Option<&str>) {
        if let Some(reference) = req.reference {
            if reference.matches(self.symbols, text, name) {
                report.reference_found = true;
            }
        }
    }

    /// Print one frame; true when the frame is a thread-entry sentinel.
    fn entry(
        &self,
        req: &BacktraceRequest<'_>,
        level: usize,
        frame: &StackFrame,
        report: &mut BacktraceReport,
        out: &mut dyn Write,
    ) -> Result<bool, AnalysisError> {
        let found = self.symbols.value_search(frame.pc);
        let name = found.map(|m| m.name).unwrap_or("(unknown)");
        let display = match found {
            Some(m) if req.flags.contains(BacktraceFlags::SYMBOL_OFFSET) && m.offset != 0 => m.to_symstr(),
            _ => name.to_string(),
        };

        write!(
            out,
            "{}#{} [{:8x}] {} at {:x}",
            if level < 10 { " " } else { "" },
            level,
            frame.sp,
            display,
            frame.pc
        )?;
        self.check_reference(req, report, frame.pc, Some(name));

        let module = found.and_then(|m| m.module);
        if let Some(module) = module {
            write!(out, " [{}]", module)?;
        }
        writeln!(out)?;

        let line = if req.flags.contains(BacktraceFlags::LINE_NUMBERS) {
            self.symbols.line_number(frame.pc)
        } else {
            None
        };
        if let Some(line) = &line {
            writeln!(out, "    {}", line)?;
        }

        report.entries.push(BacktraceEntry {
            level,
            sp: frame.sp,
            pc: frame.pc,
            symbol: found.map(|m| m.name.to_string()),
            offset: found.map_or(0, |m| m.offset),
            module: module.map(str::to_string),
            line,
        });

        Ok(SENTINEL_FUNCTIONS.contains(&name))
    }

    fn exception_frame(
        &self,
        req: &BacktraceRequest<'_>,
        addr: u64,
        mode: ExceptionMode,
        report: &mut BacktraceReport,
        out: &mut dyn Write,
    ) -> Result<(), AnalysisError> {
        let regs = match frame_at(req.stack, addr, self.config.pt_regs_size) {
            Some(regs) => regs,
            None => {
                debug!("exception frame at {:x} is outside the stack", addr);
                return Ok(());
            }
        };

        regs.render(
            mode,
            self.symbols,
            req.flags.contains(BacktraceFlags::LINE_NUMBERS),
            out,
        )?;
        if req.reference.is_some() {
            for value in regs.reference_values(mode) {
                self.check_reference(req, report, value, None);
            }
        }

        report.exception_frames.push(EframeHit { addr, mode, regs });
        Ok(())
    }

    /// Two stack words per line from `from` up to `sp`.
    fn full_frame(&self, stack: &StackBuffer, from: u64, sp: u64, out: &mut dyn Write) -> std::io::Result<()> {
        if from == sp || sp < from || !stack.contains(sp) || !stack.contains(from) {
            return Ok(());
        }

        let words = (sp - from) / 8;
        for i in 0..words {
            let addr = from + i * 8;
            if i & 1 == 0 {
                write!(out, "{}    {:x}: ", if i > 0 { "\n" } else { "" }, addr)?;
            }
            write!(out, "{:016x} ", stack.word(addr).unwrap_or(0))?;
        }
        writeln!(out)
    }

    fn text_symbols(
        &self,
        req: &BacktraceRequest<'_>,
        frame: &StackFrame,
        report: &mut BacktraceReport,
        out: &mut dyn Write,
    ) -> Result<(), AnalysisError> {
        let stack = req.stack;
        let symbol_offset = req.flags.contains(BacktraceFlags::SYMBOL_OFFSET);
        let label = |value: u64| -> String {
            match self.symbols.value_search(value) {
                Some(m) if symbol_offset => m.to_symstr(),
                Some(m) => m.name.to_string(),
                None => "(unknown)".to_string(),
            }
        };

        let start = if req.flags.contains(BacktraceFlags::TEXT_SYMBOLS_ALL) {
            stack.base()
        } else {
            writeln!(out, "{:14}START: {} at {:x}", "", label(frame.pc), frame.pc)?;
            frame.sp.wrapping_sub(8).max(stack.base())
        };

        let mut addr = start;
        while addr + 8 <= stack.top() {
            if let Some(value) = stack.word(addr) {
                if self.symbols.is_kernel_text(value) {
                    let found = self.symbols.value_search(value);
                    let module = found.and_then(|m| m.module);
                    write!(out, "  [{:>16x}] {} at {:x}", addr, label(value), value)?;
                    if let Some(module) = module {
                        write!(out, " [{}]", module)?;
                    }
                    writeln!(out)?;

                    self.check_reference(req, report, value, Some(found.map_or("", |m| m.name)));
                    report.text_symbols.push(TextSymbolEntry {
                        addr,
                        value,
                        symbol: found.map(|m| m.name.to_string()),
                        module: module.map(str::to_string),
                    });
                }
            }
            addr += 8;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::eframe::tests::{kernel_regs, symbols, STACK_BASE};
    use crate::symbols::SymbolResolver;

    const SCHEDULE: u64 = 0xffff_ffc0_0009_2010;
    const WORKER: u64 = 0xffff_ffc0_0009_3020;
    const KTHREAD: u64 = 0xffff_ffc0_0009_0430;
    const PANIC: u64 = 0xffff_ffc0_0009_1040;

    fn config(resolver: &SymbolResolver) -> UnwindConfig {
        UnwindConfig::init(resolver, resolver)
    }

    fn empty_stack() -> StackBuffer {
        StackBuffer::from_bytes(STACK_BASE, vec![0u8; ARM64_STACK_SIZE as usize])
    }

    /// Chain: schedule -> worker -> kthread, frame records 0x40 apart.
    fn chained_stack() -> (StackBuffer, StackFrame) {
        let mut stack = empty_stack();
        let f1 = STACK_BASE + 0x3e00;
        let f2 = f1 + 0x40;
        let f3 = f2 + 0x40;
        stack.set_word(f1, f2);
        stack.set_word(f1 + 8, WORKER);
        stack.set_word(f2, f3);
        stack.set_word(f2 + 8, KTHREAD);
        stack.set_word(f3, 0);
        stack.set_word(f3 + 8, 0);
        let start = StackFrame {
            fp: f1,
            sp: f1 - 0x20,
            pc: SCHEDULE,
        };
        (stack, start)
    }

    fn request<'r>(stack: &'r StackBuffer, start: StackFrame) -> BacktraceRequest<'r> {
        BacktraceRequest {
            stack,
            start,
            flags: BacktraceFlags::empty(),
            kdump_bptr: None,
            hook: None,
            reference: None,
            kernel_thread: true,
            active_on_dump: false,
        }
    }

    #[test]
    fn test_config_init() {
        let resolver = symbols();
        let config = config(&resolver);
        assert!(config.kdump_enabled());
        assert_eq!(config.crash_kexec, Some((0xffff_ffc0_0009_0000, 0xffff_ffc0_0009_0200)));
        assert!(config.in_exception_text(0xffff_ffc0_0008_2010));
        assert!(!config.in_exception_text(0xffff_ffc0_0008_2400));
        let ctx = config.context.unwrap();
        assert_eq!(ctx.pc - ctx.fp, 0x10);
        assert_eq!(config.pt_regs_size, PT_REGS_SIZE);
    }

    #[test]
    fn test_bad_stackframe_layout_disables_context() {
        let mut resolver = symbols();
        resolver.set_member_offset("stackframe", "sp", 0x10);
        assert!(config(&resolver).context.is_none());
    }

    #[test]
    fn test_chain_terminates_at_sentinel() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (stack, start) = chained_stack();
        let mut out = Vec::new();

        let report = unwinder.backtrace(&request(&stack, start), &mut out).unwrap();
        assert_eq!(report.final_state, UnwindState::DoneKernel);
        assert_eq!(report.entries.len(), 3);
        let names: Vec<_> = report.entries.iter().map(|e| e.symbol.clone().unwrap()).collect();
        assert_eq!(names, vec!["schedule", "worker", "kthread"]);
        assert_eq!(report.entries[1].sp, start.fp + 0x10);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!(" #0 [{:x}] schedule at {:x}", start.sp, SCHEDULE));
        assert_eq!(lines[2], format!(" #2 [{:x}] kthread at {:x}", start.fp + 0x50, KTHREAD));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_misaligned_fp_ends_user_task_with_user_frame() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (mut stack, start) = chained_stack();
        stack.set_word(start.fp, start.fp + 0x48);
        let mut req = request(&stack, start);
        req.kernel_thread = false;
        let mut out = Vec::new();

        let report = unwinder.backtrace(&req, &mut out).unwrap();
        assert_eq!(report.final_state, UnwindState::DoneUser);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.exception_frames.len(), 1);
        assert_eq!(report.exception_frames[0].addr, STACK_BASE + 16384 - USER_EFRAME_OFFSET);
        assert!(!String::from_utf8(out).unwrap().contains("[user space]"));
    }

    #[test]
    fn test_unwind_frame_bounds() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let stack = empty_stack();

        let mut below_sp = StackFrame { fp: STACK_BASE + 0x100, sp: STACK_BASE + 0x200, pc: 0 };
        assert!(!unwinder.unwind_frame(&stack, &mut below_sp));

        let mut off_stack = StackFrame { fp: STACK_BASE + 16384, sp: STACK_BASE + 0x3ff0, pc: 0 };
        assert!(!unwinder.unwind_frame(&stack, &mut off_stack));

        let mut ok = StackFrame { fp: STACK_BASE + 0x210, sp: STACK_BASE + 0x200, pc: 0 };
        assert!(unwinder.unwind_frame(&stack, &mut ok));
        assert_eq!(ok.sp, STACK_BASE + 0x220);

        // garbage sp at the top of the address space
        let mut wrapped = StackFrame { fp: u64::MAX & !0xf, sp: u64::MAX - 0x10, pc: 0 };
        assert!(!unwinder.unwind_frame(&stack, &mut wrapped));
        assert_eq!(wrapped.fp, u64::MAX & !0xf);
    }

    #[test]
    fn test_exception_text_frame_is_rendered() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let mut stack = empty_stack();

        // frame 1 returns into the exception vectors; the frame record it
        // links to sits directly above the saved pt_regs
        let f1 = STACK_BASE + 0x3000;
        let f2 = STACK_BASE + 0x3200;
        let f3 = STACK_BASE + 0x3400;
        let eframe = f3 - PT_REGS_SIZE;
        stack.set_word(f1, f2);
        stack.set_word(f1 + 8, 0xffff_ffc0_0008_2010);
        stack.set_word(f2, f3);
        stack.set_word(f2 + 8, WORKER);
        stack.set_bytes(eframe, &kernel_regs(f3, f3 + 0x40).to_bytes());
        stack.set_word(f3 + 8, KTHREAD);

        let start = StackFrame { fp: f1, sp: f1 - 0x10, pc: PANIC };
        let mut out = Vec::new();
        let report = unwinder.backtrace(&request(&stack, start), &mut out).unwrap();

        assert_eq!(report.entries.len(), 4);
        assert_eq!(report.exception_frames.len(), 1);
        assert_eq!(report.exception_frames[0].addr, eframe);
        let text = String::from_utf8(out).unwrap();
        let eframe_at = text.find("     PC: ffffffc000081004").unwrap();
        assert!(text.find(" #2 [").unwrap() < eframe_at);
        assert!(text.find(" #3 [").unwrap() > eframe_at);
    }

    #[test]
    fn test_exception_frame_rendered_when_next_unwind_fails() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let mut stack = empty_stack();

        // worker's frame record points at a misaligned fp that is still on
        // the stack, so the unwind after the exception-text frame stops
        let f1 = STACK_BASE + 0x3000;
        let f2 = STACK_BASE + 0x3200;
        let f3 = STACK_BASE + 0x3408;
        let eframe = f3 - PT_REGS_SIZE;
        stack.set_word(f1, f2);
        stack.set_word(f1 + 8, 0xffff_ffc0_0008_2010);
        stack.set_word(f2, f3);
        stack.set_word(f2 + 8, WORKER);
        stack.set_bytes(eframe, &kernel_regs(STACK_BASE + 0x3500, STACK_BASE + 0x3540).to_bytes());

        let start = StackFrame { fp: f1, sp: f1 - 0x10, pc: PANIC };
        let mut out = Vec::new();
        let report = unwinder.backtrace(&request(&stack, start), &mut out).unwrap();

        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.entries[2].symbol.as_deref(), Some("worker"));
        assert_eq!(report.exception_frames.len(), 1);
        assert_eq!(report.exception_frames[0].addr, eframe);
        assert_eq!(report.final_state, UnwindState::DoneKernel);

        let text = String::from_utf8(out).unwrap();
        let eframe_at = text.find("     PC: ffffffc000081004").unwrap();
        assert!(text.find(" #2 [").unwrap() < eframe_at);
    }

    #[test]
    fn test_active_task_initial_exception_frame() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (mut stack, start) = chained_stack();
        let eframe = start.fp - PT_REGS_SIZE;
        stack.set_bytes(eframe, &kernel_regs(start.fp, start.fp + 0x40).to_bytes());

        let mut req = request(&stack, start);
        req.active_on_dump = true;
        let mut out = Vec::new();
        let report = unwinder.backtrace(&req, &mut out).unwrap();
        assert_eq!(report.exception_frames.len(), 1);
        assert!(String::from_utf8(out).unwrap().starts_with("     PC: "));
    }

    #[test]
    fn test_user_space_task_goes_straight_to_user_frame() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (stack, start) = chained_stack();
        let mut req = request(&stack, start);
        req.flags = BacktraceFlags::USER_SPACE;
        req.kernel_thread = false;
        let mut out = Vec::new();

        let report = unwinder.backtrace(&req, &mut out).unwrap();
        assert!(report.entries.is_empty());
        assert_eq!(report.final_state, UnwindState::DoneUser);
        assert!(String::from_utf8(out).unwrap().ends_with(" #0 [user space]\n"));
    }

    #[test]
    fn test_kdump_adjust_start() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (mut stack, start) = chained_stack();

        // a frame record below the chain whose lr returns into crash_kexec
        let record = STACK_BASE + 0x3d00;
        stack.set_word(record, start.fp);
        stack.set_word(record + 8, 0xffff_ffc0_0009_0040);

        let panic_frame = StackFrame { fp: STACK_BASE + 0x3e00, sp: STACK_BASE + 0x3c00, pc: PANIC };
        let bptr = unwinder.in_kdump_text(&stack, &panic_frame, false).unwrap();
        assert_eq!(bptr, record + 8);

        let mut req = request(&stack, start);
        req.flags = BacktraceFlags::KDUMP_ADJUST;
        req.kdump_bptr = Some(bptr);
        let mut out = Vec::new();
        let report = unwinder.backtrace(&req, &mut out).unwrap();
        assert_eq!(report.entries[0].symbol.as_deref(), Some("crash_kexec"));
        assert_eq!(report.entries[0].sp, record + 16);
        assert_eq!(report.entries.last().unwrap().symbol.as_deref(), Some("kthread"));
    }

    #[test]
    fn test_hook_start() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (stack, start) = chained_stack();
        let mut req = request(&stack, start);
        req.hook = Some(StackHook { sp: start.fp + 8, pc: None });
        let mut out = Vec::new();

        let report = unwinder.backtrace(&req, &mut out).unwrap();
        assert_eq!(report.entries[0].pc, WORKER);
        assert_eq!(report.entries[0].sp, start.fp + 0x10);

        req.hook = Some(StackHook { sp: STACK_BASE + 0x5000, pc: None });
        assert!(unwinder.backtrace(&req, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_text_symbols_mode() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (stack, start) = chained_stack();
        let mut req = request(&stack, start);
        req.flags = BacktraceFlags::TEXT_SYMBOLS | BacktraceFlags::SYMBOL_OFFSET;
        let mut out = Vec::new();

        let report = unwinder.backtrace(&req, &mut out).unwrap();
        assert_eq!(report.text_symbols.len(), 2);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("{:14}START: schedule+0x10 at {:x}", "", SCHEDULE));
        assert_eq!(
            lines[1],
            format!("  [{:x}] worker+0x20 at {:x}", start.fp + 8, WORKER)
        );
        assert!(report.entries.is_empty());
    }

    #[test]
    fn test_reference_search() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (stack, start) = chained_stack();

        let found = BtReference::parse("worker");
        let mut req = request(&stack, start);
        req.reference = Some(&found);
        assert!(unwinder.backtrace(&req, &mut Vec::new()).unwrap().reference_found);

        let by_value = BtReference::parse("0xffffffc000093020");
        assert_eq!(by_value, BtReference::HexValue(WORKER));
        req.reference = Some(&by_value);
        assert!(unwinder.backtrace(&req, &mut Vec::new()).unwrap().reference_found);

        let missing = BtReference::parse("do_page_fault");
        req.reference = Some(&missing);
        assert!(!unwinder.backtrace(&req, &mut Vec::new()).unwrap().reference_found);

        // a value held only in a saved register of an exception frame
        let (mut stack, start) = chained_stack();
        let mut regs = kernel_regs(start.fp, start.fp + 0x40);
        regs.regs[19] = 0xdead_beef_0019;
        stack.set_bytes(start.fp - PT_REGS_SIZE, &regs.to_bytes());

        let saved = BtReference::parse("0xdeadbeef0019");
        let mut req = request(&stack, start);
        req.active_on_dump = true;
        req.reference = Some(&saved);
        let report = unwinder.backtrace(&req, &mut Vec::new()).unwrap();
        assert_eq!(report.exception_frames.len(), 1);
        assert!(report.reference_found);

        req.active_on_dump = false;
        assert!(!unwinder.backtrace(&req, &mut Vec::new()).unwrap().reference_found);
    }

    #[test]
    fn test_full_frame_dump() {
        let resolver = symbols();
        let config = config(&resolver);
        let unwinder = Unwinder::new(&config, &resolver);
        let (stack, start) = chained_stack();
        let mut req = request(&stack, start);
        req.flags = BacktraceFlags::FULL;
        let mut out = Vec::new();
        unwinder.backtrace(&req, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("    {:x}: {:016x} {:016x} ", start.fp, start.fp + 0x40, WORKER)));
    }
}

//! arm64 machine support: address-space layout, page table walks, PTE
//! decoding and kernel stack backtraces over a captured image.
pub mod crash_notes;
pub mod eframe;
pub mod layout;
pub mod pte;
pub mod stack;
pub mod unwind;
pub mod walker;

use crate::error::AnalysisError;
use crate::kernel::TaskContext;
use crate::memory::{KernelMemory, PhysicalMemory};
use crate::symbols::{SymbolLookup, TypeInfo};
use eframe::{EframeHit, PtRegs};
use layout::{AddressSpaceLayout, CaptureKind, MachineFlags, VaddrRange};
use log::{debug, warn};
use pte::{decode_pte, render_pte, PteInfo};
use stack::StackBuffer;
use std::cell::RefCell;
use std::io::Write;
use unwind::{
    BacktraceFlags, BacktraceReport, BacktraceRequest, BtReference, StackFrame, StackHook,
    UnwindConfig, Unwinder,
};
use walker::{PageTableWalker, TableScratch, Translation};

const MACHINE_TYPE: &str = "aarch64";
const DEFAULT_HZ: u64 = 100;
/// sizeof(struct cpumask) with NR_CPUS=64
const DEFAULT_CPUMASK_SIZE: u64 = 8;

/// Filter applied to every System.map/kallsyms entry: mapping symbols,
/// CRC markers, zero-valued undefined symbols and absolute symbols outside
/// the kernel half are dropped.
pub fn verify_symbol(name: &str, value: u64, kind: char) -> bool {
    if name.is_empty() {
        return false;
    }

    if matches!(kind, 'A' | 'a') && value >> 63 == 0 {
        return false;
    }

    if value == 0 && matches!(kind, 'a' | 'n' | 'N' | 'U') {
        return false;
    }

    if name == "$d" || name == "$x" {
        return false;
    }

    !(kind == 'A' && name.starts_with("__crc_"))
}

/// Kernel page table root: init_mm.pgd, else swapper_pg_dir.
pub fn kernel_pgd(mem: &dyn KernelMemory, symbols: &dyn SymbolLookup, types: &dyn TypeInfo) -> Option<u64> {
    if let (Some(init_mm), Some(pgd_offset)) = (
        symbols.symbol_value("init_mm"),
        types.member_offset("mm_struct", "pgd"),
    ) {
        match mem.read_kernel_u64(init_mm + pgd_offset) {
            Ok(pgd) if pgd != 0 => return Some(pgd),
            Ok(_) => debug!("init_mm.pgd is NULL"),
            Err(e) => debug!("cannot read init_mm.pgd: {}", e),
        }
    }

    if let Some(swapper) = symbols.symbol_value("swapper_pg_dir") {
        return Some(swapper);
    }

    warn!("cannot determine kernel pgd");
    None
}

/// "2 GB", "1.5 GB", "512 MB"
pub fn format_memory_size(bytes: u64) -> String {
    const GB: u64 = 1 << 30;
    const MB: u64 = 1 << 20;

    let (value, unit) = if bytes >= GB {
        (bytes as f64 / GB as f64, "GB")
    } else if bytes >= MB {
        (bytes as f64 / MB as f64, "MB")
    } else {
        return format!("{} KB", bytes >> 10);
    };
    let text = format!("{:.1}", value);
    format!("{} {}", text.trim_end_matches(".0"), unit)
}

/// Caller-selected backtrace behaviour.
#[derive(Debug, Clone, Default)]
pub struct BacktraceOptions {
    pub flags: BacktraceFlags,
    pub hook: Option<StackHook>,
    pub reference: Option<BtReference>,
}

/// The operations analysis commands need from the machine they run against.
pub trait Architecture {
    fn name(&self) -> &'static str;

    fn layout(&self) -> &AddressSpaceLayout;

    /// Kernel virtual to physical; `trace` receives the table walk.
    fn kvtop(&self, vaddr: u64, trace: Option<&mut dyn Write>) -> Result<Translation, AnalysisError>;

    /// User virtual to physical through the task's own page tables.
    fn uvtop(
        &self,
        task: &TaskContext,
        vaddr: u64,
        trace: Option<&mut dyn Write>,
    ) -> Result<Translation, AnalysisError>;

    /// Decode a leaf entry, rendering it when `out` is given.
    fn translate_pte(&self, pte: u64, out: Option<&mut dyn Write>) -> Result<PteInfo, AnalysisError>;

    fn backtrace(
        &self,
        task: &TaskContext,
        options: &BacktraceOptions,
        out: &mut dyn Write,
    ) -> Result<BacktraceReport, AnalysisError>;

    /// Every exception frame on the task's stack.
    fn eframe_search(&self, task: &TaskContext, out: &mut dyn Write) -> Result<Vec<EframeHit>, AnalysisError>;

    fn machine_stats(&self, out: &mut dyn Write) -> Result<(), AnalysisError>;

    fn machdep_table(&self, out: &mut dyn Write) -> Result<(), AnalysisError>;

    fn smp_cpus(&self) -> usize;

    fn kvaddr_ranges(&self) -> Vec<VaddrRange>;

    fn in_alternate_stack(&self, cpu: usize, addr: u64) -> bool;

    fn is_kvaddr(&self, vaddr: u64) -> bool {
        self.layout().is_kvaddr(vaddr)
    }

    fn is_uvaddr(&self, vaddr: u64) -> bool {
        self.layout().is_uvaddr(vaddr)
    }

    fn verify_symbol(&self, name: &str, value: u64, kind: char) -> bool {
        verify_symbol(name, value, kind)
    }
}

/// Everything an `Arm64` machine is built from.
pub struct MachineInputs<'a> {
    pub layout: &'a AddressSpaceLayout,
    pub phys: &'a dyn PhysicalMemory,
    pub kernel: &'a dyn KernelMemory,
    pub symbols: &'a dyn SymbolLookup,
    pub types: &'a dyn TypeInfo,
    pub capture: CaptureKind,
    pub memory_size: u64,
    pub kernel_pgd: Option<u64>,
}

/// Where a backtrace starts and what that implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartingFrame {
    pub frame: StackFrame,
    pub flags: BacktraceFlags,
    pub kdump_bptr: Option<u64>,
}

pub struct Arm64<'a> {
    layout: &'a AddressSpaceLayout,
    flags: MachineFlags,
    unwind: UnwindConfig,
    capture: CaptureKind,
    memory_size: u64,
    kernel_pgd: Option<u64>,
    cpus: usize,
    panic_regs: Option<Vec<PtRegs>>,
    phys: &'a dyn PhysicalMemory,
    kernel: &'a dyn KernelMemory,
    symbols: &'a dyn SymbolLookup,
    types: &'a dyn TypeInfo,
    scratch: RefCell<TableScratch>,
}

impl<'a> Arm64<'a> {
    pub fn new(inputs: MachineInputs<'a>) -> Self {
        let unwind = UnwindConfig::init(inputs.symbols, inputs.types);
        let mut flags = inputs.layout.flags;
        if unwind.kdump_enabled() {
            flags |= MachineFlags::KDUMP_ENABLED;
        }

        let cpus = count_cpus(inputs.kernel, inputs.symbols, inputs.types);

        let panic_regs = if inputs.capture == CaptureKind::Dumpfile {
            match crash_notes::extract_panic_regs(inputs.kernel, inputs.symbols, inputs.types, cpus) {
                Ok(regs) => Some(regs),
                Err(e) => {
                    debug!("crash notes: {}", e);
                    warn!(
                        "cannot retrieve registers for active task{}",
                        if cpus > 1 { "s" } else { "" }
                    );
                    None
                }
            }
        } else {
            None
        };

        Arm64 {
            layout: inputs.layout,
            flags,
            unwind,
            capture: inputs.capture,
            memory_size: inputs.memory_size,
            kernel_pgd: inputs.kernel_pgd,
            cpus,
            panic_regs,
            phys: inputs.phys,
            kernel: inputs.kernel,
            symbols: inputs.symbols,
            types: inputs.types,
            scratch: RefCell::new(TableScratch::new()),
        }
    }

    #[cfg(test)]
    fn set_panic_regs(&mut self, regs: Option<Vec<PtRegs>>) {
        self.panic_regs = regs;
    }

    pub fn flags(&self) -> MachineFlags {
        self.flags
    }

    pub fn panic_regs(&self) -> Option<&[PtRegs]> {
        self.panic_regs.as_deref()
    }

    /// Drop cached table pages, e.g. after the image was reopened.
    pub fn invalidate_tables(&self) {
        self.scratch.borrow_mut().invalidate();
    }

    fn walk(&self, pgd: u64, vaddr: u64, trace: Option<&mut dyn Write>) -> Result<Translation, AnalysisError> {
        let walker = PageTableWalker::new(self.layout, self.phys);
        walker.translate(&mut self.scratch.borrow_mut(), pgd, vaddr, trace)
    }

    /// mm_struct.pgd of a user task.
    pub fn task_pgd(&self, task: &TaskContext) -> Result<u64, AnalysisError> {
        if task.is_kernel_thread() {
            return Err(AnalysisError::MissingPageTableRoot(task.task));
        }
        let offset = self
            .types
            .member_offset("mm_struct", "pgd")
            .ok_or_else(|| AnalysisError::InvalidStructure("mm_struct.pgd offset unknown".to_string()))?;
        let pgd = self
            .kernel
            .read_kernel_u64(task.mm + offset)
            .map_err(|_| AnalysisError::read_failed(task.mm + offset, "user pgd"))?;
        if pgd == 0 {
            return Err(AnalysisError::MissingPageTableRoot(task.task));
        }
        Ok(pgd)
    }

    /// Starting frame of a task: the panic registers of its CPU when it was
    /// running on a dump, else the context saved at its last switch.
    pub fn get_stack_frame(&self, task: &TaskContext, stack: &StackBuffer) -> StartingFrame {
        let mut start = StartingFrame {
            frame: StackFrame { fp: 0, sp: 0, pc: 0 },
            flags: BacktraceFlags::empty(),
            kdump_bptr: None,
        };

        let found = if self.capture == CaptureKind::Dumpfile && task.active {
            self.dumpfile_stack_frame(task, stack, &mut start)
        } else {
            self.saved_stack_frame(task, &mut start)
        };
        if !found {
            warn!("cannot determine starting stack frame for task {:x}", task.task);
        }
        start
    }

    fn dumpfile_stack_frame(&self, task: &TaskContext, stack: &StackBuffer, start: &mut StartingFrame) -> bool {
        let regs = match self
            .panic_regs
            .as_ref()
            .and_then(|regs| regs.get(task.processor as usize))
        {
            Some(regs) => regs,
            None => {
                start.flags |= BacktraceFlags::REGS_NOT_FOUND;
                return false;
            }
        };

        start.frame = StackFrame {
            fp: regs.fp(),
            sp: regs.sp,
            pc: regs.pc,
        };

        if !self.symbols.is_kernel_text(regs.pc) && !task.is_kernel_thread() && self.layout.is_uvaddr(regs.sp) {
            start.flags |= BacktraceFlags::USER_SPACE;
        }

        let unwinder = Unwinder::new(&self.unwind, self.symbols);
        let user_space = start.flags.contains(BacktraceFlags::USER_SPACE);
        if let Some(bptr) = unwinder.in_kdump_text(stack, &start.frame, user_space) {
            start.flags |= BacktraceFlags::KDUMP_ADJUST;
            start.kdump_bptr = Some(bptr);
        }
        true
    }

    fn saved_stack_frame(&self, task: &TaskContext, start: &mut StartingFrame) -> bool {
        let context = match self.unwind.context {
            Some(context) => context,
            None => {
                start.flags |= BacktraceFlags::REGS_NOT_FOUND;
                return false;
            }
        };

        let read = |offset: u64| self.kernel.read_kernel_u64(task.task + offset);
        match (read(context.fp), read(context.sp), read(context.pc)) {
            (Ok(fp), Ok(sp), Ok(pc)) => {
                start.frame = StackFrame { fp, sp, pc };
                true
            }
            _ => {
                start.flags |= BacktraceFlags::REGS_NOT_FOUND;
                false
            }
        }
    }

    fn read_stack(&self, task: &TaskContext) -> Result<StackBuffer, AnalysisError> {
        StackBuffer::read(self.kernel, task.stack, self.layout.stack_size)
    }

    fn high_memory(&self) -> u64 {
        self.symbols
            .symbol_value("high_memory")
            .and_then(|addr| self.kernel.read_kernel_u64(addr).ok())
            .filter(|&end| end > self.layout.page_offset)
            .unwrap_or(self.layout.page_offset + self.memory_size)
    }
}

impl Architecture for Arm64<'_> {
    fn name(&self) -> &'static str {
        "arm64"
    }

    fn layout(&self) -> &AddressSpaceLayout {
        self.layout
    }

    fn kvtop(&self, vaddr: u64, trace: Option<&mut dyn Write>) -> Result<Translation, AnalysisError> {
        if !self.layout.is_kvaddr(vaddr) {
            return Err(AnalysisError::TranslationError(format!(
                "{:x}: not a kernel virtual address",
                vaddr
            )));
        }

        if !self.layout.is_vmalloc_addr(vaddr) {
            let paddr = self.layout.vtop(vaddr);
            if let (Some(out), Some(pgd)) = (trace, self.kernel_pgd) {
                // the walk is for display only; the unity map answer stands
                if let Err(e) = self.walk(pgd, vaddr, Some(out)) {
                    debug!("verbose walk of {:x} failed: {}", vaddr, e);
                }
            }
            return Ok(Translation::Mapped(paddr));
        }

        let pgd = self
            .kernel_pgd
            .ok_or_else(|| AnalysisError::TranslationError("kernel pgd unknown".to_string()))?;
        self.walk(pgd, vaddr, trace)
    }

    fn uvtop(
        &self,
        task: &TaskContext,
        vaddr: u64,
        trace: Option<&mut dyn Write>,
    ) -> Result<Translation, AnalysisError> {
        if !self.layout.is_uvaddr(vaddr) {
            return Err(AnalysisError::TranslationError(format!(
                "{:x}: not a user virtual address",
                vaddr
            )));
        }
        let pgd = self.task_pgd(task)?;
        self.walk(pgd, vaddr, trace)
    }

    fn translate_pte(&self, pte: u64, out: Option<&mut dyn Write>) -> Result<PteInfo, AnalysisError> {
        if let Some(out) = out {
            render_pte(self.layout, pte, out)?;
        }
        Ok(decode_pte(self.layout, pte))
    }

    fn backtrace(
        &self,
        task: &TaskContext,
        options: &BacktraceOptions,
        out: &mut dyn Write,
    ) -> Result<BacktraceReport, AnalysisError> {
        let stack = self.read_stack(task)?;
        let start = self.get_stack_frame(task, &stack);

        let request = BacktraceRequest {
            stack: &stack,
            start: start.frame,
            flags: options.flags | start.flags,
            kdump_bptr: start.kdump_bptr,
            hook: options.hook,
            reference: options.reference.as_ref(),
            kernel_thread: task.is_kernel_thread(),
            active_on_dump: task.active && self.capture != CaptureKind::Live,
        };
        Unwinder::new(&self.unwind, self.symbols).backtrace(&request, out)
    }

    fn eframe_search(&self, task: &TaskContext, out: &mut dyn Write) -> Result<Vec<EframeHit>, AnalysisError> {
        let stack = self.read_stack(task)?;
        let hits = eframe::search(
            &stack,
            self.symbols,
            self.unwind.pt_regs_size,
            task.is_kernel_thread(),
        );
        eframe::render_hits(&hits, self.symbols, out)?;
        Ok(hits)
    }

    fn machine_stats(&self, out: &mut dyn Write) -> Result<(), AnalysisError> {
        let l = self.layout;
        writeln!(out, "       MACHINE TYPE: {}", MACHINE_TYPE)?;
        writeln!(out, "        MEMORY SIZE: {}", format_memory_size(self.memory_size))?;
        writeln!(out, "               CPUS: {}", self.cpus)?;
        writeln!(out, "                 HZ: {}", DEFAULT_HZ)?;
        writeln!(out, "          PAGE SIZE: {}", l.page_size)?;
        writeln!(out, "KERNEL VIRTUAL BASE: {:x}", l.page_offset)?;
        writeln!(out, "KERNEL VMALLOC BASE: {:x}", l.vmalloc_start)?;
        writeln!(out, "KERNEL MODULES BASE: {:x}", l.modules_vaddr)?;
        writeln!(out, "KERNEL VMEMMAP BASE: {:x}", l.vmemmap_vaddr)?;
        writeln!(out, "  KERNEL STACK SIZE: {}", l.stack_size)?;
        Ok(())
    }

    fn machdep_table(&self, out: &mut dyn Write) -> Result<(), AnalysisError> {
        let l = self.layout;
        let range = |r: Option<(u64, u64)>| match r {
            Some((start, end)) => (format!("{:x}", start), format!("{:x}", end)),
            None => ("(unused)".to_string(), "(unused)".to_string()),
        };

        writeln!(out, "              flags: {:x} {}", self.flags.bits(), self.flags.describe())?;
        writeln!(out, "             kvbase: {:x}", l.kvbase)?;
        writeln!(out, "  identity_map_base: {:x}", l.page_offset)?;
        writeln!(out, "           pagesize: {}", l.page_size)?;
        writeln!(out, "          pageshift: {}", l.page_shift)?;
        writeln!(out, "           pagemask: {:x}", l.page_mask())?;
        writeln!(out, "         pageoffset: {:x}", l.page_offset_mask())?;
        writeln!(out, "          stacksize: {}", l.stack_size)?;
        writeln!(out, "                 hz: {}", DEFAULT_HZ)?;
        writeln!(out, "            memsize: {} ({:x})", self.memory_size, self.memory_size)?;
        writeln!(out, "               bits: 64")?;
        writeln!(out, "             levels: {}", l.depth.levels())?;
        writeln!(out, "       ptrs_per_pgd: {}", l.ptrs_per_pgd())?;
        writeln!(out, "       ptrs_per_pmd: {}", l.depth.ptrs_per_pmd())?;
        writeln!(out, "       ptrs_per_pte: {}", l.depth.ptrs_per_pte())?;
        writeln!(
            out,
            "         kernel_pgd: {}",
            self.kernel_pgd.map_or("(unknown)".to_string(), |pgd| format!("{:x}", pgd))
        )?;
        writeln!(out, "           machspec:")?;
        writeln!(out, "            VA_BITS: {}", l.va_bits)?;
        writeln!(out, "      userspace_top: {:016x}", l.userspace_top)?;
        writeln!(out, "        page_offset: {:016x}", l.page_offset)?;
        writeln!(out, " vmalloc_start_addr: {:016x}", l.vmalloc_start)?;
        writeln!(out, "        vmalloc_end: {:016x}", l.vmalloc_end)?;
        writeln!(out, "      modules_vaddr: {:016x}", l.modules_vaddr)?;
        writeln!(out, "        modules_end: {:016x}", l.modules_end)?;
        writeln!(out, "      vmemmap_vaddr: {:016x}", l.vmemmap_vaddr)?;
        writeln!(out, "        vmemmap_end: {:016x}", l.vmemmap_end)?;
        writeln!(out, "        phys_offset: {:x} ({:?})", l.phys_offset, l.phys_offset_source)?;

        let (start, end) = range(self.unwind.exception_text);
        writeln!(out, "__exception_text_start: {}", start)?;
        writeln!(out, "  __exception_text_end: {}", end)?;
        let (start, end) = range(self.unwind.crash_kexec);
        writeln!(out, "  crash_kexec_start: {}", start)?;
        writeln!(out, "    crash_kexec_end: {}", end)?;
        let (start, end) = range(self.unwind.crash_save_cpu);
        writeln!(out, "crash_save_cpu_start: {}", start)?;
        writeln!(out, "  crash_save_cpu_end: {}", end)?;

        match &self.panic_regs {
            Some(regs) => {
                writeln!(out, "    panic_task_regs: {} cpus", regs.len())?;
                for (cpu, r) in regs.iter().enumerate() {
                    writeln!(out, "      [{}]: pc {:016x} sp {:016x} fp {:016x}", cpu, r.pc, r.sp, r.fp())?;
                }
            }
            None => writeln!(out, "    panic_task_regs: (unused)")?,
        }

        writeln!(out, "      PTE_PROT_NONE: {:x}", l.pte.prot_none)?;
        writeln!(out, "           PTE_FILE: {:x}", l.pte.file)?;
        writeln!(out, "    __SWP_TYPE_BITS: {}", l.pte.swp_type_bits)?;
        writeln!(out, "   __SWP_TYPE_SHIFT: {}", l.pte.swp_type_shift)?;
        writeln!(out, "    __SWP_TYPE_MASK: {:x}", l.pte.swp_type_mask)?;
        writeln!(out, "  __SWP_OFFSET_BITS: {}", l.pte.swp_offset_bits)?;
        writeln!(out, " __SWP_OFFSET_SHIFT: {}", l.pte.swp_offset_shift)?;
        writeln!(out, "  __SWP_OFFSET_MASK: {:x}", l.pte.swp_offset_mask)?;
        Ok(())
    }

    fn smp_cpus(&self) -> usize {
        self.cpus
    }

    fn kvaddr_ranges(&self) -> Vec<VaddrRange> {
        self.layout.kvaddr_ranges(self.high_memory())
    }

    fn in_alternate_stack(&self, _cpu: usize, _addr: u64) -> bool {
        warn!("alternate stack detection is not implemented for arm64");
        false
    }
}

fn read_cpumask(
    mem: &dyn KernelMemory,
    symbols: &dyn SymbolLookup,
    size: u64,
    names: &[&str],
) -> Option<Vec<u64>> {
    let addr = names.iter().find_map(|name| symbols.symbol_value(name))?;
    let words: Vec<u64> = (0..(size / 8).max(1))
        .map_while(|i| mem.read_kernel_u64(addr + i * 8).ok())
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}

/// CPUs present, else max(online count, highest online + 1), else one.
fn count_cpus(mem: &dyn KernelMemory, symbols: &dyn SymbolLookup, types: &dyn TypeInfo) -> usize {
    let size = types.struct_size("cpumask").unwrap_or(DEFAULT_CPUMASK_SIZE);

    if let Some(present) = read_cpumask(mem, symbols, size, &["__cpu_present_mask", "cpu_present_bits"]) {
        let count: u32 = present.iter().map(|w| w.count_ones()).sum();
        if count > 0 {
            return count as usize;
        }
    }

    if let Some(online) = read_cpumask(mem, symbols, size, &["__cpu_online_mask", "cpu_online_bits"]) {
        let count: u32 = online.iter().map(|w| w.count_ones()).sum();
        let highest = online
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + 63 - w.leading_zeros() as usize);
        if let Some(highest) = highest {
            return (count as usize).max(highest + 1);
        }
    }

    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::eframe::tests::{kernel_regs, symbols, STACK_BASE};
    use crate::arch::eframe::ExceptionMode;
    use crate::arch::layout::ARM64_STACK_SIZE;
    use crate::arch::unwind::UnwindState;
    use crate::arch::walker::tests::{image_4k, VMALLOC_VA};
    use crate::symbols::SymbolResolver;
    use crate::test_support::SparseMemory;
    use crate::translation::KernelReader;

    const TASK: u64 = 0xffff_ffc0_3900_0000;
    const MM: u64 = 0xffff_ffc0_3b00_0000;
    const THREAD: u64 = 0x400;
    const SCHEDULE: u64 = 0xffff_ffc0_0009_2010;
    const WORKER: u64 = 0xffff_ffc0_0009_3020;
    const KTHREAD: u64 = 0xffff_ffc0_0009_0430;

    struct Fixture {
        layout: AddressSpaceLayout,
        mem: SparseMemory,
        kpgd: u64,
        upgd: u64,
        symbols: SymbolResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let (layout, mem, kpgd, upgd) = image_4k();
            let mut symbols = symbols();
            symbols.set_member_offset("task_struct", "thread", THREAD as usize);
            Fixture {
                layout,
                mem,
                kpgd,
                upgd,
                symbols,
            }
        }

        fn write_u64(&mut self, vaddr: u64, value: u64) {
            let paddr = self.layout.vtop(vaddr);
            self.mem.write_u64(paddr, value);
        }

        /// A zeroed stack holding the chain schedule -> worker -> kthread,
        /// with the sleeping task's saved context pointing at it.
        fn chained_stack(&mut self) -> u64 {
            let base = self.layout.vtop(STACK_BASE);
            self.mem.write_bytes(base, &vec![0u8; ARM64_STACK_SIZE as usize]);
            let f1 = STACK_BASE + 0x3e00;
            let f2 = f1 + 0x40;
            let f3 = f2 + 0x40;
            self.write_u64(f1, f2);
            self.write_u64(f1 + 8, WORKER);
            self.write_u64(f2, f3);
            self.write_u64(f2 + 8, KTHREAD);
            self.write_u64(TASK + THREAD + 0x50, f1);
            self.write_u64(TASK + THREAD + 0x58, f1 - 0x20);
            self.write_u64(TASK + THREAD + 0x60, SCHEDULE);
            f1
        }

        fn reader(&self) -> KernelReader<'_> {
            KernelReader::new(&self.layout, &self.mem).with_kernel_pgd(Some(self.kpgd))
        }

        fn machine<'a>(&'a self, reader: &'a KernelReader<'a>, capture: CaptureKind) -> Arm64<'a> {
            Arm64::new(MachineInputs {
                layout: &self.layout,
                phys: &self.mem,
                kernel: reader,
                symbols: &self.symbols,
                types: &self.symbols,
                capture,
                memory_size: 2 << 30,
                kernel_pgd: Some(self.kpgd),
            })
        }
    }

    fn task(mm: u64, active: bool) -> TaskContext {
        TaskContext {
            task: TASK,
            pid: 1,
            comm: "init".to_string(),
            mm,
            stack: STACK_BASE,
            processor: 0,
            active,
        }
    }

    #[test]
    fn test_verify_symbol() {
        assert!(verify_symbol("schedule", 0xffff_ffc0_0009_2000, 'T'));
        assert!(!verify_symbol("", 0xffff_ffc0_0009_2000, 'T'));
        assert!(!verify_symbol("$x", 0xffff_ffc0_0009_2000, 't'));
        assert!(!verify_symbol("$d", 0xffff_ffc0_0060_0000, 'd'));
        assert!(!verify_symbol("__crc_printk", 0xffff_ffc0_0000_1234, 'A'));
        assert!(!verify_symbol("_low_abs", 0x1234, 'A'));
        assert!(!verify_symbol("_zero", 0, 'a'));
        assert!(!verify_symbol("undefined", 0, 'U'));
        assert!(verify_symbol("_kernel_abs", 0xffff_ffc0_0000_0000, 'A'));
        assert!(verify_symbol("per_cpu_var", 0, 'D'));
    }

    #[test]
    fn test_format_memory_size() {
        assert_eq!(format_memory_size(2 << 30), "2 GB");
        assert_eq!(format_memory_size(3 << 29), "1.5 GB");
        assert_eq!(format_memory_size(512 << 20), "512 MB");
        assert_eq!(format_memory_size(64 << 10), "64 KB");
    }

    #[test]
    fn test_kvtop_unity_and_vmalloc() {
        let f = Fixture::new();
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        let direct = f.layout.page_offset + 0x12_3456;
        assert_eq!(arm.kvtop(direct, None).unwrap(), Translation::Mapped(0x4012_3456));
        assert_eq!(
            arm.kvtop(VMALLOC_VA + 0x123, None).unwrap(),
            Translation::Mapped(0x4123_4123)
        );
        assert!(arm.kvtop(0x40_0000, None).is_err());
    }

    #[test]
    fn test_kvtop_zero_first_level_entry_is_unmapped() {
        let f = Fixture::new();
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        // pgd[1] of the kernel table is empty
        let result = arm.kvtop(VMALLOC_VA + (1 << 30), None).unwrap();
        assert_eq!(result, Translation::Unmapped);
        assert_eq!(result.paddr(), None);
    }

    #[test]
    fn test_verbose_kvtop_keeps_unity_answer() {
        let f = Fixture::new();
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        let mut out = Vec::new();
        let direct = f.layout.page_offset + 0x1000;
        let result = arm.kvtop(direct, Some(&mut out)).unwrap();
        assert_eq!(result, Translation::Mapped(0x4000_1000));
        assert!(String::from_utf8(out).unwrap().starts_with("PAGE DIRECTORY:"));
    }

    #[test]
    fn test_uvtop() {
        let mut f = Fixture::new();
        let upgd = f.upgd;
        f.write_u64(MM + 0x40, upgd);
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        let user = task(MM, false);
        assert_eq!(
            arm.uvtop(&user, 0x40_0123, None).unwrap(),
            Translation::Mapped(0x4222_2123)
        );
        match arm.uvtop(&user, 0x40_1000, None).unwrap() {
            Translation::Swapped { swp_type, offset, .. } => {
                assert_eq!(swp_type, 1);
                assert_eq!(offset, 0x77);
            }
            other => panic!("expected a swap entry, got {:?}", other),
        }

        let kthread = task(0, false);
        assert!(matches!(
            arm.uvtop(&kthread, 0x40_0123, None),
            Err(AnalysisError::MissingPageTableRoot(TASK))
        ));
        assert!(arm.uvtop(&user, VMALLOC_VA, None).is_err());
    }

    #[test]
    fn test_smp_cpus() {
        let mut f = Fixture::new();
        f.symbols.add_symbol("__cpu_online_mask", 0xffff_ffc0_0071_0000, 'D', None);
        f.write_u64(0xffff_ffc0_0071_0000, 0b1001);
        {
            let reader = f.reader();
            assert_eq!(f.machine(&reader, CaptureKind::Live).smp_cpus(), 4);
        }

        f.symbols.add_symbol("__cpu_present_mask", 0xffff_ffc0_0071_0100, 'D', None);
        f.write_u64(0xffff_ffc0_0071_0100, 0b1011);
        let reader = f.reader();
        assert_eq!(f.machine(&reader, CaptureKind::Live).smp_cpus(), 3);

        let bare = Fixture::new();
        let reader = bare.reader();
        assert_eq!(bare.machine(&reader, CaptureKind::Live).smp_cpus(), 1);
    }

    #[test]
    fn test_machine_stats() {
        let f = Fixture::new();
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        let mut out = Vec::new();
        arm.machine_stats(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("       MACHINE TYPE: aarch64\n"));
        assert!(text.contains("        MEMORY SIZE: 2 GB\n"));
        assert!(text.contains("          PAGE SIZE: 4096\n"));
        assert!(text.contains("KERNEL VIRTUAL BASE: ffffffc000000000\n"));
        assert!(text.contains("KERNEL VMALLOC BASE: ffffff8000000000\n"));
        assert!(text.contains("  KERNEL STACK SIZE: 16384\n"));

        let mut out = Vec::new();
        arm.machdep_table(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("VM_L3_4K"));
        assert!(text.contains("KDUMP_ENABLED"));
        assert!(text.contains("            VA_BITS: 39\n"));
        assert!(text.contains("    panic_task_regs: (unused)\n"));
    }

    #[test]
    fn test_backtrace_from_saved_context() {
        let mut f = Fixture::new();
        f.chained_stack();
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        let mut out = Vec::new();
        let report = arm
            .backtrace(&task(0, false), &BacktraceOptions::default(), &mut out)
            .unwrap();
        let names: Vec<_> = report.entries.iter().filter_map(|e| e.symbol.as_deref()).collect();
        assert_eq!(names, ["schedule", "worker", "kthread"]);
        assert_eq!(report.final_state, UnwindState::DoneKernel);
        assert!(String::from_utf8(out).unwrap().contains(" #2 ["));
    }

    #[test]
    fn test_active_task_on_dump_uses_panic_registers() {
        let mut f = Fixture::new();
        let f1 = f.chained_stack();
        let reader = f.reader();
        let mut arm = f.machine(&reader, CaptureKind::Dumpfile);
        let active = task(0, true);

        // no crash_notes symbol: registers unavailable, nothing unwound
        assert!(arm.panic_regs().is_none());
        let mut out = Vec::new();
        let report = arm.backtrace(&active, &BacktraceOptions::default(), &mut out).unwrap();
        assert!(report.entries.is_empty());

        arm.set_panic_regs(Some(vec![kernel_regs(f1 - 0x20, f1)]));
        let stack = StackBuffer::read(&reader, STACK_BASE, ARM64_STACK_SIZE).unwrap();
        let start = arm.get_stack_frame(&active, &stack);
        assert_eq!(start.frame.fp, f1);
        assert!(!start.flags.contains(BacktraceFlags::USER_SPACE));
        assert!(!start.flags.contains(BacktraceFlags::KDUMP_ADJUST));

        let mut out = Vec::new();
        let report = arm.backtrace(&active, &BacktraceOptions::default(), &mut out).unwrap();
        assert_eq!(report.entries[0].symbol.as_deref(), Some("el1_da"));
        assert_eq!(report.entries.len(), 3);
    }

    #[test]
    fn test_eframe_search_reports_user_frame() {
        let mut f = Fixture::new();
        f.chained_stack();
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        let mut out = Vec::new();
        let hits = arm.eframe_search(&task(MM, false), &mut out).unwrap();
        let last = hits.last().unwrap();
        assert_eq!(last.mode, ExceptionMode::User);
        assert_eq!(last.addr, STACK_BASE + ARM64_STACK_SIZE - 304);
        assert!(String::from_utf8(out).unwrap().contains("USER-MODE EXCEPTION FRAME AT:"));
    }

    #[test]
    fn test_kvaddr_ranges_sorted() {
        let f = Fixture::new();
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        let ranges = arm.kvaddr_ranges();
        assert_eq!(ranges.len(), 4);
        assert!(ranges.windows(2).all(|w| w[0].start <= w[1].start));
        let unity = ranges.last().unwrap();
        assert_eq!(unity.start, f.layout.page_offset);
        assert_eq!(unity.end, f.layout.page_offset + (2 << 30));
        assert!(!arm.in_alternate_stack(0, STACK_BASE));
    }

    #[test]
    fn test_translate_pte() {
        let f = Fixture::new();
        let reader = f.reader();
        let arm = f.machine(&reader, CaptureKind::Live);

        let info = arm.translate_pte(0x4222_2000 | 0xf43, None).unwrap();
        assert!(info.present);
        assert_eq!(info.paddr, 0x4222_2000);

        let mut out = Vec::new();
        let swapped = f.layout.pte.swp_entry(3, 0x10);
        assert!(!arm.translate_pte(swapped, Some(&mut out)).unwrap().present);
        assert!(String::from_utf8(out).unwrap().contains("SWAP"));
    }
}

//! Kernel virtual address space layout: page size, table depth, VA_BITS,
//! phys_offset and the vmalloc/modules/vmemmap region boundaries.
use crate::arch::pte::PteFormat;
use crate::core::offsets::KernelVersion;
use crate::error::AnalysisError;
use crate::memory::DumpMetadata;
use crate::symbols::SymbolLookup;
use bitflags::bitflags;
use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;

pub const PHYS_MASK_SHIFT: u32 = 48;
pub const PHYS_MASK: u64 = (1u64 << PHYS_MASK_SHIFT) - 1;
pub const ARM64_STACK_SIZE: u64 = 16384;
pub const SZ_64K: u64 = 0x10000;

const PAGESIZE_4K: u64 = 4096;
const PAGESIZE_64K: u64 = 65536;
const MODULES_SIZE: u64 = 64 * 1024 * 1024;
// Fixed gap below PAGE_OFFSET reserved for PCI I/O and vmemmap on pre-3.17 kernels
const LEGACY_VMALLOC_GAP: u64 = 0x4_0000_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct MachineFlags: u32 {
        const KSYMS_START = 1 << 0;
        const PHYS_OFFSET = 1 << 1;
        const VM_L2_64K = 1 << 2;
        const VM_L3_4K = 1 << 3;
        const KDUMP_ENABLED = 1 << 4;
        const VMEMMAP = 1 << 5;
    }
}

impl MachineFlags {
    /// "(KSYMS_START|VM_L3_4K|...)" as shown by the machdep table
    pub fn describe(&self) -> String {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        format!("({})", names.join("|"))
    }
}

/// Translation table geometry for the two supported granules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageTableDepth {
    /// 64K pages: PGD -> PTE, 512MB blocks at the PGD level
    TwoLevel64K,
    /// 4K pages: PGD -> PMD -> PTE, 2MB blocks at the PMD level
    ThreeLevel4K,
}

impl PageTableDepth {
    pub fn levels(&self) -> u32 {
        match self {
            PageTableDepth::TwoLevel64K => 2,
            PageTableDepth::ThreeLevel4K => 3,
        }
    }

    pub fn ptrs_per_pgd(&self) -> u64 {
        match self {
            PageTableDepth::TwoLevel64K => 8192,
            PageTableDepth::ThreeLevel4K => 512,
        }
    }

    pub fn ptrs_per_pmd(&self) -> u64 {
        match self {
            PageTableDepth::TwoLevel64K => 1,
            PageTableDepth::ThreeLevel4K => 512,
        }
    }

    pub fn ptrs_per_pte(&self) -> u64 {
        match self {
            PageTableDepth::TwoLevel64K => 8192,
            PageTableDepth::ThreeLevel4K => 512,
        }
    }

    pub fn pgdir_shift(&self) -> u32 {
        match self {
            PageTableDepth::TwoLevel64K => 29,
            PageTableDepth::ThreeLevel4K => 30,
        }
    }

    pub fn pmd_shift(&self) -> u32 {
        match self {
            PageTableDepth::TwoLevel64K => 29,
            PageTableDepth::ThreeLevel4K => 21,
        }
    }

    pub fn pgdir_size(&self) -> u64 {
        1u64 << self.pgdir_shift()
    }

    /// Size of the region mapped by a block descriptor
    pub fn block_size(&self) -> u64 {
        1u64 << self.pmd_shift()
    }

    pub fn flag(&self) -> MachineFlags {
        match self {
            PageTableDepth::TwoLevel64K => MachineFlags::VM_L2_64K,
            PageTableDepth::ThreeLevel4K => MachineFlags::VM_L3_4K,
        }
    }
}

/// How the memory image was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureKind {
    Live,
    Dumpfile,
    LogOnly,
}

/// Where the phys_offset value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhysOffsetSource {
    Override,
    Iomem,
    DumpfileHeader,
    KdumpHeader,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VaddrRangeKind {
    UnityMap,
    Vmalloc,
    Modules,
    Vmemmap,
}

/// A kernel virtual range, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VaddrRange {
    pub kind: VaddrRangeKind,
    pub start: u64,
    pub end: u64,
}

/// Options accepted through `--machdep`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachdepOptions {
    pub phys_offset: Option<u64>,
}

/// Parse `--machdep` values. Each value may hold several comma-separated
/// `key=value` pairs; only `phys_offset` is recognised.
pub fn parse_machdep_args(args: &[String]) -> MachdepOptions {
    let mut options = MachdepOptions::default();
    let megabytes = Regex::new(r"^phys_offset=(\d+)[mM]$").ok();
    let hex = Regex::new(r"^phys_offset=(?:0[xX])?([0-9a-fA-F]+)$").ok();

    for item in args.iter().flat_map(|a| a.split(',')) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        let value = if let Some(caps) = megabytes.as_ref().and_then(|re| re.captures(item)) {
            caps[1].parse::<u64>().ok().and_then(|mb| mb.checked_mul(1024 * 1024))
        } else if let Some(caps) = hex.as_ref().and_then(|re| re.captures(item)) {
            u64::from_str_radix(&caps[1], 16).ok()
        } else {
            None
        };

        match value {
            Some(value) => {
                debug!("machdep: phys_offset: {:x}", value);
                options.phys_offset = Some(value);
            }
            None => warn!("ignoring --machdep option: {}", item),
        }
    }

    options
}

/// Start of the first "System RAM" range in /proc/iomem output.
pub fn parse_iomem(text: &str) -> Option<u64> {
    let re = Regex::new(r"^\s*([0-9a-fA-F]+)-([0-9a-fA-F]+)\s*:\s*System RAM").ok()?;
    text.lines()
        .find_map(|line| re.captures(line))
        .and_then(|caps| u64::from_str_radix(&caps[1], 16).ok())
}

/// Identify the page size from the distance between `swapper_pg_dir` and
/// `idmap_pg_dir` (two tables before 4.1, three after), else from `hint`.
pub fn detect_page_size(symbols: &dyn SymbolLookup, hint: Option<u64>) -> Result<u64, AnalysisError> {
    let mut page_size = 0;

    if let (Some(swapper), Some(idmap)) = (
        symbols.symbol_value("swapper_pg_dir"),
        symbols.symbol_value("idmap_pg_dir"),
    ) {
        let value = swapper.wrapping_sub(idmap);
        if value == PAGESIZE_4K * 2 || value == PAGESIZE_4K * 3 {
            page_size = PAGESIZE_4K;
        } else if value == PAGESIZE_64K * 2 || value == PAGESIZE_64K * 3 {
            page_size = PAGESIZE_64K;
        } else {
            debug!("swapper_pg_dir - idmap_pg_dir: 0x{:x}", value);
            return Err(AnalysisError::PageSizeUndetermined);
        }
    } else {
        page_size = hint.unwrap_or(0);
    }

    match page_size {
        PAGESIZE_4K | PAGESIZE_64K => Ok(page_size),
        0 => Err(AnalysisError::PageSizeUndetermined),
        other => Err(AnalysisError::UnsupportedPageSize(other)),
    }
}

/// Symbol value whose kernel-half prefix reveals VA_BITS.
pub fn va_bits_sample_address(symbols: &dyn SymbolLookup, fallback: Option<u64>) -> Option<u64> {
    ["swapper_pg_dir", "idmap_pg_dir", "_text", "stext"]
        .iter()
        .find_map(|name| symbols.symbol_value(name))
        .or(fallback)
}

/// VA_BITS from a kernel address: scanning down from its highest set bit,
/// the first clear bit `b` gives `b + 2`.
pub fn calc_va_bits(value: u64) -> Option<u32> {
    if value == 0 {
        return None;
    }
    let highest = 63 - value.leading_zeros();
    (1..=highest)
        .rev()
        .find(|bit| value & (1u64 << bit) == 0)
        .map(|bit| bit + 2)
}

/// Everything the layout calculation reads from the outside world.
pub struct LayoutInputs<'a> {
    pub capture: CaptureKind,
    pub symbols: &'a dyn SymbolLookup,
    pub kernel_version: Option<&'a KernelVersion>,
    /// Host page size on a live system, VMCOREINFO PAGESIZE on a dump
    pub page_size_hint: Option<u64>,
    /// Used when none of the preferred VA_BITS symbols exist
    pub va_bits_fallback: Option<u64>,
    pub machdep: MachdepOptions,
    /// /proc/iomem contents, only consulted on a live system
    pub iomem: Option<&'a str>,
    pub dump: Option<&'a dyn DumpMetadata>,
    /// sizeof(struct page), needed for the vmemmap refinement
    pub page_struct_size: Option<u64>,
    pub ksyms_start: bool,
}

/// Resolve phys_offset in priority order: override, live iomem, dumpfile
/// metadata, kdump header, zero.
pub fn resolve_phys_offset(
    override_value: Option<u64>,
    capture: CaptureKind,
    iomem: Option<&str>,
    dump: Option<&dyn DumpMetadata>,
) -> (u64, PhysOffsetSource) {
    if let Some(value) = override_value {
        return (value, PhysOffsetSource::Override);
    }

    if capture == CaptureKind::Live {
        if let Some(value) = iomem.and_then(parse_iomem) {
            return (value, PhysOffsetSource::Iomem);
        }
        warn!("cannot determine physical base address from /proc/iomem");
    } else if let Some(dump) = dump {
        if let Some(value) = dump.dumpfile_phys_base() {
            return (value, PhysOffsetSource::DumpfileHeader);
        }
        if let Some(value) = dump.kdump_phys_base() {
            return (value, PhysOffsetSource::KdumpHeader);
        }
    }

    warn!(
        "phys_offset cannot be determined from the dumpfile. Using default value of 0. \
         If this is not correct, try --machdep phys_offset=<addr>"
    );
    (0, PhysOffsetSource::Default)
}

/// The computed address-space layout. Built once; only `refine_virtual_ranges`
/// produces a modified copy.
#[derive(Debug, Clone, Serialize)]
pub struct AddressSpaceLayout {
    pub flags: MachineFlags,
    pub page_size: u64,
    pub page_shift: u32,
    pub depth: PageTableDepth,
    pub va_bits: u32,
    pub page_offset: u64,
    pub kvbase: u64,
    pub userspace_top: u64,
    pub vmalloc_start: u64,
    pub vmalloc_end: u64,
    pub modules_vaddr: u64,
    pub modules_end: u64,
    pub vmemmap_vaddr: u64,
    pub vmemmap_end: u64,
    pub phys_offset: u64,
    pub phys_offset_source: PhysOffsetSource,
    pub stack_size: u64,
    pub pte: PteFormat,
}

impl AddressSpaceLayout {
    /// First pass: the fixed pre-3.17 region layout for a page size and VA_BITS.
    pub fn new(
        page_size: u64,
        va_bits: u32,
        phys_offset: u64,
        phys_offset_source: PhysOffsetSource,
    ) -> Result<Self, AnalysisError> {
        let depth = match page_size {
            PAGESIZE_4K => PageTableDepth::ThreeLevel4K,
            PAGESIZE_64K => PageTableDepth::TwoLevel64K,
            other => return Err(AnalysisError::UnsupportedPageSize(other)),
        };
        if !(32..=48).contains(&va_bits) {
            return Err(AnalysisError::TranslationError(format!(
                "unsupported VA_BITS: {}",
                va_bits
            )));
        }

        let page_offset = !0u64 << (va_bits - 1);
        let vmalloc_start = !0u64 << va_bits;
        let vmalloc_end = page_offset - LEGACY_VMALLOC_GAP - 1;
        let modules_vaddr = page_offset - MODULES_SIZE;

        let mut flags = depth.flag() | MachineFlags::VMEMMAP;
        if phys_offset_source != PhysOffsetSource::Default {
            flags |= MachineFlags::PHYS_OFFSET;
        }

        Ok(AddressSpaceLayout {
            flags,
            page_size,
            page_shift: page_size.trailing_zeros(),
            depth,
            va_bits,
            page_offset,
            kvbase: vmalloc_start,
            userspace_top: 1u64 << va_bits,
            vmalloc_start,
            vmalloc_end,
            modules_vaddr,
            modules_end: page_offset - 1,
            vmemmap_vaddr: vmalloc_end + 1 + SZ_64K,
            vmemmap_end: modules_vaddr - 1,
            phys_offset,
            phys_offset_source,
            stack_size: ARM64_STACK_SIZE,
            pte: PteFormat::for_version(None),
        })
    }

    /// Run the whole calculation: page size, VA_BITS, phys_offset, swap format
    /// and, for 3.17+ kernels, the vmemmap-derived region ends.
    pub fn calculate(inputs: &LayoutInputs<'_>) -> Result<Self, AnalysisError> {
        let page_size = match detect_page_size(inputs.symbols, inputs.page_size_hint) {
            Ok(size) => size,
            Err(AnalysisError::PageSizeUndetermined) if inputs.capture == CaptureKind::LogOnly => {
                debug!("log-only capture: assuming 4K pages");
                PAGESIZE_4K
            }
            Err(e) => return Err(e),
        };

        let sample = va_bits_sample_address(inputs.symbols, inputs.va_bits_fallback)
            .ok_or_else(|| AnalysisError::SymbolNotFound("no kernel symbol to derive VA_BITS".to_string()))?;
        let va_bits = calc_va_bits(sample).ok_or_else(|| {
            AnalysisError::TranslationError(format!("cannot derive VA_BITS from 0x{:x}", sample))
        })?;

        let (phys_offset, source) = resolve_phys_offset(
            inputs.machdep.phys_offset,
            inputs.capture,
            inputs.iomem,
            inputs.dump,
        );

        let mut layout = Self::new(page_size, va_bits, phys_offset, source)?;
        layout.pte = PteFormat::for_version(inputs.kernel_version);
        if inputs.ksyms_start {
            layout.flags |= MachineFlags::KSYMS_START;
        }

        if inputs.capture == CaptureKind::LogOnly {
            return Ok(layout);
        }

        let layout = match inputs.page_struct_size {
            Some(size) => layout.refine_virtual_ranges(size, inputs.kernel_version),
            None => layout,
        };

        info!(
            "arm64 layout: {}K pages, VA_BITS {}, page_offset 0x{:x}, phys_offset 0x{:x} ({:?})",
            layout.page_size / 1024,
            layout.va_bits,
            layout.page_offset,
            layout.phys_offset,
            layout.phys_offset_source
        );

        Ok(layout)
    }

    /// Second pass: vmalloc and vmemmap boundaries for 3.17+ kernels, which
    /// size the vmemmap area from sizeof(struct page).
    pub fn refine_virtual_ranges(self, page_struct_size: u64, version: Option<&KernelVersion>) -> Self {
        if let Some(v) = version {
            if *v < KernelVersion::new(3, 17, 0) {
                return self;
            }
        }

        let pud_size = self.depth.pgdir_size();
        let entries = 1u64 << (self.va_bits - self.page_shift);
        let refined = entries
            .checked_mul(page_struct_size)
            .and_then(|bytes| align_up(bytes, pud_size))
            .and_then(|vmemmap_size| {
                let vmalloc_end = self
                    .page_offset
                    .checked_sub(pud_size)?
                    .checked_sub(vmemmap_size)?
                    .checked_sub(SZ_64K)?;
                Some((vmemmap_size, vmalloc_end))
            })
            .filter(|&(_, vmalloc_end)| vmalloc_end > self.vmalloc_start);
        let (vmemmap_size, vmalloc_end) = match refined {
            Some(values) => values,
            None => {
                warn!(
                    "sizeof(struct page) {} does not fit the address space; keeping first-pass ranges",
                    page_struct_size
                );
                return self;
            }
        };
        let vmemmap_start = vmalloc_end + SZ_64K;

        debug!(
            "vmemmap size 0x{:x}: vmalloc_end 0x{:x} vmemmap 0x{:x}",
            vmemmap_size, vmalloc_end, vmemmap_start
        );

        AddressSpaceLayout {
            vmalloc_end: vmalloc_end - 1,
            vmemmap_vaddr: vmemmap_start,
            vmemmap_end: vmemmap_start + vmemmap_size - 1,
            ..self
        }
    }

    pub fn page_offset_mask(&self) -> u64 {
        self.page_size - 1
    }

    pub fn page_mask(&self) -> u64 {
        !(self.page_size - 1)
    }

    pub fn ptrs_per_pgd(&self) -> u64 {
        self.depth.ptrs_per_pgd()
    }

    /// Direct-map virtual to physical
    pub fn vtop(&self, vaddr: u64) -> u64 {
        vaddr.wrapping_sub(self.page_offset).wrapping_add(self.phys_offset)
    }

    /// Physical to direct-map virtual
    pub fn ptov(&self, paddr: u64) -> u64 {
        paddr.wrapping_sub(self.phys_offset).wrapping_add(self.page_offset)
    }

    pub fn is_kvaddr(&self, vaddr: u64) -> bool {
        vaddr >= self.vmalloc_start
    }

    pub fn is_uvaddr(&self, vaddr: u64) -> bool {
        vaddr < self.userspace_top
    }

    /// True for vmalloc, vmemmap and module addresses (everything that needs
    /// a table walk instead of VTOP).
    pub fn is_vmalloc_addr(&self, vaddr: u64) -> bool {
        (vaddr >= self.vmalloc_start && vaddr <= self.vmalloc_end)
            || (self.flags.contains(MachineFlags::VMEMMAP)
                && vaddr >= self.vmemmap_vaddr
                && vaddr <= self.vmemmap_end)
            || (vaddr >= self.modules_vaddr && vaddr <= self.modules_end)
    }

    /// Kernel virtual ranges sorted by start. `unity_end` is high_memory.
    pub fn kvaddr_ranges(&self, unity_end: u64) -> Vec<VaddrRange> {
        let mut ranges = vec![
            VaddrRange {
                kind: VaddrRangeKind::UnityMap,
                start: self.page_offset,
                end: unity_end,
            },
            VaddrRange {
                kind: VaddrRangeKind::Vmalloc,
                start: self.vmalloc_start,
                end: self.vmalloc_end + 1,
            },
            VaddrRange {
                kind: VaddrRangeKind::Modules,
                start: self.modules_vaddr,
                end: self.modules_end.wrapping_add(1),
            },
            VaddrRange {
                kind: VaddrRangeKind::Vmemmap,
                start: self.vmemmap_vaddr,
                end: self.vmemmap_end + 1,
            },
        ];
        ranges.sort_by_key(|r| r.start);
        ranges
    }
}

fn align_up(value: u64, align: u64) -> Option<u64> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

//! Memory module for LiME, ELF vmcore and raw memory captures
use crate::error::AnalysisError;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;

pub mod elf;

/// Structure to hold a physical memory region of the capture.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
}

impl MemoryRegion {
    /// Check if an address is within this memory region
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address <= self.end
    }

    /// Convert a physical address to a file offset within this region
    pub fn physical_to_file_offset(&self, physical_addr: u64) -> Option<u64> {
        if self.contains(physical_addr) {
            Some(self.file_offset + (physical_addr - self.start))
        } else {
            None
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Reads physical memory of the captured system.
pub trait PhysicalMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), AnalysisError>;

    fn read_physical_u64(&self, paddr: u64) -> Result<u64, AnalysisError> {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Reads kernel virtual memory of the captured system.
pub trait KernelMemory {
    fn read_kernel(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), AnalysisError>;

    fn read_kernel_u64(&self, vaddr: u64) -> Result<u64, AnalysisError> {
        let mut buf = [0u8; 8];
        self.read_kernel(vaddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_kernel_u32(&self, vaddr: u64) -> Result<u32, AnalysisError> {
        let mut buf = [0u8; 4];
        self.read_kernel(vaddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_kernel_i32(&self, vaddr: u64) -> Result<i32, AnalysisError> {
        let mut buf = [0u8; 4];
        self.read_kernel(vaddr, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_kernel_bytes(&self, vaddr: u64, len: usize) -> Result<Vec<u8>, AnalysisError> {
        let mut buf = vec![0u8; len];
        self.read_kernel(vaddr, &mut buf)?;
        Ok(buf)
    }
}

/// Dump-file metadata consulted when resolving phys_offset.
pub trait DumpMetadata {
    /// phys_offset recorded by the dump producer itself, if any.
    fn dumpfile_phys_base(&self) -> Option<u64>;
    /// Base of the lowest System RAM segment described by the dump header.
    fn kdump_phys_base(&self) -> Option<u64>;
}

/// Memory mapped file handle
pub struct MemoryMap {
    _file: File,
    pub mapped: Mmap,
}

impl MemoryMap {
    /// Create a new memory map from a file path
    pub fn new(file_path: &str) -> Result<Self, AnalysisError> {
        let file = File::open(file_path)?;
        let mapped = unsafe { Mmap::map(&file)? };
        Ok(MemoryMap {
            _file: file,
            mapped,
        })
    }
}

const LIME_MAGIC: u32 = 0x4C694D45; // bytes [0x45, 0x4D, 0x69, 0x4C] = "EMiL" ASCII
const LIME_HEADER_SIZE: usize = 32;

/// Check if the beginning of the buffer is the LIME signature.
pub fn is_lime(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    u32::from_le_bytes([data[0], data[1], data[2], data[3]]) == LIME_MAGIC
}

/// Parse the LIME headers of a memory capture and return memory regions.
/// LIME format structure (32 bytes per segment header):
/// - Magic: 4 bytes
/// - Version: 4 bytes (u32)
/// - Start: 8 bytes (u64) - physical address start
/// - End: 8 bytes (u64) - physical address end (inclusive)
/// - Reserved: 8 bytes
/// After each header comes the actual memory data for that region.
pub fn parse_lime_header(data: &[u8]) -> Option<Vec<MemoryRegion>> {
    let mut regions = Vec::new();
    let mut offset = 0usize;

    while data.len().saturating_sub(offset) >= LIME_HEADER_SIZE {
        let word = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[offset + at..offset + at + 8]);
            u64::from_le_bytes(buf)
        };

        let magic = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        if magic != LIME_MAGIC {
            break;
        }

        let start = word(8);
        let end = word(16);
        if end < start {
            break;
        }

        let region_size = match (end - start)
            .checked_add(1)
            .and_then(|len| usize::try_from(len).ok())
        {
            Some(len) => len,
            None => break,
        };
        let data_offset = offset + LIME_HEADER_SIZE;
        let next = match data_offset.checked_add(region_size) {
            Some(next) => next,
            None => break,
        };

        regions.push(MemoryRegion {
            start,
            end,
            file_offset: data_offset as u64,
        });

        offset = next;
    }

    if regions.is_empty() {
        None
    } else {
        Some(regions)
    }
}

/// Format of the capture behind a `DumpImage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Lime,
    ElfVmcore,
    Raw,
}

impl std::fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DumpFormat::Lime => write!(f, "LiME"),
            DumpFormat::ElfVmcore => write!(f, "ELF vmcore"),
            DumpFormat::Raw => write!(f, "raw"),
        }
    }
}

enum Backing {
    Mapped(MemoryMap),
    Owned(Vec<u8>),
}

/// A captured physical memory image plus whatever metadata its header carries.
pub struct DumpImage {
    backing: Backing,
    format: DumpFormat,
    regions: Vec<MemoryRegion>,
    vmcoreinfo: HashMap<String, String>,
}

impl DumpImage {
    /// Memory-map a capture file and detect its format.
    pub fn open(file_path: &str) -> Result<Self, AnalysisError> {
        let map = MemoryMap::new(file_path)?;
        Self::build(Backing::Mapped(map))
    }

    /// Wrap an in-memory capture.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, AnalysisError> {
        Self::build(Backing::Owned(bytes))
    }

    fn build(backing: Backing) -> Result<Self, AnalysisError> {
        let data: &[u8] = match &backing {
            Backing::Mapped(map) => &map.mapped,
            Backing::Owned(bytes) => bytes,
        };

        let (format, regions, vmcoreinfo) = if is_lime(data) {
            let regions = parse_lime_header(data).ok_or_else(|| {
                AnalysisError::MemoryMapError(
                    "LIME header detected, but no memory regions were found".to_string(),
                )
            })?;
            (DumpFormat::Lime, regions, HashMap::new())
        } else if elf::is_elf(data) {
            let vmcore = elf::parse_vmcore(data)?;
            (DumpFormat::ElfVmcore, vmcore.regions, vmcore.vmcoreinfo)
        } else {
            let end = (data.len() as u64).saturating_sub(1);
            (
                DumpFormat::Raw,
                vec![MemoryRegion {
                    start: 0,
                    end,
                    file_offset: 0,
                }],
                HashMap::new(),
            )
        };

        for (i, region) in regions.iter().enumerate() {
            log::debug!(
                "Region {}: Start: 0x{:x}, End: 0x{:x}, FileOffset: 0x{:x}",
                i,
                region.start,
                region.end,
                region.file_offset
            );
        }

        Ok(DumpImage {
            backing,
            format,
            regions,
            vmcoreinfo,
        })
    }

    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(map) => &map.mapped,
            Backing::Owned(bytes) => bytes,
        }
    }

    pub fn format(&self) -> DumpFormat {
        self.format
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Total bytes of physical memory described by the capture.
    pub fn memory_size(&self) -> u64 {
        self.regions.iter().map(|r| r.size()).sum()
    }

    /// A VMCOREINFO key, e.g. `OSRELEASE` or `SYMBOL(swapper_pg_dir)`.
    pub fn vmcoreinfo(&self, key: &str) -> Option<&str> {
        self.vmcoreinfo.get(key).map(|s| s.as_str())
    }

    /// A VMCOREINFO value parsed as a number (hex with 0x prefix or bare hex for
    /// SYMBOL() entries, decimal otherwise).
    pub fn vmcoreinfo_number(&self, key: &str) -> Option<u64> {
        let value = self.vmcoreinfo(key)?.trim();
        if let Some(hex) = value.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()
        } else if key.starts_with("SYMBOL(") {
            u64::from_str_radix(value, 16).ok()
        } else {
            value.parse::<u64>().ok()
        }
    }

    pub fn has_vmcoreinfo(&self) -> bool {
        !self.vmcoreinfo.is_empty()
    }
}

impl PhysicalMemory for DumpImage {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), AnalysisError> {
        let data = self.data();
        let mut done = 0usize;

        while done < buf.len() {
            let addr = paddr + done as u64;
            let region = self
                .regions
                .iter()
                .find(|r| r.contains(addr))
                .ok_or_else(|| AnalysisError::read_failed(addr, "physical memory"))?;

            let avail = (region.end - addr + 1) as usize;
            let chunk = avail.min(buf.len() - done);
            let file_offset = region
                .physical_to_file_offset(addr)
                .ok_or_else(|| AnalysisError::read_failed(addr, "physical memory"))?
                as usize;

            if file_offset + chunk > data.len() {
                return Err(AnalysisError::read_failed(addr, "physical memory (truncated dump)"));
            }

            buf[done..done + chunk].copy_from_slice(&data[file_offset..file_offset + chunk]);
            done += chunk;
        }

        Ok(())
    }
}

impl DumpMetadata for DumpImage {
    fn dumpfile_phys_base(&self) -> Option<u64> {
        self.vmcoreinfo_number("NUMBER(PHYS_OFFSET)")
    }

    fn kdump_phys_base(&self) -> Option<u64> {
        match self.format {
            DumpFormat::Lime | DumpFormat::ElfVmcore => {
                self.regions.iter().map(|r| r.start).min()
            }
            DumpFormat::Raw => None,
        }
    }
}

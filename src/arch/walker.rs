//! Translation table walks for 64K-page (2-level) and 4K-page (3-level)
//! kernels, with optional verbose tracing of each level.
use crate::arch::layout::{AddressSpaceLayout, PageTableDepth, PHYS_MASK};
use crate::arch::pte::render_pte;
use crate::error::AnalysisError;
use crate::memory::PhysicalMemory;
use serde::Serialize;
use std::io::Write;

const PMD_TYPE_MASK: u64 = 3;
const PMD_TYPE_SECT: u64 = 1;
const PTE_VALID: u64 = 1;

const LEVEL_PGD: usize = 0;
const LEVEL_PMD: usize = 1;
const LEVEL_PTE: usize = 2;

/// Outcome of a single translation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Translation {
    Mapped(u64),
    /// Non-present user leaf; the entry carries a swap slot
    Swapped { pte: u64, swp_type: u64, offset: u64 },
    Unmapped,
}

impl Translation {
    pub fn paddr(&self) -> Option<u64> {
        match self {
            Translation::Mapped(paddr) => Some(*paddr),
            _ => None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Translation::Mapped(_))
    }
}

struct CachedTable {
    paddr: u64,
    data: Vec<u8>,
}

/// One cached table per level, reused across walks. Must be invalidated
/// whenever the underlying image changes.
#[derive(Default)]
pub struct TableScratch {
    levels: [Option<CachedTable>; 3],
    hits: u64,
    fills: u64,
}

impl TableScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self) {
        self.levels = Default::default();
    }

    /// (hits, fills) since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.fills)
    }

    fn entry(
        &mut self,
        mem: &dyn PhysicalMemory,
        level: usize,
        table: u64,
        index: u64,
        entries: u64,
    ) -> Result<u64, AnalysisError> {
        let cached = matches!(&self.levels[level], Some(t) if t.paddr == table);
        if cached {
            self.hits += 1;
        } else {
            let mut data = vec![0u8; (entries * 8) as usize];
            mem.read_physical(table, &mut data)
                .map_err(|_| AnalysisError::read_failed(table, level_name(level)))?;
            self.levels[level] = Some(CachedTable { paddr: table, data });
            self.fills += 1;
        }

        let table = self.levels[level]
            .as_ref()
            .ok_or_else(|| AnalysisError::TranslationError("page table cache empty".to_string()))?;
        let at = (index * 8) as usize;
        let mut word = [0u8; 8];
        word.copy_from_slice(&table.data[at..at + 8]);
        Ok(u64::from_le_bytes(word))
    }
}

fn level_name(level: usize) -> &'static str {
    match level {
        LEVEL_PGD => "page global directory",
        LEVEL_PMD => "page middle directory",
        _ => "page table",
    }
}

/// Walks the tables of one address space layout against physical memory.
pub struct PageTableWalker<'a> {
    layout: &'a AddressSpaceLayout,
    mem: &'a dyn PhysicalMemory,
}

impl<'a> PageTableWalker<'a> {
    pub fn new(layout: &'a AddressSpaceLayout, mem: &'a dyn PhysicalMemory) -> Self {
        PageTableWalker { layout, mem }
    }

    /// Translate `vaddr` through the table rooted at the kernel virtual
    /// address `pgd`. Tracing goes to `trace` and never changes the result.
    pub fn translate(
        &self,
        scratch: &mut TableScratch,
        pgd: u64,
        vaddr: u64,
        mut trace: Option<&mut dyn Write>,
    ) -> Result<Translation, AnalysisError> {
        if let Some(out) = trace.as_mut() {
            writeln!(out, "PAGE DIRECTORY: {:x}", pgd)?;
        }

        let depth = self.layout.depth;
        let pgd_index = (vaddr >> depth.pgdir_shift()) & (depth.ptrs_per_pgd() - 1);
        let pgd_val = scratch.entry(
            self.mem,
            LEVEL_PGD,
            self.layout.vtop(pgd),
            pgd_index,
            depth.ptrs_per_pgd(),
        )?;
        if let Some(out) = trace.as_mut() {
            writeln!(out, "   PGD: {:x} => {:x}", pgd + pgd_index * 8, pgd_val)?;
        }
        if pgd_val == 0 {
            return Ok(Translation::Unmapped);
        }

        let leaf_table_entry = match depth {
            PageTableDepth::TwoLevel64K => pgd_val,
            PageTableDepth::ThreeLevel4K => {
                let pmd_base = self.next_table(pgd_val);
                let pmd_index = (vaddr >> depth.pmd_shift()) & (depth.ptrs_per_pmd() - 1);
                let pmd_val =
                    scratch.entry(self.mem, LEVEL_PMD, pmd_base, pmd_index, depth.ptrs_per_pmd())?;
                if let Some(out) = trace.as_mut() {
                    writeln!(
                        out,
                        "   PMD: {:x} => {:x}",
                        self.layout.ptov(pmd_base) + pmd_index * 8,
                        pmd_val
                    )?;
                }
                if pmd_val == 0 {
                    return Ok(Translation::Unmapped);
                }
                pmd_val
            }
        };

        let block_label = match depth {
            PageTableDepth::TwoLevel64K => "512MB",
            PageTableDepth::ThreeLevel4K => "2MB",
        };
        if let Some(block) = self.block(leaf_table_entry, vaddr, block_label, &mut trace)? {
            return Ok(block);
        }

        let pte_base = self.next_table(leaf_table_entry);
        let pte_index = (vaddr >> self.layout.page_shift) & (depth.ptrs_per_pte() - 1);
        let pte_val = scratch.entry(self.mem, LEVEL_PTE, pte_base, pte_index, depth.ptrs_per_pte())?;
        if let Some(out) = trace.as_mut() {
            writeln!(
                out,
                "   PTE: {:x} => {:x}",
                self.layout.ptov(pte_base) + pte_index * 8,
                pte_val
            )?;
        }
        if pte_val == 0 {
            return Ok(Translation::Unmapped);
        }

        self.leaf(pte_val, vaddr, &mut trace)
    }

    fn next_table(&self, entry: u64) -> u64 {
        entry & PHYS_MASK & self.layout.page_mask()
    }

    /// Block descriptor one level above the leaf table. The 4K top level
    /// only walks through table entries.
    fn block(
        &self,
        entry: u64,
        vaddr: u64,
        label: &str,
        trace: &mut Option<&mut dyn Write>,
    ) -> Result<Option<Translation>, AnalysisError> {
        if entry & PMD_TYPE_MASK != PMD_TYPE_SECT {
            return Ok(None);
        }

        let block_mask = !(self.layout.depth.block_size() - 1);
        let section_base = entry & block_mask & PHYS_MASK;
        if let Some(out) = trace.as_mut() {
            writeln!(out, "  PAGE: {:x}  ({})\n", section_base, label)?;
            render_pte(self.layout, entry, &mut **out)?;
        }
        Ok(Some(Translation::Mapped(section_base + (vaddr & !block_mask))))
    }

    fn leaf(
        &self,
        pte_val: u64,
        vaddr: u64,
        trace: &mut Option<&mut dyn Write>,
    ) -> Result<Translation, AnalysisError> {
        if pte_val & PTE_VALID != 0 {
            let paddr = (pte_val & self.layout.page_mask() & PHYS_MASK) + (vaddr & self.layout.page_offset_mask());
            if let Some(out) = trace.as_mut() {
                writeln!(out, "  PAGE: {:x}\n", paddr & self.layout.page_mask())?;
                render_pte(self.layout, pte_val, &mut **out)?;
            }
            return Ok(Translation::Mapped(paddr));
        }

        if let Some(out) = trace.as_mut() {
            writeln!(out)?;
            render_pte(self.layout, pte_val, &mut **out)?;
        }

        if self.layout.is_uvaddr(vaddr) && !self.layout.pte.is_present(pte_val) {
            return Ok(Translation::Swapped {
                pte: pte_val,
                swp_type: self.layout.pte.swp_type(pte_val),
                offset: self.layout.pte.swp_offset(pte_val),
            });
        }
        Ok(Translation::Unmapped)
    }
}

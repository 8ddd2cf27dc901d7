//! Kernel virtual memory reads on top of a physical image: unity-mapped
//! addresses go through VTOP, everything else through the kernel page tables.
use crate::arch::layout::AddressSpaceLayout;
use crate::arch::walker::{PageTableWalker, TableScratch, Translation};
use crate::error::AnalysisError;
use crate::memory::{KernelMemory, PhysicalMemory};
use log::debug;
use std::cell::RefCell;

/// Kernel memory reader for one address space layout.
pub struct KernelReader<'a> {
    layout: &'a AddressSpaceLayout,
    mem: &'a dyn PhysicalMemory,
    kernel_pgd: Option<u64>,
    scratch: RefCell<TableScratch>,
}

impl<'a> KernelReader<'a> {
    /// A reader limited to the unity map until a kernel pgd is supplied.
    pub fn new(layout: &'a AddressSpaceLayout, mem: &'a dyn PhysicalMemory) -> Self {
        KernelReader {
            layout,
            mem,
            kernel_pgd: None,
            scratch: RefCell::new(TableScratch::new()),
        }
    }

    pub fn with_kernel_pgd(mut self, kernel_pgd: Option<u64>) -> Self {
        self.kernel_pgd = kernel_pgd;
        self
    }

    pub fn kernel_pgd(&self) -> Option<u64> {
        self.kernel_pgd
    }

    /// Translate a kernel virtual address to physical.
    pub fn translate(&self, vaddr: u64) -> Result<u64, AnalysisError> {
        if !self.layout.is_kvaddr(vaddr) {
            return Err(AnalysisError::AddressTranslationFailed(vaddr));
        }

        if !self.layout.is_vmalloc_addr(vaddr) {
            return Ok(self.layout.vtop(vaddr));
        }

        let pgd = self.kernel_pgd.ok_or_else(|| {
            debug!("no kernel pgd for vmalloc address {:x}", vaddr);
            AnalysisError::AddressTranslationFailed(vaddr)
        })?;
        let walker = PageTableWalker::new(self.layout, self.mem);
        match walker.translate(&mut self.scratch.borrow_mut(), pgd, vaddr, None)? {
            Translation::Mapped(paddr) => Ok(paddr),
            other => {
                debug!("{:x}: {:?}", vaddr, other);
                Err(AnalysisError::AddressTranslationFailed(vaddr))
            }
        }
    }
}

impl KernelMemory for KernelReader<'_> {
    fn read_kernel(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), AnalysisError> {
        // The unity map is physically contiguous
        if self.layout.is_kvaddr(vaddr) && !self.layout.is_vmalloc_addr(vaddr) {
            return self.mem.read_physical(self.layout.vtop(vaddr), buf);
        }

        let page_size = self.layout.page_size;
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr + done as u64;
            let in_page = (page_size - (addr & self.layout.page_offset_mask())) as usize;
            let len = in_page.min(buf.len() - done);
            let paddr = self.translate(addr)?;
            self.mem.read_physical(paddr, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }
}

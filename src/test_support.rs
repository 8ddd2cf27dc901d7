//! Synthetic memory images and symbol tables shared by unit tests.
use crate::error::AnalysisError;
use crate::memory::{KernelMemory, PhysicalMemory};
use std::collections::BTreeMap;

const CHUNK: u64 = 0x10000;

/// Physical memory with only the chunks that were written to.
#[derive(Default)]
pub struct SparseMemory {
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bytes(&mut self, paddr: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let addr = paddr + i as u64;
            let base = addr & !(CHUNK - 1);
            let chunk = self
                .chunks
                .entry(base)
                .or_insert_with(|| vec![0u8; CHUNK as usize]);
            chunk[(addr - base) as usize] = *byte;
        }
    }

    pub fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }
}

impl PhysicalMemory for SparseMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), AnalysisError> {
        for (i, slot) in buf.iter_mut().enumerate() {
            let addr = paddr + i as u64;
            let base = addr & !(CHUNK - 1);
            let chunk = self
                .chunks
                .get(&base)
                .ok_or_else(|| AnalysisError::read_failed(addr, "physical memory"))?;
            *slot = chunk[(addr - base) as usize];
        }
        Ok(())
    }
}

/// Kernel memory where virtual == physical, for code that only needs
/// plain kernel reads.
pub struct FlatKernel(pub SparseMemory);

impl KernelMemory for FlatKernel {
    fn read_kernel(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), AnalysisError> {
        self.0.read_physical(vaddr, buf)
    }
}

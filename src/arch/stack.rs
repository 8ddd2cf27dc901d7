//! A task's kernel stack copied out of the image.
use crate::error::AnalysisError;
use crate::memory::KernelMemory;

pub struct StackBuffer {
    base: u64,
    data: Vec<u8>,
}

impl StackBuffer {
    /// Copy `size` bytes of stack starting at `base`.
    pub fn read(mem: &dyn KernelMemory, base: u64, size: u64) -> Result<Self, AnalysisError> {
        let data = mem
            .read_kernel_bytes(base, size as usize)
            .map_err(|_| AnalysisError::read_failed(base, "kernel stack"))?;
        Ok(StackBuffer { base, data })
    }

    pub fn from_bytes(base: u64, data: Vec<u8>) -> Self {
        StackBuffer { base, data }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn top(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    /// True for addresses in [base, top)
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.top()
    }

    pub fn slice(&self, addr: u64, len: usize) -> Option<&[u8]> {
        if addr < self.base {
            return None;
        }
        let start = (addr - self.base) as usize;
        let end = start.checked_add(len)?;
        self.data.get(start..end)
    }

    /// The 8-byte word at `addr`, if it lies entirely inside the buffer.
    pub fn word(&self, addr: u64) -> Option<u64> {
        let bytes = self.slice(addr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Some(u64::from_le_bytes(word))
    }

    #[cfg(test)]
    pub fn set_word(&mut self, addr: u64, value: u64) {
        let start = (addr - self.base) as usize;
        self.data[start..start + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[cfg(test)]
    pub fn set_bytes(&mut self, addr: u64, bytes: &[u8]) {
        let start = (addr - self.base) as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

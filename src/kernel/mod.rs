//! Kernel task structures read through kernel virtual memory
use crate::error::AnalysisError;
use crate::memory::KernelMemory;
use serde::Serialize;

pub mod tasks;

pub use tasks::TaskWalker;

/// Linux PID_MAX_LIMIT on 64-bit
const PID_MAX_LIMIT: i32 = 4_194_304;

/// What the unwinder and the translators need to know about one task.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct TaskContext {
    /// Kernel virtual address of the task_struct
    pub task: u64,
    pub pid: i32,
    pub comm: String,
    /// mm_struct pointer; zero for kernel threads
    pub mm: u64,
    /// Base of the kernel stack (task->stack)
    pub stack: u64,
    pub processor: u32,
    /// Running on a CPU when the image was captured
    pub active: bool,
}

impl TaskContext {
    pub fn is_kernel_thread(&self) -> bool {
        self.mm == 0
    }
}

/// Read a NUL-padded string of at most `length` bytes.
pub fn read_string(mem: &dyn KernelMemory, vaddr: u64, length: usize) -> Result<String, AnalysisError> {
    let bytes = mem.read_kernel_bytes(vaddr, length)?;
    let nul_pos = bytes.iter().position(|&c| c == 0).unwrap_or(length);
    Ok(String::from_utf8_lossy(&bytes[..nul_pos]).to_string())
}

/// Reject task_structs that are clearly not real tasks.
pub fn validate_task(task: &TaskContext) -> bool {
    if task.pid < 0 || task.pid > PID_MAX_LIMIT {
        return false;
    }

    // The swapper's comm can be anything depending on the kernel build
    if task.pid == 0 {
        return true;
    }

    if task.comm.is_empty() {
        return false;
    }

    let printable = task
        .comm
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control())
        .count();
    printable * 2 >= task.comm.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FlatKernel, SparseMemory};

    fn task(pid: i32, comm: &str) -> TaskContext {
        TaskContext {
            task: 0xffff_ffc0_3900_0000,
            pid,
            comm: comm.to_string(),
            mm: 0,
            stack: 0xffff_ffc0_3a00_0000,
            processor: 0,
            active: false,
        }
    }

    #[test]
    fn test_read_string_stops_at_nul() {
        let mut mem = SparseMemory::new();
        mem.write_bytes(0x1000, b"kworker/0:1\0\0\0\0\0");
        let kernel = FlatKernel(mem);
        assert_eq!(read_string(&kernel, 0x1000, 16).unwrap(), "kworker/0:1");
    }

    #[test]
    fn test_validate_task() {
        assert!(validate_task(&task(1, "init")));
        assert!(validate_task(&task(0, "")));
        assert!(!validate_task(&task(-1, "init")));
        assert!(!validate_task(&task(PID_MAX_LIMIT + 1, "init")));
        assert!(!validate_task(&task(12, "")));
        assert!(!validate_task(&task(12, "\u{1}\u{2}\u{3}a")));
        assert!(task(12, "x").is_kernel_thread());
    }
}

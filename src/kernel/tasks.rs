//! Walk the task list from init_task and build per-task contexts
use crate::error::AnalysisError;
use crate::kernel::{read_string, validate_task, TaskContext};
use crate::memory::KernelMemory;
use crate::symbols::{SymbolLookup, TypeInfo};
use log::{debug, warn};
use std::collections::HashSet;

const TASK_COMM_LEN: usize = 16;
/// Safety limit against corrupted lists
const MAX_TASKS: usize = 10000;

/// task_struct member offsets used by the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOffsets {
    pub tasks: u64,
    pub pid: u64,
    pub comm: u64,
    pub mm: u64,
    pub stack: u64,
    pub on_cpu: Option<u64>,
    /// task_struct.cpu on kernels that moved it out of thread_info
    pub cpu: Option<u64>,
    pub thread_info_cpu: Option<u64>,
}

impl TaskOffsets {
    pub fn resolve(types: &dyn TypeInfo) -> Result<Self, AnalysisError> {
        let member = |name: &str| {
            types.member_offset("task_struct", name).ok_or_else(|| {
                AnalysisError::InvalidStructure(format!("task_struct.{} offset unknown", name))
            })
        };

        Ok(TaskOffsets {
            tasks: member("tasks")?,
            pid: member("pid")?,
            comm: member("comm")?,
            mm: member("mm")?,
            stack: member("stack")?,
            on_cpu: types.member_offset("task_struct", "on_cpu"),
            cpu: types.member_offset("task_struct", "cpu"),
            thread_info_cpu: types.member_offset("thread_info", "cpu"),
        })
    }
}

/// Reads task_structs through kernel virtual memory.
pub struct TaskWalker<'a> {
    mem: &'a dyn KernelMemory,
    offsets: TaskOffsets,
}

impl<'a> TaskWalker<'a> {
    pub fn new(mem: &'a dyn KernelMemory, types: &dyn TypeInfo) -> Result<Self, AnalysisError> {
        Ok(TaskWalker {
            mem,
            offsets: TaskOffsets::resolve(types)?,
        })
    }

    /// Build the context of the task_struct at `task`.
    pub fn read_task(&self, task: u64) -> Result<TaskContext, AnalysisError> {
        let o = &self.offsets;
        let pid = self.mem.read_kernel_i32(task + o.pid)?;
        let comm = read_string(self.mem, task + o.comm, TASK_COMM_LEN)?;
        let mm = self.mem.read_kernel_u64(task + o.mm)?;
        let stack = self.mem.read_kernel_u64(task + o.stack)?;

        let active = match o.on_cpu {
            Some(off) => self.mem.read_kernel_i32(task + off).unwrap_or(0) != 0,
            None => false,
        };

        let processor = match (o.cpu, o.thread_info_cpu) {
            (Some(off), _) => self.mem.read_kernel_u32(task + off).unwrap_or(0),
            // thread_info lives at the bottom of the stack on older kernels
            (None, Some(off)) => self.mem.read_kernel_u32(stack + off).unwrap_or(0),
            (None, None) => 0,
        };

        Ok(TaskContext {
            task,
            pid,
            comm,
            mm,
            stack,
            processor,
            active,
        })
    }

    /// Walk init_task.tasks until the list comes back around.
    pub fn walk(&self, symbols: &dyn SymbolLookup) -> Result<Vec<TaskContext>, AnalysisError> {
        let init_task = symbols
            .symbol_value("init_task")
            .ok_or_else(|| AnalysisError::SymbolNotFound("init_task".to_string()))?;
        let tasks_offset = self.offsets.tasks;
        debug!("walking tasks from init_task {:x}, tasks offset 0x{:x}", init_task, tasks_offset);

        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut current = init_task;

        loop {
            if found.len() >= MAX_TASKS {
                warn!("maximum task count reached while walking the task list");
                break;
            }
            if !visited.insert(current) {
                warn!("task list loops back to {:x} before reaching init_task", current);
                break;
            }

            match self.read_task(current) {
                Ok(task) if validate_task(&task) => found.push(task),
                Ok(task) => warn!("task_struct at {:x} (pid {}) failed validation, skipping", current, task.pid),
                Err(e) => warn!("cannot read task_struct at {:x}: {}", current, e),
            }

            let next = match self.mem.read_kernel_u64(current + tasks_offset) {
                Ok(next) => next,
                Err(e) => {
                    warn!("cannot follow tasks.next of {:x}: {}", current, e);
                    break;
                }
            };
            if next == 0 {
                warn!("NULL tasks.next in task_struct {:x}", current);
                break;
            }

            // container_of(next, struct task_struct, tasks)
            current = next.wrapping_sub(tasks_offset);
            if current == init_task {
                break;
            }
        }

        debug!("found {} tasks", found.len());
        Ok(found)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::symbols::SymbolResolver;
    use crate::test_support::{FlatKernel, SparseMemory};

    pub const INIT_TASK: u64 = 0xffff_ffc0_0060_0000;
    const TASKS: u64 = 0x100;
    const PID: u64 = 0x180;
    const COMM: u64 = 0x200;
    const MM: u64 = 0x140;
    const STACK: u64 = 0x8;
    const ON_CPU: u64 = 0x2c;

    pub fn task_types(resolver: &mut SymbolResolver) {
        resolver.set_member_offset("task_struct", "tasks", TASKS as usize);
        resolver.set_member_offset("task_struct", "pid", PID as usize);
        resolver.set_member_offset("task_struct", "comm", COMM as usize);
        resolver.set_member_offset("task_struct", "mm", MM as usize);
        resolver.set_member_offset("task_struct", "stack", STACK as usize);
        resolver.set_member_offset("task_struct", "on_cpu", ON_CPU as usize);
        resolver.set_member_offset("thread_info", "cpu", 0x10);
    }

    pub fn write_task(mem: &mut SparseMemory, task: u64, next: u64, pid: i32, comm: &str, mm: u64, stack: u64) {
        mem.write_u64(task + TASKS, next + TASKS);
        mem.write_u32(task + PID, pid as u32);
        let mut name = [0u8; 16];
        name[..comm.len()].copy_from_slice(comm.as_bytes());
        mem.write_bytes(task + COMM, &name);
        mem.write_u64(task + MM, mm);
        mem.write_u64(task + STACK, stack);
    }

    fn image() -> (FlatKernel, SymbolResolver) {
        let second = INIT_TASK + 0x1_0000;
        let third = INIT_TASK + 0x2_0000;
        let mut mem = SparseMemory::new();
        write_task(&mut mem, INIT_TASK, second, 0, "swapper/0", 0, 0xffff_ffc0_0058_0000);
        write_task(&mut mem, second, third, 1, "init", 0xffff_ffc0_3b00_0000, 0xffff_ffc0_3a00_0000);
        write_task(&mut mem, third, INIT_TASK, 2, "kthreadd", 0, 0xffff_ffc0_3a01_0000);
        mem.write_u32(third + ON_CPU, 1);
        mem.write_u32(0xffff_ffc0_3a01_0000 + 0x10, 3);

        let mut resolver = SymbolResolver::new();
        resolver.add_symbol("init_task", INIT_TASK, 'D', None);
        task_types(&mut resolver);
        (FlatKernel(mem), resolver)
    }

    #[test]
    fn test_walk_circular_list() {
        let (mem, resolver) = image();
        let walker = TaskWalker::new(&mem, &resolver).unwrap();
        let tasks = walker.walk(&resolver).unwrap();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].comm, "swapper/0");
        assert_eq!(tasks[1].pid, 1);
        assert_eq!(tasks[1].mm, 0xffff_ffc0_3b00_0000);
        assert!(!tasks[1].is_kernel_thread());
        assert!(tasks[2].active);
        assert_eq!(tasks[2].processor, 3);
    }

    #[test]
    fn test_walk_stops_on_loop() {
        let (mut mem, resolver) = image();
        // third task points back at the second instead of init_task
        let second = INIT_TASK + 0x1_0000;
        mem.0.write_u64(INIT_TASK + 0x2_0000 + TASKS, second + TASKS);
        let walker = TaskWalker::new(&mem, &resolver).unwrap();
        assert_eq!(walker.walk(&resolver).unwrap().len(), 3);
    }

    #[test]
    fn test_offsets_fall_back_to_builtin_table() {
        let mut resolver = SymbolResolver::new();
        resolver.set_member_offset("task_struct", "pid", 0x10);
        let offsets = TaskOffsets::resolve(&resolver).unwrap();
        assert_eq!(offsets.pid, 0x10);
        assert_eq!(offsets.tasks, 0x2e8);
        assert_eq!(offsets.cpu, None);
    }
}

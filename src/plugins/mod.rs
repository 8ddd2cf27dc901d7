//! Plugin registry for the arm64 memory parser
pub mod bt;
pub mod eframes;
pub mod mach;
pub mod plugin_trait;
pub mod ps;
pub mod pte;
pub mod vtop;

pub use bt::BtPlugin;
pub use eframes::EframesPlugin;
pub use mach::MachPlugin;
pub use ps::PsPlugin;
pub use pte::PtePlugin;
pub use vtop::VtopPlugin;

/// (name, description) of every plugin, in the order `--list-plugins` shows them
pub fn list_plugins() -> Vec<(&'static str, &'static str)> {
    vec![
        ("ps", "List tasks with their task_struct, CPU and state"),
        ("vtop", "Translate kernel or user virtual addresses to physical"),
        ("pte", "Decode page table entries into physical page, flags or swap location"),
        ("bt", "Backtrace kernel stacks, including exception frames"),
        ("eframes", "Search task stacks for kernel and user exception frames"),
        ("mach", "Show machine type, memory size, CPUs and kernel virtual layout"),
    ]
}

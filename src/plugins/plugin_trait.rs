//! Plugin system trait for the arm64 memory parser
use crate::arch::Architecture;
use crate::error::AnalysisError;
use crate::kernel::TaskContext;
use crate::memory::KernelMemory;
use crate::plugins::bt::BacktraceRecord;
use crate::plugins::eframes::EframeRecord;
use crate::plugins::mach::MachineSummary;
use crate::plugins::pte::PteRecord;
use crate::plugins::vtop::TranslationRecord;
use crate::symbols::SymbolLookup;

/// Analysis context that provides access to all necessary components
pub struct AnalysisContext<'a> {
    pub arch: &'a dyn Architecture,
    pub kernel: &'a dyn KernelMemory,
    pub symbols: &'a dyn SymbolLookup,
    /// Tasks found on the task list, in list order
    pub tasks: &'a [TaskContext],
}

impl AnalysisContext<'_> {
    pub fn task_by_pid(&self, pid: i32) -> Result<&TaskContext, AnalysisError> {
        self.tasks
            .iter()
            .find(|t| t.pid == pid)
            .ok_or_else(|| AnalysisError::PluginError(format!("no task with pid {}", pid)))
    }
}

/// Output from plugins - different types of data
pub enum PluginOutput {
    Tasks(Vec<TaskContext>),
    Translations(Vec<TranslationRecord>),
    Ptes(Vec<PteRecord>),
    Backtraces(Vec<BacktraceRecord>),
    ExceptionFrames(Vec<EframeRecord>),
    Machine(MachineSummary),
}

/// Trait that all forensic plugins must implement
pub trait ForensicPlugin {
    /// Get the name of the plugin
    fn name(&self) -> &str;

    /// Get a description of what the plugin does
    fn description(&self) -> &str;

    /// Run the plugin with the provided analysis context
    fn run(&self, context: &AnalysisContext) -> Result<PluginOutput, AnalysisError>;
}

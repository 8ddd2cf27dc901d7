//! Bt plugin - kernel stack backtraces
use crate::arch::unwind::BacktraceReport;
use crate::arch::BacktraceOptions;
use crate::error::AnalysisError;
use crate::kernel::TaskContext;
use crate::plugins::plugin_trait::{AnalysisContext, ForensicPlugin, PluginOutput};
use log::warn;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BacktraceRecord {
    pub pid: i32,
    pub task: u64,
    pub cpu: u32,
    pub comm: String,
    pub report: BacktraceReport,
    /// crash-style rendering of the backtrace
    pub text: String,
}

impl BacktraceRecord {
    pub fn header(&self) -> String {
        format!(
            "PID: {:<6}  TASK: {:x}  CPU: {:<2}  COMMAND: \"{}\"",
            self.pid, self.task, self.cpu, self.comm
        )
    }
}

/// Which tasks to unwind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtSelection {
    Pids(Vec<i32>),
    /// Every task on the task list
    All,
    /// Tasks running when the image was captured
    Active,
}

pub struct BtPlugin {
    pub selection: BtSelection,
    pub options: BacktraceOptions,
}

impl BtPlugin {
    fn select<'c>(&self, context: &'c AnalysisContext) -> Result<Vec<&'c TaskContext>, AnalysisError> {
        match &self.selection {
            BtSelection::Pids(pids) => pids.iter().map(|&pid| context.task_by_pid(pid)).collect(),
            BtSelection::All => Ok(context.tasks.iter().collect()),
            BtSelection::Active => {
                let active: Vec<_> = context.tasks.iter().filter(|t| t.active).collect();
                if active.is_empty() {
                    return Err(AnalysisError::PluginError(
                        "no active tasks found; use --pid or --all".to_string(),
                    ));
                }
                Ok(active)
            }
        }
    }
}

impl ForensicPlugin for BtPlugin {
    fn name(&self) -> &str {
        "bt"
    }

    fn description(&self) -> &str {
        "Backtrace kernel stacks, including exception frames"
    }

    fn run(&self, context: &AnalysisContext) -> Result<PluginOutput, AnalysisError> {
        let mut records = Vec::new();

        for task in self.select(context)? {
            let mut out = Vec::new();
            let report = match context.arch.backtrace(task, &self.options, &mut out) {
                Ok(report) => report,
                Err(e) => {
                    warn!("bt: pid {}: {}", task.pid, e);
                    continue;
                }
            };
            records.push(BacktraceRecord {
                pid: task.pid,
                task: task.task,
                cpu: task.processor,
                comm: task.comm.clone(),
                report,
                text: String::from_utf8(out)?,
            });
        }

        Ok(PluginOutput::Backtraces(records))
    }
}

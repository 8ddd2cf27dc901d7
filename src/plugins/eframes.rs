//! Eframes plugin - exhaustive exception frame search over task stacks
use crate::arch::eframe::EframeHit;
use crate::error::AnalysisError;
use crate::plugins::plugin_trait::{AnalysisContext, ForensicPlugin, PluginOutput};
use log::warn;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct EframeRecord {
    pub pid: i32,
    pub task: u64,
    pub comm: String,
    pub hits: Vec<EframeHit>,
    pub text: String,
}

#[derive(Default)]
pub struct EframesPlugin {
    /// Only this task; every task when None
    pub pid: Option<i32>,
}

impl ForensicPlugin for EframesPlugin {
    fn name(&self) -> &str {
        "eframes"
    }

    fn description(&self) -> &str {
        "Search task stacks for kernel and user exception frames"
    }

    fn run(&self, context: &AnalysisContext) -> Result<PluginOutput, AnalysisError> {
        let tasks = match self.pid {
            Some(pid) => vec![context.task_by_pid(pid)?],
            None => context.tasks.iter().collect(),
        };

        let mut records = Vec::new();
        for task in tasks {
            let mut out = Vec::new();
            match context.arch.eframe_search(task, &mut out) {
                Ok(hits) if hits.is_empty() => {}
                Ok(hits) => records.push(EframeRecord {
                    pid: task.pid,
                    task: task.task,
                    comm: task.comm.clone(),
                    hits,
                    text: String::from_utf8(out)?,
                }),
                Err(e) => warn!("eframes: pid {}: {}", task.pid, e),
            }
        }

        Ok(PluginOutput::ExceptionFrames(records))
    }
}

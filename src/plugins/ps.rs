//! Ps plugin - lists the tasks found on the task list
use crate::error::AnalysisError;
use crate::plugins::plugin_trait::{AnalysisContext, ForensicPlugin, PluginOutput};
use regex::Regex;

#[derive(Default)]
pub struct PsPlugin {
    pub pid: Option<i32>,
    /// Regex matched against the command name
    pub name: Option<String>,
}

impl ForensicPlugin for PsPlugin {
    fn name(&self) -> &str {
        "ps"
    }

    fn description(&self) -> &str {
        "List tasks with their task_struct, CPU and state"
    }

    fn run(&self, context: &AnalysisContext) -> Result<PluginOutput, AnalysisError> {
        let name_filter = self.name.as_deref().map(Regex::new).transpose()?;

        let tasks = context
            .tasks
            .iter()
            .filter(|t| self.pid.map_or(true, |pid| t.pid == pid))
            .filter(|t| name_filter.as_ref().map_or(true, |re| re.is_match(&t.comm)))
            .cloned()
            .collect();

        Ok(PluginOutput::Tasks(tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::tests::Harness;

    #[test]
    fn test_filters() {
        Harness::new().with_context(|context| {
            let all = PsPlugin::default().run(context).unwrap();
            assert!(matches!(all, PluginOutput::Tasks(ref t) if t.len() == 3));

            let by_name = PsPlugin {
                pid: None,
                name: Some("^kth".to_string()),
            };
            match by_name.run(context).unwrap() {
                PluginOutput::Tasks(tasks) => {
                    assert_eq!(tasks.len(), 1);
                    assert_eq!(tasks[0].comm, "kthreadd");
                }
                _ => panic!("expected tasks"),
            }

            let by_pid = PsPlugin {
                pid: Some(1),
                name: None,
            };
            assert!(matches!(by_pid.run(context).unwrap(), PluginOutput::Tasks(ref t) if t[0].comm == "init"));

            let bad = PsPlugin {
                pid: None,
                name: Some("(".to_string()),
            };
            assert!(matches!(bad.run(context), Err(AnalysisError::RegexError(_))));
        });
    }
}

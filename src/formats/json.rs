//! JSON output formatter for the arm64 memory parser
use crate::error::AnalysisError;
use crate::formats::traits::OutputFormatter;
use crate::kernel::TaskContext;
use crate::plugins::bt::BacktraceRecord;
use crate::plugins::eframes::EframeRecord;
use crate::plugins::mach::MachineSummary;
use crate::plugins::pte::PteRecord;
use crate::plugins::vtop::TranslationRecord;
use serde::Serialize;

#[derive(Serialize)]
struct OutputWrapper<'a, T> {
    plugin: &'a str,
    timestamp: String,
    count: usize,
    results: &'a [T],
}

fn wrap<T: Serialize>(plugin: &str, results: &[T]) -> Result<String, AnalysisError> {
    let wrapper = OutputWrapper {
        plugin,
        timestamp: chrono::Utc::now().to_rfc3339(),
        count: results.len(),
        results,
    };

    let json = serde_json::to_string_pretty(&wrapper)?;
    Ok(json)
}

/// JSON formatter that outputs data in JSON format with metadata
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn format_tasks(&self, tasks: &[TaskContext]) -> Result<String, AnalysisError> {
        wrap("ps", tasks)
    }

    fn format_translations(&self, records: &[TranslationRecord]) -> Result<String, AnalysisError> {
        wrap("vtop", records)
    }

    fn format_ptes(&self, records: &[PteRecord]) -> Result<String, AnalysisError> {
        wrap("pte", records)
    }

    fn format_backtraces(&self, records: &[BacktraceRecord]) -> Result<String, AnalysisError> {
        wrap("bt", records)
    }

    fn format_eframes(&self, records: &[EframeRecord]) -> Result<String, AnalysisError> {
        wrap("eframes", records)
    }

    fn format_machine(&self, summary: &MachineSummary) -> Result<String, AnalysisError> {
        wrap("mach", std::slice::from_ref(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_fields() {
        let tasks = vec![TaskContext {
            task: 0xffff_ffc0_3900_0000,
            pid: 1,
            comm: "init".to_string(),
            mm: 0xffff_ffc0_3b00_0000,
            stack: 0xffff_ffc0_3a00_0000,
            processor: 2,
            active: true,
        }];
        let json = JsonFormatter.format_tasks(&tasks).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["plugin"], "ps");
        assert_eq!(value["count"], 1);
        assert_eq!(value["results"][0]["comm"], "init");
        assert_eq!(value["results"][0]["processor"], 2);
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());
    }
}

//! Output format traits for the arm64 memory parser
use crate::error::AnalysisError;
use crate::kernel::TaskContext;
use crate::plugins::bt::BacktraceRecord;
use crate::plugins::eframes::EframeRecord;
use crate::plugins::mach::MachineSummary;
use crate::plugins::plugin_trait::PluginOutput;
use crate::plugins::pte::PteRecord;
use crate::plugins::vtop::TranslationRecord;

/// Trait for output formatters
pub trait OutputFormatter {
    fn format_tasks(&self, tasks: &[TaskContext]) -> Result<String, AnalysisError>;
    fn format_translations(&self, records: &[TranslationRecord]) -> Result<String, AnalysisError>;
    fn format_ptes(&self, records: &[PteRecord]) -> Result<String, AnalysisError>;
    fn format_backtraces(&self, records: &[BacktraceRecord]) -> Result<String, AnalysisError>;
    fn format_eframes(&self, records: &[EframeRecord]) -> Result<String, AnalysisError>;
    fn format_machine(&self, summary: &MachineSummary) -> Result<String, AnalysisError>;

    fn format_output(&self, output: &PluginOutput) -> Result<String, AnalysisError> {
        match output {
            PluginOutput::Tasks(tasks) => self.format_tasks(tasks),
            PluginOutput::Translations(records) => self.format_translations(records),
            PluginOutput::Ptes(records) => self.format_ptes(records),
            PluginOutput::Backtraces(records) => self.format_backtraces(records),
            PluginOutput::ExceptionFrames(records) => self.format_eframes(records),
            PluginOutput::Machine(summary) => self.format_machine(summary),
        }
    }
}

/// Enum for output format types
#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Enum for output destination
#[derive(Debug, Clone)]
pub enum OutputDestination {
    Stdout,
    File(std::path::PathBuf),
}

/// Output writer that combines format and destination
pub struct OutputWriter {
    formatter: Box<dyn OutputFormatter>,
    destination: OutputDestination,
}

impl OutputWriter {
    /// Create a new output writer
    pub fn new(format: OutputFormat, destination: OutputDestination) -> Self {
        let formatter: Box<dyn OutputFormatter> = match format {
            OutputFormat::Text => Box::new(crate::formats::text::TextFormatter),
            OutputFormat::Json => Box::new(crate::formats::json::JsonFormatter),
        };

        Self {
            formatter,
            destination,
        }
    }

    /// Write a plugin's output to the configured destination
    pub fn write_output(&self, output: &PluginOutput) -> Result<(), AnalysisError> {
        let content = self.formatter.format_output(output)?;

        match &self.destination {
            OutputDestination::Stdout => {
                println!("{}", content);
            }
            OutputDestination::File(path) => {
                std::fs::write(path, content)?;
            }
        }

        Ok(())
    }
}

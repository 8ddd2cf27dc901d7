//! Text (table) output formatter for the arm64 memory parser
use crate::arch::walker::Translation;
use crate::error::AnalysisError;
use crate::formats::traits::OutputFormatter;
use crate::kernel::TaskContext;
use crate::plugins::bt::BacktraceRecord;
use crate::plugins::eframes::EframeRecord;
use crate::plugins::mach::MachineSummary;
use crate::plugins::pte::PteRecord;
use crate::plugins::vtop::TranslationRecord;
use prettytable::{Cell, Row, Table};

fn table_with_header(titles: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(Row::new(
        titles.iter().map(|t| Cell::new(t).style_spec("c")).collect(),
    ));
    table
}

fn describe(translation: &Translation) -> String {
    match translation {
        Translation::Mapped(paddr) => format!("{:x}", paddr),
        Translation::Swapped { swp_type, offset, .. } => {
            format!("(swapped: type {} offset {})", swp_type, offset)
        }
        Translation::Unmapped => "(not mapped)".to_string(),
    }
}

/// Text formatter that outputs data in a human-readable table format
pub struct TextFormatter;

impl OutputFormatter for TextFormatter {
    fn format_tasks(&self, tasks: &[TaskContext]) -> Result<String, AnalysisError> {
        let mut table = table_with_header(&["PID", "TASK", "CPU", "ST", "MM", "COMM"]);

        for task in tasks {
            table.add_row(Row::new(vec![
                Cell::new(&task.pid.to_string()),
                Cell::new(&format!("{:x}", task.task)),
                Cell::new(&task.processor.to_string()),
                Cell::new(if task.active { "RU" } else { "" }),
                Cell::new(&format!("{:x}", task.mm)),
                Cell::new(&task.comm),
            ]));
        }

        Ok(table.to_string())
    }

    fn format_translations(&self, records: &[TranslationRecord]) -> Result<String, AnalysisError> {
        let mut table = table_with_header(&["VIRTUAL", "PHYSICAL", "SPACE"]);
        for record in records {
            let space = match record.pid {
                Some(pid) => format!("user (pid {})", pid),
                None => "kernel".to_string(),
            };
            table.add_row(Row::new(vec![
                Cell::new(&format!("{:x}", record.vaddr)),
                Cell::new(&describe(&record.translation)),
                Cell::new(&space),
            ]));
        }

        let mut output = table.to_string();
        for record in records.iter().filter(|r| !r.trace.is_empty()) {
            output.push('\n');
            output.push_str(&record.trace);
        }
        Ok(output)
    }

    fn format_ptes(&self, records: &[PteRecord]) -> Result<String, AnalysisError> {
        let blocks: Vec<&str> = records.iter().map(|r| r.rendering.as_str()).collect();
        Ok(blocks.join("\n"))
    }

    fn format_backtraces(&self, records: &[BacktraceRecord]) -> Result<String, AnalysisError> {
        let blocks: Vec<String> = records
            .iter()
            .map(|r| format!("{}\n{}", r.header(), r.text))
            .collect();
        Ok(blocks.join("\n"))
    }

    fn format_eframes(&self, records: &[EframeRecord]) -> Result<String, AnalysisError> {
        let blocks: Vec<String> = records
            .iter()
            .map(|r| {
                format!(
                    "PID: {:<6}  TASK: {:x}  COMMAND: \"{}\"\n{}",
                    r.pid, r.task, r.comm, r.text
                )
            })
            .collect();
        Ok(blocks.join("\n"))
    }

    fn format_machine(&self, summary: &MachineSummary) -> Result<String, AnalysisError> {
        let mut table = table_with_header(&["REGION", "START", "END"]);
        for range in &summary.kvaddr_ranges {
            table.add_row(Row::new(vec![
                Cell::new(&format!("{:?}", range.kind)),
                Cell::new(&format!("{:016x}", range.start)),
                Cell::new(&format!("{:016x}", range.end)),
            ]));
        }
        Ok(format!("{}\n{}", summary.text, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::vtop::AddressSpace;

    #[test]
    fn test_translation_table() {
        let records = vec![
            TranslationRecord {
                vaddr: 0xffff_ff80_0001_0010,
                space: AddressSpace::Kernel,
                pid: None,
                translation: Translation::Mapped(0x4123_4010),
                trace: String::new(),
            },
            TranslationRecord {
                vaddr: 0x40_1000,
                space: AddressSpace::User,
                pid: Some(1),
                translation: Translation::Swapped {
                    pte: 0x1d04,
                    swp_type: 1,
                    offset: 0x1d,
                },
                trace: "PAGE DIRECTORY: ffffffc000010000\n".to_string(),
            },
        ];
        let text = TextFormatter.format_translations(&records).unwrap();

        assert!(text.contains("VIRTUAL"));
        assert!(text.contains("ffffff8000010010"));
        assert!(text.contains("41234010"));
        assert!(text.contains("(swapped: type 1 offset 29)"));
        assert!(text.contains("user (pid 1)"));
        assert!(text.ends_with("PAGE DIRECTORY: ffffffc000010000\n"));
    }

    #[test]
    fn test_task_table() {
        let tasks = vec![TaskContext {
            task: 0xffff_ffc0_3900_0000,
            pid: 42,
            comm: "kworker/0:1".to_string(),
            mm: 0,
            stack: 0xffff_ffc0_3a00_0000,
            processor: 1,
            active: true,
        }];
        let text = TextFormatter.format_tasks(&tasks).unwrap();
        assert!(text.contains("kworker/0:1"));
        assert!(text.contains("ffffffc039000000"));
        assert!(text.contains("RU"));
    }
}

//! Vtop plugin - virtual to physical translation, optionally traced
use crate::arch::walker::Translation;
use crate::error::AnalysisError;
use crate::plugins::plugin_trait::{AnalysisContext, ForensicPlugin, PluginOutput};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressSpace {
    Kernel,
    User,
}

/// One translated address.
#[derive(Debug, Clone, Serialize)]
pub struct TranslationRecord {
    pub vaddr: u64,
    pub space: AddressSpace,
    pub pid: Option<i32>,
    pub translation: Translation,
    /// Table walk rendering, empty unless verbose
    pub trace: String,
}

pub struct VtopPlugin {
    pub addresses: Vec<u64>,
    /// Task whose page tables translate user addresses
    pub pid: Option<i32>,
    pub verbose: bool,
}

impl VtopPlugin {
    fn translate(&self, context: &AnalysisContext, vaddr: u64) -> Result<TranslationRecord, AnalysisError> {
        let arch = context.arch;
        let mut trace = Vec::new();
        let sink: Option<&mut dyn Write> = if self.verbose { Some(&mut trace) } else { None };

        let (space, pid, translation) = if arch.is_uvaddr(vaddr) {
            let pid = self.pid.ok_or_else(|| {
                AnalysisError::PluginError(format!("{:x}: user address needs --pid", vaddr))
            })?;
            let task = context.task_by_pid(pid)?;
            (AddressSpace::User, Some(pid), arch.uvtop(task, vaddr, sink)?)
        } else {
            (AddressSpace::Kernel, None, arch.kvtop(vaddr, sink)?)
        };

        Ok(TranslationRecord {
            vaddr,
            space,
            pid,
            translation,
            trace: String::from_utf8(trace)?,
        })
    }
}

impl ForensicPlugin for VtopPlugin {
    fn name(&self) -> &str {
        "vtop"
    }

    fn description(&self) -> &str {
        "Translate kernel or user virtual addresses to physical"
    }

    fn run(&self, context: &AnalysisContext) -> Result<PluginOutput, AnalysisError> {
        let records = self
            .addresses
            .iter()
            .map(|&vaddr| self.translate(context, vaddr))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PluginOutput::Translations(records))
    }
}

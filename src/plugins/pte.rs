//! Pte plugin - decode raw leaf page table entries
use crate::error::AnalysisError;
use crate::plugins::plugin_trait::{AnalysisContext, ForensicPlugin, PluginOutput};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PteRecord {
    pub pte: u64,
    pub present: bool,
    /// Physical page for present entries
    pub paddr: Option<u64>,
    pub swp_type: Option<u64>,
    pub swp_offset: Option<u64>,
    pub rendering: String,
}

pub struct PtePlugin {
    pub entries: Vec<u64>,
}

impl ForensicPlugin for PtePlugin {
    fn name(&self) -> &str {
        "pte"
    }

    fn description(&self) -> &str {
        "Decode page table entries into physical page, flags or swap location"
    }

    fn run(&self, context: &AnalysisContext) -> Result<PluginOutput, AnalysisError> {
        let format = context.arch.layout().pte;
        let mut records = Vec::with_capacity(self.entries.len());

        for &pte in &self.entries {
            let mut out = Vec::new();
            let info = context.arch.translate_pte(pte, Some(&mut out))?;
            records.push(PteRecord {
                pte,
                present: info.present,
                paddr: info.present.then_some(info.paddr),
                swp_type: (!info.present).then(|| format.swp_type(pte)),
                swp_offset: (!info.present).then(|| format.swp_offset(pte)),
                rendering: String::from_utf8(out)?,
            });
        }

        Ok(PluginOutput::Ptes(records))
    }
}

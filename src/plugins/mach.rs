//! Mach plugin - machine summary and, verbosely, the machine-dependent table
use crate::arch::layout::{AddressSpaceLayout, VaddrRange};
use crate::error::AnalysisError;
use crate::plugins::plugin_trait::{AnalysisContext, ForensicPlugin, PluginOutput};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct MachineSummary {
    pub machine: String,
    pub cpus: usize,
    pub layout: AddressSpaceLayout,
    pub kvaddr_ranges: Vec<VaddrRange>,
    pub text: String,
}

#[derive(Default)]
pub struct MachPlugin {
    pub verbose: bool,
}

impl ForensicPlugin for MachPlugin {
    fn name(&self) -> &str {
        "mach"
    }

    fn description(&self) -> &str {
        "Show machine type, memory size, CPUs and kernel virtual layout"
    }

    fn run(&self, context: &AnalysisContext) -> Result<PluginOutput, AnalysisError> {
        let arch = context.arch;
        let mut out = Vec::new();
        arch.machine_stats(&mut out)?;
        if self.verbose {
            out.push(b'\n');
            arch.machdep_table(&mut out)?;
        }

        Ok(PluginOutput::Machine(MachineSummary {
            machine: arch.name().to_string(),
            cpus: arch.smp_cpus(),
            layout: arch.layout().clone(),
            kvaddr_ranges: arch.kvaddr_ranges(),
            text: String::from_utf8(out)?,
        }))
    }
}

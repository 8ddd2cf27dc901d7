//! Library crate for the ARM64 kernel memory parser

// Allow clippy lints that would require significant refactoring
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_range_contains)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::collapsible_else_if)]
#![allow(clippy::redundant_closure)]
#![allow(clippy::unnecessary_cast)]
#![allow(clippy::doc_lazy_continuation)]
#![allow(clippy::too_many_arguments)]

pub mod arch;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod symbols;
pub mod translation;

#[cfg(test)]
pub(crate) mod test_support;

// Core modules
pub mod core {
    pub mod dwarf;
    pub mod offsets;
}

// CLI modules
pub mod cli {
    pub mod args;
}

// Plugin modules
pub mod plugins;

// Format modules
pub mod formats;

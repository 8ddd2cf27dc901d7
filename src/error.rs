//! Custom error types for the application
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Memory map error: {0}")]
    MemoryMapError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Symbol error: {0}")]
    SymbolError(String),
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("Translation error: {0}")]
    TranslationError(String),
    #[error("Address translation failed: 0x{0:x}")]
    AddressTranslationFailed(u64),
    #[error("cannot read {what} at 0x{addr:x}")]
    ReadFailed { addr: u64, what: String },
    #[error("invalid/unsupported page size: {0}")]
    UnsupportedPageSize(u64),
    #[error("cannot determine page size")]
    PageSizeUndetermined,
    #[error("no page table root for task 0x{0:x}")]
    MissingPageTableRoot(u64),
    #[error("Invalid structure: {0}")]
    InvalidStructure(String),
    #[error("invalid crash note: {0}")]
    InvalidCrashNote(String),
    #[error("Backtrace error: {0}")]
    BacktraceError(String),
    #[error("Plugin error: {0}")]
    PluginError(String),
    #[error("JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),
    #[error("UTF-8 conversion error: {0}")]
    FromUtf8Error(#[from] std::string::FromUtf8Error),
}

impl AnalysisError {
    pub fn read_failed(addr: u64, what: &str) -> Self {
        AnalysisError::ReadFailed {
            addr,
            what: what.to_string(),
        }
    }
}

//! Output format module for the arm64 memory parser
pub mod json;
pub mod text;
pub mod traits;

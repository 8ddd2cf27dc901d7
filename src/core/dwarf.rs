//! dwarf2json parser for loading Volatility 3 compatible symbol and type files
use crate::error::AnalysisError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Deserialize)]
struct SymbolEntry {
    address: u64,
}

#[derive(Debug, Deserialize)]
pub struct DwarfField {
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct DwarfStruct {
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub fields: Option<HashMap<String, DwarfField>>,
}

#[derive(Debug, Deserialize)]
pub struct DwarfSymbols {
    #[serde(default)]
    symbols: HashMap<String, SymbolEntry>,
    #[serde(default)]
    user_types: HashMap<String, DwarfStruct>,
}

impl DwarfSymbols {
    /// Load a dwarf2json file and parse it into symbols and structures
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, AnalysisError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, AnalysisError> {
        serde_json::from_str(content)
            .map_err(|e| AnalysisError::SymbolError(format!("Failed to parse dwarf2json: {}", e)))
    }

    /// Get the address of a symbol by name
    pub fn get_symbol_address(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).map(|entry| entry.address)
    }

    /// Get the offset of a field within a structure
    pub fn get_field_offset(&self, struct_name: &str, field_name: &str) -> Option<usize> {
        self.user_types
            .get(struct_name)?
            .fields
            .as_ref()?
            .get(field_name)
            .map(|field| field.offset)
    }

    /// Get the size of a structure
    pub fn get_struct_size(&self, struct_name: &str) -> Option<usize> {
        self.user_types
            .get(struct_name)
            .map(|s| s.size)
            .filter(|&size| size > 0)
    }

    /// Get all symbols as (name, address) pairs
    pub fn symbols(&self) -> impl Iterator<Item = (&str, u64)> {
        self.symbols
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.address))
    }

    /// Get all structure field offsets
    pub fn get_struct_offsets(&self, struct_name: &str) -> Option<HashMap<String, usize>> {
        self.user_types
            .get(struct_name)?
            .fields
            .as_ref()
            .map(|fields| {
                fields
                    .iter()
                    .map(|(name, field)| (name.clone(), field.offset))
                    .collect()
            })
    }
}

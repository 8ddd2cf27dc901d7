//! Symbol resolution module for kernel symbols and structure layouts
use crate::arch::verify_symbol;
use crate::core::dwarf::DwarfSymbols;
use crate::core::offsets::{KernelVersion, StructureOffsets};
use crate::error::AnalysisError;
use log::{debug, warn};
use std::collections::HashMap;
use std::io::BufRead;

/// Structures whose layout is pulled out of dwarf2json files
const TRACKED_STRUCTS: &[&str] = &[
    "task_struct",
    "mm_struct",
    "thread_struct",
    "cpu_context",
    "stackframe",
    "thread_info",
    "list_head",
    "pt_regs",
    "page",
    "elf_prstatus",
    "note_buf_t",
];

/// A symbol table entry
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub kind: char,
    pub module: Option<String>,
}

impl Symbol {
    fn is_text(&self) -> bool {
        matches!(self.kind, 't' | 'T' | 'w' | 'W')
    }
}

/// Result of a value-to-symbol lookup
#[derive(Debug, Clone, Copy)]
pub struct SymbolMatch<'a> {
    pub name: &'a str,
    pub value: u64,
    pub offset: u64,
    pub module: Option<&'a str>,
}

impl SymbolMatch<'_> {
    /// "name+0xoff", or just the name at offset zero
    pub fn to_symstr(&self) -> String {
        if self.offset != 0 {
            format!("{}+0x{:x}", self.name, self.offset)
        } else {
            self.name.to_string()
        }
    }
}

/// Symbol queries used by translation and backtrace code
pub trait SymbolLookup {
    fn symbol_value(&self, name: &str) -> Option<u64>;

    /// Closest symbol at or below `addr`
    fn value_search(&self, addr: u64) -> Option<SymbolMatch<'_>>;

    /// Address of the symbol following `name` in address order
    fn next_symbol_value(&self, name: &str) -> Option<u64>;

    fn is_kernel_text(&self, addr: u64) -> bool;

    /// Source line for a text address, when line information is available
    fn line_number(&self, _addr: u64) -> Option<String> {
        None
    }

    fn symbol_exists(&self, name: &str) -> bool {
        self.symbol_value(name).is_some()
    }

    fn closest_symbol(&self, addr: u64) -> Option<&str> {
        self.value_search(addr).map(|m| m.name)
    }

    /// Module owning the symbol at or below `addr`; None for core kernel symbols
    fn module_name(&self, addr: u64) -> Option<&str> {
        self.value_search(addr).and_then(|m| m.module)
    }
}

/// Structure layout queries against the target kernel's debug metadata
pub trait TypeInfo {
    fn member_offset(&self, struct_name: &str, member: &str) -> Option<u64>;
    fn struct_size(&self, struct_name: &str) -> Option<u64>;
}

/// Symbol resolver for kernel symbols and structure layouts
pub struct SymbolResolver {
    symbols: HashMap<String, u64>,
    // Sorted by address for value_search()
    sorted: Vec<Symbol>,
    // Structure field offsets from dwarf2json: "struct_name::field_name" -> offset
    struct_offsets: HashMap<String, usize>,
    struct_sizes: HashMap<String, usize>,
    offsets_db: StructureOffsets,
    ksyms_start: bool,
}

impl SymbolResolver {
    /// Create a new symbol resolver
    pub fn new() -> Self {
        SymbolResolver {
            symbols: HashMap::new(),
            sorted: Vec::new(),
            struct_offsets: HashMap::new(),
            struct_sizes: HashMap::new(),
            offsets_db: StructureOffsets::defaults(),
            ksyms_start: false,
        }
    }

    /// Select the built-in layout table for a kernel version
    pub fn set_kernel_version(&mut self, version: &KernelVersion) {
        self.offsets_db = StructureOffsets::for_kernel(version);
    }

    /// Add a symbol to the resolver
    pub fn add_symbol(&mut self, name: &str, address: u64, kind: char, module: Option<String>) {
        self.insert_symbol(name, address, kind, module);
        let n = self.sorted.len();
        if n > 1 && self.sorted[n - 2].address > address {
            self.sort_symbols();
        }
    }

    fn insert_symbol(&mut self, name: &str, address: u64, kind: char, module: Option<String>) {
        if name == "idmap_pg_dir" {
            self.ksyms_start = true;
        }
        if module.is_none() || !self.symbols.contains_key(name) {
            self.symbols.insert(name.to_string(), address);
        }
        self.sorted.push(Symbol {
            name: name.to_string(),
            address,
            kind,
            module,
        });
    }

    fn sort_symbols(&mut self) {
        self.sorted.sort_by(|a, b| a.address.cmp(&b.address).then(a.name.cmp(&b.name)));
    }

    /// Get the number of symbols
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Lowest kernel-half symbol address, a last resort for VA_BITS
    pub fn lowest_kernel_address(&self) -> Option<u64> {
        self.sorted
            .iter()
            .find(|s| s.module.is_none() && s.address & (1 << 63) != 0)
            .map(|s| s.address)
    }

    /// True once `idmap_pg_dir` has been seen in the namelist
    pub fn ksyms_start(&self) -> bool {
        self.ksyms_start
    }

    /// Record a struct field offset, overriding the built-in tables
    pub fn set_member_offset(&mut self, struct_name: &str, field_name: &str, offset: usize) {
        self.struct_offsets
            .insert(format!("{}::{}", struct_name, field_name), offset);
    }

    /// Record a struct size, overriding the built-in tables
    pub fn set_struct_size(&mut self, struct_name: &str, size: usize) {
        self.struct_sizes.insert(struct_name.to_string(), size);
    }

    /// Parse System.map or kallsyms lines ("address type name [module]").
    /// Entries rejected by the architecture's symbol filter are dropped silently.
    pub fn load_symbol_lines<R: BufRead>(&mut self, reader: R) -> Result<usize, AnalysisError> {
        let mut accepted = 0;

        for line_result in reader.lines() {
            let line = line_result?;
            let parts: Vec<&str> = line.split_whitespace().collect();

            if parts.len() < 3 || parts[1].len() != 1 {
                continue;
            }

            let address = match u64::from_str_radix(parts[0].trim_start_matches("0x"), 16) {
                Ok(address) => address,
                Err(_) => continue,
            };
            let kind = parts[1].chars().next().unwrap_or('?');
            let name = parts[2];

            if !verify_symbol(name, address, kind) {
                continue;
            }

            let module = parts
                .get(3)
                .filter(|m| m.starts_with('[') && m.ends_with(']'))
                .map(|m| m.trim_start_matches('[').trim_end_matches(']').to_string());

            self.insert_symbol(name, address, kind, module);
            accepted += 1;
        }

        self.sort_symbols();
        Ok(accepted)
    }

    /// Parse an external System.map file
    pub fn load_system_map(&mut self, file_path: &str) -> Result<usize, AnalysisError> {
        let file = std::fs::File::open(file_path)?;
        self.load_symbol_lines(std::io::BufReader::new(file))
    }

    /// Parse a kallsyms dump (System.map format with optional [module] suffixes)
    pub fn load_kallsyms(&mut self, file_path: &str) -> Result<usize, AnalysisError> {
        self.load_system_map(file_path)
    }

    /// Load symbols and structure layouts from dwarf2json format
    pub fn load_dwarf2json(&mut self, file_path: &str) -> Result<(), AnalysisError> {
        let dwarf = DwarfSymbols::load_from_file(std::path::Path::new(file_path))?;
        self.load_dwarf(&dwarf);
        Ok(())
    }

    pub fn load_dwarf(&mut self, dwarf: &DwarfSymbols) {
        for (name, addr) in dwarf.symbols() {
            // dwarf2json carries no symbol types; data symbols are the safe guess
            self.insert_symbol(name, addr, 'D', None);
        }
        self.sort_symbols();

        for struct_name in TRACKED_STRUCTS {
            if let Some(size) = dwarf.get_struct_size(struct_name) {
                self.struct_sizes.insert(struct_name.to_string(), size);
            }
            match dwarf.get_struct_offsets(struct_name) {
                Some(fields) => {
                    debug!("Loaded {} fields for struct '{}'", fields.len(), struct_name);
                    for (field_name, offset) in fields {
                        self.set_member_offset(struct_name, &field_name, offset);
                    }
                }
                None => debug!("No fields found for struct '{}' in dwarf2json", struct_name),
            }
        }

        for (struct_name, field_name) in [
            ("task_struct", "thread"),
            ("task_struct", "stack"),
            ("mm_struct", "pgd"),
            ("cpu_context", "pc"),
        ] {
            if !self
                .struct_offsets
                .contains_key(&format!("{}::{}", struct_name, field_name))
            {
                warn!(
                    "{}::{} not found in dwarf2json, using built-in default",
                    struct_name, field_name
                );
            }
        }
    }

    /// Detect kernel version from the linux_banner string
    pub fn detect_kernel_version(mapped: &[u8]) -> Option<KernelVersion> {
        let finder = memchr::memmem::Finder::new(b"Linux version ");
        let match_pos = finder.find(mapped)?;

        let slice = &mapped[match_pos..];
        let end_pos = slice
            .iter()
            .take(256)
            .position(|&c| c == b'\n' || c == b'\r' || c == 0)
            .unwrap_or_else(|| slice.len().min(256));
        let banner_str = String::from_utf8_lossy(&slice[..end_pos]);

        let version_part = banner_str.split("Linux version ").nth(1)?;
        KernelVersion::parse(version_part)
    }

    fn text_bounds(&self) -> Option<(u64, u64)> {
        let start = self
            .symbols
            .get("_stext")
            .or_else(|| self.symbols.get("_text"))
            .copied()?;
        let end = self.symbols.get("_etext").copied()?;
        Some((start, end))
    }
}

impl SymbolLookup for SymbolResolver {
    fn symbol_value(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    fn value_search(&self, addr: u64) -> Option<SymbolMatch<'_>> {
        let idx = self.sorted.partition_point(|s| s.address <= addr);
        if idx == 0 {
            return None;
        }
        let sym = &self.sorted[idx - 1];

        if sym.module.is_none() {
            if let Some(&end) = self.symbols.get("_end") {
                if addr >= end {
                    return None;
                }
            }
        }

        Some(SymbolMatch {
            name: &sym.name,
            value: sym.address,
            offset: addr - sym.address,
            module: sym.module.as_deref(),
        })
    }

    fn next_symbol_value(&self, name: &str) -> Option<u64> {
        let value = self.symbol_value(name)?;
        let idx = self.sorted.partition_point(|s| s.address <= value);
        self.sorted.get(idx).map(|s| s.address)
    }

    fn is_kernel_text(&self, addr: u64) -> bool {
        if let Some((start, end)) = self.text_bounds() {
            if addr >= start && addr < end {
                return true;
            }
        }

        let idx = self.sorted.partition_point(|s| s.address <= addr);
        idx > 0 && {
            let sym = &self.sorted[idx - 1];
            sym.module.is_some() && sym.is_text()
        }
    }
}

impl TypeInfo for SymbolResolver {
    fn member_offset(&self, struct_name: &str, member: &str) -> Option<u64> {
        self.struct_offsets
            .get(&format!("{}::{}", struct_name, member))
            .copied()
            .or_else(|| self.offsets_db.get_offset(struct_name, member))
            .map(|o| o as u64)
    }

    fn struct_size(&self, struct_name: &str) -> Option<u64> {
        self.struct_sizes
            .get(struct_name)
            .copied()
            .or_else(|| self.offsets_db.get_size(struct_name))
            .map(|s| s as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM_MAP: &str = "\
ffffffc000080000 t _head
ffffffc000081000 T _stext
ffffffc000081000 T do_undefinstr
ffffffc000082000 T __exception_text_start
ffffffc000082400 T __exception_text_end
ffffffc000090000 T crash_kexec
ffffffc000090200 T crash_save_cpu
ffffffc000090400 T kthread
ffffffc000500000 T _etext
ffffffc000600000 D swapper_pg_dir
0000000012345678 A __crc_printk
0000000000000000 a bogus_zero
ffffffc000600000 d $d
ffffffc000700000 B _end
ffffffbffc000000 t mydrv_probe\t[mydrv]
";

    fn resolver() -> SymbolResolver {
        let mut resolver = SymbolResolver::new();
        resolver.load_symbol_lines(SYSTEM_MAP.as_bytes()).unwrap();
        resolver
    }

    #[test]
    fn test_load_filters_rejected_symbols() {
        let resolver = resolver();
        assert_eq!(resolver.symbol_value("_stext"), Some(0xffffffc000081000));
        assert!(!resolver.symbol_exists("__crc_printk"));
        assert!(!resolver.symbol_exists("bogus_zero"));
        assert!(!resolver.symbol_exists("$d"));
        assert!(!resolver.ksyms_start());
    }

    #[test]
    fn test_value_search_and_offsets() {
        let resolver = resolver();
        let m = resolver.value_search(0xffffffc000090410).unwrap();
        assert_eq!(m.name, "kthread");
        assert_eq!(m.offset, 0x10);
        assert_eq!(m.to_symstr(), "kthread+0x10");
        assert!(resolver.value_search(0xffffffc000800000).is_none());
        assert_eq!(
            resolver.next_symbol_value("crash_kexec"),
            Some(0xffffffc000090200)
        );
    }

    #[test]
    fn test_kernel_text_includes_module_text() {
        let resolver = resolver();
        assert!(resolver.is_kernel_text(0xffffffc000090404));
        assert!(!resolver.is_kernel_text(0xffffffc000600008));
        assert!(resolver.is_kernel_text(0xffffffbffc000040));
        let m = resolver.value_search(0xffffffbffc000040).unwrap();
        assert_eq!(m.module, Some("mydrv"));
        assert_eq!(resolver.module_name(0xffffffbffc000040), Some("mydrv"));
        assert_eq!(resolver.module_name(0xffffffc000090404), None);
    }

    #[test]
    fn test_type_info_falls_back_to_builtin_tables() {
        let mut resolver = SymbolResolver::new();
        assert_eq!(resolver.member_offset("cpu_context", "sp"), Some(0x58));
        resolver.set_member_offset("mm_struct", "pgd", 0x48);
        resolver.set_struct_size("pt_regs", 320);
        assert_eq!(resolver.member_offset("mm_struct", "pgd"), Some(0x48));
        assert_eq!(resolver.struct_size("pt_regs"), Some(320));
        assert_eq!(resolver.struct_size("no_such_struct"), None);
    }

    #[test]
    fn test_detect_kernel_version_from_banner() {
        let mut mem = vec![0u8; 64];
        mem.extend_from_slice(b"Linux version 4.1.0-rc3 (builder@host) (gcc) #1 SMP\n");
        let version = SymbolResolver::detect_kernel_version(&mem).unwrap();
        assert_eq!(version, KernelVersion::new(4, 1, 0));
        assert_eq!(version.extra, "-rc3");
    }

    #[test]
    fn test_add_symbol_keeps_address_order() {
        let mut resolver = resolver();
        resolver.add_symbol("early_helper", 0xffffffc000080800, 't', None);
        let m = resolver.value_search(0xffffffc000080810).unwrap();
        assert_eq!(m.name, "early_helper");
        assert_eq!(resolver.lowest_kernel_address(), Some(0xffffffc000080000));
    }
}

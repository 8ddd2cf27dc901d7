//! Command-line argument parsing for the arm64 memory parser
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Hex address or value, with or without a 0x prefix
pub fn parse_hex(arg: &str) -> Result<u64, String> {
    let digits = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .unwrap_or(arg);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", arg, e))
}

#[derive(Parser)]
#[command(name = "arm64memparser")]
#[command(about = "ARM64 kernel memory image analyzer", long_about = None)]
pub struct Cli {
    /// Path to the memory image (LiME, ELF vmcore or raw)
    #[arg(value_name = "MEMORY_DUMP", required_unless_present = "list_plugins")]
    pub memory_dump: Option<std::path::PathBuf>,

    /// Plugin to run
    #[command(subcommand)]
    pub plugin: Option<PluginCommand>,

    /// Path to symbol file (System.map, kallsyms, or dwarf2json)
    #[arg(short, long, value_name = "FILE")]
    pub symbols: Option<std::path::PathBuf>,

    /// Extra dwarf2json file for structure layouts
    #[arg(short, long, value_name = "FILE")]
    pub types: Option<std::path::PathBuf>,

    /// Machine-dependent override, e.g. phys_offset=0x80000000 or phys_offset=2048m
    #[arg(long, value_name = "KEY=VALUE[,KEY=VALUE]")]
    pub machdep: Vec<String>,

    /// The image is a copy of a running system's memory
    #[arg(long)]
    pub live: bool,

    /// Kernel version (X.Y.Z), overriding VMCOREINFO and banner detection
    #[arg(long, value_name = "VERSION")]
    pub kernel_version: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormatArg,

    /// Output file (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<std::path::PathBuf>,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Enable verbose output (warnings, status messages)
    #[arg(short, long)]
    pub verbose: bool,

    /// List available plugins
    #[arg(short, long)]
    pub list_plugins: bool,
}

#[derive(Subcommand)]
pub enum PluginCommand {
    /// List tasks
    Ps {
        /// Filter by PID
        #[arg(long)]
        pid: Option<i32>,

        /// Filter by command name (regex)
        #[arg(long)]
        name: Option<String>,
    },

    /// Translate virtual addresses to physical
    Vtop {
        /// Addresses in hex
        #[arg(required = true, value_parser = parse_hex)]
        addresses: Vec<u64>,

        /// Task whose page tables translate user addresses
        #[arg(long)]
        pid: Option<i32>,

        /// Show every page table level
        #[arg(long)]
        trace: bool,
    },

    /// Decode raw page table entries
    Pte {
        /// Entries in hex
        #[arg(required = true, value_parser = parse_hex)]
        entries: Vec<u64>,
    },

    /// Kernel stack backtraces
    Bt(BtArgs),

    /// Search stacks for exception frames
    Eframes {
        /// Filter by PID
        #[arg(long)]
        pid: Option<i32>,
    },

    /// Machine summary
    Mach {
        /// Also show the machine-dependent table
        #[arg(long)]
        verbose: bool,
    },
}

#[derive(Args)]
pub struct BtArgs {
    /// Tasks to unwind (default: tasks active at capture time)
    #[arg(long)]
    pub pid: Vec<i32>,

    /// Unwind every task
    #[arg(short, long, conflicts_with = "pid")]
    pub all: bool,

    /// Dump all stack words between frames
    #[arg(short, long)]
    pub full: bool,

    /// Show source line numbers
    #[arg(short = 'l', long)]
    pub line_numbers: bool,

    /// Show symbol offsets
    #[arg(short = 'x', long)]
    pub symbol_offset: bool,

    /// List every stack word pointing into kernel text
    #[arg(long)]
    pub text_symbols: bool,

    /// Like --text-symbols, from the bottom of the stack
    #[arg(long)]
    pub text_symbols_all: bool,

    /// Start the unwind at this stack address
    #[arg(short = 'S', long, value_parser = parse_hex)]
    pub start_sp: Option<u64>,

    /// Starting pc, used with --start-sp
    #[arg(long, value_parser = parse_hex, requires = "start_sp")]
    pub start_pc: Option<u64>,

    /// Only report whether this symbol or hex value is referenced
    #[arg(short = 'R', long)]
    pub reference: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormatArg {
    Text,
    Json,
}

//! Main entry point for the arm64 memory parser
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use arm64memparser::arch::layout::{parse_machdep_args, AddressSpaceLayout, CaptureKind, LayoutInputs};
use arm64memparser::arch::unwind::{BacktraceFlags, BtReference, StackHook};
use arm64memparser::arch::{self, Arm64, BacktraceOptions, MachineInputs};
use arm64memparser::cli::args::{BtArgs, Cli, OutputFormatArg, PluginCommand};
use arm64memparser::core::offsets::KernelVersion;
use arm64memparser::formats::traits::{OutputDestination, OutputFormat, OutputWriter};
use arm64memparser::kernel::{TaskContext, TaskWalker};
use arm64memparser::memory::DumpImage;
use arm64memparser::plugins::bt::BtSelection;
use arm64memparser::plugins::plugin_trait::{AnalysisContext, ForensicPlugin, PluginOutput};
use arm64memparser::plugins::{self, BtPlugin, EframesPlugin, MachPlugin, PsPlugin, PtePlugin, VtopPlugin};
use arm64memparser::symbols::{SymbolResolver, TypeInfo};
use arm64memparser::translation::KernelReader;

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_symbols(cli: &Cli) -> Result<SymbolResolver> {
    let mut resolver = SymbolResolver::new();

    if let Some(symbol_path) = &cli.symbols {
        let path_str = symbol_path.to_string_lossy();
        info!("Loading symbols from: {}", path_str);

        if path_str.ends_with(".json") {
            resolver
                .load_dwarf2json(&path_str)
                .with_context(|| format!("failed to load dwarf2json file {}", path_str))?;
        } else if path_str.contains("kallsyms") {
            let count = resolver
                .load_kallsyms(&path_str)
                .with_context(|| format!("failed to load kallsyms {}", path_str))?;
            info!("Loaded {} symbols from kallsyms", count);
        } else {
            let count = resolver
                .load_system_map(&path_str)
                .with_context(|| format!("failed to load System.map {}", path_str))?;
            info!("Loaded {} symbols from System.map", count);
        }
    }

    if let Some(types_path) = &cli.types {
        let path_str = types_path.to_string_lossy();
        resolver
            .load_dwarf2json(&path_str)
            .with_context(|| format!("failed to load structure layouts from {}", path_str))?;
        info!("Loaded structure layouts from {}", path_str);
    }

    Ok(resolver)
}

/// `--kernel-version`, else VMCOREINFO OSRELEASE, else the linux_banner.
fn detect_version(cli: &Cli, dump: &DumpImage) -> Result<Option<KernelVersion>> {
    if let Some(arg) = &cli.kernel_version {
        let version = KernelVersion::parse(arg)
            .with_context(|| format!("invalid --kernel-version '{}'", arg))?;
        return Ok(Some(version));
    }

    if let Some(version) = dump.vmcoreinfo("OSRELEASE").and_then(KernelVersion::parse) {
        info!("Kernel version from VMCOREINFO: {}", version);
        return Ok(Some(version));
    }

    let version = SymbolResolver::detect_kernel_version(dump.data());
    match &version {
        Some(v) => info!("Detected kernel version in memory dump: {}", v),
        None => warn!("could not detect kernel version from memory dump; assuming a recent kernel"),
    }
    Ok(version)
}

/// Page size of the running kernel, read from /proc/self/smaps.
fn host_page_size() -> Option<u64> {
    let smaps = std::fs::read_to_string("/proc/self/smaps").ok()?;
    smaps
        .lines()
        .find_map(|line| line.strip_prefix("KernelPageSize:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn capture_kind(cli: &Cli, dump: &DumpImage, symbols: &SymbolResolver) -> CaptureKind {
    if cli.live {
        CaptureKind::Live
    } else if symbols.symbol_count() == 0 && dump.has_vmcoreinfo() {
        CaptureKind::LogOnly
    } else {
        CaptureKind::Dumpfile
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_plugins {
        println!("Available plugins:");
        for (name, description) in plugins::list_plugins() {
            println!("  {} - {}", name, description);
        }
        return Ok(());
    }

    init_logging(&cli);

    let dump_path = cli.memory_dump.as_deref().context("no memory image given")?;
    info!("Opening memory capture file: {}", dump_path.display());
    let dump = DumpImage::open(&dump_path.to_string_lossy())
        .with_context(|| format!("cannot open {}", dump_path.display()))?;
    info!(
        "{} capture, {} regions, {} bytes of physical memory",
        dump.format(),
        dump.regions().len(),
        dump.memory_size()
    );

    let mut symbols = load_symbols(&cli)?;
    let version = detect_version(&cli, &dump)?;
    if let Some(v) = &version {
        symbols.set_kernel_version(v);
    }

    let capture = capture_kind(&cli, &dump, &symbols);
    if capture != CaptureKind::LogOnly && symbols.symbol_count() == 0 {
        bail!("no kernel symbols: use --symbols with a System.map, kallsyms or dwarf2json file");
    }

    let iomem = match capture {
        CaptureKind::Live => std::fs::read_to_string("/proc/iomem").ok(),
        _ => None,
    };
    let page_size_hint = match capture {
        CaptureKind::Live => host_page_size(),
        _ => dump.vmcoreinfo_number("PAGESIZE"),
    };

    let layout = AddressSpaceLayout::calculate(&LayoutInputs {
        capture,
        symbols: &symbols,
        kernel_version: version.as_ref(),
        page_size_hint,
        va_bits_fallback: symbols
            .lowest_kernel_address()
            .or_else(|| dump.vmcoreinfo_number("SYMBOL(log_buf)")),
        machdep: parse_machdep_args(&cli.machdep),
        iomem: iomem.as_deref(),
        dump: Some(&dump),
        page_struct_size: symbols.struct_size("page"),
        ksyms_start: symbols.ksyms_start(),
    })
    .context("cannot determine the kernel address space layout")?;

    let kernel_pgd = arch::kernel_pgd(&KernelReader::new(&layout, &dump), &symbols, &symbols);
    let reader = KernelReader::new(&layout, &dump).with_kernel_pgd(kernel_pgd);

    let machine = Arm64::new(MachineInputs {
        layout: &layout,
        phys: &dump,
        kernel: &reader,
        symbols: &symbols,
        types: &symbols,
        capture,
        memory_size: dump.memory_size(),
        kernel_pgd,
    });

    let command = cli.plugin.unwrap_or(PluginCommand::Mach { verbose: false });
    let tasks = if needs_tasks(&command) {
        walk_tasks(&reader, &symbols)
    } else {
        Vec::new()
    };

    let context = AnalysisContext {
        arch: &machine,
        kernel: &reader,
        symbols: &symbols,
        tasks: &tasks,
    };

    let output_format = match cli.format {
        OutputFormatArg::Text => OutputFormat::Text,
        OutputFormatArg::Json => OutputFormat::Json,
    };
    let output_dest = match &cli.output {
        Some(output_path) => OutputDestination::File(output_path.clone()),
        None => OutputDestination::Stdout,
    };
    let output_writer = OutputWriter::new(output_format, output_dest);

    let plugin = build_plugin(command);
    execute_plugin(plugin.as_ref(), &context, &output_writer)
}

fn needs_tasks(command: &PluginCommand) -> bool {
    !matches!(command, PluginCommand::Mach { .. } | PluginCommand::Pte { .. })
}

fn walk_tasks(reader: &KernelReader, symbols: &SymbolResolver) -> Vec<TaskContext> {
    let walked = TaskWalker::new(reader, symbols).and_then(|walker| walker.walk(symbols));
    match walked {
        Ok(tasks) => {
            info!("Found {} tasks", tasks.len());
            tasks
        }
        Err(e) => {
            warn!("cannot walk the task list: {}", e);
            Vec::new()
        }
    }
}

fn bt_options(args: &BtArgs) -> BacktraceOptions {
    let mut flags = BacktraceFlags::empty();
    flags.set(BacktraceFlags::FULL, args.full);
    flags.set(BacktraceFlags::LINE_NUMBERS, args.line_numbers);
    flags.set(BacktraceFlags::SYMBOL_OFFSET, args.symbol_offset);
    flags.set(BacktraceFlags::TEXT_SYMBOLS, args.text_symbols || args.text_symbols_all);
    flags.set(BacktraceFlags::TEXT_SYMBOLS_ALL, args.text_symbols_all);

    BacktraceOptions {
        flags,
        hook: args.start_sp.map(|sp| StackHook { sp, pc: args.start_pc }),
        reference: args.reference.as_deref().map(BtReference::parse),
    }
}

/// Build the plugin for a command
fn build_plugin(command: PluginCommand) -> Box<dyn ForensicPlugin> {
    match command {
        PluginCommand::Ps { pid, name } => Box::new(PsPlugin { pid, name }),
        PluginCommand::Vtop { addresses, pid, trace } => Box::new(VtopPlugin {
            addresses,
            pid,
            verbose: trace,
        }),
        PluginCommand::Pte { entries } => Box::new(PtePlugin { entries }),
        PluginCommand::Bt(args) => {
            let selection = if args.all {
                BtSelection::All
            } else if !args.pid.is_empty() {
                BtSelection::Pids(args.pid.clone())
            } else {
                BtSelection::Active
            };
            Box::new(BtPlugin {
                selection,
                options: bt_options(&args),
            })
        }
        PluginCommand::Eframes { pid } => Box::new(EframesPlugin { pid }),
        PluginCommand::Mach { verbose } => Box::new(MachPlugin { verbose }),
    }
}

/// Execute a plugin and handle its output
fn execute_plugin(
    plugin: &dyn ForensicPlugin,
    context: &AnalysisContext,
    output_writer: &OutputWriter,
) -> Result<()> {
    info!("Running plugin: {}", plugin.name());
    let output = plugin
        .run(context)
        .with_context(|| format!("{} failed", plugin.name()))?;

    let empty = match &output {
        PluginOutput::Tasks(tasks) => tasks.is_empty(),
        PluginOutput::Translations(records) => records.is_empty(),
        PluginOutput::Ptes(records) => records.is_empty(),
        PluginOutput::Backtraces(records) => records.is_empty(),
        PluginOutput::ExceptionFrames(records) => records.is_empty(),
        PluginOutput::Machine(_) => false,
    };
    if empty {
        println!("No results from {}.", plugin.name());
        return Ok(());
    }

    output_writer.write_output(&output)?;
    Ok(())
}

//! Crescent test environment CLI
//!
//! Sets up the bootable image, runs the kernel in QEMU, and bridges GDB to the
//! kernel's runtime section layout.
//!
//! # Usage
//!
//! ```bash
//! # Provision TESTING/ (Limine release, limine.conf template)
//! crescent-run --setup
//!
//! # Stage the kernel and build TESTING/crescent.iso
//! crescent-run package
//!
//! # Run with 4 CPUs, 512M, OVMF, halted for a debugger
//! crescent-run -c 4 -m 512M -e -d
//!
//! # In another terminal: attach GDB with symbols loaded
//! crescent-run gdb
//!
//! # Check host tools, firmware, and network first
//! crescent-run preflight
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success, setup done, or dry run |
//! | 2 | Bootable medium missing |
//! | 1 | Any other error |
//! | other | QEMU's own exit code |

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use crescent_run::config::{defaults, Project};
use crescent_run::fetch::FailurePolicy;
use crescent_run::image::{self, SetupMode, StrategyKind};
use crescent_run::launch::{
    self, Firmware, Invocation, LaunchOptions, MemorySize, QemuBuilder, SetupPlan,
    EXIT_MISSING_MEDIUM,
};
use crescent_run::preflight::PreflightChecker;
use crescent_run::symbols::{self, gdb::GdbAttach, SymbolBridge};
use crescent_run::Error;

#[derive(Parser)]
#[command(name = "crescent-run")]
#[command(author, version, about = "Crescent kernel test environment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    launch: LaunchArgs,

    /// Project root (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Configuration file (default: <root>/crescent-run.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Args, Debug, Default, PartialEq)]
struct LaunchArgs {
    /// The number of logical cores the VM should have
    #[arg(short, long)]
    cpus: Option<NonZeroU32>,

    /// The amount of memory the VM should have (e.g. 128M, 2G)
    #[arg(short, long)]
    memory: Option<MemorySize>,

    /// Halt at reset and open the gdbstub on tcp::1234
    #[arg(short, long)]
    debug: bool,

    /// Start QEMU with OVMF instead of SeaBIOS
    #[arg(short, long)]
    efi: bool,

    /// Folder with the OVMF files
    #[arg(short = 'o', long)]
    ovmf_path: Option<PathBuf>,

    /// Set up the testing environment and exit
    #[arg(short, long)]
    setup: bool,

    /// Stop setup at the first failed stage
    #[arg(long)]
    strict: bool,

    /// Refuse to set up over an existing image tree
    #[arg(long)]
    fresh: bool,

    /// Bootloader provisioning strategy
    #[arg(long, value_enum)]
    strategy: Option<StrategyKind>,

    /// Print the QEMU command line instead of running it
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Copy the kernel into the image tree and build the ISO
    Package {
        /// Kernel binary (default: ./crescent-kernel)
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Strategy the tree was provisioned with
        #[arg(long, value_enum)]
        strategy: Option<StrategyKind>,
    },

    /// Print the GDB relocation script for the kernel's sections
    Symbols {
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Section tool (default: ./tools/sections/sections)
        #[arg(long)]
        tool: Option<PathBuf>,

        /// Write the script here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Attach GDB to a --debug launch and load kernel symbols
    Gdb {
        #[arg(long)]
        kernel: Option<PathBuf>,

        #[arg(long)]
        tool: Option<PathBuf>,

        #[arg(long, default_value_t = defaults::GDB_PORT)]
        port: u16,
    },

    /// Check host tools, firmware, and network before setup
    Preflight,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<Error>() {
        Some(Error::MissingMedium(_)) => EXIT_MISSING_MEDIUM,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<i32> {
    check_launch_flags(&cli)?;
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let project = Project::load(root, cli.config.as_deref())?;

    match cli.command {
        None => cmd_launch(&project, cli.launch),
        Some(Commands::Package { kernel, strategy }) => {
            cmd_package(&project, kernel, strategy).map(|()| 0)
        }
        Some(Commands::Symbols {
            kernel,
            tool,
            output,
        }) => cmd_symbols(&project, kernel, tool, output.as_deref()).map(|()| 0),
        Some(Commands::Gdb { kernel, tool, port }) => cmd_gdb(&project, kernel, tool, port),
        Some(Commands::Preflight) => cmd_preflight(project),
    }
}

/// Launch flags only apply when no subcommand is given.
fn check_launch_flags(cli: &Cli) -> Result<()> {
    if cli.command.is_some() && cli.launch != LaunchArgs::default() {
        bail!("launch options cannot be combined with a subcommand");
    }
    Ok(())
}

fn cmd_launch(project: &Project, args: LaunchArgs) -> Result<i32> {
    let setup = &project.config.setup;

    let mut options = LaunchOptions::from_project(project, args.cpus, args.memory)?;
    if let Some(dir) = args.ovmf_path {
        options.firmware_dir = dir;
    }
    options.debug = args.debug;
    options.firmware = if args.efi { Firmware::Efi } else { Firmware::Bios };

    let setup_plan = if args.setup {
        let kind = args.strategy.unwrap_or(setup.strategy);
        let mode = if args.fresh { SetupMode::Fresh } else { setup.mode };
        let policy = if args.strict {
            FailurePolicy::Strict
        } else {
            setup.failure_policy()
        };
        Some(SetupPlan {
            tree: project.image_tree(),
            strategy: image::strategy_for(kind, project),
            mode,
            policy,
        })
    } else {
        None
    };

    let invocation = Invocation {
        setup: setup_plan,
        qemu: QemuBuilder::new(options).qemu(project.config.launch.qemu.clone()),
        dry_run: args.dry_run,
    };
    launch::run(&invocation)
}

fn cmd_package(
    project: &Project,
    kernel: Option<PathBuf>,
    strategy: Option<StrategyKind>,
) -> Result<()> {
    let kind = strategy.unwrap_or(project.config.setup.strategy);
    let kernel = kernel.unwrap_or_else(|| project.kernel());

    println!("=== Packaging Crescent ({:?}) ===\n", kind);
    image::package(
        &project.image_tree(),
        image::strategy_for(kind, project).as_ref(),
        &kernel,
        &project.iso(),
    )?;
    println!("\nNext: crescent-run");
    Ok(())
}

fn cmd_symbols(
    project: &Project,
    kernel: Option<PathBuf>,
    tool: Option<PathBuf>,
    output: Option<&Path>,
) -> Result<()> {
    let kernel = kernel.unwrap_or_else(|| project.kernel());
    let tool = tool.unwrap_or_else(|| project.sections_tool());

    let mut bridge = SymbolBridge::new(tool, kernel);
    symbols::emit(&mut bridge, output)
}

fn cmd_gdb(
    project: &Project,
    kernel: Option<PathBuf>,
    tool: Option<PathBuf>,
    port: u16,
) -> Result<i32> {
    let attach = GdbAttach {
        exe: std::env::current_exe().context("Failed to locate crescent-run executable")?,
        root: absolute(project.root.clone())?,
        kernel: absolute(kernel.unwrap_or_else(|| project.kernel()))?,
        tool: absolute(tool.unwrap_or_else(|| project.sections_tool()))?,
        port,
        gdb: "gdb".to_string(),
    };
    attach.run()
}

fn cmd_preflight(project: Project) -> Result<i32> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let report = runtime.block_on(PreflightChecker::new(project).run_all());
    report.print_summary();
    Ok(if report.is_ok() { 0 } else { 1 })
}

/// GDB's `shell` runs in GDB's working directory, not ours.
fn absolute(path: PathBuf) -> Result<PathBuf> {
    std::path::absolute(&path).with_context(|| format!("Failed to resolve {}", path.display()))
}

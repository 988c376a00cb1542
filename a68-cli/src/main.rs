use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use a68_core::options::{
    DEFAULT_LINE_WIDTH, DEFAULT_OPT_LEVEL, ListingOptions, MAX_MEM_SIZE, MIN_MEM_SIZE, isolate_items,
    parse_size,
};
use a68_core::{Options, run};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable holding options applied before the command line.
const OPTIONS_VARIABLE: &str = "A68_OPTIONS";

#[derive(Parser, Debug)]
#[command(name = "a68", version, about = "Algol 68 compiler-interpreter", long_about = None)]
struct Cli {
    /// Source file; `.a68` may be left off.
    #[arg(required_unless_present = "run_script")]
    source: Option<PathBuf>,

    #[arg(long, value_name = "SIZE", value_parser = budget)]
    heap: Option<usize>,
    #[arg(long, value_name = "SIZE", value_parser = budget)]
    handles: Option<usize>,
    #[arg(long, value_name = "SIZE", value_parser = budget)]
    frame: Option<usize>,
    #[arg(long, value_name = "SIZE", value_parser = budget)]
    stack: Option<usize>,
    #[arg(long, value_name = "SIZE", value_parser = budget, help = "Reserve kept free between the arena fronts")]
    overhead: Option<usize>,

    #[arg(short = 'O', long, help = "Compile suitable units to native code")]
    optimise: bool,
    #[arg(long, value_name = "LEVEL", value_parser = clap::value_parser!(u8).range(0..=3), default_value_t = DEFAULT_OPT_LEVEL)]
    opt_level: u8,
    #[arg(long, help = "Keep intermediate files")]
    keep: bool,
    #[arg(long, help = "Reuse the shared module built by a previous run")]
    rerun: bool,
    #[arg(long, help = "Build only and package the program as a script")]
    compile: bool,
    #[arg(long, value_name = "SCRIPT", help = "Run a script produced by --compile")]
    run_script: Option<PathBuf>,
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    time_limit: u64,

    #[arg(long)]
    no_warnings: bool,
    #[arg(short, long)]
    quiet: bool,
    #[arg(long, help = "Warn about constructs that are not portable")]
    portcheck: bool,
    #[arg(short, long, help = "Announce phases and log at debug level")]
    verbose: bool,
    #[arg(long, help = "Write diagnostics to <name>.diag as they arise")]
    tui: bool,

    #[arg(long, help = "Write every listing section")]
    listing: bool,
    #[arg(long)]
    source_listing: bool,
    #[arg(long)]
    tree_listing: bool,
    #[arg(long)]
    object_listing: bool,
    #[arg(long)]
    moid_listing: bool,
    #[arg(long)]
    standard_listing: bool,
    #[arg(long)]
    refinement_listing: bool,
    #[arg(long)]
    pragmat_listing: bool,
    #[arg(long, value_name = "COLUMNS", default_value_t = DEFAULT_LINE_WIDTH)]
    line_width: usize,

    #[arg(long = "cc", value_name = "PROGRAM", default_value = "cc")]
    compiler: String,
    #[arg(long = "ld", value_name = "PROGRAM", default_value = "ld")]
    linker: String,
    #[arg(long = "tuning", value_name = "FLAG", allow_hyphen_values = true)]
    tuning: Vec<String>,
    #[arg(long, value_name = "DIR", help = "Directory of .a68 files read ahead of the program")]
    prelude: Option<PathBuf>,
}

fn budget(text: &str) -> Result<usize, String> {
    match parse_size(text)? {
        size if size > MAX_MEM_SIZE => Err(format!("\"{text}\" is too large")),
        size => Ok(size.max(MIN_MEM_SIZE)),
    }
}

/// Turns `A68_OPTIONS` into command-line items placed before the real ones.
fn environment_items(text: &str) -> Result<Vec<String>> {
    let items = isolate_items(text)
        .map_err(|e| anyhow!("unterminated quote in {OPTIONS_VARIABLE} at offset {}", e.offset))?;
    Ok(items
        .into_iter()
        .map(|item| {
            if item.starts_with('-') || item.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                item
            } else {
                format!("--{item}")
            }
        })
        .collect())
}

fn arguments() -> Result<Vec<String>> {
    let mut args: Vec<String> = env::args().collect();
    match env::var(OPTIONS_VARIABLE) {
        Ok(text) => {
            let items = environment_items(&text)?;
            let tail = args.split_off(1.min(args.len()));
            args.extend(items);
            args.extend(tail);
        }
        Err(env::VarError::NotPresent) => {}
        Err(e) => return Err(e).with_context(|| format!("cannot read {OPTIONS_VARIABLE}")),
    }
    Ok(args)
}

fn options(cli: Cli) -> Result<Options> {
    let mut options = Options::default();
    if let Some(prelude) = &cli.prelude {
        anyhow::ensure!(prelude.is_dir(), "prelude directory {} does not exist", prelude.display());
    }
    let budgets = &mut options.budgets;
    budgets.heap = cli.heap.unwrap_or(budgets.heap);
    budgets.handles = cli.handles.unwrap_or(budgets.handles);
    budgets.frame = cli.frame.unwrap_or(budgets.frame);
    budgets.stack = cli.stack.unwrap_or(budgets.stack);
    budgets.overhead = cli.overhead.unwrap_or(budgets.overhead);

    options.run_script = cli.run_script.is_some();
    options.source = cli
        .run_script
        .or(cli.source)
        .context("no source file given")?;
    options.optimise = cli.optimise;
    options.opt_level = cli.opt_level;
    options.keep = cli.keep;
    options.rerun = cli.rerun;
    options.compile = cli.compile;
    options.time_limit = cli.time_limit;
    options.no_warnings = cli.no_warnings;
    options.quiet = cli.quiet;
    options.portcheck = cli.portcheck;
    options.verbose = cli.verbose;
    options.tui = cli.tui;
    let all = cli.listing;
    options.listing = ListingOptions {
        source: all || cli.source_listing,
        tree: all || cli.tree_listing,
        object: all || cli.object_listing,
        moids: all || cli.moid_listing,
        standard_environment: all || cli.standard_listing,
        refinements: all || cli.refinement_listing,
        pragmats: all || cli.pragmat_listing,
    };
    options.line_width = cli.line_width;
    options.compiler = cli.compiler;
    options.linker = cli.linker;
    options.tuning = cli.tuning;
    options.prelude = cli.prelude;
    Ok(options)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse_from(arguments()?);
    init_tracing(cli.verbose);
    let options = options(cli)?;
    debug!(source = %options.source.display(), native = options.native(), "options assembled");
    let exit = run(options, Box::new(io::stdout()));
    Ok(ExitCode::from(exit.code()))
}

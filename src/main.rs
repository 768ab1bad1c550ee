//! offline-interp command line.
//!
//! ```text
//! offline-interp compile [OPTIONS] <MODEL> <OUTPUT>
//!
//! Options:
//!   --planner <PLANNER>          Memory planning strategy [default: greedy]
//!                                [possible values: greedy, optimal]
//!   --probe-arena-bytes <BYTES>  Scratch arena used to measure the real one [default: 1048576]
//!   --search-budget <N>          Search expansions for the optimal planner [default: 200000]
//!   --no-timestamp               Omit the generation timestamp line
//!   --report                     Print a memory map of the generated arena
//!   -v, --verbose                Enable debug logging
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use offline_interp::config::{DEFAULT_PROBE_ARENA_BYTES, DEFAULT_SEARCH_BUDGET};
use offline_interp::{CompileError, CompileOptions, Compiler, PlannerKind};

/// Ahead-of-time specializer for a microcontroller neural network interpreter
#[derive(Parser)]
#[command(name = "offline-interp")]
#[command(version)]
#[command(
    about = "Plan a model's tensor arena offline and emit a specialized interpreter",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a model into a translation unit
    ///
    /// Runs the model's allocation once on the host, plans every buffer into
    /// one arena and writes Setup/Eval routines with all addresses resolved.
    Compile(CompileArgs),
}

#[derive(Args)]
struct CompileArgs {
    /// Model file to compile
    #[arg(value_name = "MODEL")]
    model: PathBuf,

    /// Where to write the generated source
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Memory planning strategy
    #[arg(long, value_enum, default_value_t = PlannerKind::Greedy)]
    planner: PlannerKind,

    /// Scratch arena used to measure the real one
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_PROBE_ARENA_BYTES)]
    probe_arena_bytes: usize,

    /// Search expansions for the optimal planner
    #[arg(long, value_name = "N", default_value_t = DEFAULT_SEARCH_BUDGET)]
    search_budget: usize,

    /// Omit the generation timestamp line
    #[arg(long)]
    no_timestamp: bool,

    /// Print a memory map of the generated arena
    #[arg(long)]
    report: bool,
}

impl CompileArgs {
    fn options(&self) -> CompileOptions {
        CompileOptions {
            planner: self.planner,
            probe_arena_bytes: self.probe_arena_bytes,
            search_budget: self.search_budget,
            timestamp: !self.no_timestamp,
            ..CompileOptions::default()
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // Help and version go to stdout and are not failures.
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let result = match &cli.command {
        Commands::Compile(args) => cmd_compile(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.is_internal() {
                eprintln!("internal error: {err}");
            } else {
                eprintln!("error: {err}");
            }
            ExitCode::FAILURE
        }
    }
}

fn cmd_compile(args: &CompileArgs) -> Result<(), CompileError> {
    let compiler = Compiler::new(args.options());
    let output = compiler.compile_file(&args.model, &args.output)?;

    println!("num tensors: {}", output.tensor_count);
    for (i, name) in output.operations.iter().enumerate() {
        println!("operation {i}: {name}");
    }
    print!("{}", output.plan_description);
    println!("Required tensor memory: {}", output.arena_size);

    if args.report {
        print!("{}", output.memory_map.render());
    }
    Ok(())
}

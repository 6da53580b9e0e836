use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use weft_manager::commands;

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Weft - record, analyze, rewrite and replay concurrent executions")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a recorded trace and file it under a result directory
    Record {
        /// Directory holding the per-routine trace files
        #[arg(short = 't', long = "trace")]
        trace: PathBuf,

        /// Result directory
        #[arg(short = 'o', long = "out", default_value = "weft-results")]
        out: PathBuf,
    },

    /// Predict concurrency bugs from a recorded trace
    Analyze {
        /// Directory holding the per-routine trace files
        #[arg(short = 't', long = "trace")]
        trace: PathBuf,

        /// Result directory
        #[arg(short = 'o', long = "out", default_value = "weft-results")]
        out: PathBuf,

        /// Scenario selectors: s send-closed, r recv-closed, w wait
        /// group, n close-closed, b concurrent recv, l leak, u unlock,
        /// c resource deadlock, m mixed deadlock (empty = all)
        #[arg(short = 's', long = "scenarios", default_value = "")]
        scenarios: String,

        /// Write human-readable bug reports (default unless only
        /// --out-machine is given)
        #[arg(long = "out-readable")]
        out_readable: bool,

        /// Write the machine-readable bug aggregate
        #[arg(long = "out-machine")]
        out_machine: bool,
    },

    /// Derive bug-manifesting traces from the predictions
    Rewrite {
        /// Directory holding the per-routine trace files
        #[arg(short = 't', long = "trace")]
        trace: PathBuf,

        /// Result directory
        #[arg(short = 'o', long = "out", default_value = "weft-results")]
        out: PathBuf,

        /// Scenario selectors (see analyze)
        #[arg(short = 's', long = "scenarios", default_value = "")]
        scenarios: String,
    },

    /// Replay a trace and report the exit classification
    Replay {
        /// Directory holding the trace to replay
        #[arg(short = 't', long = "trace")]
        trace: PathBuf,

        /// Replay timeout in seconds
        #[arg(long = "timeout-replay", default_value_t = 30)]
        timeout_replay: u64,

        /// Do not gate atomic operations
        #[arg(long = "ignore-atomics")]
        ignore_atomics: bool,
    },

    /// Run a mutation campaign over a recorded trace
    Fuzz {
        /// Directory holding the per-routine trace files
        #[arg(short = 't', long = "trace")]
        trace: PathBuf,

        /// Result directory
        #[arg(short = 'o', long = "out", default_value = "weft-results")]
        out: PathBuf,

        /// Mutation family: gopie, gopie-hb, gfuzz or flow
        #[arg(short = 'm', long = "mode", default_value = "gopie")]
        mode: String,

        /// Maximum number of mutation replays
        #[arg(long = "max-fuzzing-runs", default_value_t = 100)]
        max_fuzzing_runs: u64,

        /// Keep every mutated trace on disk
        #[arg(long = "keep-traces")]
        keep_traces: bool,

        /// Campaign seed for reproducible mutation order
        #[arg(long = "seed", default_value_t = 1)]
        seed: u64,
    },

    /// Aggregate bug statistics over a result directory
    Stats {
        /// Result directory
        #[arg(short = 'o', long = "out", default_value = "weft-results")]
        out: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Record { trace, out } => commands::record::run(&trace, &out).map(|_| 0),
        Commands::Analyze {
            trace,
            out,
            scenarios,
            out_readable,
            out_machine,
        } => commands::analyze::run(
            &trace,
            &out,
            &commands::analyze::AnalyzeOptions {
                scenarios: &scenarios,
                out_readable,
                out_machine,
            },
        )
        .map(|_| 0),
        Commands::Rewrite {
            trace,
            out,
            scenarios,
        } => commands::rewrite::run(&trace, &out, &scenarios).map(|_| 0),
        Commands::Replay {
            trace,
            timeout_replay,
            ignore_atomics,
        } => commands::replay::run(
            &trace,
            &commands::replay::ReplayOptions {
                timeout: Duration::from_secs(timeout_replay),
                ignore_atomics,
            },
        )
        .map(|exit| exit.code()),
        Commands::Fuzz {
            trace,
            out,
            mode,
            max_fuzzing_runs,
            keep_traces,
            seed,
        } => commands::fuzz::run(
            &trace,
            &out,
            &commands::fuzz::FuzzOptions {
                mode: &mode,
                max_runs: max_fuzzing_runs,
                keep_traces,
                seed,
            },
        )
        .map(|_| 0),
        Commands::Stats { out } => commands::stats::run(&out).map(|_| 0),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            std::process::exit(1);
        }
    }
}

//! `weft replay` — drive a trace through the replay manager
//!
//! Spawning and instrumenting child processes belongs to the external
//! toolchain; this command performs a manager-driven dry replay of the
//! trace (original or rewritten) and reports the exit classification.
//! In-process replays embed `ReplayManager` and its gates directly.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;

use weft_core::replay::{ExitCode, ReplayConfig, ReplayManager};
use weft_core::trace::read_trace_dir;

pub struct ReplayOptions {
    pub timeout: Duration,
    pub ignore_atomics: bool,
}

pub fn run(trace_dir: &Path, options: &ReplayOptions) -> Result<ExitCode> {
    let trace = read_trace_dir(trace_dir)
        .with_context(|| format!("failed to read trace from {}", trace_dir.display()))?;

    let config = ReplayConfig::default()
        .with_ignore_atomics(options.ignore_atomics)
        .with_max_no_wait(options.timeout);
    let manager = ReplayManager::new(&trace, config);
    let exit = manager.dry_run();

    let label = format!("exit {}", exit.code());
    if exit.is_confirmation() {
        println!("{} {}", "confirmed:".red().bold(), label);
    } else {
        println!("{} {}", "unconfirmed:".green(), label);
    }
    Ok(exit)
}

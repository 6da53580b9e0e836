//! `weft record` — validate and register a recorded trace
//!
//! The instrumentation toolchain writes raw per-routine trace files next
//! to the program. This command parses them (rejecting malformed
//! traces early), prints a summary, and files a normalized copy under
//! the result directory.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use weft_core::trace::{read_trace_dir, write_trace_dir};

use crate::report::ResultDir;

pub fn run(trace_dir: &Path, out: &Path) -> Result<()> {
    let trace = read_trace_dir(trace_dir)
        .with_context(|| format!("failed to read trace from {}", trace_dir.display()))?;

    let routines = trace.routine_ids().count();
    let events = trace.len();
    let blocked = trace.count_matching(|e| e.is_blocked());
    println!(
        "{} {} routines, {} events, {} never completed",
        "recorded:".green().bold(),
        routines,
        events,
        blocked
    );

    let result = ResultDir::new(out);
    result.ensure()?;
    let dest = result.traces_dir().join("recorded");
    write_trace_dir(&trace, &dest)
        .with_context(|| format!("failed to write trace to {}", dest.display()))?;
    println!("{} {}", "trace filed under".dimmed(), dest.display());
    Ok(())
}

//! `weft rewrite` — derive bug-manifesting traces from predictions

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;

use weft_core::analysis::{run_analysis, ScenarioSet};
use weft_core::rewrite::{RewriteOutcome, Rewriter, RewrittenTrace};
use weft_core::trace::{read_trace_dir, write_trace_dir};

use crate::report::ResultDir;

/// Sidecar metadata stored next to each rewritten trace
#[derive(Debug, Serialize)]
struct RewriteInfo<'a> {
    bug_code: &'static str,
    bug_name: &'static str,
    expected_exit: i32,
    start_time_active: u64,
    active: &'a weft_core::rewrite::ActiveMap,
}

pub fn write_rewrite(dir: &Path, rewrite: &RewrittenTrace, code: &'static str, name: &'static str) -> Result<()> {
    write_trace_dir(&rewrite.trace, dir)?;
    let info = RewriteInfo {
        bug_code: code,
        bug_name: name,
        expected_exit: rewrite.expected_exit.code(),
        start_time_active: rewrite.start_time_active,
        active: &rewrite.active,
    };
    let file = fs::File::create(dir.join("active.json"))?;
    serde_json::to_writer_pretty(file, &info)?;
    Ok(())
}

pub fn run(trace_dir: &Path, out: &Path, scenarios: &str) -> Result<()> {
    let trace = read_trace_dir(trace_dir)
        .with_context(|| format!("failed to read trace from {}", trace_dir.display()))?;
    let scenarios = ScenarioSet::from_flags(scenarios)?;
    let analysis = run_analysis(&trace, &scenarios);
    let rewriter = Rewriter::new(&trace, &analysis);

    let result = ResultDir::new(out);
    result.ensure()?;

    let mut rewritten = 0usize;
    let mut declined = 0usize;
    let mut not_needed = 0usize;
    for (index, bug) in analysis.bugs.iter().enumerate() {
        match rewriter.rewrite(bug) {
            RewriteOutcome::Rewritten(rewrite) => {
                let dir = result
                    .traces_dir()
                    .join(format!("rewritten_{:03}_{}", index, bug.kind.code()));
                write_rewrite(&dir, &rewrite, bug.kind.code(), bug.kind.name())?;
                println!(
                    "{} {} -> {} (expected exit {})",
                    "rewritten:".green().bold(),
                    bug.kind.code(),
                    dir.display(),
                    rewrite.expected_exit.code()
                );
                rewritten += 1;
            }
            RewriteOutcome::NotNeeded => {
                println!(
                    "{} {} observed in the recorded run",
                    "not needed:".dimmed(),
                    bug.kind.code()
                );
                not_needed += 1;
            }
            RewriteOutcome::NotPossible(reason) => {
                println!(
                    "{} {} ({})",
                    "not possible:".yellow(),
                    bug.kind.code(),
                    reason
                );
                declined += 1;
            }
        }
    }
    println!(
        "{} {} rewritten, {} not needed, {} not possible",
        "rewrite:".bold(),
        rewritten,
        not_needed,
        declined
    );
    Ok(())
}

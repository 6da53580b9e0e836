//! `weft analyze` — predict concurrency bugs from a recorded trace

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use weft_core::analysis::{run_analysis, ScenarioSet};
use weft_core::trace::read_trace_dir;

use crate::report::{write_bug_report, write_machine_report, ResultDir};

pub struct AnalyzeOptions<'a> {
    pub scenarios: &'a str,
    pub out_readable: bool,
    pub out_machine: bool,
}

pub fn run(trace_dir: &Path, out: &Path, options: &AnalyzeOptions) -> Result<usize> {
    let trace = read_trace_dir(trace_dir)
        .with_context(|| format!("failed to read trace from {}", trace_dir.display()))?;
    let scenarios = ScenarioSet::from_flags(options.scenarios)?;
    let analysis = run_analysis(&trace, &scenarios);

    if analysis.bugs.is_empty() {
        println!("{}", "no bugs predicted".green());
    } else {
        println!(
            "{} {} bug(s) predicted",
            "analysis:".yellow().bold(),
            analysis.bugs.len()
        );
        for bug in &analysis.bugs {
            println!("  {} {}", bug.kind.code().red().bold(), bug.kind.name());
        }
    }

    let result = ResultDir::new(out);
    result.ensure()?;
    // readable reports are the default output
    let readable = options.out_readable || !options.out_machine;
    if readable {
        for (index, bug) in analysis.bugs.iter().enumerate() {
            write_bug_report(&result, index, bug, &trace)?;
        }
    }
    if options.out_machine {
        let path = write_machine_report(&result, &analysis.bugs, &trace)?;
        println!("{} {}", "machine report:".dimmed(), path.display());
    }
    Ok(analysis.bugs.len())
}

//! Result directory layout and bug report writing
//!
//! A result directory contains `bugs/` (one textual report per bug,
//! first `# ...` line naming the bug type via the codebook), `traces/`
//! (original and rewritten traces) and `stats/` (CSV aggregates).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use weft_core::analysis::{Bug, CODEBOOK};
use weft_core::trace::Trace;

/// Paths of one result directory
#[derive(Debug, Clone)]
pub struct ResultDir {
    base: PathBuf,
}

impl ResultDir {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn bugs_dir(&self) -> PathBuf {
        self.base.join("bugs")
    }

    pub fn traces_dir(&self) -> PathBuf {
        self.base.join("traces")
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.base.join("stats")
    }

    /// Create the directory skeleton
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.bugs_dir(), self.traces_dir(), self.stats_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Machine-readable view of one bug
#[derive(Debug, Serialize)]
pub struct MachineBug {
    pub code: &'static str,
    pub name: &'static str,
    pub primary: Vec<String>,
    pub secondary: Vec<String>,
}

fn positions_of(trace: &Trace, keys: &[weft_core::trace::EventKey]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| trace.event(*key).map(|e| e.pos.key()))
        .collect()
}

impl MachineBug {
    pub fn from_bug(bug: &Bug, trace: &Trace) -> Self {
        Self {
            code: bug.kind.code(),
            name: bug.kind.name(),
            primary: positions_of(trace, &bug.primary),
            secondary: positions_of(trace, &bug.secondary),
        }
    }
}

/// Write the human-readable report for one bug
pub fn write_bug_report(result: &ResultDir, index: usize, bug: &Bug, trace: &Trace) -> Result<PathBuf> {
    let path = result
        .bugs_dir()
        .join(format!("bug_{:03}_{}.md", index, bug.kind.code()));
    let mut file = fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    // first line names the bug type via the codebook
    writeln!(file, "# {}", bug.kind.name())?;
    writeln!(file)?;
    writeln!(file, "code: {}", bug.kind.code())?;
    writeln!(file)?;
    writeln!(file, "## Involved operations")?;
    for key in &bug.primary {
        if let Some(event) = trace.event(*key) {
            writeln!(
                file,
                "- primary: routine {} at {} ({})",
                event.routine,
                event.pos,
                event.kind.code()
            )?;
        }
    }
    for key in &bug.secondary {
        if let Some(event) = trace.event(*key) {
            writeln!(
                file,
                "- secondary: routine {} at {} ({})",
                event.routine,
                event.pos,
                event.kind.code()
            )?;
        }
    }
    Ok(path)
}

/// Write the machine-readable aggregate of all bugs
pub fn write_machine_report(result: &ResultDir, bugs: &[Bug], trace: &Trace) -> Result<PathBuf> {
    let path = result.bugs_dir().join("bugs.json");
    let machine: Vec<MachineBug> = bugs
        .iter()
        .map(|bug| MachineBug::from_bug(bug, trace))
        .collect();
    let file = fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, &machine)?;
    Ok(path)
}

/// Aggregate bug counts from the reports in `bugs/` into a CSV
pub fn write_stats_csv(result: &ResultDir) -> Result<PathBuf> {
    let mut counts: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
    if result.bugs_dir().exists() {
        for entry in fs::read_dir(result.bugs_dir())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // bug_<idx>_<code>.md
            if let Some(code) = name
                .strip_suffix(".md")
                .and_then(|n| n.rsplit('_').next())
            {
                if CODEBOOK.contains_key(code) {
                    *counts.entry(code.to_string()).or_default() += 1;
                }
            }
        }
    }
    let path = result.stats_dir().join("bugs.csv");
    let mut file = fs::File::create(&path)?;
    writeln!(file, "code,name,count")?;
    for (code, count) in &counts {
        let name = CODEBOOK.get(code.as_str()).copied().unwrap_or("");
        writeln!(file, "{},{},{}", code, name, count)?;
    }
    Ok(path)
}

//! `weft stats` — aggregate bug counts over a result directory

use std::fs;
use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use crate::report::{write_stats_csv, ResultDir};

pub fn run(results: &Path) -> Result<()> {
    let result = ResultDir::new(results);
    result.ensure()?;
    let path = write_stats_csv(&result)?;
    let content = fs::read_to_string(&path)?;
    let rows = content.lines().skip(1).count();
    if rows == 0 {
        println!("{}", "no bug reports found".dimmed());
    } else {
        for line in content.lines().skip(1) {
            let mut fields = line.splitn(3, ',');
            let code = fields.next().unwrap_or("");
            let name = fields.next().unwrap_or("");
            let count = fields.next().unwrap_or("");
            println!("{:>5}  {}  {}", count, code.bold(), name);
        }
    }
    println!("{} {}", "stats written to".dimmed(), path.display());
    Ok(())
}

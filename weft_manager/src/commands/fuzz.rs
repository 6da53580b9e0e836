//! `weft fuzz` — run a mutation campaign over a recorded trace

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use colored::Colorize;

use weft_core::analysis::{run_analysis, ScenarioSet};
use weft_core::fuzzing::{FuzzCampaign, FuzzConfig, FuzzInput, FuzzMode};
use weft_core::replay::{ReplayConfig, ReplayManager};
use weft_core::trace::read_trace_dir;

use crate::commands::rewrite::write_rewrite;
use crate::report::ResultDir;

pub struct FuzzOptions<'a> {
    pub mode: &'a str,
    pub max_runs: u64,
    pub keep_traces: bool,
    pub seed: u64,
}

fn parse_mode(mode: &str) -> Result<FuzzMode> {
    match mode {
        "gopie" => Ok(FuzzMode::GoPie),
        "gopie-hb" => Ok(FuzzMode::GoPieHb),
        "gfuzz" => Ok(FuzzMode::GFuzz),
        "flow" => Ok(FuzzMode::Flow),
        other => Err(anyhow!(
            "unknown fuzz mode '{}', expected gopie, gopie-hb, gfuzz or flow",
            other
        )),
    }
}

/// Summary written next to the campaign snapshot, one `key: value` per
/// line like a trace's `trace_info.log`.
fn write_campaign_info(dir: &Path, campaign: &FuzzCampaign) -> Result<()> {
    let mut file = fs::File::create(dir.join("campaign_info.log"))?;
    let config = campaign.config();
    let stats = campaign.stats();
    writeln!(file, "mode: {:?}", campaign.mode())?;
    writeln!(file, "max_runs: {}", config.max_runs)?;
    writeln!(file, "mutations_per_seed: {}", config.mutations_per_seed)?;
    writeln!(file, "max_select_mutations: {}", config.max_select_mutations)?;
    writeln!(file, "energy_ceiling: {}", config.energy_ceiling)?;
    writeln!(file, "seed: {}", config.seed)?;
    writeln!(file, "runs_done: {}", stats.runs_done)?;
    writeln!(file, "mutations_generated: {}", stats.mutations_generated)?;
    writeln!(file, "confirmations: {}", stats.confirmations)?;
    Ok(())
}

pub fn run(trace_dir: &Path, out: &Path, options: &FuzzOptions) -> Result<()> {
    let trace = read_trace_dir(trace_dir)
        .with_context(|| format!("failed to read trace from {}", trace_dir.display()))?;
    let analysis = run_analysis(&trace, &ScenarioSet::all());

    let mode = parse_mode(options.mode)?;
    let config = FuzzConfig::default()
        .with_max_runs(options.max_runs)
        .with_seed(options.seed);
    let mut campaign = FuzzCampaign::new(mode, config);
    campaign.seed_from_trace(&trace, &analysis);
    println!(
        "{} {} mutation(s) queued ({:?})",
        "fuzz:".bold(),
        campaign.pending(),
        mode
    );

    let result = ResultDir::new(out);
    result.ensure()?;
    let fuzz_dir = result.base().join("fuzz");
    fs::create_dir_all(&fuzz_dir)?;

    let mut run_index = 0usize;
    while let Some(task) = campaign.next_task() {
        let run_dir = fuzz_dir.join(format!("run_{:04}", run_index));
        run_index += 1;
        let confirmed = match &task.input {
            FuzzInput::Schedule(schedule) => {
                if options.keep_traces {
                    write_rewrite(&run_dir, schedule, "FUZZ", "GoPie schedule")?;
                }
                let manager = ReplayManager::for_rewrite(schedule, ReplayConfig::default());
                let exit = manager.dry_run();
                exit.is_confirmation()
            }
            FuzzInput::SelectPreferences(preferences) => {
                if options.keep_traces {
                    fs::create_dir_all(&run_dir)?;
                    let file = fs::File::create(run_dir.join("preferences.json"))?;
                    serde_json::to_writer_pretty(file, preferences)?;
                }
                false
            }
            FuzzInput::Delays(delays) => {
                if options.keep_traces {
                    fs::create_dir_all(&run_dir)?;
                    let file = fs::File::create(run_dir.join("delays.json"))?;
                    serde_json::to_writer_pretty(file, delays)?;
                }
                false
            }
        };
        campaign.record_result(confirmed);
    }

    let stats = campaign.stats();
    println!(
        "{} {} run(s), {} mutation(s) generated, {} confirmation(s)",
        "fuzz done:".bold(),
        stats.runs_done,
        stats.mutations_generated,
        stats.confirmations
    );
    campaign.save(&fuzz_dir.join("campaign.bin"))?;
    write_campaign_info(&fuzz_dir, &campaign)?;
    Ok(())
}

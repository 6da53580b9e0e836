//! # Fuzzing
//!
//! Mutates recorded traces into new schedules and feeds them back into
//! the replay manager:
//!
//! - **gopie**: scheduling chains over the Rel1/Rel2 relations with the
//!   abridge/flip/substitute/augment rules
//! - **gfuzz**: per-select preferred-case vectors
//! - **flow**: delay maps stalling timing-race winners
//!
//! A `FuzzCampaign` owns the queue of pending mutations and the run
//! budget; its state snapshots to disk so campaigns survive restarts.

pub mod flow;
pub mod gfuzz;
pub mod gopie;

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::analysis::Analysis;
use crate::error::WeftResult;
use crate::replay::{FlowDelays, SelectPreferences};
use crate::rewrite::RewrittenTrace;
use crate::trace::Trace;

pub use gopie::{materialize, mutate_chain, seed_chains, ChainScope, Relations, SchedulingChain, SC_START};

/// Deterministic xorshift64 generator; seeded explicitly so campaigns
/// are reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XorShift {
    state: u64,
}

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut s = self.state;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.state = s;
        s
    }

    /// Uniform value in `0..bound` (bound must be non-zero)
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }
}

/// Tuning knobs of a fuzzing campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzConfig {
    /// Maximum number of mutation replays
    pub max_runs: u64,
    /// Bound on chains produced per seed chain (GoPie)
    pub mutations_per_seed: usize,
    /// Bound on select-preference mutations per trace (GFuzz)
    pub max_select_mutations: usize,
    /// Cap on the energy score driving the GoPie termination coin
    pub energy_ceiling: usize,
    /// Seed for the deterministic mutation order
    pub seed: u64,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            max_runs: 100,
            mutations_per_seed: 16,
            max_select_mutations: 32,
            energy_ceiling: 256,
            seed: 1,
        }
    }
}

impl FuzzConfig {
    pub fn with_max_runs(mut self, max_runs: u64) -> Self {
        self.max_runs = max_runs;
        self
    }

    pub fn with_mutations_per_seed(mut self, bound: usize) -> Self {
        self.mutations_per_seed = bound;
        self
    }

    pub fn with_max_select_mutations(mut self, bound: usize) -> Self {
        self.max_select_mutations = bound;
        self
    }

    pub fn with_energy_ceiling(mut self, ceiling: usize) -> Self {
        self.energy_ceiling = ceiling;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Which mutation family a campaign runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuzzMode {
    /// Scheduling chains over mutex/channel/select operations
    GoPie,
    /// Chains with the broader HB-aware event scope
    GoPieHb,
    /// Select preferred-case mutation
    GFuzz,
    /// Timing delay mutation
    Flow,
}

/// One queued mutation ready for replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzTask {
    pub id: u64,
    pub mode: FuzzMode,
    pub input: FuzzInput,
}

/// The replay input a mutation produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FuzzInput {
    /// Partial-replay schedule (GoPie)
    Schedule(RewrittenTrace),
    /// Select preferences (GFuzz)
    SelectPreferences(SelectPreferences),
    /// Delay map (Flow)
    Delays(FlowDelays),
}

/// Counters of a fuzzing campaign
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FuzzStats {
    pub runs_done: u64,
    pub mutations_generated: u64,
    pub confirmations: u64,
}

/// Queue of pending mutations plus the run budget
#[derive(Debug, Serialize, Deserialize)]
pub struct FuzzCampaign {
    mode: FuzzMode,
    config: FuzzConfig,
    next_id: u64,
    rng: XorShift,
    queue: VecDeque<FuzzTask>,
    stats: FuzzStats,
}

impl FuzzCampaign {
    pub fn new(mode: FuzzMode, config: FuzzConfig) -> Self {
        let rng = XorShift::new(config.seed);
        Self {
            mode,
            config,
            next_id: 0,
            rng,
            queue: VecDeque::new(),
            stats: FuzzStats::default(),
        }
    }

    pub fn mode(&self) -> FuzzMode {
        self.mode
    }

    pub fn config(&self) -> &FuzzConfig {
        &self.config
    }

    pub fn stats(&self) -> FuzzStats {
        self.stats
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Generate mutations from a recorded trace and enqueue them
    pub fn seed_from_trace(&mut self, trace: &Trace, analysis: &Analysis) {
        match self.mode {
            FuzzMode::GoPie | FuzzMode::GoPieHb => {
                let scope = if self.mode == FuzzMode::GoPie {
                    ChainScope::Standard
                } else {
                    ChainScope::HbAware
                };
                let relations = Relations::compute(trace, scope);
                // chains deliberately reorder lock acquisitions, so
                // validity is judged without the mutex edges
                let hb_weak = crate::analysis::HbIndex::build_without_locks(trace);
                for seed in seed_chains(trace, &relations) {
                    let chains = mutate_chain(
                        &seed,
                        &relations,
                        &hb_weak,
                        &mut self.rng,
                        self.config.mutations_per_seed,
                        self.config.energy_ceiling,
                    );
                    for chain in chains {
                        if let Some(schedule) = materialize(trace, &chain) {
                            self.push(FuzzInput::Schedule(schedule));
                        }
                    }
                }
            }
            FuzzMode::GFuzz => {
                let bound = self.config.max_select_mutations;
                for preferences in
                    gfuzz::build_select_preferences(trace, bound, &mut self.rng)
                {
                    self.push(FuzzInput::SelectPreferences(preferences));
                }
            }
            FuzzMode::Flow => {
                for delays in flow::build_flow_delays(trace, analysis) {
                    self.push(FuzzInput::Delays(delays));
                }
            }
        }
        info!(
            "fuzz campaign seeded: {} pending mutations ({:?})",
            self.queue.len(),
            self.mode
        );
    }

    fn push(&mut self, input: FuzzInput) {
        let task = FuzzTask {
            id: self.next_id,
            mode: self.mode,
            input,
        };
        self.next_id += 1;
        self.stats.mutations_generated += 1;
        self.queue.push_back(task);
    }

    /// Next mutation to replay, while the run budget lasts
    pub fn next_task(&mut self) -> Option<FuzzTask> {
        if self.stats.runs_done >= self.config.max_runs {
            return None;
        }
        let task = self.queue.pop_front()?;
        self.stats.runs_done += 1;
        Some(task)
    }

    /// Record a finished replay; confirmed bugs count toward the stats
    pub fn record_result(&mut self, confirmed: bool) {
        if confirmed {
            self.stats.confirmations += 1;
        }
    }

    /// Snapshot the whole campaign (queue included) to disk
    pub fn save(&self, path: &Path) -> WeftResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(self)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Restore a snapshot written by [`FuzzCampaign::save`]
    pub fn load(path: &Path) -> WeftResult<Self> {
        let bytes = fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

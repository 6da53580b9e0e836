//! GFuzz-style select mutation
//!
//! Builds per-select preferred-case vectors from the observed selects:
//! a case is viable if some other routine offers the complementary
//! operation on its channel. The replay manager's preference mode then
//! delays each select briefly in favor of the preferred case before
//! falling back.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;

use crate::fuzzing::XorShift;
use crate::replay::SelectPreferences;
use crate::trace::{ChannelOpKind, EventKind, ObjectId, Trace};

/// Default delay a select waits for its preferred case
pub const SELECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct SelectSite {
    pos_key: String,
    /// Observed chosen case (-1 = default)
    chosen: i64,
    /// Case indices with a potential partner elsewhere
    viable: Vec<usize>,
}

/// Collect the select sites of a trace with their viable cases
fn collect_sites(trace: &Trace) -> Vec<SelectSite> {
    // who offers sends/recvs per channel, counting select cases too
    let mut senders: HashMap<ObjectId, usize> = HashMap::new();
    let mut receivers: HashMap<ObjectId, usize> = HashMap::new();
    for event in trace.iter_sorted() {
        match &event.kind {
            EventKind::Channel { id, op, .. } => match op {
                ChannelOpKind::Send => *senders.entry(*id).or_default() += 1,
                ChannelOpKind::Recv => *receivers.entry(*id).or_default() += 1,
                ChannelOpKind::Close => {}
            },
            EventKind::Select { cases, .. } => {
                for case in cases {
                    match case.op {
                        ChannelOpKind::Send => *senders.entry(case.channel).or_default() += 1,
                        ChannelOpKind::Recv => *receivers.entry(case.channel).or_default() += 1,
                        ChannelOpKind::Close => {}
                    }
                }
            }
            _ => {}
        }
    }

    let mut sites: Vec<SelectSite> = Vec::new();
    for event in trace.iter_sorted() {
        let EventKind::Select { cases, chosen, .. } = &event.kind else {
            continue;
        };
        let pos_key = event.pos.key();
        if sites.iter().any(|s| s.pos_key == pos_key) {
            continue;
        }
        let viable: Vec<usize> = cases
            .iter()
            .enumerate()
            .filter(|(_, case)| {
                let offers = match case.op {
                    // a send case needs a receiver elsewhere and so on;
                    // own occurrence is part of the count, so require
                    // the complementary side
                    ChannelOpKind::Send => receivers.get(&case.channel).copied().unwrap_or(0),
                    ChannelOpKind::Recv => senders.get(&case.channel).copied().unwrap_or(0),
                    ChannelOpKind::Close => 0,
                };
                offers > 0
            })
            .map(|(i, _)| i)
            .collect();
        if !viable.is_empty() {
            sites.push(SelectSite {
                pos_key,
                chosen: *chosen,
                viable,
            });
        }
    }
    sites
}

/// Build GFuzz mutations for a trace.
///
/// Deterministic single-site flips come first (each viable case that is
/// not the recorded choice), followed by random multi-site assignments
/// up to `max_mutations`.
pub fn build_select_preferences(
    trace: &Trace,
    max_mutations: usize,
    rng: &mut XorShift,
) -> Vec<SelectPreferences> {
    let sites = collect_sites(trace);
    if sites.is_empty() {
        return Vec::new();
    }
    let mut mutations: Vec<SelectPreferences> = Vec::new();

    // flip one select at a time
    for site in &sites {
        for &case in &site.viable {
            if case as i64 == site.chosen {
                continue;
            }
            let mut preferences = SelectPreferences::new(SELECT_DELAY);
            preferences.prefer(&site.pos_key, vec![case]);
            mutations.push(preferences);
            if mutations.len() >= max_mutations {
                return mutations;
            }
        }
    }

    // random joint assignments across all selects
    if sites.len() > 1 {
        let budget = max_mutations.saturating_sub(mutations.len());
        for _ in 0..budget {
            let mut preferences = SelectPreferences::new(SELECT_DELAY);
            for site in &sites {
                let pick = site.viable[rng.below(site.viable.len() as u64) as usize];
                preferences.prefer(&site.pos_key, vec![pick]);
            }
            mutations.push(preferences);
        }
    }
    debug!(
        "gfuzz: {} select sites -> {} mutations",
        sites.len(),
        mutations.len()
    );
    mutations
}

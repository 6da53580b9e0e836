//! GoPie-style schedule mutation
//!
//! A *scheduling chain* is an ordered list of events from different
//! routines steering the replay into a new interleaving. Chains are
//! seeded from the same-primitive cross-routine relation and grown by
//! four mutation rules (abridge, flip, substitute, augment), then
//! materialized into partial-replay traces.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::analysis::{HbIndex, HbRelation};
use crate::fuzzing::XorShift;
use crate::replay::ExitCode;
use crate::rewrite::{ActiveMap, RewrittenTrace};
use crate::trace::{Event, EventKey, EventKind, Time, Trace};

/// Which events participate in chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainScope {
    /// Mutex, channel and select operations
    Standard,
    /// The HB-aware variant additionally chains wait group, cond and
    /// once operations
    HbAware,
}

/// Cap on chains seeded per starting point
pub const SC_START: usize = 3;

fn chainable(event: &Event, scope: ChainScope) -> bool {
    match &event.kind {
        EventKind::Channel { .. } | EventKind::Mutex { .. } | EventKind::Select { .. } => true,
        EventKind::WaitGroup { .. } | EventKind::Cond { .. } | EventKind::Once { .. } => {
            scope == ChainScope::HbAware
        }
        _ => false,
    }
}

/// Rel1 (same-routine adjacency) and Rel2 (same-primitive across
/// routines, plus the derived Rel1∘Rel2 clause).
#[derive(Debug, Default)]
pub struct Relations {
    rel1: HashMap<EventKey, Vec<EventKey>>,
    rel2: HashMap<EventKey, Vec<EventKey>>,
}

impl Relations {
    pub fn compute(trace: &Trace, scope: ChainScope) -> Self {
        let mut relations = Relations::default();

        // Rel1: consecutive chainable events of one routine
        for routine in trace.routine_ids().collect::<Vec<_>>() {
            let chainable_events: Vec<EventKey> = trace
                .events_of(routine)
                .iter()
                .filter(|e| chainable(e, scope))
                .map(|e| e.key())
                .collect();
            for pair in chainable_events.windows(2) {
                relations.rel1.entry(pair[0]).or_default().push(pair[1]);
            }
        }

        // Rel2: same primitive, different routines
        let mut by_object: HashMap<u64, Vec<EventKey>> = HashMap::new();
        for event in trace.iter_sorted() {
            if !chainable(event, scope) {
                continue;
            }
            if let Some(id) = event.object_id() {
                by_object.entry(id).or_default().push(event.key());
            }
        }
        for keys in by_object.values() {
            for &a in keys {
                for &b in keys {
                    if a != b && a.routine != b.routine {
                        relations.rel2.entry(a).or_default().push(b);
                    }
                }
            }
        }

        // derived clause: (a, c) ∈ Rel2 if (a, b) ∈ Rel1 and (b, c) ∈ Rel2
        let mut derived: Vec<(EventKey, EventKey)> = Vec::new();
        for (a, bs) in &relations.rel1 {
            for b in bs {
                if let Some(cs) = relations.rel2.get(b) {
                    for c in cs {
                        if a.routine != c.routine && *a != *c {
                            derived.push((*a, *c));
                        }
                    }
                }
            }
        }
        for (a, c) in derived {
            let list = relations.rel2.entry(a).or_default();
            if !list.contains(&c) {
                list.push(c);
            }
        }
        relations
    }

    pub fn rel1_of(&self, key: EventKey) -> &[EventKey] {
        self.rel1.get(&key).map_or(&[], Vec::as_slice)
    }

    pub fn rel2_of(&self, key: EventKey) -> &[EventKey] {
        self.rel2.get(&key).map_or(&[], Vec::as_slice)
    }

    /// Energy of the trace: how many cross-routine scheduling choices it
    /// offers. Drives the mutation budget.
    pub fn energy(&self) -> usize {
        self.rel2.values().map(Vec::len).sum()
    }
}

/// Ordered list of events from different routines exploring an
/// alternative interleaving. Neighbors always differ in routine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchedulingChain {
    events: Vec<EventKey>,
}

impl SchedulingChain {
    pub fn new(events: Vec<EventKey>) -> Option<Self> {
        let chain = Self { events };
        chain.neighbors_differ().then_some(chain)
    }

    pub fn events(&self) -> &[EventKey] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn neighbors_differ(&self) -> bool {
        self.events
            .windows(2)
            .all(|w| w[0].routine != w[1].routine)
    }

    /// A chain is HB-valid iff no element happens after its successor
    pub fn is_hb_valid(&self, hb: &HbIndex) -> bool {
        self.events
            .windows(2)
            .all(|w| hb.relation(w[0], w[1]) != HbRelation::After)
    }

    fn contains(&self, key: EventKey) -> bool {
        self.events.contains(&key)
    }
}

/// Seed chains from Rel2 pairs, capped per starting point
pub fn seed_chains(trace: &Trace, relations: &Relations) -> Vec<SchedulingChain> {
    let mut chains = Vec::new();
    for event in trace.iter_sorted() {
        let key = event.key();
        let partners = relations.rel2_of(key);
        for partner in partners.iter().take(SC_START) {
            if let Some(chain) = SchedulingChain::new(vec![key, *partner]) {
                chains.push(chain);
            }
        }
    }
    chains
}

/// Grow a chain into a set of mutated chains.
///
/// Applies the four rules until the set exceeds `bound` or an
/// energy-weighted coin terminates the run; the energy score is the
/// trace's Rel2 size capped at `energy_ceiling`.
pub fn mutate_chain(
    seed: &SchedulingChain,
    relations: &Relations,
    hb: &HbIndex,
    rng: &mut XorShift,
    bound: usize,
    energy_ceiling: usize,
) -> Vec<SchedulingChain> {
    let mut set: HashSet<SchedulingChain> = HashSet::new();
    set.insert(seed.clone());
    let energy = relations.energy().min(energy_ceiling).max(1);

    // one deterministic round of every rule over the seed
    for rule in 0..4 {
        for chain in apply_rule(seed, rule, relations) {
            if chain.len() >= 2 && chain.is_hb_valid(hb) {
                set.insert(chain);
            }
        }
    }

    // then grow randomly until the bound or the energy-weighted coin
    loop {
        if set.len() >= bound {
            break;
        }
        // richer traces mutate longer before the coin terminates
        if rng.below(energy as u64 + 1) == 0 {
            break;
        }
        let current = {
            let idx = rng.below(set.len() as u64) as usize;
            set.iter().nth(idx).cloned()
        };
        let Some(current) = current else { break };
        let rule = rng.below(4) as usize;
        for chain in apply_rule(&current, rule, relations) {
            if chain.len() >= 2 && chain.is_hb_valid(hb) {
                set.insert(chain);
            }
        }
    }
    debug!("mutated chain of {} into {} chains", seed.len(), set.len());
    set.remove(seed);
    set.into_iter().collect()
}

fn apply_rule(
    chain: &SchedulingChain,
    rule: usize,
    relations: &Relations,
) -> Vec<SchedulingChain> {
    match rule {
        // abridge: drop head or tail
        0 => {
            let mut results = Vec::new();
            if chain.len() > 2 {
                results.extend(SchedulingChain::new(chain.events[1..].to_vec()));
                results.extend(SchedulingChain::new(
                    chain.events[..chain.len() - 1].to_vec(),
                ));
            }
            results
        }
        // flip: swap each adjacent pair
        1 => {
            let mut results = Vec::new();
            for i in 0..chain.len().saturating_sub(1) {
                let mut events = chain.events.clone();
                events.swap(i, i + 1);
                results.extend(SchedulingChain::new(events));
            }
            results
        }
        // substitute: replace an element with a Rel1 neighbor of it
        2 => {
            let mut results = Vec::new();
            for i in 0..chain.len() {
                for candidate in relations.rel1_of(chain.events[i]) {
                    if chain.contains(*candidate) {
                        continue;
                    }
                    let mut events = chain.events.clone();
                    events[i] = *candidate;
                    results.extend(SchedulingChain::new(events));
                }
            }
            results
        }
        // augment: append a Rel2 partner of the last element
        _ => {
            let Some(&last) = chain.events.last() else {
                return Vec::new();
            };
            let mut results = Vec::new();
            for candidate in relations.rel2_of(last) {
                if chain.contains(*candidate) {
                    continue;
                }
                let mut events = chain.events.clone();
                events.push(*candidate);
                results.extend(SchedulingChain::new(events));
            }
            results
        }
    }
}

/// Materialize a chain into a partial-replay trace: the original trace
/// is cut before the chain's first element and the chain members are
/// re-inserted with fresh monotonic timestamps; the active map pins
/// exactly the chain's positions.
pub fn materialize(trace: &Trace, chain: &SchedulingChain) -> Option<RewrittenTrace> {
    let first = chain.events().first()?;
    let first_time = trace.event(*first)?.t_sort();

    let members: Vec<Event> = chain
        .events()
        .iter()
        .map(|key| trace.event(*key).cloned())
        .collect::<Option<Vec<_>>>()?;

    let mut rewritten = trace.clone();
    rewritten.shorten(first_time, false);
    // chain members that predate the cut must not stay duplicated in
    // the prefix
    for key in chain.events() {
        rewritten.remove_event(*key);
    }
    let mut t: Time = first_time.max(rewritten.last_time() + 1);
    for member in members {
        let mut event = member;
        event.t_pre = t;
        event.t_post = t + 1;
        if let EventKind::Select { cases, .. } = &mut event.kind {
            for case in cases.iter_mut() {
                case.t_pre = t;
                if case.t_post != 0 {
                    case.t_post = t + 1;
                }
            }
        }
        rewritten.add(event).ok()?;
        t += 2;
    }
    rewritten.add_replay_marker(t, ExitCode::Unconfirmed.code());

    let mut active = ActiveMap::new();
    for key in chain.events() {
        let pos_key = trace.event(*key)?.pos.key();
        // occurrences as the gate will count them in the new trace
        let mut occurrence = 0;
        for event in rewritten.iter_sorted() {
            if event.pos.key() == pos_key {
                occurrence += 1;
                if event.routine == key.routine && event.t_pre >= first_time {
                    break;
                }
            }
        }
        if occurrence == 0 {
            return None;
        }
        active.insert(&pos_key, occurrence);
    }

    Some(RewrittenTrace {
        trace: rewritten,
        active,
        start_time_active: first_time,
        expected_exit: ExitCode::Unconfirmed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::HbIndex;
    use crate::trace::{ChannelOpKind, MutexOpKind, Position};

    fn mutex(routine: u64, t_pre: u64, t_post: u64, line: u32, id: u64, op: MutexOpKind) -> Event {
        Event {
            routine,
            t_pre,
            t_post,
            pos: Position::new("main.go", line),
            kind: EventKind::Mutex {
                id,
                rw: false,
                op,
                suc: true,
            },
        }
    }

    fn sample_trace() -> Trace {
        let mut trace = Trace::new();
        trace.add(mutex(1, 2, 4, 10, 7, MutexOpKind::Lock)).unwrap();
        trace
            .add(mutex(1, 6, 8, 11, 7, MutexOpKind::Unlock))
            .unwrap();
        trace.add(mutex(2, 10, 12, 20, 7, MutexOpKind::Lock)).unwrap();
        trace
            .add(mutex(2, 14, 16, 21, 7, MutexOpKind::Unlock))
            .unwrap();
        trace
            .add(Event {
                routine: 2,
                t_pre: 18,
                t_post: 20,
                pos: Position::new("main.go", 22),
                kind: EventKind::Channel {
                    id: 9,
                    op: ChannelOpKind::Send,
                    closed: false,
                    op_id: 1,
                    qsize: 1,
                    qcount: 1,
                },
            })
            .unwrap();
        trace
    }

    #[test]
    fn test_relations() {
        let trace = sample_trace();
        let relations = Relations::compute(&trace, ChainScope::Standard);
        let lock1 = EventKey::new(1, 2);
        let unlock1 = EventKey::new(1, 6);
        let lock2 = EventKey::new(2, 10);
        // adjacency within routine 1
        assert_eq!(relations.rel1_of(lock1), &[unlock1]);
        // same mutex across routines
        assert!(relations.rel2_of(lock1).contains(&lock2));
        // derived: lock1 -Rel1-> unlock1 -Rel2-> lock2 lands in Rel2(lock1)
        assert!(relations.rel2_of(lock1).contains(&EventKey::new(2, 14)));
        assert!(relations.energy() > 0);
    }

    #[test]
    fn test_seed_chains_cap_and_shape() {
        let trace = sample_trace();
        let relations = Relations::compute(&trace, ChainScope::Standard);
        let chains = seed_chains(&trace, &relations);
        assert!(!chains.is_empty());
        for chain in &chains {
            assert_eq!(chain.len(), 2);
            assert!(chain.neighbors_differ());
        }
    }

    #[test]
    fn test_chain_hb_validity() {
        let trace = sample_trace();
        let hb = HbIndex::build(&trace);
        // unlock1 -> lock2 are HB-ordered by the mutex edge, valid order
        let ordered =
            SchedulingChain::new(vec![EventKey::new(1, 6), EventKey::new(2, 10)]).unwrap();
        assert!(ordered.is_hb_valid(&hb));
        // the reverse puts an HB-later event first
        let reversed =
            SchedulingChain::new(vec![EventKey::new(2, 10), EventKey::new(1, 6)]).unwrap();
        assert!(!reversed.is_hb_valid(&hb));
    }

    #[test]
    fn test_neighbors_must_differ() {
        assert!(SchedulingChain::new(vec![EventKey::new(1, 2), EventKey::new(1, 6)]).is_none());
    }

    #[test]
    fn test_mutation_produces_valid_chains() {
        let trace = sample_trace();
        let relations = Relations::compute(&trace, ChainScope::Standard);
        let hb = HbIndex::build(&trace);
        let mut rng = XorShift::new(42);
        let seed =
            SchedulingChain::new(vec![EventKey::new(1, 2), EventKey::new(2, 10)]).unwrap();
        let mutated = mutate_chain(&seed, &relations, &hb, &mut rng, 16, 256);
        for chain in &mutated {
            assert!(chain.len() >= 2);
            assert!(chain.neighbors_differ());
            assert!(chain.is_hb_valid(&hb));
        }
    }

    #[test]
    fn test_materialize_builds_partial_replay() {
        let trace = sample_trace();
        let chain =
            SchedulingChain::new(vec![EventKey::new(2, 10), EventKey::new(1, 2)]).unwrap();
        let result = materialize(&trace, &chain).unwrap();
        assert_eq!(result.expected_exit, ExitCode::Unconfirmed);
        assert!(!result.active.is_empty());
        assert!(result.active.tracks_position("main.go:20"));
        assert!(result.active.tracks_position("main.go:10"));
        // chain members were re-inserted after the cut
        let lock_events = result.trace.count_matching(|e| {
            matches!(
                e.kind,
                EventKind::Mutex {
                    op: MutexOpKind::Lock,
                    ..
                }
            )
        });
        assert_eq!(lock_events, 2);
        // the marker terminates the trace
        assert!(result.trace.replay_marker().is_some());
    }
}

//! # Trace rewriting
//!
//! For every predicted bug the rewriter derives a fresh trace whose
//! replay makes the bug manifest. All rewrites preserve HB consistency
//! up to the rewrite frontier: no event is placed before another event
//! that happens-before it. The shared primitive is
//! [`shift_concurrent_or_after_to_after`], built on the trace model's
//! order-preserving shift.
//!
//! Every rewritten trace ends in a `ReplayEnd` marker carrying the
//! confirmation exit code for the bug and an `active` map naming the
//! strict schedule fragment; the replay manager runs everything outside
//! that fragment as a pass-through (partial replay).

mod closed_channel;
mod deadlock;
mod leak;

use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::analysis::{Analysis, Bug, BugKind, HbIndex, HbRelation};
use crate::replay::ExitCode;
use crate::trace::{Event, EventKey, RoutineId, Time, Trace, CONTROL_ROUTINE};

/// Positions the replay manager must schedule strictly, each with the
/// 1-based occurrence numbers that are held (other occurrences of the
/// same position pass through).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveMap {
    entries: HashMap<String, Vec<u64>>,
}

impl ActiveMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one occurrence of a position as strict
    pub fn insert(&mut self, pos_key: &str, occurrence: u64) {
        let list = self.entries.entry(pos_key.to_string()).or_default();
        if !list.contains(&occurrence) {
            list.push(occurrence);
            list.sort_unstable();
        }
    }

    /// Whether the n-th occurrence of a position is strict
    pub fn contains(&self, pos_key: &str, occurrence: u64) -> bool {
        self.entries
            .get(pos_key)
            .is_some_and(|list| list.contains(&occurrence))
    }

    /// Whether a position appears at all
    pub fn tracks_position(&self, pos_key: &str) -> bool {
        self.entries.contains_key(pos_key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn positions(&self) -> impl Iterator<Item = (&str, &[u64])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// A rewrite ready for replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrittenTrace {
    pub trace: Trace,
    /// Strict schedule fragment for partial replay
    pub active: ActiveMap,
    /// Gates before this time are pass-through even when `active` is set
    pub start_time_active: Time,
    /// The exit code the replay must produce to confirm the bug
    pub expected_exit: ExitCode,
}

/// Outcome of asking the rewriter for one bug
#[derive(Debug)]
pub enum RewriteOutcome {
    /// A trace whose replay should exhibit the bug
    Rewritten(Box<RewrittenTrace>),
    /// The bug was observed in the recorded run; nothing to rewrite
    NotNeeded,
    /// No HB-consistent reordering exhibits the bug
    NotPossible(String),
}

impl RewriteOutcome {
    pub fn is_rewritten(&self) -> bool {
        matches!(self, RewriteOutcome::Rewritten(_))
    }
}

/// Derives bug-manifesting traces from a recorded trace and its analysis
pub struct Rewriter<'a> {
    trace: &'a Trace,
    analysis: &'a Analysis,
}

impl<'a> Rewriter<'a> {
    pub fn new(trace: &'a Trace, analysis: &'a Analysis) -> Self {
        Self { trace, analysis }
    }

    /// Produce the rewrite for one bug
    pub fn rewrite(&self, bug: &Bug) -> RewriteOutcome {
        use BugKind::*;
        let outcome = match bug.kind {
            // observed in the recorded run, or recording faults: the
            // original trace already exhibits them
            SendOnClosed | RecvOnClosed | CloseOnClosed | CloseOnNil | NegativeWaitGroup
            | UnlockOfUnlocked | ActualLeak | ConcurrentRecv | SelectWithoutPartner
            | UnknownPanic | RecordingTimeout => RewriteOutcome::NotNeeded,

            PossibleSendOnClosed | PossibleRecvOnClosed => {
                closed_channel::rewrite(self.trace, &self.analysis.hb, bug)
            }
            PossibleNegativeWaitGroup => deadlock::rewrite_negative_wait_group(
                self.trace,
                &self.analysis.hb,
                bug,
            ),
            UnlockBeforeLock => {
                deadlock::rewrite_unlock_before_lock(self.trace, &self.analysis.hb, bug)
            }
            CyclicDeadlock => deadlock::rewrite_cyclic(self.trace, &self.analysis.hb, bug),

            LeakUnbufferedWith | LeakSelectWith => {
                leak::rewrite_unbuffered(self.trace, self.analysis, bug)
            }
            LeakBufferedWith => leak::rewrite_buffered(self.trace, self.analysis, bug),
            LeakMutex => leak::rewrite_mutex(self.trace, &self.analysis.hb, bug),
            LeakWaitGroup => leak::rewrite_wait_group(self.trace, &self.analysis.hb, bug),
            LeakCond => leak::rewrite_cond(self.trace, &self.analysis.hb, bug),

            LeakUnbufferedWithout | LeakBufferedWithout | LeakSelectWithout | LeakNilChannel
            | LeakContext | LeakUnknown => {
                RewriteOutcome::NotPossible("stuck operation has no possible partner".into())
            }
        };
        match &outcome {
            RewriteOutcome::Rewritten(r) => info!(
                "rewrote {} with expected exit {}",
                bug.kind.code(),
                r.expected_exit.code()
            ),
            RewriteOutcome::NotNeeded => debug!("{}: rewrite not needed", bug.kind.code()),
            RewriteOutcome::NotPossible(reason) => {
                debug!("{}: rewrite not possible: {}", bug.kind.code(), reason)
            }
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Shared rewrite primitives
// ---------------------------------------------------------------------------

/// Advance every event HB-concurrent with or HB-after `anchor` so it
/// lands after `reference_time`, preserving per-routine order. Events in
/// `keep` stay where they are.
pub(crate) fn shift_concurrent_or_after_to_after(
    trace: &mut Trace,
    hb: &HbIndex,
    anchor: EventKey,
    reference_time: Time,
    keep: &[EventKey],
) -> Result<(), String> {
    trace
        .shift_events_to_after(reference_time, |event| {
            let key = event.key();
            if key == anchor || keep.contains(&key) {
                return false;
            }
            matches!(
                hb.relation(anchor, key),
                HbRelation::Concurrent | HbRelation::Before
            )
        })
        .map_err(|e| e.to_string())
}

/// Advance `anchor` itself plus everything HB-after it past
/// `reference_time`.
pub(crate) fn shift_self_and_after_to_after(
    trace: &mut Trace,
    hb: &HbIndex,
    anchor: EventKey,
    reference_time: Time,
) -> Result<(), String> {
    trace
        .shift_events_to_after(reference_time, |event| {
            let key = event.key();
            key == anchor || hb.relation(anchor, key) == HbRelation::Before
        })
        .map_err(|e| e.to_string())
}

/// Durable reference to an event that survives timestamp shifts: the
/// n-th event at a position within its routine (per-routine order is
/// preserved by every mutator).
#[derive(Debug, Clone)]
pub(crate) struct EventLocator {
    routine: RoutineId,
    pos_key: String,
    nth: usize,
}

impl EventLocator {
    /// Capture a locator before mutating the trace
    pub(crate) fn capture(trace: &Trace, key: EventKey) -> Option<Self> {
        let event = trace.event(key)?;
        let pos_key = event.pos.key();
        let nth = trace
            .events_of(key.routine)
            .iter()
            .filter(|e| e.t_pre <= key.t_pre && e.pos.key() == pos_key)
            .count();
        Some(Self {
            routine: key.routine,
            pos_key,
            nth,
        })
    }

    /// Find the event again after mutation
    pub(crate) fn resolve<'t>(&self, trace: &'t Trace) -> Option<&'t Event> {
        trace
            .events_of(self.routine)
            .iter()
            .filter(|e| e.pos.key() == self.pos_key)
            .nth(self.nth - 1)
    }

    /// Global 1-based occurrence number of this event's position in the
    /// trace's `t_sort` order, as the replay gate will count it.
    pub(crate) fn occurrence(&self, trace: &Trace) -> Option<u64> {
        let event = self.resolve(trace)?;
        let t = event.t_sort();
        let mut occurrence = 0;
        for e in trace.iter_sorted() {
            if e.pos.key() == self.pos_key {
                occurrence += 1;
                if e.routine == event.routine && e.t_pre == event.t_pre {
                    return Some(occurrence);
                }
                if e.t_sort() > t {
                    break;
                }
            }
        }
        None
    }
}

/// Finalize a rewrite: stamp the replay marker and build the active map
/// from the critical events.
pub(crate) fn finalize(
    mut trace: Trace,
    critical: Vec<EventLocator>,
    exit: ExitCode,
) -> RewriteOutcome {
    let marker_time = trace.last_time() + 1;
    trace.add_replay_marker(marker_time, exit.code());

    let mut active = ActiveMap::new();
    let mut start_time_active = marker_time;
    for locator in &critical {
        let Some(event) = locator.resolve(&trace) else {
            return RewriteOutcome::NotPossible(format!(
                "critical event at {} lost during rewrite",
                locator.pos_key
            ));
        };
        start_time_active = start_time_active.min(event.t_sort());
        let Some(occurrence) = locator.occurrence(&trace) else {
            return RewriteOutcome::NotPossible(format!(
                "could not count occurrences of {}",
                locator.pos_key
            ));
        };
        active.insert(&locator.pos_key, occurrence);
    }

    RewriteOutcome::Rewritten(Box::new(RewrittenTrace {
        trace,
        active,
        start_time_active,
        expected_exit: exit,
    }))
}

/// Drop control markers left over from a previous rewrite
pub(crate) fn strip_markers(trace: &mut Trace) {
    let markers: Vec<EventKey> = trace
        .events_of(CONTROL_ROUTINE)
        .iter()
        .map(|e| e.key())
        .collect();
    for key in markers {
        trace.remove_event(key);
    }
}

//! Flow-style delay mutation
//!
//! Finds operations whose outcome hinged on timing (failed try-locks,
//! once losers) and builds delay maps that stall the winning side at the
//! right occurrence, giving the loser a chance to win under replay.

use log::debug;

use crate::analysis::{Analysis, HbRelation};
use crate::replay::FlowDelays;
use crate::trace::{EventKind, Trace};

/// Build flow mutations for a trace: one delay map per timing-sensitive
/// pair found.
pub fn build_flow_delays(trace: &Trace, analysis: &Analysis) -> Vec<FlowDelays> {
    let mut mutations = Vec::new();

    // failed try-locks: delay the concurrent successful acquire
    for event in trace.iter_sorted() {
        let EventKind::Mutex { id, op, suc, .. } = &event.kind else {
            continue;
        };
        if !op.is_try() || *suc {
            continue;
        }
        let winner = trace.iter_sorted().find(|other| {
            matches!(
                &other.kind,
                EventKind::Mutex { id: oid, op: oop, suc: osuc, .. }
                    if oid == id && oop.is_acquire() && (!oop.is_try() || *osuc)
            ) && other.t_post != 0
                && other.routine != event.routine
                && analysis.hb.relation(event.key(), other.key()) == HbRelation::Concurrent
        });
        if let Some(winner) = winner {
            if let Some(occurrence) = trace.occurrence_of(winner.key()) {
                let mut delays = FlowDelays::new();
                delays.delay(&winner.pos.key(), occurrence);
                mutations.push(delays);
            }
        }
    }

    // once losers: delay the winning Do. The once edge itself orders
    // winner before loser, so anything but loser-before-winner counts.
    for event in trace.iter_sorted() {
        let EventKind::Once { id, suc } = &event.kind else {
            continue;
        };
        if *suc {
            continue;
        }
        let winner = trace.iter_sorted().find(|other| {
            matches!(&other.kind, EventKind::Once { id: oid, suc: true } if oid == id)
                && other.routine != event.routine
                && analysis.hb.relation(event.key(), other.key()) != HbRelation::Before
        });
        if let Some(winner) = winner {
            if let Some(occurrence) = trace.occurrence_of(winner.key()) {
                let mut delays = FlowDelays::new();
                delays.delay(&winner.pos.key(), occurrence);
                mutations.push(delays);
            }
        }
    }

    debug!("flow: built {} delay mutations", mutations.len());
    mutations
}

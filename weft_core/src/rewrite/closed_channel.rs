//! Rewrites for the closed-channel family (possible send/recv on closed)
//!
//! The operation and the close are HB-concurrent, so a schedule exists
//! where the close runs first. The rewrite truncates everything after
//! the two events and, when the operation preceded the close in the
//! recorded run, moves it (and its HB-successors) past the close.

use crate::analysis::{Bug, BugKind, HbIndex, HbRelation};
use crate::replay::ExitCode;
use crate::rewrite::{
    finalize, shift_self_and_after_to_after, strip_markers, EventLocator, RewriteOutcome,
};
use crate::trace::Trace;

pub(crate) fn rewrite(trace: &Trace, hb: &HbIndex, bug: &Bug) -> RewriteOutcome {
    let (Some(&op), Some(&cls)) = (bug.primary.first(), bug.secondary.first()) else {
        return RewriteOutcome::NotPossible("bug is missing the operation or close event".into());
    };
    if hb.relation(op, cls) != HbRelation::Concurrent {
        return RewriteOutcome::NotPossible("operation and close are HB-ordered".into());
    }
    let exit = match bug.kind {
        BugKind::PossibleSendOnClosed => ExitCode::SendOnClosed,
        BugKind::PossibleRecvOnClosed => ExitCode::RecvOnClosed,
        _ => return RewriteOutcome::NotPossible("not a closed-channel bug".into()),
    };

    let (Some(op_event), Some(cls_event)) = (trace.event(op), trace.event(cls)) else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };
    let op_time = op_event.t_sort();
    let cls_time = cls_event.t_sort();

    let mut rewritten = trace.clone();
    strip_markers(&mut rewritten);
    let (Some(op_loc), Some(cls_loc)) = (
        EventLocator::capture(&rewritten, op),
        EventLocator::capture(&rewritten, cls),
    ) else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };

    rewritten.shorten(op_time.max(cls_time), true);
    if op_time < cls_time {
        // the operation ran first in the recorded schedule; push it and
        // its HB-successors past the close
        if let Err(e) = shift_self_and_after_to_after(&mut rewritten, hb, op, cls_time) {
            return RewriteOutcome::NotPossible(e);
        }
    }

    finalize(rewritten, vec![op_loc, cls_loc], exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{run_analysis, ScenarioSet};
    use crate::trace::{ChannelOpKind, Event, EventKind, Position};

    fn channel(
        routine: u64,
        t_pre: u64,
        t_post: u64,
        line: u32,
        id: u64,
        op: ChannelOpKind,
        op_id: u64,
    ) -> Event {
        Event {
            routine,
            t_pre,
            t_post,
            pos: Position::new("main.go", line),
            kind: EventKind::Channel {
                id,
                op,
                closed: false,
                op_id,
                qsize: 1,
                qcount: 0,
            },
        }
    }

    #[test]
    fn test_send_moves_past_close() {
        let mut trace = Trace::new();
        trace
            .add(channel(1, 2, 4, 10, 5, ChannelOpKind::Send, 1))
            .unwrap();
        trace
            .add(channel(1, 20, 22, 11, 5, ChannelOpKind::Send, 2))
            .unwrap();
        trace
            .add(channel(2, 6, 6, 20, 5, ChannelOpKind::Close, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = analysis
            .bugs
            .iter()
            .find(|b| b.kind == BugKind::PossibleSendOnClosed)
            .expect("analysis should predict send on closed");

        let outcome = rewrite(&trace, &analysis.hb, bug);
        let RewriteOutcome::Rewritten(result) = outcome else {
            panic!("expected a rewrite");
        };
        assert_eq!(result.expected_exit, ExitCode::SendOnClosed);
        // the late second send was truncated
        assert_eq!(
            result
                .trace
                .count_matching(|e| matches!(e.kind, EventKind::Channel { .. })),
            2
        );
        // close now precedes the send in iteration order
        let order: Vec<u64> = result
            .trace
            .iter_sorted()
            .filter(|e| matches!(e.kind, EventKind::Channel { .. }))
            .map(|e| e.routine)
            .collect();
        assert_eq!(order, vec![2, 1]);
        // the marker carries the confirmation code
        let marker = result.trace.replay_marker().unwrap();
        assert!(matches!(marker.kind, EventKind::ReplayEnd { exit_code: 30 }));
        // both critical positions are strict
        assert!(result.active.tracks_position("main.go:10"));
        assert!(result.active.tracks_position("main.go:20"));
    }

    #[test]
    fn test_ordered_pair_is_not_rewritable() {
        let unbuffered = |routine, t_pre, t_post, line, op, op_id| Event {
            routine,
            t_pre,
            t_post,
            pos: Position::new("main.go", line),
            kind: EventKind::Channel {
                id: 5,
                op,
                closed: false,
                op_id,
                qsize: 0,
                qcount: 0,
            },
        };
        let mut trace = Trace::new();
        // rendezvous orders the send before the close
        trace
            .add(unbuffered(1, 2, 8, 10, ChannelOpKind::Send, 1))
            .unwrap();
        trace
            .add(unbuffered(2, 4, 8, 20, ChannelOpKind::Recv, 1))
            .unwrap();
        trace
            .add(unbuffered(2, 10, 10, 21, ChannelOpKind::Close, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = Bug::new(
            BugKind::PossibleSendOnClosed,
            vec![crate::trace::EventKey::new(1, 2)],
            vec![crate::trace::EventKey::new(2, 10)],
        );
        let outcome = rewrite(&trace, &analysis.hb, &bug);
        assert!(matches!(outcome, RewriteOutcome::NotPossible(_)));
    }
}

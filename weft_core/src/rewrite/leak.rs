//! Rewrites for leaked (never-completed) operations
//!
//! A leak with a possible partner is made resolvable by stealing the
//! partner: its recorded counterpart is removed from the trace and the
//! schedule is reordered so stuck operation and partner meet. Leaks on
//! mutexes, wait groups and conditionals reorder the releasing side
//! instead.

use crate::analysis::{Analysis, Bug, HbIndex, HbRelation};
use crate::replay::ExitCode;
use crate::rewrite::{
    finalize, shift_concurrent_or_after_to_after, strip_markers, EventLocator, RewriteOutcome,
};
use crate::trace::{
    ChannelOpKind, CondOpKind, Event, EventKey, EventKind, ObjectId, Time, Trace, WaitGroupOpKind,
};

/// The channel a stuck op and its candidate partner share, and the stuck
/// side's operation on it.
fn shared_channel(stuck: &Event, partner: &Event) -> Option<(ObjectId, ChannelOpKind)> {
    match (&stuck.kind, &partner.kind) {
        (EventKind::Channel { id, op, .. }, _) => Some((*id, *op)),
        (EventKind::Select { cases, .. }, EventKind::Channel { id, .. }) => cases
            .iter()
            .find(|c| c.channel == *id)
            .map(|c| (c.channel, c.op)),
        (EventKind::Select { cases, .. }, EventKind::Select { cases: pcases, .. }) => {
            cases.iter().find_map(|c| {
                pcases
                    .iter()
                    .any(|p| p.channel == c.channel && p.op != c.op)
                    .then_some((c.channel, c.op))
            })
        }
        _ => None,
    }
}

/// Point a select at the case matching the given channel
fn choose_select_case(trace: &mut Trace, key: EventKey, channel: ObjectId) {
    trace.update_event(key, |event| {
        if let EventKind::Select { cases, chosen, .. } = &mut event.kind {
            if let Some(idx) = cases.iter().position(|c| c.channel == channel) {
                *chosen = idx as i64;
            }
        }
    });
}

/// Leak on an unbuffered channel or select with a possible partner.
///
/// Four sub-cases by which of {stuck, partner} is a select; both reduce
/// to: remove the partner's recorded counterpart, reorder so the stuck
/// op meets the partner, and pin select cases to the stuck channel.
pub(crate) fn rewrite_unbuffered(trace: &Trace, analysis: &Analysis, bug: &Bug) -> RewriteOutcome {
    let (Some(&stuck), Some(&partner)) = (bug.primary.first(), bug.secondary.first()) else {
        return RewriteOutcome::NotPossible("leak is missing stuck op or partner".into());
    };
    let (Some(stuck_event), Some(partner_event)) = (trace.event(stuck), trace.event(partner))
    else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };
    let Some((channel, stuck_op)) = shared_channel(stuck_event, partner_event) else {
        return RewriteOutcome::NotPossible("stuck op and partner share no channel".into());
    };

    // the partner's own recorded partner must not be required before the
    // stuck op, otherwise stealing it breaks HB consistency
    let counterpart = analysis.index.partner_of(partner_event);
    if let Some(pp) = counterpart {
        if analysis.hb.relation(pp, stuck) == HbRelation::Before {
            return RewriteOutcome::NotPossible(
                "partner's counterpart happens before the stuck operation".into(),
            );
        }
    }

    let partner_time = partner_event.t_sort();
    let counterpart_time = counterpart
        .and_then(|pp| trace.event(pp))
        .map(|e| e.t_sort());

    let mut rewritten = trace.clone();
    strip_markers(&mut rewritten);
    let (Some(stuck_loc), Some(partner_loc)) = (
        EventLocator::capture(&rewritten, stuck),
        EventLocator::capture(&rewritten, partner),
    ) else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };

    if let Some(pp) = counterpart {
        rewritten.remove_event(pp);
    }
    choose_select_case(&mut rewritten, stuck, channel);
    choose_select_case(&mut rewritten, partner, channel);

    match stuck_op {
        ChannelOpKind::Recv => {
            // park the receiver first, then hand it the partner's send
            if let Err(e) = shift_concurrent_or_after_to_after(
                &mut rewritten,
                &analysis.hb,
                stuck,
                partner_time,
                &[],
            ) {
                return RewriteOutcome::NotPossible(e);
            }
        }
        ChannelOpKind::Send => {
            // the stuck send goes after the stolen counterpart's slot,
            // the partner's recv after the send
            let stuck_time = stuck_event.t_sort();
            if let Some(pp_time) = counterpart_time {
                if stuck_time <= pp_time {
                    rewritten.shift_routine(
                        stuck.routine,
                        stuck_time,
                        (pp_time + 1 - stuck_time) as i64,
                    );
                }
            }
            let new_stuck_time = stuck_loc
                .resolve(&rewritten)
                .map(|e| e.t_sort())
                .unwrap_or(stuck_time);
            if partner_time <= new_stuck_time {
                rewritten.shift_routine(
                    partner.routine,
                    partner_time,
                    (new_stuck_time + 1 - partner_time) as i64,
                );
            }
        }
        ChannelOpKind::Close => {
            return RewriteOutcome::NotPossible("stuck close cannot leak".into())
        }
    }

    // with the partner stolen the stuck op completes under replay
    if let Some(new_key) = stuck_loc.resolve(&rewritten).map(|e| e.key()) {
        rewritten.update_event(new_key, |event| event.t_post = event.t_pre);
    }

    finalize(rewritten, vec![stuck_loc, partner_loc], ExitCode::LeakUnbuffered)
}

/// Leak on a buffered channel with a possible partner: steal the
/// partner's counterpart and move the stuck op just after the partner's
/// original slot.
pub(crate) fn rewrite_buffered(trace: &Trace, analysis: &Analysis, bug: &Bug) -> RewriteOutcome {
    let (Some(&stuck), Some(&partner)) = (bug.primary.first(), bug.secondary.first()) else {
        return RewriteOutcome::NotPossible("leak is missing stuck op or partner".into());
    };
    let (Some(stuck_event), Some(partner_event)) = (trace.event(stuck), trace.event(partner))
    else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };
    let counterpart = analysis.index.partner_of(partner_event);
    if let Some(pp) = counterpart {
        if analysis.hb.relation(pp, stuck) == HbRelation::Before {
            return RewriteOutcome::NotPossible(
                "partner's counterpart happens before the stuck operation".into(),
            );
        }
    }

    let mut rewritten = trace.clone();
    strip_markers(&mut rewritten);
    let (Some(stuck_loc), Some(partner_loc)) = (
        EventLocator::capture(&rewritten, stuck),
        EventLocator::capture(&rewritten, partner),
    ) else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };

    if let Some(pp) = counterpart {
        rewritten.remove_event(pp);
    }
    let stuck_time = stuck_event.t_sort();
    let partner_time = partner_event.t_sort();
    if stuck_time <= partner_time {
        rewritten.shift_routine(
            stuck.routine,
            stuck_time,
            (partner_time + 1 - stuck_time) as i64,
        );
    }
    if let Some(new_key) = stuck_loc.resolve(&rewritten).map(|e| e.key()) {
        rewritten.update_event(new_key, |event| event.t_post = event.t_pre);
    }

    finalize(rewritten, vec![stuck_loc, partner_loc], ExitCode::LeakBuffered)
}

/// Leak on a mutex: drop everything racing with the stuck lock so it can
/// complete under replay.
pub(crate) fn rewrite_mutex(trace: &Trace, hb: &HbIndex, bug: &Bug) -> RewriteOutcome {
    let Some(&stuck) = bug.primary.first() else {
        return RewriteOutcome::NotPossible("leak is missing the stuck lock".into());
    };
    let Some(stuck_event) = trace.event(stuck) else {
        return RewriteOutcome::NotPossible("stuck lock not in trace".into());
    };
    let EventKind::Mutex { id, .. } = stuck_event.kind else {
        return RewriteOutcome::NotPossible("stuck event is not a mutex operation".into());
    };

    // the last completed lock on the same mutex must be reorderable
    let last_lock = trace
        .iter_sorted()
        .filter(|e| {
            e.t_post != 0
                && e.key() != stuck
                && matches!(
                    &e.kind,
                    EventKind::Mutex { id: mid, op, suc, .. }
                        if *mid == id && op.is_acquire() && (!op.is_try() || *suc)
                )
        })
        .last();
    let Some(last_lock) = last_lock else {
        return RewriteOutcome::NotPossible("no competing lock on the mutex".into());
    };
    if hb.relation(stuck, last_lock.key()) != HbRelation::Concurrent {
        return RewriteOutcome::NotPossible("stuck lock is ordered against the holder".into());
    }

    let mut rewritten = trace.clone();
    strip_markers(&mut rewritten);
    let Some(stuck_loc) = EventLocator::capture(&rewritten, stuck) else {
        return RewriteOutcome::NotPossible("stuck lock not in trace".into());
    };

    rewritten.shorten(stuck_event.t_sort(), true);
    let concurrent: Vec<EventKey> = rewritten
        .iter_sorted()
        .filter(|e| hb.relation(stuck, e.key()) == HbRelation::Concurrent)
        .map(|e| e.key())
        .collect();
    for key in concurrent {
        rewritten.remove_event(key);
    }
    // with the competition gone the lock completes under replay
    rewritten.update_event(stuck, |event| event.t_post = event.t_pre);

    finalize(rewritten, vec![stuck_loc], ExitCode::LeakMutex)
}

/// Leak on a wait group: move the Wait past the point where the counter
/// balances.
pub(crate) fn rewrite_wait_group(trace: &Trace, _hb: &HbIndex, bug: &Bug) -> RewriteOutcome {
    let Some(&stuck) = bug.primary.first() else {
        return RewriteOutcome::NotPossible("leak is missing the stuck wait".into());
    };
    let Some(stuck_event) = trace.event(stuck) else {
        return RewriteOutcome::NotPossible("stuck wait not in trace".into());
    };
    let EventKind::WaitGroup { id, .. } = stuck_event.kind else {
        return RewriteOutcome::NotPossible("stuck event is not a wait group operation".into());
    };

    // the frontier where adds and dones balance
    let mut counter = 0i64;
    let mut frontier: Option<Time> = None;
    let mut seen_change = false;
    for event in trace.iter_sorted() {
        if let EventKind::WaitGroup {
            id: wid,
            op: WaitGroupOpKind::AddOrDone,
            delta,
            ..
        } = &event.kind
        {
            if *wid == id {
                seen_change = true;
                counter += delta;
                if counter == 0 {
                    frontier = Some(event.t_sort());
                }
            }
        }
    }
    let Some(frontier) = frontier else {
        let reason = if seen_change {
            "wait group counter never balances"
        } else {
            "wait group has no add or done events"
        };
        return RewriteOutcome::NotPossible(reason.into());
    };

    let mut rewritten = trace.clone();
    strip_markers(&mut rewritten);
    let Some(stuck_loc) = EventLocator::capture(&rewritten, stuck) else {
        return RewriteOutcome::NotPossible("stuck wait not in trace".into());
    };
    let stuck_time = stuck_event.t_sort();
    if stuck_time <= frontier {
        rewritten.shift_routine(stuck.routine, stuck_time, (frontier + 1 - stuck_time) as i64);
    }
    // the shift renamed the wait's key; find it again before completing it
    if let Some(new_key) = stuck_loc.resolve(&rewritten).map(|e| e.key()) {
        rewritten.update_event(new_key, |event| event.t_post = event.t_pre);
    }

    finalize(rewritten, vec![stuck_loc], ExitCode::LeakWaitGroup)
}

/// Leak on a conditional variable: bring a concurrent signal or
/// broadcast into a position where it wakes the stuck wait.
pub(crate) fn rewrite_cond(trace: &Trace, hb: &HbIndex, bug: &Bug) -> RewriteOutcome {
    let Some(&stuck) = bug.primary.first() else {
        return RewriteOutcome::NotPossible("leak is missing the stuck wait".into());
    };
    let Some(stuck_event) = trace.event(stuck) else {
        return RewriteOutcome::NotPossible("stuck wait not in trace".into());
    };
    let EventKind::Cond { id, .. } = stuck_event.kind else {
        return RewriteOutcome::NotPossible("stuck event is not a cond operation".into());
    };

    let wake = trace
        .iter_sorted()
        .find(|e| {
            matches!(
                &e.kind,
                EventKind::Cond { id: cid, op }
                    if *cid == id
                        && matches!(op, CondOpKind::Signal | CondOpKind::Broadcast)
            ) && hb.relation(stuck, e.key()) == HbRelation::Concurrent
        })
        .map(|e| (e.key(), e.t_sort(), e.kind.clone()));
    let Some((wake, wake_time, wake_kind)) = wake else {
        return RewriteOutcome::NotPossible("no concurrent signal or broadcast".into());
    };

    let mut rewritten = trace.clone();
    strip_markers(&mut rewritten);
    let (Some(stuck_loc), Some(wake_loc)) = (
        EventLocator::capture(&rewritten, stuck),
        EventLocator::capture(&rewritten, wake),
    ) else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };

    let stuck_time = stuck_event.t_sort();
    let is_broadcast = matches!(
        wake_kind,
        EventKind::Cond {
            op: CondOpKind::Broadcast,
            ..
        }
    );
    if is_broadcast {
        // broadcast must already be pending when the wait parks
        if stuck_time <= wake_time {
            rewritten.shift_routine(stuck.routine, stuck_time, (wake_time + 1 - stuck_time) as i64);
        }
    } else {
        // signal fires after the wait parked; replay ordering wakes it
        if wake_time <= stuck_time {
            rewritten.shift_routine(wake.routine, wake_time, (stuck_time + 1 - wake_time) as i64);
        }
    }

    finalize(rewritten, vec![stuck_loc, wake_loc], ExitCode::LeakCond)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{run_analysis, BugKind, ScenarioSet};
    use crate::trace::{MutexOpKind, Position};

    fn channel(
        routine: u64,
        t_pre: u64,
        t_post: u64,
        line: u32,
        id: u64,
        op: ChannelOpKind,
        op_id: u64,
        qsize: u64,
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
                qsize,
                qcount: 0,
            },
        }
    }

    #[test]
    fn test_unbuffered_leak_steals_partner() {
        let mut trace = Trace::new();
        // routine 1: recv stuck forever
        trace
            .add(channel(1, 2, 0, 10, 5, ChannelOpKind::Recv, 0, 0))
            .unwrap();
        // routine 2 sends, routine 3 received it
        trace
            .add(channel(2, 4, 8, 20, 5, ChannelOpKind::Send, 1, 0))
            .unwrap();
        trace
            .add(channel(3, 6, 8, 30, 5, ChannelOpKind::Recv, 1, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = analysis
            .bugs
            .iter()
            .find(|b| b.kind == BugKind::LeakUnbufferedWith)
            .expect("should classify leak with partner");

        let outcome = rewrite_unbuffered(&trace, &analysis, bug);
        let RewriteOutcome::Rewritten(result) = outcome else {
            panic!("expected a rewrite");
        };
        assert_eq!(result.expected_exit, ExitCode::LeakUnbuffered);
        // the stolen counterpart (routine 3 recv) is gone
        assert_eq!(result.trace.events_of(3).len(), 0);
        // stuck recv and partner send survive
        assert_eq!(result.trace.events_of(1).len(), 1);
        assert_eq!(result.trace.events_of(2).len(), 1);
    }

    #[test]
    fn test_unbuffered_leak_declines_without_counterpart_reorderable() {
        let mut trace = Trace::new();
        // counterpart recv (routine 3) happens before the stuck recv via
        // a rendezvous chain, so stealing it is not HB-consistent
        trace
            .add(channel(3, 2, 6, 30, 5, ChannelOpKind::Recv, 1, 0))
            .unwrap();
        trace
            .add(channel(2, 4, 6, 20, 5, ChannelOpKind::Send, 1, 0))
            .unwrap();
        trace
            .add(channel(3, 8, 12, 31, 7, ChannelOpKind::Send, 1, 0))
            .unwrap();
        trace
            .add(channel(1, 10, 12, 11, 7, ChannelOpKind::Recv, 1, 0))
            .unwrap();
        trace
            .add(channel(1, 14, 0, 10, 5, ChannelOpKind::Recv, 0, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = Bug::new(
            BugKind::LeakUnbufferedWith,
            vec![EventKey::new(1, 14)],
            vec![EventKey::new(2, 4)],
        );
        let outcome = rewrite_unbuffered(&trace, &analysis, &bug);
        assert!(matches!(outcome, RewriteOutcome::NotPossible(_)));
    }

    #[test]
    fn test_mutex_leak_completes_stuck_lock() {
        let mut trace = Trace::new();
        trace
            .add(Event {
                routine: 1,
                t_pre: 2,
                t_post: 4,
                pos: Position::new("main.go", 10),
                kind: EventKind::Mutex {
                    id: 7,
                    rw: false,
                    op: MutexOpKind::Lock,
                    suc: true,
                },
            })
            .unwrap();
        trace
            .add(Event {
                routine: 2,
                t_pre: 6,
                t_post: 0,
                pos: Position::new("main.go", 20),
                kind: EventKind::Mutex {
                    id: 7,
                    rw: false,
                    op: MutexOpKind::Lock,
                    suc: false,
                },
            })
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = analysis
            .bugs
            .iter()
            .find(|b| b.kind == BugKind::LeakMutex)
            .expect("should classify mutex leak");

        let outcome = rewrite_mutex(&trace, &analysis.hb, bug);
        let RewriteOutcome::Rewritten(result) = outcome else {
            panic!("expected a rewrite");
        };
        assert_eq!(result.expected_exit, ExitCode::LeakMutex);
        // the competing lock was removed and the stuck one completes
        assert_eq!(result.trace.events_of(1).len(), 0);
        let stuck = result.trace.event(EventKey::new(2, 6)).unwrap();
        assert_eq!(stuck.t_post, stuck.t_pre);
    }

    #[test]
    fn test_wait_group_leak_moves_wait_past_frontier() {
        let mut trace = Trace::new();
        trace
            .add(Event {
                routine: 1,
                t_pre: 2,
                t_post: 0,
                pos: Position::new("main.go", 10),
                kind: EventKind::WaitGroup {
                    id: 3,
                    op: WaitGroupOpKind::Wait,
                    delta: 0,
                    value: 1,
                },
            })
            .unwrap();
        let wg_change = |routine, t, line, delta, value| Event {
            routine,
            t_pre: t,
            t_post: t,
            pos: Position::new("main.go", line),
            kind: EventKind::WaitGroup {
                id: 3,
                op: WaitGroupOpKind::AddOrDone,
                delta,
                value,
            },
        };
        trace.add(wg_change(2, 4, 20, 1, 1)).unwrap();
        trace.add(wg_change(2, 6, 21, -1, 0)).unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = analysis
            .bugs
            .iter()
            .find(|b| b.kind == BugKind::LeakWaitGroup)
            .expect("should classify wait group leak");

        let outcome = rewrite_wait_group(&trace, &analysis.hb, bug);
        let RewriteOutcome::Rewritten(result) = outcome else {
            panic!("expected a rewrite");
        };
        assert_eq!(result.expected_exit, ExitCode::LeakWaitGroup);
        let wait = result.trace.events_of(1).first().unwrap();
        assert!(wait.t_sort() > 6);
        assert_eq!(wait.t_post, wait.t_pre);
    }

    #[test]
    fn test_cond_leak_moves_signal_after_wait() {
        let mut trace = Trace::new();
        trace
            .add(Event {
                routine: 1,
                t_pre: 6,
                t_post: 0,
                pos: Position::new("main.go", 10),
                kind: EventKind::Cond {
                    id: 4,
                    op: CondOpKind::Wait,
                },
            })
            .unwrap();
        trace
            .add(Event {
                routine: 2,
                t_pre: 2,
                t_post: 4,
                pos: Position::new("main.go", 20),
                kind: EventKind::Cond {
                    id: 4,
                    op: CondOpKind::Signal,
                },
            })
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = analysis
            .bugs
            .iter()
            .find(|b| b.kind == BugKind::LeakCond)
            .expect("should classify cond leak");

        let outcome = rewrite_cond(&trace, &analysis.hb, bug);
        let RewriteOutcome::Rewritten(result) = outcome else {
            panic!("expected a rewrite");
        };
        assert_eq!(result.expected_exit, ExitCode::LeakCond);
        // signal now sorts after the parked wait
        let signal = result.trace.events_of(2).first().unwrap();
        let wait = result.trace.events_of(1).first().unwrap();
        assert!(signal.t_sort() > wait.t_sort());
    }
}

//! Rewrites built on the resource graph: negative wait group counters,
//! unlock-before-lock and cyclic mutex deadlocks.

use std::collections::HashMap;

use crate::analysis::{Bug, HbIndex, HbRelation};
use crate::replay::ExitCode;
use crate::rewrite::{
    finalize, shift_self_and_after_to_after, strip_markers, EventLocator, RewriteOutcome,
};
use crate::trace::{EventKey, RoutineId, Time, Trace};

/// Reorder so the offending Done replays before the Adds that balanced
/// it in the recorded run.
pub(crate) fn rewrite_negative_wait_group(
    trace: &Trace,
    hb: &HbIndex,
    bug: &Bug,
) -> RewriteOutcome {
    let Some(&done) = bug.primary.first() else {
        return RewriteOutcome::NotPossible("bug is missing the done event".into());
    };
    if bug.secondary.is_empty() {
        return RewriteOutcome::NotPossible("no concurrent add to reorder against".into());
    }
    let Some(done_event) = trace.event(done) else {
        return RewriteOutcome::NotPossible("done event not in trace".into());
    };
    let done_time = done_event.t_sort();
    let mut max_time = done_time;
    for add in &bug.secondary {
        match trace.event(*add) {
            Some(event) => max_time = max_time.max(event.t_sort()),
            None => return RewriteOutcome::NotPossible("add event not in trace".into()),
        }
    }

    let mut rewritten = trace.clone();
    strip_markers(&mut rewritten);
    let mut critical = Vec::new();
    for key in std::iter::once(&done).chain(bug.secondary.iter()) {
        match EventLocator::capture(&rewritten, *key) {
            Some(locator) => critical.push(locator),
            None => return RewriteOutcome::NotPossible("implicated event not in trace".into()),
        }
    }

    rewritten.shorten(max_time, true);
    let adds = bug.secondary.clone();
    let shift = rewritten.shift_events_to_after(done_time, |event| {
        let key = event.key();
        if key == done {
            return false;
        }
        adds.contains(&key)
            || adds
                .iter()
                .any(|add| hb.relation(*add, key) == HbRelation::Before)
    });
    if let Err(e) = shift {
        return RewriteOutcome::NotPossible(e.to_string());
    }

    finalize(rewritten, critical, ExitCode::NegativeWaitGroup)
}

/// Reorder so the unlock replays before the lock it released.
pub(crate) fn rewrite_unlock_before_lock(
    trace: &Trace,
    hb: &HbIndex,
    bug: &Bug,
) -> RewriteOutcome {
    let (Some(&unlock), Some(&lock)) = (bug.primary.first(), bug.secondary.first()) else {
        return RewriteOutcome::NotPossible("bug is missing the unlock or lock event".into());
    };
    if hb.relation(unlock, lock) != HbRelation::Concurrent {
        return RewriteOutcome::NotPossible("unlock and lock are HB-ordered".into());
    }
    let (Some(unlock_event), Some(lock_event)) = (trace.event(unlock), trace.event(lock)) else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };
    let unlock_time = unlock_event.t_sort();
    let max_time = unlock_time.max(lock_event.t_sort());

    let mut rewritten = trace.clone();
    strip_markers(&mut rewritten);
    let (Some(unlock_loc), Some(lock_loc)) = (
        EventLocator::capture(&rewritten, unlock),
        EventLocator::capture(&rewritten, lock),
    ) else {
        return RewriteOutcome::NotPossible("implicated events not in trace".into());
    };

    rewritten.shorten(max_time, true);
    if lock_event.t_sort() < unlock_time {
        if let Err(e) = shift_self_and_after_to_after(&mut rewritten, hb, lock, unlock_time) {
            return RewriteOutcome::NotPossible(e);
        }
    }

    finalize(rewritten, vec![unlock_loc, lock_loc], ExitCode::UnlockOfUnlocked)
}

/// Build a trace where every cycle participant acquires its first lock
/// and then blocks on the next; the `ReplayEnd` marker tells the manager
/// to confirm by sampling wait reasons after quiescence.
pub(crate) fn rewrite_cyclic(trace: &Trace, hb: &HbIndex, bug: &Bug) -> RewriteOutcome {
    let acquires = &bug.primary;
    let helds = &bug.secondary;
    if acquires.len() < 2 || acquires.len() != helds.len() {
        return RewriteOutcome::NotPossible("malformed deadlock cycle".into());
    }

    // first-lock horizon per participating routine
    let mut horizon: HashMap<RoutineId, Time> = HashMap::new();
    for (held, acquire) in helds.iter().zip(acquires.iter()) {
        if held.routine != acquire.routine {
            return RewriteOutcome::NotPossible("cycle edge spans routines".into());
        }
        let Some(held_event) = trace.event(*held) else {
            return RewriteOutcome::NotPossible("held lock not in trace".into());
        };
        horizon.insert(held.routine, held_event.t_sort());
    }

    let mut rewritten = Trace::new();
    let mut last_time: Time = 0;
    for routine in trace.routine_ids().collect::<Vec<_>>() {
        for event in trace.events_of(routine) {
            let keep = match horizon.get(&routine) {
                // cycle participant: stop after its first lock
                Some(h) => event.t_sort() <= *h,
                // everyone else: drop whatever depends on the acquires
                // that will now block forever
                None => !acquires
                    .iter()
                    .any(|a| hb.relation(*a, event.key()) == HbRelation::Before),
            };
            if keep {
                last_time = last_time.max(event.t_sort());
                if rewritten.add(event.clone()).is_err() {
                    return RewriteOutcome::NotPossible("trace order violated".into());
                }
            }
        }
    }

    // re-append the second acquisitions as blocked attempts
    let mut critical = Vec::new();
    for held in helds {
        match EventLocator::capture(&rewritten, *held) {
            Some(locator) => critical.push(locator),
            None => return RewriteOutcome::NotPossible("held lock lost during rewrite".into()),
        }
    }
    let mut t = last_time + 2;
    for acquire in acquires {
        let Some(original) = trace.event(*acquire) else {
            return RewriteOutcome::NotPossible("acquire event not in trace".into());
        };
        let mut attempt = original.clone();
        attempt.t_pre = t;
        attempt.t_post = 0;
        if rewritten.add(attempt).is_err() {
            return RewriteOutcome::NotPossible("trace order violated".into());
        }
        match EventLocator::capture(&rewritten, EventKey::new(acquire.routine, t)) {
            Some(locator) => critical.push(locator),
            None => return RewriteOutcome::NotPossible("acquire lost during rewrite".into()),
        }
        t += 2;
    }

    finalize(rewritten, critical, ExitCode::CyclicDeadlock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{run_analysis, BugKind, ScenarioSet};
    use crate::trace::{Event, EventKind, MutexOpKind, Position, WaitGroupOpKind};

    fn wg(routine: u64, t: u64, line: u32, delta: i64, value: i64) -> Event {
        Event {
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
        }
    }

    fn lock(routine: u64, t_pre: u64, t_post: u64, line: u32, id: u64, op: MutexOpKind) -> Event {
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

    #[test]
    fn test_negative_wait_group_rewrite_moves_add_after_done() {
        let mut trace = Trace::new();
        trace.add(wg(1, 2, 10, 1, 1)).unwrap();
        trace.add(wg(2, 4, 20, -1, 0)).unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = analysis
            .bugs
            .iter()
            .find(|b| b.kind == BugKind::PossibleNegativeWaitGroup)
            .expect("should predict possible negative wait group");

        let outcome = rewrite_negative_wait_group(&trace, &analysis.hb, bug);
        let RewriteOutcome::Rewritten(result) = outcome else {
            panic!("expected a rewrite");
        };
        assert_eq!(result.expected_exit, ExitCode::NegativeWaitGroup);
        // done now precedes the add
        let order: Vec<i64> = result
            .trace
            .iter_sorted()
            .filter_map(|e| match &e.kind {
                EventKind::WaitGroup { delta, .. } => Some(*delta),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![-1, 1]);
    }

    #[test]
    fn test_cyclic_rewrite_blocks_both_participants() {
        let mut trace = Trace::new();
        trace.add(lock(1, 2, 4, 10, 100, MutexOpKind::Lock)).unwrap();
        trace.add(lock(1, 6, 8, 11, 200, MutexOpKind::Lock)).unwrap();
        trace
            .add(lock(1, 10, 12, 12, 200, MutexOpKind::Unlock))
            .unwrap();
        trace
            .add(lock(1, 14, 16, 13, 100, MutexOpKind::Unlock))
            .unwrap();
        trace.add(lock(2, 18, 20, 20, 200, MutexOpKind::Lock)).unwrap();
        trace.add(lock(2, 22, 24, 21, 100, MutexOpKind::Lock)).unwrap();
        trace
            .add(lock(2, 26, 28, 22, 100, MutexOpKind::Unlock))
            .unwrap();
        trace
            .add(lock(2, 30, 32, 23, 200, MutexOpKind::Unlock))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let bug = analysis
            .bugs
            .iter()
            .find(|b| b.kind == BugKind::CyclicDeadlock)
            .expect("should predict cyclic deadlock");

        let outcome = rewrite_cyclic(&trace, &analysis.hb, bug);
        let RewriteOutcome::Rewritten(result) = outcome else {
            panic!("expected a rewrite");
        };
        assert_eq!(result.expected_exit, ExitCode::CyclicDeadlock);
        // two blocked second acquisitions, no unlocks left
        let blocked = result.trace.count_matching(|e| e.is_blocked());
        assert_eq!(blocked, 2);
        let unlocks = result.trace.count_matching(|e| {
            matches!(
                e.kind,
                EventKind::Mutex {
                    op: MutexOpKind::Unlock,
                    ..
                }
            )
        });
        assert_eq!(unlocks, 0);
        // marker carries the cyclic code
        let marker = result.trace.replay_marker().unwrap();
        assert!(matches!(marker.kind, EventKind::ReplayEnd { exit_code: 41 }));
    }
}

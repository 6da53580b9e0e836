//! Happens-before engine
//!
//! Folds a trace left-to-right in `t_sort` order and assigns every event
//! a vector clock. Synchronization edges:
//!
//! - spawn: the child inherits the parent's clock with its own component
//!   set to 1
//! - channel rendezvous: the recv's clock includes the paired send's; on
//!   unbuffered channels the sender additionally continues from the
//!   receiver's history (both sides waited)
//! - close: every later recv that observes the closed channel merges the
//!   close's clock
//! - mutex: an acquire merges the clock of the previous release
//! - wait group: a completed Wait merges the accumulated Add/Done clocks
//! - once: the winning Do's clock merges into every other Do
//! - atomics: release-acquire; a load merges the most recent write on the
//!   same address, read-modify-writes do both
//!
//! Rendezvous pairing is by `(channel, op_id)`, so the i-th send reaches
//! the i-th recv on buffered channels (FIFO). The two halves of an
//! unbuffered rendezvous share their `t_post` and are therefore adjacent
//! in the fold; whichever half the tie-break yields first is deferred
//! until its partner arrives, keeping send-before-recv clock assignment
//! independent of routine numbering.

use std::collections::HashMap;

use crate::analysis::vclock::{HbRelation, VectorClock};
use crate::trace::{
    ChannelOpKind, Event, EventKey, EventKind, ObjectId, RoutineId, Trace, WaitGroupOpKind,
};

/// Per-event clocks for a whole trace
#[derive(Debug, Default)]
pub struct HbIndex {
    clocks: HashMap<EventKey, VectorClock>,
}

impl HbIndex {
    /// Fold the trace and assign every event its clock
    pub fn build(trace: &Trace) -> Self {
        Self::build_inner(trace, true)
    }

    /// Like [`HbIndex::build`], but without the mutex release→acquire
    /// edges. Sequentially executed critical sections stay concurrent
    /// under this relation, which is what deadlock prediction needs: lock
    /// order is exactly what another schedule may change.
    pub fn build_without_locks(trace: &Trace) -> Self {
        Self::build_inner(trace, false)
    }

    fn build_inner(trace: &Trace, lock_edges: bool) -> Self {
        let mut engine = ClockEngine {
            lock_edges,
            ..ClockEngine::default()
        };
        let mut index = HbIndex::default();
        for event in trace.iter_sorted() {
            for (key, clock) in engine.advance(event) {
                index.clocks.insert(key, clock);
            }
        }
        index
    }

    /// Clock assigned to an event
    pub fn clock(&self, key: EventKey) -> Option<&VectorClock> {
        self.clocks.get(&key)
    }

    /// Happens-before relation between two events
    pub fn relation(&self, a: EventKey, b: EventKey) -> HbRelation {
        if a == b {
            return HbRelation::Equal;
        }
        match (self.clocks.get(&a), self.clocks.get(&b)) {
            (Some(ca), Some(cb)) => ca.relation(cb),
            // Unknown events cannot be ordered
            _ => HbRelation::Concurrent,
        }
    }

    /// True if `a` happens before or equals `b`
    pub fn before_or_equal(&self, a: EventKey, b: EventKey) -> bool {
        matches!(self.relation(a, b), HbRelation::Before | HbRelation::Equal)
    }

    /// True if the two events are HB-concurrent
    pub fn concurrent(&self, a: EventKey, b: EventKey) -> bool {
        self.relation(a, b) == HbRelation::Concurrent
    }

    /// True if `e` is HB-concurrent with or HB-after `anchor`
    pub fn concurrent_or_after(&self, anchor: EventKey, e: EventKey) -> bool {
        matches!(
            self.relation(anchor, e),
            HbRelation::Concurrent | HbRelation::Before
        )
    }
}

/// The channel half a rendezvous is still waiting for
#[derive(Debug)]
struct PendingHalf {
    key: EventKey,
    routine: RoutineId,
    op: ChannelOpKind,
    unbuffered: bool,
}

#[derive(Debug, Default)]
struct ClockEngine {
    /// Whether mutex release→acquire merges apply
    lock_edges: bool,
    routine_clocks: HashMap<RoutineId, VectorClock>,
    /// Initial clocks of spawned routines not yet started
    pending_children: HashMap<RoutineId, VectorClock>,
    /// Completed sends waiting to reach their recv (buffered propagation)
    send_clocks: HashMap<(ObjectId, u64), VectorClock>,
    /// First-seen half of an unbuffered rendezvous, deferred until the
    /// partner arrives
    deferred: HashMap<(ObjectId, u64), PendingHalf>,
    close_clocks: HashMap<ObjectId, VectorClock>,
    mutex_release: HashMap<ObjectId, VectorClock>,
    wg_accumulated: HashMap<ObjectId, VectorClock>,
    once_winner: HashMap<ObjectId, VectorClock>,
    atomic_write: HashMap<ObjectId, VectorClock>,
}

impl ClockEngine {
    /// Process one event; returns the clock assignments it produced
    /// (usually one, two when a deferred rendezvous half resolves).
    fn advance(&mut self, event: &Event) -> Vec<(EventKey, VectorClock)> {
        match &event.kind {
            EventKind::Spawn { child } => {
                let clock = self.step(event.routine);
                let mut child_clock = clock.clone();
                child_clock.set(*child, 1);
                self.pending_children.insert(*child, child_clock);
                vec![(event.key(), clock)]
            }
            EventKind::Channel {
                id,
                op,
                closed,
                op_id,
                qsize,
                ..
            } => self.advance_channel(event, *id, *op, *closed, *op_id, *qsize == 0),
            EventKind::Select { .. } => {
                if let Some(case) = event.chosen_case() {
                    let (id, op, closed, op_id, unbuffered) = (
                        case.channel,
                        case.op,
                        case.closed,
                        case.op_id,
                        case.qsize == 0,
                    );
                    self.advance_channel(event, id, op, closed, op_id, unbuffered)
                } else {
                    // Default case or blocked select: local step only
                    vec![(event.key(), self.step(event.routine))]
                }
            }
            EventKind::Mutex { id, op, suc, .. } => {
                let acquires = op.is_acquire() && (!op.is_try() || *suc);
                let releases = !op.is_acquire();
                if acquires && event.t_post != 0 && self.lock_edges {
                    if let Some(release) = self.mutex_release.get(id).cloned() {
                        self.merge_into_routine(event.routine, &release);
                    }
                }
                let clock = self.step(event.routine);
                if releases {
                    self.mutex_release.insert(*id, clock.clone());
                }
                vec![(event.key(), clock)]
            }
            EventKind::WaitGroup { id, op, .. } => match op {
                WaitGroupOpKind::AddOrDone => {
                    let clock = self.step(event.routine);
                    self.wg_accumulated
                        .entry(*id)
                        .or_default()
                        .merge(&clock);
                    vec![(event.key(), clock)]
                }
                WaitGroupOpKind::Wait => {
                    if event.t_post != 0 {
                        if let Some(acc) = self.wg_accumulated.get(id).cloned() {
                            self.merge_into_routine(event.routine, &acc);
                        }
                    }
                    vec![(event.key(), self.step(event.routine))]
                }
            },
            EventKind::Once { id, suc } => {
                if !*suc {
                    if let Some(winner) = self.once_winner.get(id).cloned() {
                        self.merge_into_routine(event.routine, &winner);
                    }
                }
                let clock = self.step(event.routine);
                if *suc {
                    self.once_winner.insert(*id, clock.clone());
                }
                vec![(event.key(), clock)]
            }
            EventKind::Atomic { id, op } => {
                if !matches!(op, crate::trace::AtomicOpKind::Store) {
                    // loads and read-modify-writes acquire the last write
                    if let Some(write) = self.atomic_write.get(id).cloned() {
                        self.merge_into_routine(event.routine, &write);
                    }
                }
                let clock = self.step(event.routine);
                if op.is_write() {
                    self.atomic_write.insert(*id, clock.clone());
                }
                vec![(event.key(), clock)]
            }
            EventKind::ChannelNew { .. }
            | EventKind::RoutineExit
            | EventKind::Cond { .. }
            | EventKind::ReplayEnd { .. } => {
                // cond ordering is enforced by the mutex around it
                vec![(event.key(), self.step(event.routine))]
            }
        }
    }

    fn advance_channel(
        &mut self,
        event: &Event,
        id: ObjectId,
        op: ChannelOpKind,
        closed: bool,
        op_id: u64,
        unbuffered: bool,
    ) -> Vec<(EventKey, VectorClock)> {
        match op {
            ChannelOpKind::Close => {
                let clock = self.step(event.routine);
                self.close_clocks.insert(id, clock.clone());
                vec![(event.key(), clock)]
            }
            _ if event.t_post == 0 => {
                // blocked forever: local step only
                vec![(event.key(), self.step(event.routine))]
            }
            ChannelOpKind::Recv if closed => {
                // zero-value recv after close
                if let Some(close) = self.close_clocks.get(&id).cloned() {
                    self.merge_into_routine(event.routine, &close);
                }
                vec![(event.key(), self.step(event.routine))]
            }
            ChannelOpKind::Send if !unbuffered => {
                let clock = self.step(event.routine);
                self.send_clocks.insert((id, op_id), clock.clone());
                vec![(event.key(), clock)]
            }
            ChannelOpKind::Recv if !unbuffered => {
                if let Some(send) = self.send_clocks.get(&(id, op_id)).cloned() {
                    self.merge_into_routine(event.routine, &send);
                }
                vec![(event.key(), self.step(event.routine))]
            }
            _ => self.advance_unbuffered(event, id, op, op_id),
        }
    }

    /// Unbuffered send/recv: both halves share their `t_post`, so they are
    /// adjacent in the fold. The first half seen is deferred; the second
    /// completes the pair with send-before-recv clock assignment.
    fn advance_unbuffered(
        &mut self,
        event: &Event,
        id: ObjectId,
        op: ChannelOpKind,
        op_id: u64,
    ) -> Vec<(EventKey, VectorClock)> {
        let pair = (id, op_id);
        let Some(partner) = self.deferred.remove(&pair) else {
            self.deferred.insert(
                pair,
                PendingHalf {
                    key: event.key(),
                    routine: event.routine,
                    op,
                    unbuffered: true,
                },
            );
            return Vec::new();
        };

        let (send_key, send_routine, recv_key, recv_routine) = if op == ChannelOpKind::Send {
            (event.key(), event.routine, partner.key, partner.routine)
        } else {
            (partner.key, partner.routine, event.key(), event.routine)
        };
        debug_assert!(partner.op != op);
        debug_assert!(partner.unbuffered);

        let receiver_pre = self.routine_clock(recv_routine).clone();
        let send_clock = self.step(send_routine);
        // the sender's later events also follow the receiver's history
        self.merge_into_routine(send_routine, &receiver_pre);
        self.merge_into_routine(recv_routine, &send_clock);
        let recv_clock = self.step(recv_routine);
        vec![(send_key, send_clock), (recv_key, recv_clock)]
    }

    fn routine_clock(&mut self, routine: RoutineId) -> &mut VectorClock {
        let pending = &mut self.pending_children;
        self.routine_clocks
            .entry(routine)
            .or_insert_with(|| pending.remove(&routine).unwrap_or_default())
    }

    /// Increment the routine's own component and return the new clock
    fn step(&mut self, routine: RoutineId) -> VectorClock {
        let clock = self.routine_clock(routine);
        clock.increment(routine);
        clock.clone()
    }

    fn merge_into_routine(&mut self, routine: RoutineId, other: &VectorClock) {
        self.routine_clock(routine).merge(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Position, Trace};

    fn event(routine: RoutineId, t_pre: u64, t_post: u64, kind: EventKind) -> Event {
        Event {
            routine,
            t_pre,
            t_post,
            pos: Position::new("main.go", (t_pre % 100) as u32),
            kind,
        }
    }

    fn channel(
        routine: RoutineId,
        t_pre: u64,
        t_post: u64,
        id: ObjectId,
        op: ChannelOpKind,
        op_id: u64,
        qsize: u64,
    ) -> Event {
        event(
            routine,
            t_pre,
            t_post,
            EventKind::Channel {
                id,
                op,
                closed: false,
                op_id,
                qsize,
                qcount: 0,
            },
        )
    }

    #[test]
    fn test_spawn_orders_parent_prefix_before_child() {
        let mut trace = Trace::new();
        trace
            .add(event(1, 2, 2, EventKind::Spawn { child: 2 }))
            .unwrap();
        trace.add(event(1, 10, 10, EventKind::RoutineExit)).unwrap();
        trace.add(event(2, 4, 4, EventKind::RoutineExit)).unwrap();
        let hb = HbIndex::build(&trace);
        let spawn = EventKey::new(1, 2);
        let child_exit = EventKey::new(2, 4);
        let parent_exit = EventKey::new(1, 10);
        assert_eq!(hb.relation(spawn, child_exit), HbRelation::Before);
        // parent after the spawn is concurrent with the child
        assert_eq!(hb.relation(parent_exit, child_exit), HbRelation::Concurrent);
    }

    #[test]
    fn test_unbuffered_rendezvous_send_before_recv() {
        let mut trace = Trace::new();
        trace
            .add(channel(1, 2, 8, 5, ChannelOpKind::Send, 1, 0))
            .unwrap();
        trace
            .add(channel(2, 4, 8, 5, ChannelOpKind::Recv, 1, 0))
            .unwrap();
        let hb = HbIndex::build(&trace);
        assert_eq!(
            hb.relation(EventKey::new(1, 2), EventKey::new(2, 4)),
            HbRelation::Before
        );
        assert_eq!(
            hb.relation(EventKey::new(2, 4), EventKey::new(1, 2)),
            HbRelation::After
        );
    }

    #[test]
    fn test_unbuffered_rendezvous_syncs_both_directions() {
        // events after the send must be HB-after events before the recv
        let mut t = Trace::new();
        t.add(event(2, 2, 2, EventKind::Once { id: 9, suc: true }))
            .unwrap();
        t.add(channel(2, 4, 10, 5, ChannelOpKind::Recv, 1, 0)).unwrap();
        t.add(channel(1, 6, 10, 5, ChannelOpKind::Send, 1, 0)).unwrap();
        t.add(event(1, 12, 12, EventKind::RoutineExit)).unwrap();
        let hb = HbIndex::build(&t);
        let before_recv = EventKey::new(2, 2);
        let after_send = EventKey::new(1, 12);
        assert_eq!(hb.relation(before_recv, after_send), HbRelation::Before);
    }

    #[test]
    fn test_buffered_send_propagates_one_direction() {
        let mut trace = Trace::new();
        trace
            .add(channel(1, 2, 4, 5, ChannelOpKind::Send, 1, 1))
            .unwrap();
        trace.add(event(1, 20, 20, EventKind::RoutineExit)).unwrap();
        trace
            .add(channel(2, 6, 8, 5, ChannelOpKind::Recv, 1, 1))
            .unwrap();
        trace.add(event(2, 10, 10, EventKind::RoutineExit)).unwrap();
        let hb = HbIndex::build(&trace);
        // send before recv
        assert_eq!(
            hb.relation(EventKey::new(1, 2), EventKey::new(2, 6)),
            HbRelation::Before
        );
        // but the sender's later events stay concurrent with the recv
        assert_eq!(
            hb.relation(EventKey::new(1, 20), EventKey::new(2, 6)),
            HbRelation::Concurrent
        );
    }

    #[test]
    fn test_mutex_release_acquire() {
        let mut trace = Trace::new();
        trace
            .add(event(
                1,
                2,
                4,
                EventKind::Mutex {
                    id: 7,
                    rw: false,
                    op: crate::trace::MutexOpKind::Lock,
                    suc: true,
                },
            ))
            .unwrap();
        trace
            .add(event(
                1,
                6,
                8,
                EventKind::Mutex {
                    id: 7,
                    rw: false,
                    op: crate::trace::MutexOpKind::Unlock,
                    suc: true,
                },
            ))
            .unwrap();
        trace
            .add(event(
                2,
                10,
                12,
                EventKind::Mutex {
                    id: 7,
                    rw: false,
                    op: crate::trace::MutexOpKind::Lock,
                    suc: true,
                },
            ))
            .unwrap();
        let hb = HbIndex::build(&trace);
        assert_eq!(
            hb.relation(EventKey::new(1, 6), EventKey::new(2, 10)),
            HbRelation::Before
        );
    }

    #[test]
    fn test_once_winner_orders_losers() {
        let mut trace = Trace::new();
        trace
            .add(event(1, 2, 4, EventKind::Once { id: 3, suc: true }))
            .unwrap();
        trace
            .add(event(2, 6, 8, EventKind::Once { id: 3, suc: false }))
            .unwrap();
        let hb = HbIndex::build(&trace);
        assert_eq!(
            hb.relation(EventKey::new(1, 2), EventKey::new(2, 6)),
            HbRelation::Before
        );
    }

    #[test]
    fn test_atomic_store_load_edge() {
        let mut trace = Trace::new();
        trace
            .add(event(
                1,
                2,
                2,
                EventKind::Atomic {
                    id: 99,
                    op: crate::trace::AtomicOpKind::Store,
                },
            ))
            .unwrap();
        trace
            .add(event(
                2,
                4,
                4,
                EventKind::Atomic {
                    id: 99,
                    op: crate::trace::AtomicOpKind::Load,
                },
            ))
            .unwrap();
        let hb = HbIndex::build(&trace);
        assert_eq!(
            hb.relation(EventKey::new(1, 2), EventKey::new(2, 4)),
            HbRelation::Before
        );
    }

    #[test]
    fn test_close_orders_zero_value_recv() {
        let mut trace = Trace::new();
        trace
            .add(channel(1, 2, 2, 5, ChannelOpKind::Close, 0, 0))
            .unwrap();
        let mut recv = channel(2, 4, 6, 5, ChannelOpKind::Recv, 0, 0);
        if let EventKind::Channel { closed, .. } = &mut recv.kind {
            *closed = true;
        }
        trace.add(recv).unwrap();
        let hb = HbIndex::build(&trace);
        assert_eq!(
            hb.relation(EventKey::new(1, 2), EventKey::new(2, 4)),
            HbRelation::Before
        );
    }

    #[test]
    fn test_wait_group_release() {
        let mut trace = Trace::new();
        trace
            .add(event(
                2,
                2,
                2,
                EventKind::WaitGroup {
                    id: 11,
                    op: WaitGroupOpKind::AddOrDone,
                    delta: -1,
                    value: 0,
                },
            ))
            .unwrap();
        trace
            .add(event(
                1,
                4,
                6,
                EventKind::WaitGroup {
                    id: 11,
                    op: WaitGroupOpKind::Wait,
                    delta: 0,
                    value: 0,
                },
            ))
            .unwrap();
        let hb = HbIndex::build(&trace);
        assert_eq!(
            hb.relation(EventKey::new(2, 2), EventKey::new(1, 4)),
            HbRelation::Before
        );
    }
}

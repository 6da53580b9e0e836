//! Record-phase runtime
//!
//! During recording each routine owns its event buffer; no cross-routine
//! locking happens on the hot path. Timestamps come from a single atomic
//! counter incremented by 2 on each step, reserving odd values for
//! control markers. Object ids are minted as `(routine << 30) | counter`
//! so they are globally unique without coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{WeftError, WeftResult};
use crate::trace::event::{
    mint_object_id, AtomicOpKind, ChannelOpKind, CondOpKind, Event, EventKind, MutexOpKind,
    ObjectId, Position, RoutineId, SelectCase, Time, WaitGroupOpKind,
};
use crate::trace::model::Trace;

/// Shared recording state: timestamp source, routine minting, collected
/// buffers. Clone-cheap; hand one to each spawned routine.
#[derive(Clone)]
pub struct TraceRecorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    /// Global timestamp counter; step 2 keeps operation timestamps even
    clock: AtomicU64,
    /// Next routine id to mint (1-origin)
    next_routine: AtomicU64,
    /// Finished per-routine buffers, collected at routine exit
    collected: Mutex<Vec<(RoutineId, Vec<Event>)>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                clock: AtomicU64::new(2),
                next_routine: AtomicU64::new(1),
                collected: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Next even global timestamp
    pub fn next_time(&self) -> Time {
        self.inner.clock.fetch_add(2, Ordering::Relaxed)
    }

    /// Start the main routine (routine 1)
    pub fn main_routine(&self) -> RoutineRecorder {
        let id = self.inner.next_routine.fetch_add(1, Ordering::Relaxed);
        RoutineRecorder::new(self.clone(), id)
    }

    /// Collect all finished buffers into a trace.
    ///
    /// Fails if a routine buffer violates the per-routine order, which
    /// only happens on recorder misuse.
    pub fn into_trace(self) -> WeftResult<Trace> {
        let inner = Arc::try_unwrap(self.inner).map_err(|_| {
            WeftError::trace("recorder still shared; finish all routines first")
        })?;
        let mut trace = Trace::new();
        for (_, events) in inner.collected.into_inner() {
            for event in events {
                trace.add(event)?;
            }
        }
        Ok(trace)
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an in-flight operation: the pre half has been recorded, the
/// post half is pending.
#[derive(Debug, Clone, Copy)]
pub struct PendingOp {
    index: usize,
}

/// Per-routine recording handle. Owned by exactly one routine; appends
/// are lock-free.
pub struct RoutineRecorder {
    shared: TraceRecorder,
    routine: RoutineId,
    local_counter: u64,
    events: Vec<Event>,
    finished: bool,
}

impl RoutineRecorder {
    fn new(shared: TraceRecorder, routine: RoutineId) -> Self {
        Self {
            shared,
            routine,
            local_counter: 0,
            events: Vec::new(),
            finished: false,
        }
    }

    pub fn routine(&self) -> RoutineId {
        self.routine
    }

    /// Mint an object id owned by this routine
    pub fn mint_id(&mut self) -> ObjectId {
        self.local_counter += 1;
        mint_object_id(self.routine, self.local_counter)
    }

    /// Record a spawn and hand back the child's recorder
    pub fn record_spawn(&mut self, pos: Position) -> RoutineRecorder {
        let child = self
            .shared
            .inner
            .next_routine
            .fetch_add(1, Ordering::Relaxed);
        let t = self.shared.next_time();
        self.events.push(Event {
            routine: self.routine,
            t_pre: t,
            t_post: t,
            pos,
            kind: EventKind::Spawn { child },
        });
        RoutineRecorder::new(self.shared.clone(), child)
    }

    /// Record channel creation
    pub fn record_channel_new(&mut self, qsize: u64, pos: Position) -> ObjectId {
        let id = self.mint_id();
        let t = self.shared.next_time();
        self.events.push(Event {
            routine: self.routine,
            t_pre: t,
            t_post: t,
            pos,
            kind: EventKind::ChannelNew { id, qsize },
        });
        id
    }

    /// Pre half of a channel operation
    pub fn channel_pre(
        &mut self,
        id: ObjectId,
        op: ChannelOpKind,
        qsize: u64,
        pos: Position,
    ) -> PendingOp {
        self.push_pending(pos, EventKind::Channel {
            id,
            op,
            closed: false,
            op_id: 0,
            qsize,
            qcount: 0,
        })
    }

    /// Post half of a channel operation
    pub fn channel_post(&mut self, pending: PendingOp, closed: bool, op_id: u64, qcount: u64) {
        let t = self.shared.next_time();
        let event = &mut self.events[pending.index];
        event.t_post = t;
        if let EventKind::Channel {
            closed: c,
            op_id: o,
            qcount: q,
            ..
        } = &mut event.kind
        {
            *c = closed;
            *o = op_id;
            *q = qcount;
        }
    }

    /// Close is instantaneous: `t_post == t_pre`, no partner
    pub fn record_close(&mut self, id: ObjectId, qsize: u64, pos: Position) {
        let t = self.shared.next_time();
        self.events.push(Event {
            routine: self.routine,
            t_pre: t,
            t_post: t,
            pos,
            kind: EventKind::Channel {
                id,
                op: ChannelOpKind::Close,
                closed: false,
                op_id: 0,
                qsize,
                qcount: 0,
            },
        });
    }

    /// Pre half of a mutex operation
    pub fn mutex_pre(&mut self, id: ObjectId, rw: bool, op: MutexOpKind, pos: Position) -> PendingOp {
        self.push_pending(pos, EventKind::Mutex {
            id,
            rw,
            op,
            suc: false,
        })
    }

    /// Post half of a mutex operation
    pub fn mutex_post(&mut self, pending: PendingOp, suc: bool) {
        let t = self.shared.next_time();
        let event = &mut self.events[pending.index];
        event.t_post = t;
        if let EventKind::Mutex { suc: s, .. } = &mut event.kind {
            *s = suc;
        }
    }

    /// Record a wait group Add/Done (instantaneous)
    pub fn record_wg_add(&mut self, id: ObjectId, delta: i64, value: i64, pos: Position) {
        let t = self.shared.next_time();
        self.events.push(Event {
            routine: self.routine,
            t_pre: t,
            t_post: t,
            pos,
            kind: EventKind::WaitGroup {
                id,
                op: WaitGroupOpKind::AddOrDone,
                delta,
                value,
            },
        });
    }

    /// Pre half of a wait group Wait
    pub fn wg_wait_pre(&mut self, id: ObjectId, pos: Position) -> PendingOp {
        self.push_pending(pos, EventKind::WaitGroup {
            id,
            op: WaitGroupOpKind::Wait,
            delta: 0,
            value: 0,
        })
    }

    /// Post half of a wait group Wait
    pub fn wg_wait_post(&mut self, pending: PendingOp, value: i64) {
        let t = self.shared.next_time();
        let event = &mut self.events[pending.index];
        event.t_post = t;
        if let EventKind::WaitGroup { value: v, .. } = &mut event.kind {
            *v = value;
        }
    }

    /// Pre half of a select
    pub fn select_pre(
        &mut self,
        id: ObjectId,
        cases: Vec<SelectCase>,
        default_present: bool,
        pos: Position,
    ) -> PendingOp {
        self.push_pending(pos, EventKind::Select {
            id,
            cases,
            default_present,
            chosen: -1,
        })
    }

    /// Post half of a select; `chosen` is the executed case index or -1
    /// when the default ran. The chosen case's rendezvous fields are
    /// patched to mirror a standalone channel op.
    pub fn select_post(&mut self, pending: PendingOp, chosen: i64, op_id: u64, qcount: u64) {
        let t = self.shared.next_time();
        let t_pre = self.events[pending.index].t_pre;
        let event = &mut self.events[pending.index];
        event.t_post = t;
        if let EventKind::Select { cases, chosen: c, .. } = &mut event.kind {
            *c = chosen;
            if chosen >= 0 {
                if let Some(case) = cases.get_mut(chosen as usize) {
                    case.t_pre = t_pre;
                    case.t_post = t;
                    case.op_id = op_id;
                    case.qcount = qcount;
                }
            }
        }
    }

    /// Record a `once.Do` (instantaneous; `suc` marks the winning call)
    pub fn record_once(&mut self, id: ObjectId, suc: bool, pos: Position) {
        let t = self.shared.next_time();
        self.events.push(Event {
            routine: self.routine,
            t_pre: t,
            t_post: t,
            pos,
            kind: EventKind::Once { id, suc },
        });
    }

    /// Pre half of a cond operation (only Wait blocks, but signal and
    /// broadcast share the pre/post protocol)
    pub fn cond_pre(&mut self, id: ObjectId, op: CondOpKind, pos: Position) -> PendingOp {
        self.push_pending(pos, EventKind::Cond { id, op })
    }

    /// Post half of a cond operation
    pub fn cond_post(&mut self, pending: PendingOp) {
        let t = self.shared.next_time();
        self.events[pending.index].t_post = t;
    }

    /// Record an atomic operation (single timestamp)
    pub fn record_atomic(&mut self, id: ObjectId, op: AtomicOpKind, pos: Position) {
        let t = self.shared.next_time();
        self.events.push(Event {
            routine: self.routine,
            t_pre: t,
            t_post: t,
            pos,
            kind: EventKind::Atomic { id, op },
        });
    }

    /// Record routine exit and hand the buffer to the shared collector
    pub fn finish(mut self) {
        let t = self.shared.next_time();
        self.events.push(Event {
            routine: self.routine,
            t_pre: t,
            t_post: t,
            pos: Position::default(),
            kind: EventKind::RoutineExit,
        });
        self.finished = true;
        self.shared
            .inner
            .collected
            .lock()
            .push((self.routine, std::mem::take(&mut self.events)));
    }

    fn push_pending(&mut self, pos: Position, kind: EventKind) -> PendingOp {
        let t = self.shared.next_time();
        self.events.push(Event {
            routine: self.routine,
            t_pre: t,
            t_post: 0,
            pos,
            kind,
        });
        PendingOp {
            index: self.events.len() - 1,
        }
    }
}

impl Drop for RoutineRecorder {
    /// A dropped-but-unfinished recorder still contributes its buffer;
    /// its pending operations keep `t_post == 0` and show up as leaks.
    fn drop(&mut self) {
        if !self.finished && !self.events.is_empty() {
            self.shared
                .inner
                .collected
                .lock()
                .push((self.routine, std::mem::take(&mut self.events)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_even_and_increasing() {
        let recorder = TraceRecorder::new();
        let a = recorder.next_time();
        let b = recorder.next_time();
        assert_eq!(a % 2, 0);
        assert_eq!(b % 2, 0);
        assert!(b > a);
    }

    #[test]
    fn test_record_simple_rendezvous() {
        let recorder = TraceRecorder::new();
        let mut main = recorder.main_routine();
        let ch = main.record_channel_new(0, Position::new("main.go", 3));
        let mut child = main.record_spawn(Position::new("main.go", 4));

        let send = child.channel_pre(ch, ChannelOpKind::Send, 0, Position::new("main.go", 8));
        child.channel_post(send, false, 1, 0);
        child.finish();

        let recv = main.channel_pre(ch, ChannelOpKind::Recv, 0, Position::new("main.go", 5));
        main.channel_post(recv, false, 1, 0);
        main.finish();

        let trace = recorder.into_trace().unwrap();
        assert_eq!(trace.routine_ids().count(), 2);
        // spawn + channel new + send + recv + 2 exits
        assert_eq!(trace.len(), 6);
    }

    #[test]
    fn test_unfinished_routine_leaks_pending_op() {
        let recorder = TraceRecorder::new();
        let mut main = recorder.main_routine();
        let ch = main.record_channel_new(0, Position::new("main.go", 3));
        let mut child = main.record_spawn(Position::new("main.go", 4));
        let _pending = child.channel_pre(ch, ChannelOpKind::Send, 0, Position::new("main.go", 8));
        drop(child);
        main.finish();

        let trace = recorder.into_trace().unwrap();
        let blocked = trace.count_matching(|e| e.is_blocked());
        assert_eq!(blocked, 1);
    }

    #[test]
    fn test_minted_ids_do_not_collide_across_routines() {
        let recorder = TraceRecorder::new();
        let mut main = recorder.main_routine();
        let mut child = main.record_spawn(Position::new("main.go", 4));
        let a = main.mint_id();
        let b = child.mint_id();
        assert_ne!(a, b);
        child.finish();
        main.finish();
    }
}

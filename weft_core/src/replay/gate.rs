//! Replay gate protocol
//!
//! Every instrumented primitive enters a gate between its pre hook and
//! the actual operation. The gate either lets the caller proceed (replay
//! disabled, position untracked, pass-through phase) or parks it on a
//! channel until the manager releases it. Callers that requested an ack
//! receive a token to fire after the primitive body ran.

use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::replay::exit_code::ExitCode;
use crate::trace::{
    AtomicOpKind, ChannelOpKind, CondOpKind, Event, EventKind, MutexOpKind, Time, WaitGroupOpKind,
};

/// Operation kinds at gate granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplayOp {
    Spawn,
    ChannelSend,
    ChannelRecv,
    ChannelClose,
    MutexLock,
    MutexUnlock,
    MutexTryLock,
    RwMutexLock,
    RwMutexRLock,
    RwMutexUnlock,
    RwMutexRUnlock,
    RwMutexTryLock,
    RwMutexTryRLock,
    Once,
    WaitGroupAddDone,
    WaitGroupWait,
    Select,
    CondWait,
    CondSignal,
    CondBroadcast,
    AtomicLoad,
    AtomicStore,
    AtomicAdd,
    AtomicSwap,
    AtomicCompareAndSwap,
    AtomicAnd,
    AtomicOr,
}

impl ReplayOp {
    /// Atomic operations can be suppressed wholesale
    pub fn is_atomic(self) -> bool {
        matches!(
            self,
            ReplayOp::AtomicLoad
                | ReplayOp::AtomicStore
                | ReplayOp::AtomicAdd
                | ReplayOp::AtomicSwap
                | ReplayOp::AtomicCompareAndSwap
                | ReplayOp::AtomicAnd
                | ReplayOp::AtomicOr
        )
    }

    /// Wait reasons that count as stuck for deadlock confirmation
    pub fn is_blocking_lock(self) -> bool {
        matches!(
            self,
            ReplayOp::MutexLock | ReplayOp::RwMutexLock | ReplayOp::RwMutexRLock
        )
    }

    /// The gate op corresponding to a trace event, if the event is gated
    pub fn of_event(event: &Event) -> Option<ReplayOp> {
        match &event.kind {
            EventKind::Spawn { .. } => Some(ReplayOp::Spawn),
            EventKind::Channel { op, .. } => Some(match op {
                ChannelOpKind::Send => ReplayOp::ChannelSend,
                ChannelOpKind::Recv => ReplayOp::ChannelRecv,
                ChannelOpKind::Close => ReplayOp::ChannelClose,
            }),
            EventKind::Mutex { rw, op, .. } => Some(match (rw, op) {
                (false, MutexOpKind::Lock) => ReplayOp::MutexLock,
                (false, MutexOpKind::Unlock) => ReplayOp::MutexUnlock,
                (false, _) => ReplayOp::MutexTryLock,
                (true, MutexOpKind::Lock) => ReplayOp::RwMutexLock,
                (true, MutexOpKind::RLock) => ReplayOp::RwMutexRLock,
                (true, MutexOpKind::Unlock) => ReplayOp::RwMutexUnlock,
                (true, MutexOpKind::RUnlock) => ReplayOp::RwMutexRUnlock,
                (true, MutexOpKind::TryLock) => ReplayOp::RwMutexTryLock,
                (true, MutexOpKind::TryRLock) => ReplayOp::RwMutexTryRLock,
            }),
            EventKind::WaitGroup { op, .. } => Some(match op {
                WaitGroupOpKind::AddOrDone => ReplayOp::WaitGroupAddDone,
                WaitGroupOpKind::Wait => ReplayOp::WaitGroupWait,
            }),
            EventKind::Select { .. } => Some(ReplayOp::Select),
            EventKind::Once { .. } => Some(ReplayOp::Once),
            EventKind::Cond { op, .. } => Some(match op {
                CondOpKind::Wait => ReplayOp::CondWait,
                CondOpKind::Signal => ReplayOp::CondSignal,
                CondOpKind::Broadcast => ReplayOp::CondBroadcast,
            }),
            EventKind::Atomic { op, .. } => Some(match op {
                AtomicOpKind::Load => ReplayOp::AtomicLoad,
                AtomicOpKind::Store => ReplayOp::AtomicStore,
                AtomicOpKind::Add => ReplayOp::AtomicAdd,
                AtomicOpKind::Swap => ReplayOp::AtomicSwap,
                AtomicOpKind::CompareAndSwap => ReplayOp::AtomicCompareAndSwap,
                AtomicOpKind::And => ReplayOp::AtomicAnd,
                AtomicOpKind::Or => ReplayOp::AtomicOr,
            }),
            EventKind::RoutineExit
            | EventKind::ChannelNew { .. }
            | EventKind::ReplayEnd { .. } => None,
        }
    }
}

/// One schedulable step of the replay: a flattened trace event the
/// manager hands to the matching waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayElement {
    /// Index in the flattened trace
    pub index: usize,
    /// Routine the recorded event belonged to
    pub routine: u64,
    /// Gate-level operation, `None` for control markers
    pub op: Option<ReplayOp>,
    /// `file:line` matching key
    pub pos_key: String,
    /// Recorded `t_sort`
    pub time: Time,
    /// The recorded operation never completed (`t_post == 0`); its gate
    /// stays parked instead of being released
    pub blocked: bool,
    /// 1-based occurrence of `pos_key` up to this element
    pub occurrence: u64,
    /// Exit classification for `ReplayEnd` markers
    pub exit: Option<ExitCode>,
    /// Chosen select case recorded for this step, if any
    pub select_case: Option<i64>,
}

/// What the manager sends a parked gate
#[derive(Debug, Clone)]
pub struct ReleaseSignal {
    /// The trace element the release corresponds to; `None` when replay
    /// was disabled and the gate becomes a pass-through.
    pub element: Option<ReplayElement>,
    /// False means replay is no longer steering this gate
    pub blocked: bool,
}

/// Token to fire after the primitive body executed
#[derive(Debug)]
pub struct AckToken {
    pub(crate) tx: Sender<()>,
}

impl AckToken {
    /// Acknowledge completion to the manager
    pub fn ack(self) {
        let _ = self.tx.send(());
    }
}

/// Handle for a parked gate
#[derive(Debug)]
pub struct WaitHandle {
    pub(crate) release_rx: Receiver<ReleaseSignal>,
    pub(crate) ack_tx: Option<Sender<()>>,
}

impl WaitHandle {
    /// Block until the manager releases this gate. Returns the release
    /// and, if an ack was requested, the token to fire after the
    /// primitive body.
    pub fn wait(self) -> (ReleaseSignal, Option<AckToken>) {
        let signal = self.release_rx.recv().unwrap_or(ReleaseSignal {
            element: None,
            blocked: false,
        });
        let ack = self.ack_tx.map(|tx| AckToken { tx });
        (signal, ack)
    }
}

/// Outcome of entering a gate
#[derive(Debug)]
pub enum GateDecision {
    /// Run the primitive immediately
    Proceed,
    /// Park until the manager releases the gate
    Wait(WaitHandle),
    /// GFuzz select mode: try the preferred cases for `delay` before
    /// falling back to the recorded behavior
    Prefer {
        cases: Vec<usize>,
        delay: Duration,
    },
}

impl GateDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, GateDecision::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Position;

    #[test]
    fn test_op_of_event() {
        let event = Event {
            routine: 1,
            t_pre: 2,
            t_post: 4,
            pos: Position::new("main.go", 3),
            kind: EventKind::Mutex {
                id: 1,
                rw: true,
                op: MutexOpKind::RLock,
                suc: true,
            },
        };
        assert_eq!(ReplayOp::of_event(&event), Some(ReplayOp::RwMutexRLock));
        assert!(ReplayOp::RwMutexRLock.is_blocking_lock());
        assert!(!ReplayOp::ChannelSend.is_blocking_lock());
        assert!(ReplayOp::AtomicAdd.is_atomic());
    }

    #[test]
    fn test_exit_and_new_are_not_gated() {
        let exit = Event {
            routine: 1,
            t_pre: 2,
            t_post: 2,
            pos: Position::default(),
            kind: EventKind::RoutineExit,
        };
        assert_eq!(ReplayOp::of_event(&exit), None);
    }
}

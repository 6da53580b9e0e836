//! Trace event model
//!
//! One `Event` is the merged pre/post record of a single synchronization
//! primitive operation: who ran it, when it started (`t_pre`), when it
//! completed (`t_post`, 0 if it never did), where in the source it lives,
//! and a payload describing the primitive. All analysis, rewriting and
//! replay logic is exhaustive pattern matching over `EventKind`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a routine (1-origin; 0 is reserved for control markers)
pub type RoutineId = u64;

/// Global logical timestamp. Even values are operation timestamps, odd
/// values are reserved for control markers.
pub type Time = u64;

/// Identifier of a primitive object (channel, mutex, wait group, ...)
pub type ObjectId = u64;

/// Number of bits the routine id occupies in a minted object id
pub const OBJECT_ID_SHIFT: u32 = 30;

/// Mint a globally unique object id without cross-routine coordination.
///
/// Ids minted in one routine are never reused by another.
pub fn mint_object_id(routine: RoutineId, local_counter: u64) -> ObjectId {
    (routine << OBJECT_ID_SHIFT) | local_counter
}

/// Source position of an operation, used as the replay matching key
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    /// Source file path
    pub file: String,
    /// 1-origin line number
    pub line: u32,
}

impl Position {
    pub fn new(file: &str, line: u32) -> Self {
        Self {
            file: file.to_string(),
            line,
        }
    }

    /// The `file:line` key used by the replay waiting map
    pub fn key(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }

    /// Parse a `file:line` string (the line is everything after the last colon)
    pub fn parse(s: &str) -> Option<Self> {
        let (file, line) = s.rsplit_once(':')?;
        let line = line.parse().ok()?;
        Some(Self {
            file: file.to_string(),
            line,
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Channel operation sub-kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelOpKind {
    Send,
    Recv,
    Close,
}

impl ChannelOpKind {
    /// The complementary rendezvous operation (close has none)
    pub fn opposite(self) -> Option<ChannelOpKind> {
        match self {
            ChannelOpKind::Send => Some(ChannelOpKind::Recv),
            ChannelOpKind::Recv => Some(ChannelOpKind::Send),
            ChannelOpKind::Close => None,
        }
    }
}

/// Mutex operation sub-kind (plain and rw variants share the set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutexOpKind {
    Lock,
    Unlock,
    TryLock,
    RLock,
    RUnlock,
    TryRLock,
}

impl MutexOpKind {
    /// True for Lock/RLock/TryLock/TryRLock
    pub fn is_acquire(self) -> bool {
        !matches!(self, MutexOpKind::Unlock | MutexOpKind::RUnlock)
    }

    /// True for the try variants that may fail without blocking
    pub fn is_try(self) -> bool {
        matches!(self, MutexOpKind::TryLock | MutexOpKind::TryRLock)
    }

    /// True for the reader-side rw operations
    pub fn is_read(self) -> bool {
        matches!(
            self,
            MutexOpKind::RLock | MutexOpKind::RUnlock | MutexOpKind::TryRLock
        )
    }
}

/// Wait group operation sub-kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitGroupOpKind {
    /// `Add(delta)` or `Done()` (delta = -1)
    AddOrDone,
    /// `Wait()`
    Wait,
}

/// Conditional variable operation sub-kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CondOpKind {
    Wait,
    Signal,
    Broadcast,
}

/// Atomic operation sub-kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOpKind {
    Load,
    Store,
    Add,
    Swap,
    CompareAndSwap,
    And,
    Or,
}

impl AtomicOpKind {
    /// True if the operation publishes a value (store or read-modify-write)
    pub fn is_write(self) -> bool {
        !matches!(self, AtomicOpKind::Load)
    }
}

/// One case of a select statement. Mirrors the channel event payload; the
/// chosen case behaves exactly like a standalone send/recv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectCase {
    pub t_pre: Time,
    pub t_post: Time,
    /// Channel the case refers to (0 = nil channel)
    pub channel: ObjectId,
    /// Send or Recv (Close cannot appear in a select)
    pub op: ChannelOpKind,
    /// Whether the case observed a closed channel
    pub closed: bool,
    /// Rendezvous pairing counter, matches the partner's op_id
    pub op_id: u64,
    /// Channel capacity
    pub qsize: u64,
    /// Queue fill after the operation
    pub qcount: u64,
    pub pos: Position,
}

/// Payload of an event, discriminated by primitive kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// A routine spawned a child routine
    Spawn { child: RoutineId },
    /// The routine finished
    RoutineExit,
    /// Channel creation, capturing the capacity
    ChannelNew { id: ObjectId, qsize: u64 },
    /// Channel send/recv/close
    Channel {
        id: ObjectId,
        op: ChannelOpKind,
        /// The operation found the channel closed
        closed: bool,
        /// Rendezvous pairing counter (i-th send matches i-th recv)
        op_id: u64,
        /// Channel capacity
        qsize: u64,
        /// Queue fill after the operation
        qcount: u64,
    },
    /// Mutex or rw-mutex operation
    Mutex {
        id: ObjectId,
        rw: bool,
        op: MutexOpKind,
        /// For try-ops: whether the acquisition succeeded
        suc: bool,
    },
    /// Wait group Add/Done or Wait
    WaitGroup {
        id: ObjectId,
        op: WaitGroupOpKind,
        /// Counter delta (0 for Wait)
        delta: i64,
        /// Counter value after the operation
        value: i64,
    },
    /// Select over channel cases, possibly with a default
    Select {
        id: ObjectId,
        cases: Vec<SelectCase>,
        /// A default case exists
        default_present: bool,
        /// Index of the chosen case, -1 if the default ran
        chosen: i64,
    },
    /// `once.Do(f)`
    Once {
        id: ObjectId,
        /// Whether this Do executed the function
        suc: bool,
    },
    /// Conditional variable operation
    Cond { id: ObjectId, op: CondOpKind },
    /// Atomic memory operation; the id is the address hash
    Atomic { id: ObjectId, op: AtomicOpKind },
    /// Control marker terminating a (rewritten) trace, carrying the
    /// expected exit classification
    ReplayEnd { exit_code: i32 },
}

impl EventKind {
    /// Single-letter kind code, matching the on-disk format
    pub fn code(&self) -> &'static str {
        match self {
            EventKind::Spawn { .. } => "G",
            EventKind::RoutineExit => "E",
            EventKind::ChannelNew { .. } => "N",
            EventKind::Channel { .. } => "C",
            EventKind::Mutex { .. } => "M",
            EventKind::WaitGroup { .. } => "W",
            EventKind::Select { .. } => "S",
            EventKind::Once { .. } => "O",
            EventKind::Cond { .. } => "D",
            EventKind::Atomic { .. } => "A",
            EventKind::ReplayEnd { .. } => "X",
        }
    }
}

/// Stable identity of an event inside a trace.
///
/// Per-routine `t_pre` values are strictly increasing, so the pair is
/// unique for the whole trace and survives serialization (no partner
/// pointers; lookups go through `TraceIndex`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub routine: RoutineId,
    pub t_pre: Time,
}

impl EventKey {
    pub fn new(routine: RoutineId, t_pre: Time) -> Self {
        Self { routine, t_pre }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.routine, self.t_pre)
    }
}

/// One typed record of a synchronization-primitive operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Owning routine (1-origin; 0 for control markers)
    pub routine: RoutineId,
    /// Timestamp at the operation's pre moment
    pub t_pre: Time,
    /// Timestamp at the post moment; 0 means the operation blocked and
    /// never completed
    pub t_post: Time,
    /// Source position, the replay matching identifier
    pub pos: Position,
    /// Primitive payload
    pub kind: EventKind,
}

impl Event {
    /// Sort key for the global iteration order
    pub fn t_sort(&self) -> Time {
        if self.t_post != 0 {
            self.t_post
        } else {
            self.t_pre
        }
    }

    /// Stable identity of this event
    pub fn key(&self) -> EventKey {
        EventKey::new(self.routine, self.t_pre)
    }

    /// Id of the primitive the event acts on, if any
    pub fn object_id(&self) -> Option<ObjectId> {
        match &self.kind {
            EventKind::ChannelNew { id, .. }
            | EventKind::Channel { id, .. }
            | EventKind::Mutex { id, .. }
            | EventKind::WaitGroup { id, .. }
            | EventKind::Select { id, .. }
            | EventKind::Once { id, .. }
            | EventKind::Cond { id, .. }
            | EventKind::Atomic { id, .. } => Some(*id),
            EventKind::Spawn { .. } | EventKind::RoutineExit | EventKind::ReplayEnd { .. } => None,
        }
    }

    /// True if the operation blocked and never completed
    pub fn is_blocked(&self) -> bool {
        self.t_post == 0
            && !matches!(
                self.kind,
                EventKind::Spawn { .. }
                    | EventKind::RoutineExit
                    | EventKind::ChannelNew { .. }
                    | EventKind::ReplayEnd { .. }
            )
    }

    /// The chosen select case, if this is a select that ran a channel case
    pub fn chosen_case(&self) -> Option<&SelectCase> {
        match &self.kind {
            EventKind::Select { cases, chosen, .. } if *chosen >= 0 => {
                cases.get(*chosen as usize)
            }
            _ => None,
        }
    }

    /// Shift both timestamps by a signed delta, keeping `t_post == 0`
    /// blocked markers intact. Times never drop below 1.
    pub fn shift(&mut self, delta: i64) {
        self.t_pre = shift_time(self.t_pre, delta);
        if self.t_post != 0 {
            self.t_post = shift_time(self.t_post, delta);
        }
        if let EventKind::Select { cases, .. } = &mut self.kind {
            for case in cases {
                case.t_pre = shift_time(case.t_pre, delta);
                if case.t_post != 0 {
                    case.t_post = shift_time(case.t_post, delta);
                }
            }
        }
    }
}

fn shift_time(t: Time, delta: i64) -> Time {
    let shifted = t as i64 + delta;
    if shifted < 1 {
        1
    } else {
        shifted as Time
    }
}

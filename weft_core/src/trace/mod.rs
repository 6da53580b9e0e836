//! # Trace model and persistence
//!
//! Everything about traces themselves:
//!
//! - **event**: the typed event record and its payloads
//! - **model**: per-routine sequences, the global `t_sort` iterator and
//!   the mutators the rewriter builds on
//! - **recorder**: the record-phase runtime (per-routine buffers, the
//!   global timestamp counter, id minting)
//! - **io**: the line-oriented trace format and directory layout

pub mod event;
pub mod io;
pub mod model;
pub mod recorder;

pub use event::{
    mint_object_id, AtomicOpKind, ChannelOpKind, CondOpKind, Event, EventKey, EventKind,
    MutexOpKind, ObjectId, Position, RoutineId, SelectCase, Time, WaitGroupOpKind,
};
pub use io::{parse_line, parse_routine, read_trace_dir, serialize_routine, write_trace_dir};
pub use model::{Trace, TraceIndex, TraceIter, CONTROL_ROUTINE};
pub use recorder::{RoutineRecorder, TraceRecorder};

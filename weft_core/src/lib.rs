//! # Weft Core
//!
//! Core runtime for weft, a recorder, analyzer, rewriter and
//! deterministic replayer for the concurrent execution of programs
//! written against a Go-like runtime (routines, channels, mutexes, wait
//! groups, conditionals, atomics, once, selects).
//!
//! The pipeline:
//!
//! - **Trace**: instrumented primitives emit a totally ordered event
//!   trace with per-routine views (`trace`)
//! - **Analysis**: vector clocks give a happens-before relation that
//!   predicts bugs the recorded run did not show (`analysis`)
//! - **Rewrite**: a predicted bug is made manifest by reordering the
//!   trace while keeping it HB-consistent (`rewrite`)
//! - **Replay**: a cooperative scheduler gates every primitive on the
//!   recorded or rewritten trace and classifies the outcome (`replay`)
//! - **Fuzzing**: GoPie chains, GFuzz select preferences and flow delays
//!   mutate traces into new schedules (`fuzzing`)
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use weft_core::analysis::{run_analysis, ScenarioSet};
//! use weft_core::trace::read_trace_dir;
//!
//! let trace = read_trace_dir(std::path::Path::new("results/traces/run0"))?;
//! let analysis = run_analysis(&trace, &ScenarioSet::all());
//! for bug in &analysis.bugs {
//!     println!("{}: {}", bug.kind.code(), bug.kind.name());
//! }
//! # Ok::<(), weft_core::WeftError>(())
//! ```

pub mod analysis;
pub mod error;
pub mod fuzzing;
pub mod replay;
pub mod rewrite;
pub mod trace;

// Re-export commonly used types for easy access
pub use analysis::{run_analysis, Analysis, Bug, BugKind, HbIndex, HbRelation, ScenarioSet};
pub use error::{WeftError, WeftResult};
pub use replay::{ExitCode, ReplayConfig, ReplayManager};
pub use rewrite::{ActiveMap, RewriteOutcome, Rewriter, RewrittenTrace};
pub use trace::{Event, EventKey, EventKind, Position, RoutineId, Time, Trace, TraceRecorder};

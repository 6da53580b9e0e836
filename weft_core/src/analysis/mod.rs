//! # Trace analysis
//!
//! Predicts concurrency bugs from a recorded trace:
//!
//! - **vclock**: vector clocks and the four-way happens-before relation
//! - **hb**: the clock engine folding a trace into per-event clocks
//! - **analyzer**: the forward pass evaluating the bug predicates
//! - **bug**: the stable bug taxonomy and report types

pub mod analyzer;
pub mod bug;
pub mod hb;
pub mod vclock;

pub use analyzer::{run_analysis, Analysis, ScenarioSet};
pub use bug::{Bug, BugKind, CODEBOOK};
pub use hb::HbIndex;
pub use vclock::{HbRelation, VectorClock};

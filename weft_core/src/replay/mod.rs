//! # Replay
//!
//! The runtime-side cooperative scheduler:
//!
//! - **gate**: the protocol every instrumented primitive enters between
//!   its pre hook and the actual operation
//! - **manager**: the single decision-maker consuming the ordered trace,
//!   with partial replay, stall breaking and idle teardown
//! - **exit_code**: the closed outcome taxonomy and the panic-message
//!   mapping

pub mod exit_code;
pub mod gate;
pub mod manager;

pub use exit_code::ExitCode;
pub use gate::{AckToken, GateDecision, ReleaseSignal, ReplayElement, ReplayOp, WaitHandle};
pub use manager::{FlowDelays, ReplayConfig, ReplayManager, SelectPreferences};

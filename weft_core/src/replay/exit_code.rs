//! Replay exit classification
//!
//! A closed numeric taxonomy describing how a replay ended. The replay
//! manager maps intercepted panic messages to these codes at a single
//! choke point; the rewriter stamps the expected code into the
//! `ReplayEnd` marker of every rewritten trace.

use serde::{Deserialize, Serialize};

use crate::analysis::BugKind;

/// Outcome classification of a replay run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Replay finished without confirming anything
    Unconfirmed = 0,
    /// The program panicked in a way the taxonomy does not cover
    UnexpectedPanic = 3,
    /// Replay gave up waiting
    Timeout = 10,
    /// Confirmed leak on an unbuffered channel (or select/nil/context)
    LeakUnbuffered = 20,
    /// Confirmed leak on a buffered channel
    LeakBuffered = 21,
    /// Confirmed leak on a mutex
    LeakMutex = 22,
    /// Confirmed leak on a conditional variable
    LeakCond = 23,
    /// Confirmed leak on a wait group
    LeakWaitGroup = 24,
    /// Confirmed send on closed channel
    SendOnClosed = 30,
    /// Confirmed receive on closed channel
    RecvOnClosed = 31,
    /// Confirmed close of closed channel
    CloseOnClosed = 32,
    /// Confirmed close of nil channel
    CloseOnNil = 33,
    /// Confirmed negative wait group counter
    NegativeWaitGroup = 34,
    /// Confirmed unlock of not locked mutex
    UnlockOfUnlocked = 35,
    /// Confirmed cyclic deadlock
    CyclicDeadlock = 41,
}

impl ExitCode {
    /// Numeric value used as the process exit code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up by numeric value
    pub fn from_code(code: i32) -> Option<ExitCode> {
        use ExitCode::*;
        match code {
            0 => Some(Unconfirmed),
            3 => Some(UnexpectedPanic),
            10 => Some(Timeout),
            20 => Some(LeakUnbuffered),
            21 => Some(LeakBuffered),
            22 => Some(LeakMutex),
            23 => Some(LeakCond),
            24 => Some(LeakWaitGroup),
            30 => Some(SendOnClosed),
            31 => Some(RecvOnClosed),
            32 => Some(CloseOnClosed),
            33 => Some(CloseOnNil),
            34 => Some(NegativeWaitGroup),
            35 => Some(UnlockOfUnlocked),
            41 => Some(CyclicDeadlock),
            _ => None,
        }
    }

    /// Whether reaching the end marker with this code confirms a bug
    pub fn is_confirmation(self) -> bool {
        matches!(self.code(), 20..=24 | 30..=35 | 41)
    }

    /// Cyclic deadlocks need the quiescence check instead of a plain exit
    pub fn is_cyclic(self) -> bool {
        self == ExitCode::CyclicDeadlock
    }

    /// The confirmation code a rewrite for this bug kind must carry, if a
    /// rewrite exists for the kind at all.
    pub fn for_bug(kind: BugKind) -> Option<ExitCode> {
        use BugKind::*;
        match kind {
            PossibleSendOnClosed => Some(ExitCode::SendOnClosed),
            PossibleRecvOnClosed => Some(ExitCode::RecvOnClosed),
            PossibleNegativeWaitGroup => Some(ExitCode::NegativeWaitGroup),
            UnlockBeforeLock => Some(ExitCode::UnlockOfUnlocked),
            CyclicDeadlock => Some(ExitCode::CyclicDeadlock),
            LeakUnbufferedWith | LeakUnbufferedWithout | LeakNilChannel | LeakSelectWith
            | LeakSelectWithout | LeakContext => Some(ExitCode::LeakUnbuffered),
            LeakBufferedWith | LeakBufferedWithout => Some(ExitCode::LeakBuffered),
            LeakMutex => Some(ExitCode::LeakMutex),
            LeakCond => Some(ExitCode::LeakCond),
            LeakWaitGroup => Some(ExitCode::LeakWaitGroup),
            _ => None,
        }
    }

    /// Map an intercepted panic message onto the taxonomy. This is the
    /// single choke point turning host panics into exit codes.
    pub fn from_panic_message(message: &str) -> ExitCode {
        if message.contains("send on closed channel") {
            ExitCode::SendOnClosed
        } else if message.contains("close of closed channel") {
            ExitCode::CloseOnClosed
        } else if message.contains("close of nil channel") {
            ExitCode::CloseOnNil
        } else if message.contains("negative WaitGroup counter") {
            ExitCode::NegativeWaitGroup
        } else if message.contains("unlock of unlocked")
            || message.contains("Unlock of unlocked")
        {
            ExitCode::UnlockOfUnlocked
        } else if message.contains("all goroutines are asleep") {
            ExitCode::CyclicDeadlock
        } else {
            ExitCode::UnexpectedPanic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in [0, 3, 10, 20, 21, 22, 23, 24, 30, 31, 32, 33, 34, 35, 41] {
            let exit = ExitCode::from_code(code).unwrap();
            assert_eq!(exit.code(), code);
        }
        assert_eq!(ExitCode::from_code(99), None);
    }

    #[test]
    fn test_confirmation_partition() {
        assert!(!ExitCode::Unconfirmed.is_confirmation());
        assert!(!ExitCode::UnexpectedPanic.is_confirmation());
        assert!(!ExitCode::Timeout.is_confirmation());
        assert!(ExitCode::LeakMutex.is_confirmation());
        assert!(ExitCode::SendOnClosed.is_confirmation());
        assert!(ExitCode::CyclicDeadlock.is_confirmation());
    }

    #[test]
    fn test_panic_message_mapping() {
        assert_eq!(
            ExitCode::from_panic_message("send on closed channel"),
            ExitCode::SendOnClosed
        );
        assert_eq!(
            ExitCode::from_panic_message("close of closed channel"),
            ExitCode::CloseOnClosed
        );
        assert_eq!(
            ExitCode::from_panic_message("sync: negative WaitGroup counter"),
            ExitCode::NegativeWaitGroup
        );
        assert_eq!(
            ExitCode::from_panic_message("sync: unlock of unlocked mutex"),
            ExitCode::UnlockOfUnlocked
        );
        assert_eq!(
            ExitCode::from_panic_message("something else entirely"),
            ExitCode::UnexpectedPanic
        );
    }

    #[test]
    fn test_bug_confirmation_codes() {
        assert_eq!(
            ExitCode::for_bug(BugKind::PossibleSendOnClosed),
            Some(ExitCode::SendOnClosed)
        );
        assert_eq!(
            ExitCode::for_bug(BugKind::LeakBufferedWith),
            Some(ExitCode::LeakBuffered)
        );
        // actual bugs need no rewrite and have no confirmation code
        assert_eq!(ExitCode::for_bug(BugKind::SendOnClosed), None);
    }
}

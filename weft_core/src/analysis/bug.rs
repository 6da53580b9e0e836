//! Bug taxonomy and reports
//!
//! Codes are stable across runs and appear in reports and statistics:
//! `A..` for bugs observed in the recorded run, `P..` for HB-predicted
//! bugs, `L..` for leaks and `R..` for recording faults.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::trace::EventKey;

/// Closed bug taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BugKind {
    // Actual bugs, observed in the recorded run
    SendOnClosed,
    RecvOnClosed,
    CloseOnClosed,
    CloseOnNil,
    NegativeWaitGroup,
    UnlockOfUnlocked,
    ActualLeak,
    ConcurrentRecv,
    SelectWithoutPartner,

    // Possible bugs, HB-predicted
    PossibleSendOnClosed,
    PossibleRecvOnClosed,
    PossibleNegativeWaitGroup,
    UnlockBeforeLock,
    CyclicDeadlock,

    // Leaks, classified by the stuck operation
    LeakUnknown,
    LeakUnbufferedWith,
    LeakUnbufferedWithout,
    LeakBufferedWith,
    LeakBufferedWithout,
    LeakNilChannel,
    LeakSelectWith,
    LeakSelectWithout,
    LeakMutex,
    LeakWaitGroup,
    LeakCond,
    LeakContext,

    // Recording faults
    UnknownPanic,
    RecordingTimeout,
}

impl BugKind {
    /// Stable report code
    pub fn code(self) -> &'static str {
        match self {
            BugKind::SendOnClosed => "A01",
            BugKind::RecvOnClosed => "A02",
            BugKind::CloseOnClosed => "A03",
            BugKind::CloseOnNil => "A04",
            BugKind::NegativeWaitGroup => "A05",
            BugKind::UnlockOfUnlocked => "A06",
            BugKind::ActualLeak => "A07",
            BugKind::ConcurrentRecv => "A08",
            BugKind::SelectWithoutPartner => "A09",
            BugKind::PossibleSendOnClosed => "P01",
            BugKind::PossibleRecvOnClosed => "P02",
            BugKind::PossibleNegativeWaitGroup => "P03",
            BugKind::UnlockBeforeLock => "P04",
            BugKind::CyclicDeadlock => "P05",
            BugKind::LeakUnknown => "L00",
            BugKind::LeakUnbufferedWith => "L01",
            BugKind::LeakUnbufferedWithout => "L02",
            BugKind::LeakBufferedWith => "L03",
            BugKind::LeakBufferedWithout => "L04",
            BugKind::LeakNilChannel => "L05",
            BugKind::LeakSelectWith => "L06",
            BugKind::LeakSelectWithout => "L07",
            BugKind::LeakMutex => "L08",
            BugKind::LeakWaitGroup => "L09",
            BugKind::LeakCond => "L10",
            BugKind::LeakContext => "L11",
            BugKind::UnknownPanic => "R01",
            BugKind::RecordingTimeout => "R02",
        }
    }

    /// Human-readable name, used as the first `# ...` line of reports
    pub fn name(self) -> &'static str {
        CODEBOOK
            .get(self.code())
            .copied()
            .unwrap_or("Unknown bug")
    }

    /// True for bugs observed in the recorded run (no rewrite needed)
    pub fn is_actual(self) -> bool {
        self.code().starts_with('A')
    }

    /// True for leaks
    pub fn is_leak(self) -> bool {
        self.code().starts_with('L')
    }

    /// True for recording faults
    pub fn is_recording_fault(self) -> bool {
        self.code().starts_with('R')
    }

    /// All kinds, in code order
    pub fn all() -> &'static [BugKind] {
        &[
            BugKind::SendOnClosed,
            BugKind::RecvOnClosed,
            BugKind::CloseOnClosed,
            BugKind::CloseOnNil,
            BugKind::NegativeWaitGroup,
            BugKind::UnlockOfUnlocked,
            BugKind::ActualLeak,
            BugKind::ConcurrentRecv,
            BugKind::SelectWithoutPartner,
            BugKind::PossibleSendOnClosed,
            BugKind::PossibleRecvOnClosed,
            BugKind::PossibleNegativeWaitGroup,
            BugKind::UnlockBeforeLock,
            BugKind::CyclicDeadlock,
            BugKind::LeakUnknown,
            BugKind::LeakUnbufferedWith,
            BugKind::LeakUnbufferedWithout,
            BugKind::LeakBufferedWith,
            BugKind::LeakBufferedWithout,
            BugKind::LeakNilChannel,
            BugKind::LeakSelectWith,
            BugKind::LeakSelectWithout,
            BugKind::LeakMutex,
            BugKind::LeakWaitGroup,
            BugKind::LeakCond,
            BugKind::LeakContext,
            BugKind::UnknownPanic,
            BugKind::RecordingTimeout,
        ]
    }

    /// Look up a kind by its stable code
    pub fn from_code(code: &str) -> Option<BugKind> {
        BugKind::all().iter().copied().find(|k| k.code() == code)
    }
}

/// Code -> display name, the single source for report headers
pub static CODEBOOK: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("A01", "Actual send on closed channel"),
        ("A02", "Actual receive on closed channel"),
        ("A03", "Actual close on closed channel"),
        ("A04", "Actual close on nil channel"),
        ("A05", "Actual negative wait group counter"),
        ("A06", "Actual unlock of not locked mutex"),
        ("A07", "Actual leak"),
        ("A08", "Concurrent receive on same channel"),
        ("A09", "Select case without partner"),
        ("P01", "Possible send on closed channel"),
        ("P02", "Possible receive on closed channel"),
        ("P03", "Possible negative wait group counter"),
        ("P04", "Possible unlock before lock"),
        ("P05", "Possible cyclic deadlock"),
        ("L00", "Leak on unknown operation"),
        ("L01", "Leak on unbuffered channel with possible partner"),
        ("L02", "Leak on unbuffered channel without possible partner"),
        ("L03", "Leak on buffered channel with possible partner"),
        ("L04", "Leak on buffered channel without possible partner"),
        ("L05", "Leak on nil channel"),
        ("L06", "Leak on select with possible partner"),
        ("L07", "Leak on select without possible partner"),
        ("L08", "Leak on mutex"),
        ("L09", "Leak on wait group"),
        ("L10", "Leak on conditional variable"),
        ("L11", "Leak on context"),
        ("R01", "Unknown panic during recording"),
        ("R02", "Timeout during recording"),
    ])
});

/// One predicted or observed bug: the kind plus the implicated events.
///
/// For send-on-closed the primary event is the send and the secondary
/// the close; for leaks the primary is the stuck operation and the
/// secondary its possible partner; for deadlocks the primaries are the
/// lock acquisitions forming the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bug {
    pub kind: BugKind,
    pub primary: Vec<EventKey>,
    pub secondary: Vec<EventKey>,
}

impl Bug {
    pub fn new(kind: BugKind, primary: Vec<EventKey>, secondary: Vec<EventKey>) -> Self {
        Self {
            kind,
            primary,
            secondary,
        }
    }

    /// All implicated events, primary first
    pub fn events(&self) -> impl Iterator<Item = EventKey> + '_ {
        self.primary.iter().chain(self.secondary.iter()).copied()
    }
}

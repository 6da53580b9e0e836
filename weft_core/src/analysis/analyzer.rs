//! Trace analysis
//!
//! A single forward pass over the global iterator updates vector clocks,
//! tracks per-primitive state (channel close state and queues, mutex hold
//! stacks, wait group counters, once winners) and evaluates the bug
//! predicates of the taxonomy. Leaks are classified at end of trace from
//! the operations that never completed.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, warn};

use crate::analysis::bug::{Bug, BugKind};
use crate::analysis::hb::HbIndex;
use crate::analysis::vclock::HbRelation;
use crate::error::{WeftError, WeftResult};
use crate::trace::{
    ChannelOpKind, CondOpKind, Event, EventKey, EventKind, MutexOpKind, ObjectId, Position,
    RoutineId, Time, Trace, TraceIndex, WaitGroupOpKind,
};

/// Valid scenario selector characters
pub const SCENARIO_CHARS: &str = "srwnbluc m";

/// Which analysis scenarios run. Each character selects one family:
/// `s` send on closed, `r` receive on closed, `w` wait group, `n` close
/// on closed/nil, `b` concurrent receive and select partners, `l` leaks,
/// `u` unlock, `c` resource deadlock, `m` mixed deadlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioSet {
    chars: BTreeSet<char>,
}

impl ScenarioSet {
    /// Every scenario enabled
    pub fn all() -> Self {
        Self {
            chars: "srwnbluc".chars().collect(),
        }
    }

    /// Parse a selector string such as `"srl"`
    pub fn from_flags(flags: &str) -> WeftResult<Self> {
        let mut chars = BTreeSet::new();
        for c in flags.chars() {
            if c.is_whitespace() {
                continue;
            }
            if !SCENARIO_CHARS.contains(c) {
                return Err(WeftError::invalid_input(format!(
                    "unknown scenario '{}', valid: {}",
                    c,
                    SCENARIO_CHARS.trim()
                )));
            }
            chars.insert(c);
        }
        if chars.is_empty() {
            return Ok(Self::all());
        }
        Ok(Self { chars })
    }

    pub fn enabled(&self, c: char) -> bool {
        self.chars.contains(&c)
    }
}

impl Default for ScenarioSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Result of analyzing one trace: the predicted bugs plus the HB data
/// the rewriter needs.
pub struct Analysis {
    pub bugs: Vec<Bug>,
    pub hb: HbIndex,
    pub index: TraceIndex,
}

/// Analyze a trace under the selected scenarios
pub fn run_analysis(trace: &Trace, scenarios: &ScenarioSet) -> Analysis {
    if scenarios.enabled('m') {
        warn!("mixed deadlock analysis is not part of the taxonomy; skipping 'm'");
    }
    let hb = HbIndex::build(trace);
    // lock order is schedule-dependent, so deadlock concurrency is judged
    // without the mutex edges
    let hb_weak = HbIndex::build_without_locks(trace);
    let index = TraceIndex::build(trace);
    let mut analyzer = Analyzer::new(trace, &hb, &hb_weak, scenarios);
    for event in trace.iter_sorted() {
        analyzer.consume(event);
    }
    analyzer.finish();
    Analysis {
        bugs: analyzer.into_bugs(),
        hb,
        index,
    }
}

/// Reference to one operation, with the fields every predicate needs
#[derive(Debug, Clone, Copy, PartialEq)]
struct OpRef {
    key: EventKey,
    time: Time,
    routine: RoutineId,
}

impl OpRef {
    fn of(event: &Event) -> Self {
        Self {
            key: event.key(),
            time: event.t_sort(),
            routine: event.routine,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    qsize: u64,
    /// First close, if any
    closed_by: Option<OpRef>,
    closes: Vec<OpRef>,
    /// Completed sends/recvs (standalone or chosen select case)
    executed_sends: Vec<OpRef>,
    executed_recvs: Vec<OpRef>,
    /// Everything that could pair: completed, blocked, and select cases
    candidate_sends: Vec<OpRef>,
    candidate_recvs: Vec<OpRef>,
}

#[derive(Debug, Default)]
struct MutexState {
    /// Currently held acquisitions: (routine, acquire event, op)
    held: Vec<(RoutineId, OpRef, MutexOpKind)>,
    /// Most recent successful lock of any flavor
    last_lock: Option<OpRef>,
    /// (unlock, matching lock) pairs for the unlock-before-lock check
    releases: Vec<(OpRef, OpRef)>,
}

#[derive(Debug, Default)]
struct WaitGroupState {
    /// AddOrDone events: (op, delta, value after)
    changes: Vec<(OpRef, i64, i64)>,
}

/// Wait-for edge of the resource graph: `routine` acquired `to` (at
/// `acquire`) while holding `from` (since `held`).
#[derive(Debug, Clone)]
struct LockEdge {
    from: ObjectId,
    to: ObjectId,
    routine: RoutineId,
    held: OpRef,
    acquire: OpRef,
}

struct Analyzer<'t> {
    trace: &'t Trace,
    hb: &'t HbIndex,
    hb_weak: &'t HbIndex,
    scenarios: &'t ScenarioSet,
    bugs: Vec<Bug>,
    dedup: HashSet<String>,
    channels: HashMap<ObjectId, ChannelState>,
    mutexes: HashMap<ObjectId, MutexState>,
    wait_groups: HashMap<ObjectId, WaitGroupState>,
    /// Mutexes currently held per routine, with their acquire events
    held_by_routine: HashMap<RoutineId, Vec<(ObjectId, OpRef)>>,
    lock_edges: Vec<LockEdge>,
    /// Operations that never completed, for leak classification
    blocked: Vec<EventKey>,
    /// Executed selects, for the partner check
    selects: Vec<EventKey>,
}

impl<'t> Analyzer<'t> {
    fn new(
        trace: &'t Trace,
        hb: &'t HbIndex,
        hb_weak: &'t HbIndex,
        scenarios: &'t ScenarioSet,
    ) -> Self {
        Self {
            trace,
            hb,
            hb_weak,
            scenarios,
            bugs: Vec::new(),
            dedup: HashSet::new(),
            channels: HashMap::new(),
            mutexes: HashMap::new(),
            wait_groups: HashMap::new(),
            held_by_routine: HashMap::new(),
            lock_edges: Vec::new(),
            blocked: Vec::new(),
            selects: Vec::new(),
        }
    }

    fn consume(&mut self, event: &Event) {
        if event.is_blocked() {
            self.blocked.push(event.key());
        }
        match &event.kind {
            EventKind::ChannelNew { id, qsize } => {
                self.channels.entry(*id).or_default().qsize = *qsize;
            }
            EventKind::Channel {
                id,
                op,
                closed,
                qsize,
                ..
            } => self.consume_channel_op(event, *id, *op, *closed, *qsize, true),
            EventKind::Select { cases, chosen, .. } => {
                if event.t_post != 0 {
                    self.selects.push(event.key());
                }
                for (i, case) in cases.iter().enumerate() {
                    let is_chosen = *chosen >= 0 && *chosen as usize == i;
                    self.consume_channel_op(
                        event,
                        case.channel,
                        case.op,
                        case.closed,
                        case.qsize,
                        is_chosen,
                    );
                }
            }
            EventKind::Mutex { id, op, suc, .. } => {
                self.consume_mutex_op(event, *id, *op, *suc)
            }
            EventKind::WaitGroup {
                id,
                op,
                delta,
                value,
            } => {
                if *op == WaitGroupOpKind::AddOrDone {
                    let state = self.wait_groups.entry(*id).or_default();
                    state.changes.push((OpRef::of(event), *delta, *value));
                    if *value < 0 && self.scenarios.enabled('w') {
                        self.report(BugKind::NegativeWaitGroup, vec![event.key()], vec![]);
                    }
                }
            }
            // only cond Wait can block, which the leak pass picks up
            EventKind::Cond { .. }
            | EventKind::Spawn { .. }
            | EventKind::RoutineExit
            | EventKind::Once { .. }
            | EventKind::Atomic { .. }
            | EventKind::ReplayEnd { .. } => {}
        }
    }

    /// Track a channel operation; `executed` is false for the non-chosen
    /// cases of a select, which count as pairing candidates only.
    fn consume_channel_op(
        &mut self,
        event: &Event,
        id: ObjectId,
        op: ChannelOpKind,
        observed_closed: bool,
        qsize: u64,
        executed: bool,
    ) {
        let completed = event.t_post != 0;
        let opref = OpRef::of(event);
        let already_closed = {
            let state = self.channels.entry(id).or_default();
            if state.qsize == 0 {
                state.qsize = qsize;
            }
            state.closed_by
        };
        match op {
            ChannelOpKind::Close => {
                if id == 0 {
                    if self.scenarios.enabled('n') {
                        self.report(BugKind::CloseOnNil, vec![event.key()], vec![]);
                    }
                } else if let Some(first) = already_closed {
                    if self.scenarios.enabled('n') {
                        self.report(BugKind::CloseOnClosed, vec![event.key()], vec![first.key]);
                    }
                }
                let state = self.channels.entry(id).or_default();
                if state.closed_by.is_none() {
                    state.closed_by = Some(opref);
                }
                state.closes.push(opref);
            }
            ChannelOpKind::Send => {
                if let Some(close) = already_closed {
                    if completed && executed && self.scenarios.enabled('s') {
                        self.report(BugKind::SendOnClosed, vec![event.key()], vec![close.key]);
                    }
                }
                let state = self.channels.entry(id).or_default();
                state.candidate_sends.push(opref);
                if completed && executed {
                    state.executed_sends.push(opref);
                }
            }
            ChannelOpKind::Recv => {
                if observed_closed && completed && executed && self.scenarios.enabled('r') {
                    let close = already_closed.map(|c| vec![c.key]).unwrap_or_default();
                    self.report(BugKind::RecvOnClosed, vec![event.key()], close);
                }
                let state = self.channels.entry(id).or_default();
                state.candidate_recvs.push(opref);
                if completed && executed {
                    state.executed_recvs.push(opref);
                }
            }
        }
    }

    fn consume_mutex_op(&mut self, event: &Event, id: ObjectId, op: MutexOpKind, suc: bool) {
        let completed = event.t_post != 0;
        let opref = OpRef::of(event);
        if op.is_acquire() {
            if !completed || (op.is_try() && !suc) {
                return;
            }
            // resource graph: an edge from every mutex this routine
            // already holds to the one it just acquired
            let held = self.held_by_routine.entry(event.routine).or_default();
            for (held_id, held_ref) in held.iter() {
                self.lock_edges.push(LockEdge {
                    from: *held_id,
                    to: id,
                    routine: event.routine,
                    held: *held_ref,
                    acquire: opref,
                });
            }
            held.push((id, opref));
            let state = self.mutexes.entry(id).or_default();
            state.held.push((event.routine, opref, op));
            if !op.is_read() {
                state.last_lock = Some(opref);
            }
        } else {
            let state = self.mutexes.entry(id).or_default();
            let want_read = op.is_read();
            let held_idx = state
                .held
                .iter()
                .rposition(|(_, _, held_op)| held_op.is_read() == want_read);
            match held_idx {
                Some(idx) => {
                    let (_, lock, _) = state.held.remove(idx);
                    state.releases.push((opref, lock));
                    if let Some(held) = self.held_by_routine.get_mut(&lock.routine) {
                        if let Some(pos) = held.iter().position(|(hid, h)| *hid == id && h.key == lock.key)
                        {
                            held.remove(pos);
                        }
                    }
                }
                None => {
                    if self.scenarios.enabled('u') {
                        self.report(BugKind::UnlockOfUnlocked, vec![event.key()], vec![]);
                    }
                }
            }
        }
    }

    /// Post-pass checks over the accumulated state
    fn finish(&mut self) {
        self.check_closed_channel_predictions();
        self.check_concurrent_recv();
        self.check_select_partners();
        self.check_possible_negative_wait_group();
        self.check_unlock_before_lock();
        self.check_cyclic_deadlock();
        self.check_leaks();
    }

    /// Possible send/recv on closed: the close is HB-concurrent with an
    /// operation that completed before it in the recorded run.
    fn check_closed_channel_predictions(&mut self) {
        let mut found = Vec::new();
        for state in self.channels.values() {
            let Some(close) = state.closed_by else { continue };
            if self.scenarios.enabled('s') {
                for send in &state.executed_sends {
                    if send.time < close.time && self.hb.concurrent(send.key, close.key) {
                        found.push((BugKind::PossibleSendOnClosed, send.key, close.key));
                    }
                }
            }
            if self.scenarios.enabled('r') {
                for recv in &state.executed_recvs {
                    if recv.time < close.time && self.hb.concurrent(recv.key, close.key) {
                        found.push((BugKind::PossibleRecvOnClosed, recv.key, close.key));
                    }
                }
            }
        }
        for (kind, primary, secondary) in found {
            self.report(kind, vec![primary], vec![secondary]);
        }
    }

    /// Two receives on the same channel that are HB-concurrent
    fn check_concurrent_recv(&mut self) {
        if !self.scenarios.enabled('b') {
            return;
        }
        let mut found = Vec::new();
        for state in self.channels.values() {
            for (i, a) in state.executed_recvs.iter().enumerate() {
                for b in state.executed_recvs.iter().skip(i + 1) {
                    if a.routine != b.routine && self.hb.concurrent(a.key, b.key) {
                        found.push((a.key, b.key));
                    }
                }
            }
        }
        for (a, b) in found {
            self.report(BugKind::ConcurrentRecv, vec![a], vec![b]);
        }
    }

    /// Selects with a case that has no potential partner anywhere
    fn check_select_partners(&mut self) {
        if !self.scenarios.enabled('b') {
            return;
        }
        let mut found = Vec::new();
        for select_key in &self.selects {
            let Some(event) = self.trace.event(*select_key) else {
                continue;
            };
            let EventKind::Select { cases, .. } = &event.kind else {
                continue;
            };
            for case in cases {
                if case.channel == 0 {
                    found.push(*select_key);
                    break;
                }
                let Some(state) = self.channels.get(&case.channel) else {
                    found.push(*select_key);
                    break;
                };
                let candidates = match case.op {
                    ChannelOpKind::Send => &state.candidate_recvs,
                    ChannelOpKind::Recv => &state.candidate_sends,
                    ChannelOpKind::Close => continue,
                };
                let has_partner = candidates
                    .iter()
                    .any(|c| c.key != *select_key && c.routine != select_key.routine);
                if !has_partner {
                    found.push(*select_key);
                    break;
                }
            }
        }
        for key in found {
            self.report(BugKind::SelectWithoutPartner, vec![key], vec![]);
        }
    }

    /// A Done may underflow the counter in some HB-consistent
    /// linearization: the adds guaranteed to precede it do not cover the
    /// dones that may precede it.
    fn check_possible_negative_wait_group(&mut self) {
        if !self.scenarios.enabled('w') {
            return;
        }
        let mut found = Vec::new();
        for state in self.wait_groups.values() {
            for (done, delta, value) in state.changes.iter().filter(|(_, d, _)| *d < 0) {
                if *value < 0 {
                    continue; // already reported as actual
                }
                let mut guaranteed_adds = 0i64;
                let mut possible_dones = 0i64;
                let mut concurrent_adds = Vec::new();
                for (other, other_delta, _) in &state.changes {
                    if other.key == done.key {
                        continue;
                    }
                    if *other_delta > 0 {
                        if self.hb.before_or_equal(other.key, done.key) {
                            guaranteed_adds += other_delta;
                        } else if self.hb.concurrent(other.key, done.key) {
                            concurrent_adds.push(other.key);
                        }
                    } else if self.hb.relation(done.key, other.key) != HbRelation::Before {
                        // the other done is before or concurrent with this
                        // one, so it may precede it in some linearization
                        possible_dones += -other_delta;
                    }
                }
                if !concurrent_adds.is_empty()
                    && guaranteed_adds - possible_dones < -delta
                {
                    found.push((done.key, concurrent_adds));
                }
            }
        }
        for (done, adds) in found {
            self.report(BugKind::PossibleNegativeWaitGroup, vec![done], adds);
        }
    }

    /// An unlock that is HB-concurrent with the lock it releases could
    /// run first under another schedule.
    fn check_unlock_before_lock(&mut self) {
        if !self.scenarios.enabled('u') {
            return;
        }
        let mut found = Vec::new();
        for state in self.mutexes.values() {
            for (unlock, lock) in &state.releases {
                if self.hb.concurrent(unlock.key, lock.key) {
                    found.push((unlock.key, lock.key));
                }
            }
        }
        for (unlock, lock) in found {
            self.report(BugKind::UnlockBeforeLock, vec![unlock], vec![lock]);
        }
    }

    /// Cycles in the resource graph whose acquisitions are mutually
    /// HB-concurrent across distinct routines.
    fn check_cyclic_deadlock(&mut self) {
        if !self.scenarios.enabled('c') || self.lock_edges.is_empty() {
            return;
        }
        const MAX_CYCLE: usize = 6;
        let mut adjacency: HashMap<ObjectId, Vec<usize>> = HashMap::new();
        for (i, edge) in self.lock_edges.iter().enumerate() {
            adjacency.entry(edge.from).or_default().push(i);
        }
        let mut found: Vec<Vec<usize>> = Vec::new();
        let starts: BTreeSet<ObjectId> = self.lock_edges.iter().map(|e| e.from).collect();
        for start in starts {
            let mut path = Vec::new();
            self.find_cycles(start, start, &adjacency, &mut path, &mut found, MAX_CYCLE);
        }
        let mut bugs = Vec::new();
        for cycle in found {
            let edges: Vec<&LockEdge> = cycle.iter().map(|i| &self.lock_edges[*i]).collect();
            let routines: HashSet<RoutineId> = edges.iter().map(|e| e.routine).collect();
            if routines.len() < 2 || routines.len() != edges.len() {
                continue;
            }
            let acquires: Vec<EventKey> = edges.iter().map(|e| e.acquire.key).collect();
            let pairwise_concurrent = acquires.iter().enumerate().all(|(i, a)| {
                acquires
                    .iter()
                    .skip(i + 1)
                    .all(|b| self.hb_weak.concurrent(*a, *b))
            });
            if pairwise_concurrent {
                debug!("deadlock candidate over {} mutexes", edges.len());
                let helds: Vec<EventKey> = edges.iter().map(|e| e.held.key).collect();
                bugs.push((acquires, helds));
            }
        }
        for (acquires, helds) in bugs {
            self.report(BugKind::CyclicDeadlock, acquires, helds);
        }
    }

    fn find_cycles(
        &self,
        start: ObjectId,
        current: ObjectId,
        adjacency: &HashMap<ObjectId, Vec<usize>>,
        path: &mut Vec<usize>,
        found: &mut Vec<Vec<usize>>,
        limit: usize,
    ) {
        if path.len() >= limit {
            return;
        }
        let Some(edges) = adjacency.get(&current) else {
            return;
        };
        for &edge_idx in edges {
            let edge = &self.lock_edges[edge_idx];
            if path.iter().any(|i| *i == edge_idx) {
                continue;
            }
            if edge.to == start && !path.is_empty() {
                // only report each cycle once, from its smallest mutex
                if path
                    .iter()
                    .chain(std::iter::once(&edge_idx))
                    .map(|i| self.lock_edges[*i].from)
                    .min()
                    == Some(start)
                {
                    let mut cycle = path.clone();
                    cycle.push(edge_idx);
                    found.push(cycle);
                }
                continue;
            }
            // never revisit a mutex inside one path
            if edge.to == start || path.iter().any(|i| self.lock_edges[*i].from == edge.to) {
                continue;
            }
            path.push(edge_idx);
            self.find_cycles(start, edge.to, adjacency, path, found, limit);
            path.pop();
        }
    }

    /// Classify every operation that never completed
    fn check_leaks(&mut self) {
        if !self.scenarios.enabled('l') {
            return;
        }
        let mut found = Vec::new();
        for key in &self.blocked {
            let Some(event) = self.trace.event(*key) else {
                continue;
            };
            let (kind, partner) = self.classify_leak(event);
            found.push((kind, *key, partner));
        }
        for (kind, key, partner) in found {
            let secondary = partner.map(|p| vec![p]).unwrap_or_default();
            self.report(kind, vec![key], secondary);
        }
    }

    fn classify_leak(&self, event: &Event) -> (BugKind, Option<EventKey>) {
        match &event.kind {
            EventKind::Channel { id, op, qsize, .. } => {
                if *id == 0 {
                    return (BugKind::LeakNilChannel, None);
                }
                if is_context_position(&event.pos) {
                    return (BugKind::LeakContext, None);
                }
                let partner = self.leak_partner(event.key(), *id, *op);
                let kind = match (qsize, partner.is_some()) {
                    (0, true) => BugKind::LeakUnbufferedWith,
                    (0, false) => BugKind::LeakUnbufferedWithout,
                    (_, true) => BugKind::LeakBufferedWith,
                    (_, false) => BugKind::LeakBufferedWithout,
                };
                (kind, partner)
            }
            EventKind::Select { cases, .. } => {
                if cases.iter().all(|c| c.channel == 0) && !cases.is_empty() {
                    return (BugKind::LeakNilChannel, None);
                }
                if is_context_position(&event.pos)
                    || cases.iter().any(|c| is_context_position(&c.pos))
                {
                    return (BugKind::LeakContext, None);
                }
                for case in cases {
                    if case.channel == 0 {
                        continue;
                    }
                    if let Some(partner) = self.leak_partner(event.key(), case.channel, case.op) {
                        return (BugKind::LeakSelectWith, Some(partner));
                    }
                }
                (BugKind::LeakSelectWithout, None)
            }
            EventKind::Mutex { .. } => (BugKind::LeakMutex, None),
            EventKind::WaitGroup { .. } => (BugKind::LeakWaitGroup, None),
            EventKind::Cond { op, .. } if *op == CondOpKind::Wait => (BugKind::LeakCond, None),
            _ => (BugKind::LeakUnknown, None),
        }
    }

    /// A possible partner for a stuck channel op: a complementary
    /// operation in another routine, HB-concurrent with the stuck one.
    fn leak_partner(
        &self,
        stuck: EventKey,
        channel: ObjectId,
        op: ChannelOpKind,
    ) -> Option<EventKey> {
        let state = self.channels.get(&channel)?;
        let candidates = match op {
            ChannelOpKind::Send => &state.candidate_recvs,
            ChannelOpKind::Recv => &state.candidate_sends,
            ChannelOpKind::Close => return None,
        };
        candidates
            .iter()
            .find(|c| {
                c.key != stuck
                    && c.routine != stuck.routine
                    && self.hb.concurrent(c.key, stuck)
            })
            .map(|c| c.key)
    }

    /// Record a bug, deduplicated by the tuple of implicated positions
    fn report(&mut self, kind: BugKind, primary: Vec<EventKey>, secondary: Vec<EventKey>) {
        let mut positions: Vec<String> = primary
            .iter()
            .chain(secondary.iter())
            .map(|key| {
                self.trace
                    .event(*key)
                    .map(|e| e.pos.key())
                    .unwrap_or_default()
            })
            .collect();
        positions.sort();
        let dedup_key = format!("{}|{}", kind.code(), positions.join(";"));
        if !self.dedup.insert(dedup_key) {
            return;
        }
        debug!("found {} ({})", kind.code(), kind.name());
        self.bugs.push(Bug::new(kind, primary, secondary));
    }

    fn into_bugs(self) -> Vec<Bug> {
        self.bugs
    }
}

/// Context-derived primitives are recognized by their source path
fn is_context_position(pos: &Position) -> bool {
    pos.file
        .split(['/', '\\'])
        .any(|segment| segment == "context" || segment == "context.go")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Position;

    fn event(routine: RoutineId, t_pre: Time, t_post: Time, line: u32, kind: EventKind) -> Event {
        Event {
            routine,
            t_pre,
            t_post,
            pos: Position::new("main.go", line),
            kind,
        }
    }

    fn channel(
        routine: RoutineId,
        t_pre: Time,
        t_post: Time,
        line: u32,
        id: ObjectId,
        op: ChannelOpKind,
        op_id: u64,
        qsize: u64,
    ) -> Event {
        event(
            routine,
            t_pre,
            t_post,
            line,
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

    fn kinds(analysis: &Analysis) -> Vec<BugKind> {
        analysis.bugs.iter().map(|b| b.kind).collect()
    }

    #[test]
    fn test_actual_send_on_closed() {
        let mut trace = Trace::new();
        trace
            .add(channel(1, 2, 2, 10, 5, ChannelOpKind::Close, 0, 0))
            .unwrap();
        trace
            .add(channel(2, 4, 6, 20, 5, ChannelOpKind::Send, 1, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert!(kinds(&analysis).contains(&BugKind::SendOnClosed));
    }

    #[test]
    fn test_possible_send_on_closed_when_concurrent() {
        let mut trace = Trace::new();
        // send completes first but is concurrent with the close
        trace
            .add(channel(1, 2, 4, 10, 5, ChannelOpKind::Send, 1, 1))
            .unwrap();
        trace
            .add(channel(2, 6, 6, 20, 5, ChannelOpKind::Close, 0, 1))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert!(kinds(&analysis).contains(&BugKind::PossibleSendOnClosed));
        assert!(!kinds(&analysis).contains(&BugKind::SendOnClosed));
    }

    #[test]
    fn test_no_prediction_when_ordered_by_hb() {
        let mut trace = Trace::new();
        // rendezvous orders routine 2's close after the send
        trace
            .add(channel(1, 2, 8, 10, 5, ChannelOpKind::Send, 1, 0))
            .unwrap();
        trace
            .add(channel(2, 4, 8, 20, 5, ChannelOpKind::Recv, 1, 0))
            .unwrap();
        trace
            .add(channel(2, 10, 10, 21, 5, ChannelOpKind::Close, 0, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert!(!kinds(&analysis).contains(&BugKind::PossibleSendOnClosed));
    }

    #[test]
    fn test_close_on_closed_and_nil() {
        let mut trace = Trace::new();
        trace
            .add(channel(1, 2, 2, 10, 5, ChannelOpKind::Close, 0, 0))
            .unwrap();
        trace
            .add(channel(1, 4, 4, 11, 5, ChannelOpKind::Close, 0, 0))
            .unwrap();
        trace
            .add(channel(1, 6, 6, 12, 0, ChannelOpKind::Close, 0, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert!(kinds(&analysis).contains(&BugKind::CloseOnClosed));
        assert!(kinds(&analysis).contains(&BugKind::CloseOnNil));
    }

    #[test]
    fn test_actual_negative_wait_group() {
        let mut trace = Trace::new();
        trace
            .add(event(
                1,
                2,
                2,
                10,
                EventKind::WaitGroup {
                    id: 3,
                    op: WaitGroupOpKind::AddOrDone,
                    delta: -1,
                    value: -1,
                },
            ))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert_eq!(kinds(&analysis), vec![BugKind::NegativeWaitGroup]);
    }

    #[test]
    fn test_possible_negative_wait_group() {
        let mut trace = Trace::new();
        // add in routine 1 concurrent with done in routine 2
        trace
            .add(event(
                1,
                2,
                2,
                10,
                EventKind::WaitGroup {
                    id: 3,
                    op: WaitGroupOpKind::AddOrDone,
                    delta: 1,
                    value: 1,
                },
            ))
            .unwrap();
        trace
            .add(event(
                2,
                4,
                4,
                20,
                EventKind::WaitGroup {
                    id: 3,
                    op: WaitGroupOpKind::AddOrDone,
                    delta: -1,
                    value: 0,
                },
            ))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert!(kinds(&analysis).contains(&BugKind::PossibleNegativeWaitGroup));
    }

    #[test]
    fn test_unlock_of_unlocked() {
        let mut trace = Trace::new();
        trace
            .add(event(
                1,
                2,
                4,
                10,
                EventKind::Mutex {
                    id: 7,
                    rw: false,
                    op: MutexOpKind::Unlock,
                    suc: true,
                },
            ))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert_eq!(kinds(&analysis), vec![BugKind::UnlockOfUnlocked]);
    }

    #[test]
    fn test_cyclic_deadlock_detection() {
        let mut trace = Trace::new();
        let lock = |routine, t_pre, t_post, line, id| {
            event(
                routine,
                t_pre,
                t_post,
                line,
                EventKind::Mutex {
                    id,
                    rw: false,
                    op: MutexOpKind::Lock,
                    suc: true,
                },
            )
        };
        let unlock = |routine, t_pre, t_post, line, id| {
            event(
                routine,
                t_pre,
                t_post,
                line,
                EventKind::Mutex {
                    id,
                    rw: false,
                    op: MutexOpKind::Unlock,
                    suc: true,
                },
            )
        };
        // routine 1: lock m1 then m2; routine 2: lock m2 then m1
        trace.add(lock(1, 2, 4, 10, 100)).unwrap();
        trace.add(lock(1, 6, 8, 11, 200)).unwrap();
        trace.add(unlock(1, 10, 12, 12, 200)).unwrap();
        trace.add(unlock(1, 14, 16, 13, 100)).unwrap();
        trace.add(lock(2, 18, 20, 20, 200)).unwrap();
        trace.add(lock(2, 22, 24, 21, 100)).unwrap();
        trace.add(unlock(2, 26, 28, 22, 100)).unwrap();
        trace.add(unlock(2, 30, 32, 23, 200)).unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let deadlocks: Vec<&Bug> = analysis
            .bugs
            .iter()
            .filter(|b| b.kind == BugKind::CyclicDeadlock)
            .collect();
        assert_eq!(deadlocks.len(), 1);
        assert_eq!(deadlocks[0].primary.len(), 2);
    }

    #[test]
    fn test_no_deadlock_when_ordered() {
        let mut trace = Trace::new();
        let lock = |routine, t_pre, t_post, line, id| {
            event(
                routine,
                t_pre,
                t_post,
                line,
                EventKind::Mutex {
                    id,
                    rw: false,
                    op: MutexOpKind::Lock,
                    suc: true,
                },
            )
        };
        // both routines take m1 then m2; no reversed order
        trace.add(lock(1, 2, 4, 10, 100)).unwrap();
        trace.add(lock(1, 6, 8, 11, 200)).unwrap();
        trace.add(lock(2, 20, 22, 20, 100)).unwrap();
        trace.add(lock(2, 24, 26, 21, 200)).unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert!(!kinds(&analysis).contains(&BugKind::CyclicDeadlock));
    }

    #[test]
    fn test_leak_unbuffered_with_and_without_partner() {
        let mut trace = Trace::new();
        // stuck send on channel 5, concurrent recv exists in routine 2
        trace
            .add(channel(1, 2, 0, 10, 5, ChannelOpKind::Send, 0, 0))
            .unwrap();
        trace
            .add(channel(2, 4, 0, 20, 5, ChannelOpKind::Recv, 0, 0))
            .unwrap();
        // stuck send on channel 6, nobody ever receives
        trace
            .add(channel(3, 6, 0, 30, 6, ChannelOpKind::Send, 0, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let got = kinds(&analysis);
        assert!(got.contains(&BugKind::LeakUnbufferedWith));
        assert!(got.contains(&BugKind::LeakUnbufferedWithout));
    }

    #[test]
    fn test_leak_mutex_and_wait_group() {
        let mut trace = Trace::new();
        trace
            .add(event(
                1,
                2,
                0,
                10,
                EventKind::Mutex {
                    id: 7,
                    rw: false,
                    op: MutexOpKind::Lock,
                    suc: false,
                },
            ))
            .unwrap();
        trace
            .add(event(
                2,
                4,
                0,
                20,
                EventKind::WaitGroup {
                    id: 9,
                    op: WaitGroupOpKind::Wait,
                    delta: 0,
                    value: 1,
                },
            ))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let got = kinds(&analysis);
        assert!(got.contains(&BugKind::LeakMutex));
        assert!(got.contains(&BugKind::LeakWaitGroup));
    }

    #[test]
    fn test_leak_context_classification() {
        let mut trace = Trace::new();
        trace
            .add(Event {
                routine: 1,
                t_pre: 2,
                t_post: 0,
                pos: Position::new("go/src/context/context.go", 300),
                kind: EventKind::Channel {
                    id: 5,
                    op: ChannelOpKind::Recv,
                    closed: false,
                    op_id: 0,
                    qsize: 0,
                    qcount: 0,
                },
            })
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        assert_eq!(kinds(&analysis), vec![BugKind::LeakContext]);
    }

    #[test]
    fn test_scenario_filtering() {
        let mut trace = Trace::new();
        trace
            .add(channel(1, 2, 2, 10, 5, ChannelOpKind::Close, 0, 0))
            .unwrap();
        trace
            .add(channel(2, 4, 6, 20, 5, ChannelOpKind::Send, 1, 0))
            .unwrap();
        let only_leaks = ScenarioSet::from_flags("l").unwrap();
        let analysis = run_analysis(&trace, &only_leaks);
        assert!(!kinds(&analysis).contains(&BugKind::SendOnClosed));
    }

    #[test]
    fn test_dedup_by_position() {
        let mut trace = Trace::new();
        trace
            .add(channel(1, 2, 2, 10, 5, ChannelOpKind::Close, 0, 0))
            .unwrap();
        // two sends from the same source position
        trace
            .add(channel(2, 4, 6, 20, 5, ChannelOpKind::Send, 1, 0))
            .unwrap();
        trace
            .add(channel(2, 8, 10, 20, 5, ChannelOpKind::Send, 2, 0))
            .unwrap();
        let analysis = run_analysis(&trace, &ScenarioSet::all());
        let sends: Vec<&Bug> = analysis
            .bugs
            .iter()
            .filter(|b| b.kind == BugKind::SendOnClosed)
            .collect();
        assert_eq!(sends.len(), 1);
    }

    #[test]
    fn test_scenario_flags_reject_unknown() {
        assert!(ScenarioSet::from_flags("xyz").is_err());
        assert!(ScenarioSet::from_flags("sr").is_ok());
    }
}

//! Cooperative replay scheduler
//!
//! A single manager owns the flattened, ordered trace and an index into
//! it. Program routines run as host threads but synchronize through the
//! gates: only one routine at a time holds a release, so primitive
//! operations serialize in the recorded order. Deviation is handled by
//! three timeouts (per-ack, per-same-key stall, per-idle disable) and a
//! pseudo-random stall breaker that either skips the trace head or
//! releases the oldest waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{bounded, Receiver};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::replay::exit_code::ExitCode;
use crate::replay::gate::{
    AckToken, GateDecision, ReleaseSignal, ReplayElement, ReplayOp, WaitHandle,
};
use crate::rewrite::{ActiveMap, RewrittenTrace};
use crate::trace::{EventKind, Time, Trace};

/// Tuning knobs of the replay manager
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// How long to wait for a released gate's acknowledgement
    pub ack_timeout: Duration,
    /// How long the head of the trace may stall before the manager
    /// skips it or releases the oldest waiter; decays on each breaker
    pub release_oldest_wait: Duration,
    /// Idle time without any gate activity before replay disables itself
    pub max_no_wait: Duration,
    /// Polling interval of the manager loop
    pub spin_interval: Duration,
    /// Suppress gating of atomic operations
    pub ignore_atomics: bool,
    /// Sleep injected by flow mutations
    pub flow_delay: Duration,
    /// Interval between the two stuck-routine samples of the cyclic
    /// deadlock confirmation
    pub cyclic_sample_interval: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(1),
            release_oldest_wait: Duration::from_millis(500),
            max_no_wait: Duration::from_secs(10),
            spin_interval: Duration::from_millis(1),
            ignore_atomics: false,
            flow_delay: Duration::from_secs(3),
            cyclic_sample_interval: Duration::from_millis(100),
        }
    }
}

impl ReplayConfig {
    /// Fast timeouts for tests and short traces
    pub fn snappy() -> Self {
        Self {
            ack_timeout: Duration::from_millis(100),
            release_oldest_wait: Duration::from_millis(50),
            max_no_wait: Duration::from_millis(500),
            spin_interval: Duration::from_micros(200),
            flow_delay: Duration::from_millis(50),
            cyclic_sample_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_ignore_atomics(mut self, ignore: bool) -> Self {
        self.ignore_atomics = ignore;
        self
    }

    pub fn with_max_no_wait(mut self, timeout: Duration) -> Self {
        self.max_no_wait = timeout;
        self
    }
}

/// GFuzz mode: preferred select cases per source position
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SelectPreferences {
    map: HashMap<String, Vec<usize>>,
    pub delay: Duration,
}

impl SelectPreferences {
    pub fn new(delay: Duration) -> Self {
        Self {
            map: HashMap::new(),
            delay,
        }
    }

    pub fn prefer(&mut self, pos_key: &str, cases: Vec<usize>) {
        self.map.insert(pos_key.to_string(), cases);
    }

    pub fn get(&self, pos_key: &str) -> Option<&Vec<usize>> {
        self.map.get(pos_key)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Flow mode: positions whose n-th occurrence gets delayed
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FlowDelays {
    map: HashMap<String, Vec<u64>>,
}

impl FlowDelays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(&mut self, pos_key: &str, occurrence: u64) {
        let list = self.map.entry(pos_key.to_string()).or_default();
        if !list.contains(&occurrence) {
            list.push(occurrence);
        }
    }

    pub fn contains(&self, pos_key: &str, occurrence: u64) -> bool {
        self.map
            .get(pos_key)
            .is_some_and(|list| list.contains(&occurrence))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = (&str, &[u64])> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

struct Waiter {
    op: ReplayOp,
    release_tx: crossbeam::channel::Sender<ReleaseSignal>,
    ack_rx: Option<Receiver<()>>,
    enqueued: Instant,
    serial: u64,
}

struct ManagerState {
    index: usize,
    /// Ack the manager still owes a wait on
    pending_ack: Option<Receiver<()>>,
    /// Partial replay switched on (trace passed `start_time_active`)
    partial_entered: bool,
    head_since: Instant,
    last_activity: Instant,
    /// Current stall threshold; decays on every breaker activation
    release_oldest_wait: Duration,
}

struct ManagerInner {
    elements: Vec<ReplayElement>,
    enabled: AtomicBool,
    state: Mutex<ManagerState>,
    waiting: Mutex<HashMap<String, Vec<Waiter>>>,
    /// Per-position gate arrival counts
    occurrences: Mutex<HashMap<String, u64>>,
    waiter_serial: AtomicU64,
    rng_state: AtomicU64,
    config: ReplayConfig,
    /// Strict fragment for partial replay
    active: Option<ActiveMap>,
    start_time_active: Time,
    gfuzz: Option<SelectPreferences>,
    flow: Option<FlowDelays>,
}

/// The runtime-side scheduler gating every primitive on the trace
#[derive(Clone)]
pub struct ReplayManager {
    inner: Arc<ManagerInner>,
}

impl ReplayManager {
    /// Manager for a full strict replay of a trace
    pub fn new(trace: &Trace, config: ReplayConfig) -> Self {
        Self::build(trace, config, None, 0, None, None)
    }

    /// Manager for a rewritten trace with partial replay
    pub fn for_rewrite(rewrite: &RewrittenTrace, config: ReplayConfig) -> Self {
        Self::build(
            &rewrite.trace,
            config,
            Some(rewrite.active.clone()),
            rewrite.start_time_active,
            None,
            None,
        )
    }

    /// Manager in GFuzz mode: no trace enforcement, selects wait for
    /// their preferred case first.
    pub fn for_select_preferences(preferences: SelectPreferences, config: ReplayConfig) -> Self {
        Self::build(&Trace::new(), config, None, 0, Some(preferences), None)
    }

    /// Manager in flow mode: no trace enforcement, delays injected at
    /// the listed occurrences.
    pub fn for_flow(delays: FlowDelays, config: ReplayConfig) -> Self {
        Self::build(&Trace::new(), config, None, 0, None, Some(delays))
    }

    fn build(
        trace: &Trace,
        config: ReplayConfig,
        active: Option<ActiveMap>,
        start_time_active: Time,
        gfuzz: Option<SelectPreferences>,
        flow: Option<FlowDelays>,
    ) -> Self {
        let elements = flatten(trace);
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
            | 1;
        // a fragment starting at the very first element means the whole
        // replay runs in the partial phase
        let partial_from_start = active.is_some()
            && elements
                .first()
                .map_or(false, |e| e.time >= start_time_active);
        let now = Instant::now();
        Self {
            inner: Arc::new(ManagerInner {
                elements,
                enabled: AtomicBool::new(true),
                state: Mutex::new(ManagerState {
                    index: 0,
                    pending_ack: None,
                    partial_entered: partial_from_start,
                    head_since: now,
                    last_activity: now,
                    release_oldest_wait: config.release_oldest_wait,
                }),
                waiting: Mutex::new(HashMap::new()),
                occurrences: Mutex::new(HashMap::new()),
                waiter_serial: AtomicU64::new(0),
                rng_state: AtomicU64::new(seed),
                config,
                active,
                start_time_active,
                gfuzz,
                flow,
            }),
        }
    }

    /// Whether the manager is still steering gates
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// The gate every instrumented primitive enters between its pre
    /// hook and the actual operation.
    pub fn gate(&self, op: ReplayOp, file: &str, line: u32, want_ack: bool) -> GateDecision {
        if !self.is_enabled() {
            return GateDecision::Proceed;
        }
        let pos_key = format!("{}:{}", file, line);
        let occurrence = {
            let mut occurrences = self.inner.occurrences.lock();
            let counter = occurrences.entry(pos_key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.inner.state.lock().last_activity = Instant::now();

        // flow mode: inject the delay, then run freely
        if let Some(flow) = &self.inner.flow {
            if flow.contains(&pos_key, occurrence) {
                debug!("flow delay at {} (occurrence {})", pos_key, occurrence);
                thread::sleep(self.inner.config.flow_delay);
            }
            if self.inner.elements.is_empty() {
                return GateDecision::Proceed;
            }
        }

        // GFuzz mode: hand the select its preferred cases
        if op == ReplayOp::Select {
            if let Some(preferences) = &self.inner.gfuzz {
                if let Some(cases) = preferences.get(&pos_key) {
                    return GateDecision::Prefer {
                        cases: cases.clone(),
                        delay: preferences.delay,
                    };
                }
            }
        }
        if self.inner.gfuzz.is_some() && self.inner.elements.is_empty() {
            return GateDecision::Proceed;
        }

        if self.inner.elements.is_empty() {
            return GateDecision::Proceed;
        }
        if self.inner.config.ignore_atomics && op.is_atomic() {
            return GateDecision::Proceed;
        }
        // partial replay: outside the active fragment everything passes
        if let Some(active) = &self.inner.active {
            let partial = self.inner.state.lock().partial_entered;
            if !partial {
                return GateDecision::Proceed;
            }
            if !active.contains(&pos_key, occurrence) {
                return GateDecision::Proceed;
            }
        }

        let (release_tx, release_rx) = bounded(1);
        let (ack_tx, ack_rx) = bounded(1);
        let (ack_tx, ack_rx) = if want_ack {
            (Some(ack_tx), Some(ack_rx))
        } else {
            (None, None)
        };

        // direct-release fast path: the arriving gate is the head of the
        // trace and nothing is pending ack
        {
            let mut state = self.inner.state.lock();
            if state.pending_ack.is_none() && state.index < self.inner.elements.len() {
                let head = &self.inner.elements[state.index];
                if head.exit.is_none() && !head.blocked && head.pos_key == pos_key {
                    let element = head.clone();
                    state.index += 1;
                    state.head_since = Instant::now();
                    state.pending_ack = ack_rx;
                    let _ = release_tx.send(ReleaseSignal {
                        element: Some(element),
                        blocked: true,
                    });
                    return GateDecision::Wait(WaitHandle {
                        release_rx,
                        ack_tx,
                    });
                }
            }
        }

        let waiter = Waiter {
            op,
            release_tx,
            ack_rx,
            enqueued: Instant::now(),
            serial: self.inner.waiter_serial.fetch_add(1, Ordering::Relaxed),
        };
        self.inner
            .waiting
            .lock()
            .entry(pos_key)
            .or_default()
            .push(waiter);
        GateDecision::Wait(WaitHandle {
            release_rx,
            ack_tx,
        })
    }

    /// Convenience wrapper matching the instrumentation contract
    pub fn wait_for_replay(
        &self,
        op: ReplayOp,
        file: &str,
        line: u32,
        want_ack: bool,
    ) -> Option<(ReleaseSignal, Option<AckToken>)> {
        match self.gate(op, file, line, want_ack) {
            GateDecision::Proceed => None,
            GateDecision::Wait(handle) => Some(handle.wait()),
            GateDecision::Prefer { .. } => None,
        }
    }

    /// Broadcast pass-through to every parked gate and stop steering
    pub fn disable_replay(&self) {
        if self.inner.enabled.swap(false, Ordering::AcqRel) {
            info!("replay disabled, releasing all waiters");
        }
        let mut waiting = self.inner.waiting.lock();
        for (_, waiters) in waiting.drain() {
            for waiter in waiters {
                let _ = waiter.release_tx.send(ReleaseSignal {
                    element: None,
                    blocked: false,
                });
            }
        }
    }

    /// Map an intercepted panic to the exit taxonomy and stop the
    /// replay. Single choke point for panic classification.
    pub fn report_panic(&self, message: &str) -> ExitCode {
        let code = ExitCode::from_panic_message(message);
        warn!("panic intercepted: {} -> exit {}", message, code.code());
        self.disable_replay();
        code
    }

    /// Run the manager loop on the calling thread until the trace is
    /// exhausted, an end marker fires, or replay disables itself.
    pub fn run(&self) -> ExitCode {
        loop {
            if !self.is_enabled() {
                return ExitCode::Unconfirmed;
            }

            // collect an outstanding ack first
            let pending = self.inner.state.lock().pending_ack.take();
            if let Some(ack) = pending {
                if ack.recv_timeout(self.inner.config.ack_timeout).is_err() {
                    debug!("ack timeout, continuing anyway");
                }
                continue;
            }

            let (element, stalled_for, idle_for, oldest_wait) = {
                let state = self.inner.state.lock();
                if state.index >= self.inner.elements.len() {
                    drop(state);
                    self.disable_replay();
                    return ExitCode::Unconfirmed;
                }
                (
                    self.inner.elements[state.index].clone(),
                    state.head_since.elapsed(),
                    state.last_activity.elapsed(),
                    state.release_oldest_wait,
                )
            };

            // end marker
            if let Some(exit) = element.exit {
                return self.handle_end_marker(exit);
            }

            // ignorable under atomic suppression
            if self.inner.config.ignore_atomics
                && element.op.is_some_and(|op| op.is_atomic())
            {
                self.advance();
                continue;
            }

            // recorded as blocked forever: the routine is supposed to be
            // stuck here, so its gate stays parked (the cyclic
            // confirmation samples exactly these waiters)
            if element.blocked {
                self.advance();
                continue;
            }

            // partial replay phase switch
            if self.inner.active.is_some() {
                let entered = {
                    let mut state = self.inner.state.lock();
                    if !state.partial_entered && element.time >= self.inner.start_time_active {
                        state.partial_entered = true;
                        true
                    } else {
                        false
                    }
                };
                if entered {
                    self.release_not_active();
                }
                let partial = self.inner.state.lock().partial_entered;
                if !partial {
                    // everything before the frontier runs freely
                    self.advance();
                    continue;
                }
                if let Some(active) = &self.inner.active {
                    if !active.contains(&element.pos_key, element.occurrence) {
                        self.advance();
                        continue;
                    }
                }
            }

            // wake the matching waiter
            if self.release_waiter_at(&element.pos_key, &element) {
                self.advance();
                continue;
            }

            // nobody there yet: spin, then break the stall
            if stalled_for > oldest_wait {
                self.break_stall(&element);
                continue;
            }
            if idle_for > self.inner.config.max_no_wait {
                info!("no gate activity for {:?}, disabling replay", idle_for);
                self.disable_replay();
                return ExitCode::Unconfirmed;
            }
            thread::sleep(self.inner.config.spin_interval);
        }
    }

    /// Run the manager on a dedicated thread
    pub fn start(&self) -> thread::JoinHandle<ExitCode> {
        let manager = self.clone();
        thread::spawn(move || manager.run())
    }

    /// Consume the trace without a program attached, reporting the exit
    /// classification the replay would produce. Used by the CLI to
    /// validate traces; in-process replays attach real gates instead.
    pub fn dry_run(&self) -> ExitCode {
        for element in &self.inner.elements {
            if let Some(exit) = element.exit {
                if exit.is_confirmation() && !exit.is_cyclic() {
                    return exit;
                }
                if exit.is_cyclic() {
                    // without live routines there is nothing to sample
                    return ExitCode::Unconfirmed;
                }
            }
        }
        ExitCode::Unconfirmed
    }

    // -- internals ---------------------------------------------------------

    fn advance(&self) {
        let mut state = self.inner.state.lock();
        state.index += 1;
        state.head_since = Instant::now();
    }

    fn handle_end_marker(&self, exit: ExitCode) -> ExitCode {
        if exit.is_cyclic() {
            return self.confirm_cyclic();
        }
        // let in-flight releases complete before tearing down
        thread::sleep(self.inner.config.spin_interval.max(Duration::from_millis(10)));
        self.disable_replay();
        if exit.is_confirmation() {
            info!("replay reached end marker, exit {}", exit.code());
            exit
        } else {
            ExitCode::Unconfirmed
        }
    }

    /// Cyclic confirmation: sample parked lock waiters twice; a waiter
    /// present in both samples with a mutex wait reason counts as stuck.
    fn confirm_cyclic(&self) -> ExitCode {
        let sample = |manager: &Self| -> Vec<u64> {
            let waiting = manager.inner.waiting.lock();
            waiting
                .values()
                .flatten()
                .filter(|w| w.op.is_blocking_lock())
                .map(|w| w.serial)
                .collect()
        };
        let first = sample(self);
        thread::sleep(self.inner.config.cyclic_sample_interval);
        let second = sample(self);
        let stuck = second.iter().filter(|s| first.contains(s)).count();
        self.disable_replay();
        if stuck >= 1 {
            info!("cyclic deadlock confirmed: {} routine(s) stuck", stuck);
            ExitCode::CyclicDeadlock
        } else {
            ExitCode::Unconfirmed
        }
    }

    fn release_waiter_at(&self, pos_key: &str, element: &ReplayElement) -> bool {
        let waiter = {
            let mut waiting = self.inner.waiting.lock();
            match waiting.get_mut(pos_key) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };
        let Some(waiter) = waiter else {
            return false;
        };
        let _ = waiter.release_tx.send(ReleaseSignal {
            element: Some(element.clone()),
            blocked: true,
        });
        let mut state = self.inner.state.lock();
        state.last_activity = Instant::now();
        state.pending_ack = waiter.ack_rx;
        true
    }

    /// Stall breaker: pseudo-randomly either skip the head of the trace
    /// or release the oldest waiter with a synthesized element. The
    /// threshold decays so pathological stalls drain quickly.
    fn break_stall(&self, head: &ReplayElement) {
        let skip = self.coin();
        if skip {
            debug!("stall: skipping head {} ({})", head.index, head.pos_key);
            self.advance();
        } else {
            let oldest = {
                let mut waiting = self.inner.waiting.lock();
                let oldest_key = waiting
                    .iter()
                    .filter(|(_, queue)| !queue.is_empty())
                    .min_by_key(|(_, queue)| queue.iter().map(|w| w.enqueued).min())
                    .map(|(key, _)| key.clone());
                oldest_key.and_then(|key| {
                    let queue = waiting.get_mut(&key)?;
                    let idx = (0..queue.len()).min_by_key(|i| queue[*i].enqueued)?;
                    Some((key, queue.remove(idx)))
                })
            };
            match oldest {
                Some((key, waiter)) => {
                    debug!("stall: releasing oldest waiter at {}", key);
                    let synthesized = ReplayElement {
                        index: head.index,
                        routine: 0,
                        op: Some(waiter.op),
                        pos_key: key,
                        time: head.time,
                        blocked: false,
                        occurrence: 0,
                        exit: None,
                        select_case: None,
                    };
                    let _ = waiter.release_tx.send(ReleaseSignal {
                        element: Some(synthesized),
                        blocked: true,
                    });
                    let mut state = self.inner.state.lock();
                    state.pending_ack = waiter.ack_rx;
                    state.last_activity = Instant::now();
                    state.head_since = Instant::now();
                }
                None => {
                    debug!("stall with no waiters: skipping head {}", head.index);
                    self.advance();
                }
            }
        }
        let mut state = self.inner.state.lock();
        state.release_oldest_wait =
            (state.release_oldest_wait * 9 / 10).max(Duration::from_millis(20));
        state.head_since = Instant::now();
    }

    /// Release-not-active rule: when partial replay switches on, every
    /// parked waiter outside the active map becomes a pass-through.
    fn release_not_active(&self) {
        let Some(active) = &self.inner.active else {
            return;
        };
        let mut waiting = self.inner.waiting.lock();
        let keys: Vec<String> = waiting
            .keys()
            .filter(|key| !active.tracks_position(key))
            .cloned()
            .collect();
        for key in keys {
            if let Some(queue) = waiting.remove(&key) {
                for waiter in queue {
                    let _ = waiter.release_tx.send(ReleaseSignal {
                        element: None,
                        blocked: false,
                    });
                }
            }
        }
    }

    /// Nanotime-seeded xorshift coin for the stall breaker
    fn coin(&self) -> bool {
        let mut state = self.inner.rng_state.load(Ordering::Acquire);
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.inner.rng_state.store(state, Ordering::Release);
        state & 1 == 0
    }
}

/// Flatten a trace into the manager's ordered element list, counting
/// per-position occurrences the way gates will.
fn flatten(trace: &Trace) -> Vec<ReplayElement> {
    let mut elements = Vec::new();
    let mut occurrences: HashMap<String, u64> = HashMap::new();
    for event in trace.iter_sorted() {
        match &event.kind {
            EventKind::ReplayEnd { exit_code } => {
                elements.push(ReplayElement {
                    index: elements.len(),
                    routine: event.routine,
                    op: None,
                    pos_key: String::new(),
                    time: event.t_sort(),
                    blocked: false,
                    occurrence: 0,
                    exit: ExitCode::from_code(*exit_code).or(Some(ExitCode::Unconfirmed)),
                    select_case: None,
                });
            }
            _ => {
                let Some(op) = crate::replay::gate::ReplayOp::of_event(event) else {
                    continue;
                };
                let pos_key = event.pos.key();
                let counter = occurrences.entry(pos_key.clone()).or_insert(0);
                *counter += 1;
                let select_case = match &event.kind {
                    EventKind::Select { chosen, .. } => Some(*chosen),
                    _ => None,
                };
                elements.push(ReplayElement {
                    index: elements.len(),
                    routine: event.routine,
                    op: Some(op),
                    pos_key,
                    time: event.t_sort(),
                    blocked: event.is_blocked(),
                    occurrence: *counter,
                    exit: None,
                    select_case,
                });
            }
        }
    }
    elements
}

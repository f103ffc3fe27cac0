//! The per-worker-alias coordinator: owns the IPC transport, the active
//! call table, the fork policy, and promise delivery back to the parent.
//!
//! Dynamic method dispatch on an arbitrary worker object is reimplemented
//! per the REDESIGN FLAGS as a registered-operation table: each worker
//! declares its named operations explicitly, so the mediator looks the
//! handler up by string key without reflection. The inline path routes
//! directly to the same table.
//!
//! A note on the event bus: the source subscribes the mediator's
//! reconciliation steps (`pre_execute`, `post_execute`, `idle`, `stats`,
//! `reaped`) onto the daemon's shared event bus as closures. A Rust
//! `EventBus` subscriber must be `'static` and cannot also hold a second
//! `&mut ProcessTable` borrow for the dispatch's duration without shared
//! interior mutability everywhere. Rather than wrap the process table in
//! `Rc<RefCell<_>>` purely to satisfy the bus, the scheduler calls the
//! mediator's `pre_execute`/`post_execute`/`idle`/`stats` hooks directly
//! as fixed steps of its per-iteration algorithm (see `scheduler.rs`),
//! and *also* publishes the corresponding `Event` on the bus immediately
//! after so user plugins still observe the same event surface described
//! in the design. The mediator's own reconciliation is not a removable
//! plugin, so nothing is lost by wiring it this way.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;

use crate::call::{Call, CallId, CallOutcome, CallResult, CallStatus};
use crate::error::{DaemonError, ErrorCategory, ErrorCounters};
use crate::ipc::{HeaderKind, Transport};
use crate::process::{ForkBranch, ProcessTable, MIN_TIMEOUT};

const RECENT_CAPACITY: usize = 50;
const GC_INTERVAL: Duration = Duration::from_secs(30);
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);
const MAX_CONSECUTIVE_FORK_FAILURES: u32 = 3;

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Governs when a mediator creates additional worker children.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ForkingStrategy {
    Lazy,
    Mixed,
    Aggressive,
}

impl ForkingStrategy {
    /// `Lazy` when the daemon's loop interval is zero or over 2s,
    /// `Mixed` when over 1s, `Aggressive` otherwise.
    pub fn from_loop_interval(interval: Duration) -> Self {
        if interval.is_zero() || interval > Duration::from_secs(2) {
            ForkingStrategy::Lazy
        } else if interval > Duration::from_secs(1) {
            ForkingStrategy::Mixed
        } else {
            ForkingStrategy::Aggressive
        }
    }

    /// How many additional processes to fork given `active` outstanding
    /// calls and `procs` currently live workers, capped at `max`.
    pub fn processes_to_fork(self, active: usize, procs: usize, max: usize) -> usize {
        if procs >= max {
            return 0;
        }
        let headroom = max - procs;
        match self {
            ForkingStrategy::Lazy => {
                if active > procs {
                    headroom.min(1)
                } else {
                    0
                }
            }
            ForkingStrategy::Mixed => {
                if active > 0 {
                    headroom
                } else {
                    0
                }
            }
            ForkingStrategy::Aggressive => headroom,
        }
    }
}

/// Per-worker-alias settings. `loop_interval_hint` is only used once, at
/// construction, to pick the initial forking strategy.
#[derive(Clone, Debug)]
pub struct MediatorConfig {
    pub alias: String,
    pub max_processes: usize,
    pub max_calls_per_child: u32,
    pub min_runtime: Duration,
    pub max_runtime: Duration,
    pub auto_restart: bool,
    pub allow_wakeup: bool,
    pub loop_interval_hint: Duration,
    /// Error-category threshold bound before the parent's side of this
    /// mediator is considered fatally broken.
    pub parent_error_bound: u32,
    /// Error-category threshold bound on the worker (child) side.
    pub worker_error_bound: u32,
}

impl MediatorConfig {
    pub fn new(alias: impl Into<String>, loop_interval_hint: Duration) -> Self {
        MediatorConfig {
            alias: alias.into(),
            max_processes: 4,
            max_calls_per_child: 100,
            min_runtime: Duration::from_secs(1),
            max_runtime: Duration::from_secs(300),
            auto_restart: true,
            allow_wakeup: true,
            loop_interval_hint,
            parent_error_bound: 25,
            worker_error_bound: 10,
        }
    }
}

type OperationFn = Box<dyn Fn(Vec<Value>) -> Result<Value, String>>;

/// The small set of method names the mediator itself exposes; a worker's
/// registered operation may not collide with these.
const RESERVED_OPERATION_NAMES: &[&str] = &["call", "inline", "kill", "stats", "fork", "count", "find"];

/// A worker's explicitly registered named operations, looked up by string
/// key without reflection.
#[derive(Default)]
pub struct OperationTable {
    operations: HashMap<String, OperationFn>,
    init_hook: Option<Box<dyn Fn()>>,
}

impl OperationTable {
    pub fn new() -> Self {
        OperationTable::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(Vec<Value>) -> Result<Value, String> + 'static,
    ) -> Result<(), DaemonError> {
        let name = name.into();
        if RESERVED_OPERATION_NAMES.contains(&name.as_str()) {
            return Err(DaemonError::Validation(format!(
                "operation name '{}' collides with the mediator's own surface",
                name
            )));
        }
        self.operations.insert(name, Box::new(handler));
        Ok(())
    }

    /// Registers a hook run once in every freshly forked child, before it
    /// enters its call loop.
    pub fn on_child_init(&mut self, hook: impl Fn() + 'static) {
        self.init_hook = Some(Box::new(hook));
    }

    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, String> {
        match self.operations.get(method) {
            Some(handler) => handler(args),
            None => Err(format!("unknown operation '{}'", method)),
        }
    }

    pub fn run_init_hook(&self) {
        if let Some(hook) = &self.init_hook {
            hook();
        }
    }
}

/// Outcome of a settled call, once removed from the active table —
/// enough to populate `recent` for statistics without retaining
/// payloads.
#[derive(Clone, Debug)]
pub struct CallSummary {
    pub id: CallId,
    pub method: String,
    pub pid: i32,
    pub status: CallStatus,
}

struct PromiseInner {
    outcome: Option<CallOutcome>,
    callbacks: Vec<Box<dyn FnOnce(CallOutcome)>>,
}

/// A parent-side, single-settlement result primitive. Settling twice is a
/// programming error (it panics), matching invariant 1 in the design:
/// every call's promise settles exactly once.
#[derive(Clone)]
pub struct Promise {
    inner: Rc<RefCell<PromiseInner>>,
}

pub struct Settle {
    inner: Rc<RefCell<PromiseInner>>,
}

/// What a `.then` callback hands back: an immediate value, or another
/// promise to forward through.
pub enum Chain {
    Value(CallOutcome),
    Promise(Promise),
}

impl Promise {
    pub fn new() -> (Promise, Settle) {
        let inner = Rc::new(RefCell::new(PromiseInner {
            outcome: None,
            callbacks: Vec::new(),
        }));
        (
            Promise {
                inner: inner.clone(),
            },
            Settle { inner },
        )
    }

    pub fn is_settled(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// Non-blocking peek at the outcome, if it has settled.
    pub fn poll(&self) -> Option<CallOutcome> {
        self.inner.borrow().outcome.clone()
    }

    /// Registers `callback`, run immediately if the promise has already
    /// settled, or queued for when it does.
    pub fn subscribe(&self, callback: impl FnOnce(CallOutcome) + 'static) {
        let already = self.inner.borrow().outcome.clone();
        match already {
            Some(outcome) => callback(outcome),
            None => self.inner.borrow_mut().callbacks.push(Box::new(callback)),
        }
    }

    /// Chains a new promise: `f` inspects the settled outcome and either
    /// hands back a value immediately or forwards another promise, which
    /// must itself settle before the returned promise does.
    pub fn then(&self, f: impl FnOnce(CallOutcome) -> Chain + 'static) -> Promise {
        let (next, settle) = Promise::new();
        self.subscribe(move |outcome| match f(outcome) {
            Chain::Value(v) => settle.resolve(v),
            Chain::Promise(p) => {
                p.subscribe(move |o| settle.resolve(o));
            }
        });
        next
    }
}

impl Settle {
    pub fn fulfill(self, value: Value) {
        self.resolve(Ok(value));
    }

    pub fn reject(self, error: impl Into<String>) {
        self.resolve(Err(error.into()));
    }

    fn resolve(self, outcome: CallOutcome) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            assert!(inner.outcome.is_none(), "a promise may only settle once");
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.callbacks)
        };
        for cb in callbacks {
            cb(outcome.clone());
        }
    }
}

pub struct Mediator {
    config: MediatorConfig,
    operations: Rc<OperationTable>,
    transport: Box<dyn Transport>,
    calls: HashMap<CallId, Call>,
    settles: HashMap<CallId, Settle>,
    running: HashMap<CallId, i64>,
    recent: VecDeque<CallSummary>,
    reaped_pending: VecDeque<i32>,
    error_counters: ErrorCounters,
    /// Errors recorded since the last drain, queued for the scheduler to
    /// publish as `Event::Error` (the mediator has no bus reference of
    /// its own — see the module-level note on direct hook wiring).
    pending_errors: VecDeque<(ErrorCategory, String)>,
    last_gc: Option<Instant>,
    strategy: ForkingStrategy,
    consecutive_fork_failures: u32,
    fatal: Option<DaemonError>,
}

impl Mediator {
    pub fn new(config: MediatorConfig, operations: OperationTable, transport: Box<dyn Transport>) -> Self {
        let strategy = ForkingStrategy::from_loop_interval(config.loop_interval_hint);
        Mediator {
            config,
            operations: Rc::new(operations),
            transport,
            calls: HashMap::new(),
            settles: HashMap::new(),
            running: HashMap::new(),
            recent: VecDeque::new(),
            reaped_pending: VecDeque::new(),
            error_counters: ErrorCounters::new(),
            pending_errors: VecDeque::new(),
            last_gc: None,
            strategy,
            consecutive_fork_failures: 0,
            fatal: None,
        }
    }

    /// Drains every error recorded since the last call, for the scheduler
    /// to publish as `Event::Error` on this mediator's behalf.
    pub fn take_pending_errors(&mut self) -> Vec<(ErrorCategory, String)> {
        self.pending_errors.drain(..).collect()
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    pub fn strategy(&self) -> ForkingStrategy {
        self.strategy
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn active_call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn recent(&self) -> &VecDeque<CallSummary> {
        &self.recent
    }

    /// One-time parent setup: attach IPC, purge residual state, perform
    /// an initial fork pass.
    pub fn setup_parent(&mut self, processes: &mut ProcessTable) -> Result<(), DaemonError> {
        self.transport.setup()?;
        self.transport.purge()?;
        self.fork_pass(processes)
    }

    /// Issues a call against this mediator's worker alias: creates the
    /// `Call`, writes it to IPC, and returns its promise. On any
    /// transport failure the promise is rejected immediately and the
    /// call is left `Called` until the next GC pass.
    pub fn call(&mut self, processes: &mut ProcessTable, method: &str, args: Vec<Value>) -> Promise {
        let mut call = Call::create(method, args);
        let (promise, settle) = Promise::new();
        call.promise = Some(promise.clone());

        if let Err(e) = call.called() {
            settle.reject(e);
            return promise;
        }

        if let Err(e) = self.transport.put(&call) {
            self.record_error(e.category(), format!("writing CALL header: {}", e));
            settle.reject(e.to_string());
            self.calls.insert(call.id, call);
            return promise;
        }

        let id = call.id;
        self.calls.insert(id, call);
        self.settles.insert(id, settle);

        if let Err(e) = self.fork_pass(processes) {
            self.fatal = Some(e);
        }

        promise
    }

    /// Invokes the operation directly on the current process, bypassing
    /// IPC entirely — for callers that deliberately want a blocking call
    /// on the daemon thread.
    pub fn inline(&self, method: &str, args: Vec<Value>) -> Result<Value, String> {
        self.operations.invoke(method, args)
    }

    /// Queues a pid observed by the process table's reaper, for
    /// reconciliation in the next `post_execute`.
    pub fn note_reaped(&mut self, pid: i32) {
        self.reaped_pending.push_back(pid);
    }

    /// Drains every available `Running` then `Return` header. Settles
    /// promises for returned calls and keeps a bounded summary in
    /// `recent`. Mirrors §4.5.5 "pre-execute".
    ///
    /// A transport `Err` stops the drain for that header kind rather than
    /// looping forever on it: `Transport::get` already exhausts its own
    /// retry budget (§7) before returning one, so the failure is logged,
    /// counted against this mediator's error threshold, and queued for
    /// `Event::Error` (drained by the scheduler via `take_pending_errors`)
    /// instead of being silently dropped by a `while let Ok(Some(..))`
    /// pattern that never matches it.
    pub fn pre_execute(&mut self, _processes: &mut ProcessTable) {
        loop {
            match self.transport.get(Some(HeaderKind::Running), false) {
                Ok(Some(header_call)) => {
                    if !self.calls.contains_key(&header_call.id) {
                        log::warn!(
                            "mediator '{}': dropping stale RUNNING header for unknown call {}",
                            self.config.alias,
                            header_call.id
                        );
                        continue;
                    }
                    self.running.insert(header_call.id, now_millis());
                    if let Some(call) = self.calls.get_mut(&header_call.id) {
                        let _ = call.running(header_call.pid);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.record_transport_error("draining RUNNING headers", e);
                    break;
                }
            }
        }

        loop {
            match self.transport.get(Some(HeaderKind::Return), false) {
                Ok(Some(returned)) => {
                    let id = returned.id;
                    if self.calls.remove(&id).is_none() {
                        log::warn!(
                            "mediator '{}': dropping stale RETURN header for unknown call {}",
                            self.config.alias,
                            id
                        );
                        continue;
                    }
                    self.running.remove(&id);
                    let outcome = returned.outcome().unwrap_or_else(|| Err("worker returned no result".into()));
                    if let Some(settle) = self.settles.remove(&id) {
                        settle.resolve_outcome(outcome.clone());
                    }
                    self.recent_push(CallSummary {
                        id,
                        method: returned.method.clone(),
                        pid: returned.pid,
                        status: returned.status,
                    });
                    if outcome.is_err() {
                        self.record_error(ErrorCategory::Died, format!("call {} died: {:?}", id, outcome));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.record_transport_error("draining RETURN headers", e);
                    break;
                }
            }
        }
    }

    /// Reconciles pids reaped by the process table against outstanding
    /// calls (a call still in `calls` without a settled promise implies
    /// its worker died mid-flight) and considers another fork pass.
    /// Mirrors §4.5.5 "post-execute".
    pub fn post_execute(&mut self, processes: &mut ProcessTable) {
        while let Some(pid) = self.reaped_pending.pop_front() {
            let dead_call_ids: Vec<CallId> = self
                .calls
                .iter()
                .filter(|(_, call)| call.pid == pid && !call.status.is_terminal())
                .map(|(id, _)| *id)
                .collect();
            for id in dead_call_ids {
                if let Some(mut call) = self.calls.remove(&id) {
                    let _ = call.timeout("call died: worker exited before returning");
                    self.running.remove(&id);
                    if let Some(settle) = self.settles.remove(&id) {
                        settle.reject(format!("call {} died: worker exited before returning", id));
                    }
                    self.recent_push(CallSummary {
                        id,
                        method: call.method.clone(),
                        pid,
                        status: CallStatus::Timeout,
                    });
                    self.record_error(
                        ErrorCategory::Died,
                        format!("call {} died: worker exited before returning", id),
                    );
                }
            }
        }

        if let Err(e) = self.fork_pass(processes) {
            self.fatal = Some(e);
        }
    }

    /// Runs call GC at most once every 30s, per the mediator's `Idle`
    /// subscription.
    pub fn idle(&mut self) {
        let now = Instant::now();
        if self.last_gc.map(|t| now.duration_since(t) < GC_INTERVAL).unwrap_or(false) {
            return;
        }
        self.last_gc = Some(now);
        for call in self.calls.values_mut() {
            call.gc();
        }
    }

    /// `&mut self` because querying the transport's queue depth takes its
    /// own lock (`Transport::pending_messages`), not because stats mutate
    /// anything here.
    pub fn stats(&mut self) -> Value {
        let pending = self.transport.pending_messages().ok();
        serde_json::json!({
            "alias": self.config.alias,
            "active_calls": self.calls.len(),
            "pending_messages": pending,
            "recent": self.recent.iter().map(|s| serde_json::json!({
                "id": s.id,
                "method": s.method,
                "pid": s.pid,
                "status": format!("{:?}", s.status),
            })).collect::<Vec<_>>(),
            "strategy": format!("{:?}", self.strategy),
        })
    }

    /// Records one occurrence of `category` against this mediator's
    /// per-category threshold (§7), escalating to fatal past the bound,
    /// and queues `message` for the scheduler to publish as `Event::Error`.
    fn record_error(&mut self, category: ErrorCategory, message: impl Into<String>) {
        let message = message.into();
        log::warn!("mediator '{}': {}", self.config.alias, message);
        self.pending_errors.push_back((category, message));

        let bound = self.config.parent_error_bound;
        if self.error_counters.record(category, bound) {
            self.fatal = Some(DaemonError::Fatal(format!(
                "mediator '{}' exceeded its {:?} error bound ({})",
                self.config.alias, category, bound
            )));
        }
    }

    /// Routes a `Transport::get`/`put` failure through `record_error`,
    /// using the error's own category (`DaemonError::category`) rather
    /// than assuming one, since `get` can fail as Transient, Identity, or
    /// Corruption depending on what went wrong underneath. Then gives the
    /// transport a chance to recover (§7): `SysVTransport` reattaches on
    /// `Identity` and runs its corruption self-test on `Corruption`,
    /// escalating to fatal if the self-test itself fails.
    fn record_transport_error(&mut self, context: &str, error: DaemonError) {
        let category = error.category();
        self.record_error(category, format!("{}: {}", context, error));
        if let Err(e) = self.transport.recover(category) {
            self.fatal = Some(e);
        }
    }

    fn recent_push(&mut self, summary: CallSummary) {
        if self.recent.len() >= RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(summary);
    }

    fn fork_pass(&mut self, processes: &mut ProcessTable) -> Result<(), DaemonError> {
        let active = self.calls.len();
        let procs = processes.count(Some(&self.config.alias));
        let to_fork = self.strategy.processes_to_fork(active, procs, self.config.max_processes);

        for _ in 0..to_fork {
            match processes.fork_driven(&self.config.alias, self.config.max_runtime.max(MIN_TIMEOUT)) {
                Ok(ForkBranch::Child) => self.run_child(),
                Ok(ForkBranch::Parent(_)) => {
                    self.consecutive_fork_failures = 0;
                }
                Ok(ForkBranch::Reaped) => {
                    // The child died before the table could register it;
                    // a later pass will try again.
                }
                Err(e) => {
                    self.consecutive_fork_failures += 1;
                    if self.consecutive_fork_failures > MAX_CONSECUTIVE_FORK_FAILURES {
                        return Err(DaemonError::Fatal(format!(
                            "mediator '{}': fork failed {} times in a row: {}",
                            self.config.alias,
                            self.consecutive_fork_failures,
                            e
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The forked child's setup and call loop. Never returns: the child
    /// exits via `std::process::exit` once its recycling conditions are
    /// met (or, in the non-auto-restart case, runs forever servicing
    /// calls).
    fn run_child(&mut self) -> ! {
        self.calls.clear();
        self.settles.clear();
        self.running.clear();
        if let Err(e) = self.transport.setup() {
            log::error!("mediator '{}' child could not attach IPC: {}", self.config.alias, e);
            std::process::exit(1);
        }
        self.operations.run_init_hook();

        let pid = nix::unistd::getpid().as_raw();
        let mut rng = rand::thread_rng();
        let jitter = |rng: &mut rand::rngs::ThreadRng, base: Duration| -> Duration {
            if base.is_zero() {
                return base;
            }
            let factor = 1.0 + rng.gen_range(-0.25f64, 0.25f64);
            Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
        };
        let max_calls = {
            let factor = 1.0 + rng.gen_range(-0.25f64, 0.25f64);
            ((self.config.max_calls_per_child as f64) * factor).max(1.0).round() as u32
        };
        let max_runtime = jitter(&mut rng, self.config.max_runtime);
        let min_runtime = self.config.min_runtime;

        let start = Instant::now();
        let mut calls_served: u32 = 0;

        loop {
            let runtime = start.elapsed();
            if self.config.auto_restart
                && (runtime >= max_runtime || (runtime >= min_runtime && calls_served >= max_calls))
            {
                std::process::exit(0);
            }

            let block = !(self.config.auto_restart && max_runtime > Duration::ZERO);
            let call = match self.transport.get(Some(HeaderKind::Call), block) {
                Ok(Some(call)) => call,
                Ok(None) => {
                    thread::sleep(CHILD_POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    log::warn!("mediator '{}' child transient get error: {}", self.config.alias, e);
                    thread::sleep(CHILD_POLL_INTERVAL);
                    continue;
                }
            };

            if call.status == CallStatus::Cancelled {
                continue;
            }

            let mut call = call;
            if let Err(e) = call.running(pid) {
                log::warn!("mediator '{}' child: {}", self.config.alias, e);
                continue;
            }
            if self.transport.put(&call).is_err() {
                continue;
            }

            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.operations.invoke(&call.method, call.args.clone())
            }))
            .unwrap_or_else(|_| Err(format!("operation '{}' panicked", call.method)));

            let result: CallResult = outcome.into();
            if let CallResult::Err(_) = &result {
                call.errors += 1;
            }
            if call.returned(result).is_ok() {
                let _ = self.transport.put(&call);
            }

            calls_served += 1;

            if self.config.allow_wakeup {
                let parent = nix::unistd::getppid();
                let _ = nix::sys::signal::kill(parent, nix::sys::signal::Signal::SIGALRM);
            }
        }
    }
}

impl Settle {
    /// Settles from an already-computed `CallOutcome` (used when
    /// reconstructing a result read back off the wire, where we already
    /// have `Ok`/`Err` rather than a bare value).
    fn resolve_outcome(self, outcome: CallOutcome) {
        self.resolve(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::transport::FakeTransport;

    fn test_mediator(config: MediatorConfig) -> Mediator {
        Mediator::new(config, OperationTable::new(), Box::new(FakeTransport::new(1024 * 1024)))
    }

    #[test]
    fn lazy_strategy_forks_one_when_active_exceeds_procs() {
        assert_eq!(ForkingStrategy::Lazy.processes_to_fork(1, 0, 4), 1);
        assert_eq!(ForkingStrategy::Lazy.processes_to_fork(0, 0, 4), 0);
        assert_eq!(ForkingStrategy::Lazy.processes_to_fork(5, 4, 4), 0);
    }

    #[test]
    fn mixed_strategy_fills_up_to_max_when_any_active() {
        assert_eq!(ForkingStrategy::Mixed.processes_to_fork(1, 1, 4), 3);
        assert_eq!(ForkingStrategy::Mixed.processes_to_fork(0, 1, 4), 0);
    }

    #[test]
    fn aggressive_strategy_always_targets_max() {
        assert_eq!(ForkingStrategy::Aggressive.processes_to_fork(0, 0, 4), 4);
        assert_eq!(ForkingStrategy::Aggressive.processes_to_fork(0, 4, 4), 0);
    }

    #[test]
    fn strategy_selection_follows_loop_interval_thresholds() {
        assert_eq!(ForkingStrategy::from_loop_interval(Duration::ZERO), ForkingStrategy::Lazy);
        assert_eq!(
            ForkingStrategy::from_loop_interval(Duration::from_secs(3)),
            ForkingStrategy::Lazy
        );
        assert_eq!(
            ForkingStrategy::from_loop_interval(Duration::from_millis(1500)),
            ForkingStrategy::Mixed
        );
        assert_eq!(
            ForkingStrategy::from_loop_interval(Duration::from_millis(500)),
            ForkingStrategy::Aggressive
        );
    }

    #[test]
    fn registering_a_reserved_name_fails() {
        let mut table = OperationTable::new();
        assert!(table.register("stats", |_| Ok(Value::Null)).is_err());
        assert!(table.register("echo", |args| Ok(args[0].clone())).is_ok());
    }

    #[test]
    fn inline_path_bypasses_ipc() {
        let mut table = OperationTable::new();
        table.register("echo", |args| Ok(args[0].clone())).unwrap();
        let mediator = test_mediator(MediatorConfig::new("echo", Duration::from_millis(100)));
        let mut mediator = Mediator::new(
            mediator.config.clone(),
            table,
            Box::new(FakeTransport::new(1024 * 1024)),
        );
        let result = mediator.inline("echo", vec![serde_json::json!("hi")]);
        assert_eq!(result, Ok(serde_json::json!("hi")));
    }

    #[test]
    fn promise_then_chains_through_a_value() {
        let (promise, settle) = Promise::new();
        let chained = promise.then(|outcome| Chain::Value(outcome.map(|v| serde_json::json!(v.as_str().unwrap().len()))));
        settle.fulfill(serde_json::json!("hello"));
        assert_eq!(chained.poll(), Some(Ok(serde_json::json!(5))));
    }

    #[test]
    #[should_panic(expected = "only settle once")]
    fn settling_twice_panics() {
        let (_, settle) = Promise::new();
        let inner = settle.inner.clone();
        settle.fulfill(serde_json::json!(1));
        Settle { inner }.fulfill(serde_json::json!(2));
    }

    /// Forks one real worker over a real `SysVTransport` and round-trips
    /// an echo call through it, per the commitment to test the recycling/
    /// premature-death/echo scenarios against real OS processes rather
    /// than `FakeTransport`.
    #[test]
    fn end_to_end_echo_call_with_a_real_forked_worker_over_sysv_transport() {
        use crate::ipc::transport::SysVTransport;

        let mut operations = OperationTable::new();
        operations
            .register("echo", |args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
            .unwrap();

        let transport =
            SysVTransport::new("mediator-e2e-echo", 1024 * 1024).expect("construct a real transport");

        let mut config = MediatorConfig::new("mediator-e2e-echo", Duration::from_millis(50));
        config.max_processes = 1;
        config.auto_restart = false;

        let mut mediator = Mediator::new(config, operations, Box::new(transport));
        let mut processes = ProcessTable::new();
        mediator
            .setup_parent(&mut processes)
            .expect("setup_parent attaches IPC and forks the first real worker");

        let promise = mediator.call(&mut processes, "echo", vec![serde_json::json!("hi")]);

        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = loop {
            mediator.pre_execute(&mut processes);
            if let Some(outcome) = promise.poll() {
                break outcome;
            }
            assert!(
                Instant::now() < deadline,
                "echo call did not settle against a real forked worker in time"
            );
            thread::sleep(Duration::from_millis(20));
        };

        assert_eq!(outcome, Ok(serde_json::json!("hi")));
        assert!(!mediator.is_fatal());

        let _ = processes.kill_group("mediator-e2e-echo");
        processes.teardown();
    }

    /// A transport whose `get` fails with a fixed error every time,
    /// standing in for an IPC identity/transient failure that has
    /// exhausted `Transport::get`'s own retry budget.
    struct FailingTransport {
        inner: FakeTransport,
    }

    impl Transport for FailingTransport {
        fn setup(&mut self) -> Result<(), DaemonError> {
            self.inner.setup()
        }
        fn purge(&mut self) -> Result<(), DaemonError> {
            self.inner.purge()
        }
        fn put(&mut self, call: &Call) -> Result<(), DaemonError> {
            self.inner.put(call)
        }
        fn get(&mut self, _kind: Option<HeaderKind>, _block: bool) -> Result<Option<Call>, DaemonError> {
            Err(DaemonError::Identity("segment identifier removed".into()))
        }
        fn drop_payload(&mut self, call_id: CallId) -> Result<(), DaemonError> {
            self.inner.drop_payload(call_id)
        }
        fn pending_messages(&mut self) -> Result<usize, DaemonError> {
            self.inner.pending_messages()
        }
        fn store_size(&self) -> usize {
            self.inner.store_size()
        }
    }

    #[test]
    fn pre_execute_records_and_queues_a_transport_error_instead_of_swallowing_it() {
        let mut mediator = Mediator::new(
            MediatorConfig::new("echo", Duration::from_millis(100)),
            OperationTable::new(),
            Box::new(FailingTransport {
                inner: FakeTransport::new(1024 * 1024),
            }),
        );
        let mut processes = ProcessTable::new();
        mediator.pre_execute(&mut processes);

        let errors = mediator.take_pending_errors();
        assert_eq!(errors.len(), 2, "one for the RUNNING drain, one for the RETURN drain");
        assert!(errors.iter().all(|(category, _)| *category == ErrorCategory::Identity));
        assert_eq!(mediator.error_counters.get(ErrorCategory::Identity), 2);
    }
}

//! The supervised main loop: fixed-cadence iteration, signal-driven
//! interrupts, auto-restart, and the glue between the event bus, the
//! process table, and every registered mediator.
//!
//! Signal handlers cannot safely do anything beyond flipping an atomic
//! flag (the handler body itself must be async-signal-safe), so the
//! actual bookkeeping — counting, dispatching `Event::Signal`, deciding
//! to shut down — happens once per tick when the main loop polls the
//! flags this module's `lazy_static` registry exposes.

use std::cell::RefCell;
use std::convert::TryFrom;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use rand::Rng;

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::event::{Event, EventBus};
use crate::log::FileLog;
use crate::mediator::Mediator;
use crate::process::ProcessTable;

/// Flags a signal handler may touch: plain atomics, safe to mutate from
/// an async-signal-safe context. Polled once per tick by the scheduler.
struct SignalFlags {
    usr1: AtomicBool,
    hup: AtomicBool,
    int: AtomicBool,
    term: AtomicBool,
    chld: AtomicBool,
    alrm: AtomicBool,
    other: AtomicBool,
    last_other: AtomicU64,
    counts: [AtomicU64; 32],
}

impl SignalFlags {
    fn new() -> Self {
        SignalFlags {
            usr1: AtomicBool::new(false),
            hup: AtomicBool::new(false),
            int: AtomicBool::new(false),
            term: AtomicBool::new(false),
            chld: AtomicBool::new(false),
            alrm: AtomicBool::new(false),
            other: AtomicBool::new(false),
            last_other: AtomicU64::new(0),
            counts: Default::default(),
        }
    }

    fn bump(&self, signum: i32) {
        if let Some(slot) = self.counts.get(signum as usize) {
            slot.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn count(&self, signum: i32) -> u64 {
        self.counts
            .get(signum as usize)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

lazy_static! {
    static ref SIGNAL_FLAGS: SignalFlags = SignalFlags::new();
}

extern "C" fn handle_signal(signum: libc::c_int) {
    SIGNAL_FLAGS.bump(signum);
    match Signal::try_from(signum) {
        Ok(Signal::SIGUSR1) => SIGNAL_FLAGS.usr1.store(true, Ordering::SeqCst),
        Ok(Signal::SIGHUP) => SIGNAL_FLAGS.hup.store(true, Ordering::SeqCst),
        Ok(Signal::SIGINT) => SIGNAL_FLAGS.int.store(true, Ordering::SeqCst),
        Ok(Signal::SIGTERM) => SIGNAL_FLAGS.term.store(true, Ordering::SeqCst),
        Ok(Signal::SIGCHLD) => SIGNAL_FLAGS.chld.store(true, Ordering::SeqCst),
        Ok(Signal::SIGALRM) => SIGNAL_FLAGS.alrm.store(true, Ordering::SeqCst),
        _ => {
            SIGNAL_FLAGS.other.store(true, Ordering::SeqCst);
            SIGNAL_FLAGS.last_other.store(signum as u64, Ordering::SeqCst);
        }
    }
}

/// Installs handlers for every signal this crate consumes. Safe to call
/// more than once; later calls simply re-install the same handler.
fn install_handlers() -> Result<(), DaemonError> {
    let handler = SigHandler::Handler(handle_signal);
    for sig in [
        Signal::SIGUSR1,
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGCHLD,
        Signal::SIGALRM,
    ] {
        unsafe { signal::signal(sig, handler) }.map_err(DaemonError::from)?;
    }
    Ok(())
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SchedulerState {
    Created,
    Initialized,
    Running,
    ShuttingDown,
    Restarting,
    Exited,
}

/// A user-supplied per-tick body. Implemented for plain closures via the
/// blanket impl below so callers can pass a `FnMut(&mut Daemon)` directly.
pub trait Execute {
    fn execute(&mut self, daemon: &mut Daemon);
}

impl<F: FnMut(&mut Daemon)> Execute for F {
    fn execute(&mut self, daemon: &mut Daemon) {
        self(daemon)
    }
}

/// A long-running, multi-process daemon. Owns the event bus, the process
/// table, every registered mediator, and the scheduler's own state.
/// Constructed once per program (not a singleton: nothing here is a
/// process-wide static except the signal flag registry, which holds no
/// daemon state of its own).
pub struct Daemon {
    config: DaemonConfig,
    state: SchedulerState,
    bus: EventBus,
    processes: ProcessTable,
    mediators: Vec<Rc<RefCell<Mediator>>>,
    log: FileLog,
    is_parent: bool,
    parent_pid: i32,
    pid: i32,
    loop_start: Option<Instant>,
    daemon_start: Option<Instant>,
    loop_iterations: u64,
    interrupt_count: u64,
    shutdown: bool,
    restart: bool,
    argv0: String,
    args: Vec<String>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let pid = nix::unistd::getpid().as_raw();
        let mut args = std::env::args();
        let argv0 = args.next().unwrap_or_default();
        Ok(Daemon {
            log: FileLog::new(config.log_path.clone()),
            config,
            state: SchedulerState::Created,
            bus: EventBus::new(),
            processes: ProcessTable::new(),
            mediators: Vec::new(),
            is_parent: true,
            parent_pid: pid,
            pid,
            loop_start: None,
            daemon_start: None,
            loop_iterations: 0,
            interrupt_count: 0,
            shutdown: false,
            restart: false,
            argv0,
            args: args.collect(),
        })
    }

    pub fn bus(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn processes(&mut self) -> &mut ProcessTable {
        &mut self.processes
    }

    pub fn register_mediator(&mut self, mediator: Mediator) -> Result<Rc<RefCell<Mediator>>, DaemonError> {
        let mediator = Rc::new(RefCell::new(mediator));
        mediator.borrow_mut().setup_parent(&mut self.processes)?;
        self.mediators.push(mediator.clone());
        Ok(mediator)
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown
    }

    pub fn interrupt_count(&self) -> u64 {
        self.interrupt_count
    }

    /// Marks the daemon for graceful shutdown on the next signal poll,
    /// honoring `shutdown_on_interrupt` per the Open Question decision:
    /// `SIGINT` never forces an immediate exit, only requests one.
    pub fn shutdown_on_interrupt(&mut self) {
        if self.config.shutdown_on_interrupt {
            self.shutdown = true;
        }
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    fn initialize(&mut self) -> Result<(), DaemonError> {
        install_handlers()?;
        self.daemon_start = Some(Instant::now());
        self.bus.dispatch(Event::Init);
        self.state = SchedulerState::Initialized;
        Ok(())
    }

    /// Runs the supervised loop until shutdown is requested or a restart
    /// is triggered. `body` is invoked once per tick between `PreExecute`
    /// and `PostExecute`, unless a `PreExecute` subscriber stops
    /// propagation.
    pub fn run(&mut self, mut body: impl Execute) -> Result<(), DaemonError> {
        if self.state == SchedulerState::Created {
            self.initialize()?;
        }
        self.state = SchedulerState::Running;

        while !self.shutdown {
            let t0 = Instant::now();

            if self.config.daemonize && self.is_parent {
                if let Some(interval) = self.config.auto_restart_interval {
                    let uptime = self.daemon_start.map(|s| s.elapsed()).unwrap_or_default();
                    if interval > Duration::ZERO && uptime >= interval {
                        let dispatch = self.bus.dispatch(Event::AutoRestart);
                        if dispatch.is_propagating() {
                            self.restart = true;
                            self.shutdown = true;
                            break;
                        }
                    }
                }
            }

            self.poll_signals();
            if self.shutdown {
                break;
            }

            let pre = self.bus.dispatch(Event::PreExecute);
            for mediator in self.mediators.clone() {
                mediator.borrow_mut().pre_execute(&mut self.processes);
                self.publish_mediator_errors(&mediator);
            }
            if pre.is_propagating() {
                body.execute(self);
            }

            for mediator in self.mediators.clone() {
                mediator.borrow_mut().post_execute(&mut self.processes);
                self.publish_mediator_errors(&mediator);
            }
            self.bus.dispatch(Event::PostExecute);

            self.loop_iterations += 1;
            self.wait(t0);
        }

        self.teardown();

        if self.restart {
            self.state = SchedulerState::Restarting;
            self.exec_restart();
        } else {
            self.state = SchedulerState::Exited;
        }
        Ok(())
    }

    /// Drains a mediator's errors recorded since the last tick and
    /// publishes each as `Event::Error` (§7: "all runtime errors publish
    /// the `error` event; if not consumed, the error is logged").
    fn publish_mediator_errors(&mut self, mediator: &Rc<RefCell<Mediator>>) {
        let errors = mediator.borrow_mut().take_pending_errors();
        for (category, message) in errors {
            let dispatch = self.bus.dispatch(Event::Error {
                message: message.clone(),
                category,
            });
            if dispatch.is_propagating() {
                self.log_line(log::Level::Warn, &message);
            }
        }
    }

    /// Polls the flags a signal handler may have set since the last
    /// tick, performs the associated bookkeeping, and publishes `Signal`
    /// for every signal observed. This is the only place signal-driven
    /// state actually changes daemon state.
    fn poll_signals(&mut self) {
        if SIGNAL_FLAGS.chld.swap(false, Ordering::SeqCst) {
            for process in self.processes.reap() {
                self.bus.dispatch(Event::Reaped {
                    pid: process.pid,
                    group: process.group.clone(),
                    call: None,
                });
                for mediator in &self.mediators {
                    mediator.borrow_mut().note_reaped(process.pid);
                }
            }
            self.bus.dispatch(Event::Signal {
                signum: Signal::SIGCHLD as i32,
                count: SIGNAL_FLAGS.count(Signal::SIGCHLD as i32),
            });
        }

        if SIGNAL_FLAGS.usr1.swap(false, Ordering::SeqCst) {
            if self.is_parent && self.config.dump_on_signal {
                self.dump_stats();
            }
            self.bus.dispatch(Event::Signal {
                signum: Signal::SIGUSR1 as i32,
                count: SIGNAL_FLAGS.count(Signal::SIGUSR1 as i32),
            });
        }

        if SIGNAL_FLAGS.hup.swap(false, Ordering::SeqCst) {
            if self.is_parent && self.config.daemonize {
                self.restart = true;
                self.shutdown = true;
            }
            self.bus.dispatch(Event::Signal {
                signum: Signal::SIGHUP as i32,
                count: SIGNAL_FLAGS.count(Signal::SIGHUP as i32),
            });
        }

        if SIGNAL_FLAGS.int.swap(false, Ordering::SeqCst) {
            self.interrupt_count += 1;
            self.shutdown_on_interrupt();
            self.bus.dispatch(Event::Signal {
                signum: Signal::SIGINT as i32,
                count: SIGNAL_FLAGS.count(Signal::SIGINT as i32),
            });
        }

        if SIGNAL_FLAGS.term.swap(false, Ordering::SeqCst) {
            self.shutdown = true;
            self.bus.dispatch(Event::Signal {
                signum: Signal::SIGTERM as i32,
                count: SIGNAL_FLAGS.count(Signal::SIGTERM as i32),
            });
        }

        if SIGNAL_FLAGS.alrm.swap(false, Ordering::SeqCst) {
            self.bus.dispatch(Event::Signal {
                signum: Signal::SIGALRM as i32,
                count: SIGNAL_FLAGS.count(Signal::SIGALRM as i32),
            });
        }

        if SIGNAL_FLAGS.other.swap(false, Ordering::SeqCst) {
            let signum = SIGNAL_FLAGS.last_other.load(Ordering::SeqCst) as i32;
            self.bus.dispatch(Event::Signal {
                signum,
                count: SIGNAL_FLAGS.count(signum),
            });
        }
    }

    /// Sleeps out the remainder of the loop interval, or yields briefly
    /// if the tick over-ran. `SIGCHLD` is blocked for the sleep itself so
    /// a worker exiting mid-sleep cannot trigger an early wakeup; any
    /// other delivered signal still ends the sleep early.
    fn wait(&mut self, t0: Instant) {
        let elapsed = t0.elapsed();
        let interval = self.config.loop_interval;

        if elapsed < interval {
            let remaining = interval - elapsed;
            let mut mask = SigSet::empty();
            mask.add(Signal::SIGCHLD);
            let _ = unsafe { signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&mask), None) };
            thread_sleep_interruptible(remaining);
            let _ = unsafe { signal::sigprocmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&mask), None) };
        } else if elapsed > interval {
            if interval > Duration::ZERO && self.config.log_overrun {
                self.log_line(
                    log::Level::Debug,
                    &format!("tick over-ran by {:?} (interval {:?})", elapsed - interval, interval),
                );
            }
            std::thread::sleep(self.config.loop_sleep_min.max(Duration::from_micros(1)));
        }

        if self.is_idle(t0) {
            self.bus.dispatch(Event::Idle);
            for mediator in self.mediators.clone() {
                mediator.borrow_mut().idle();
            }
        }
    }

    /// A tick is idle if there was slack left in the interval, or — when
    /// running with no fixed interval — a Bernoulli draw of
    /// `idle_probability` succeeds.
    fn is_idle(&self, t0: Instant) -> bool {
        let interval = self.config.loop_interval;
        if interval > Duration::ZERO {
            let slack = Duration::from_millis(10);
            return t0.elapsed() + slack < interval;
        }
        if self.config.idle_probability <= 0.0 {
            return false;
        }
        if self.config.idle_probability >= 1.0 {
            return true;
        }
        rand::thread_rng().gen_range(0.0f64, 1.0f64) < self.config.idle_probability
    }

    fn dump_stats(&mut self) {
        let stats: Vec<_> = self.mediators.iter().map(|m| m.borrow_mut().stats()).collect();
        let text = serde_json::to_string_pretty(&stats).unwrap_or_default();
        self.bus.dispatch(Event::Stats { text: text.clone() });
        self.log_line(log::Level::Info, &text);
    }

    /// Publishes `Log` before writing so a subscriber can intercept or,
    /// by stopping propagation, veto the write and the console echo
    /// entirely (§4.6.7).
    fn log_line(&mut self, level: log::Level, message: &str) {
        let dispatch = self.bus.dispatch(Event::Log {
            level,
            message: message.to_string(),
        });
        if dispatch.is_propagating() {
            let _ = self.log.write_line(level, message);
        }
    }

    fn teardown(&mut self) {
        self.state = SchedulerState::ShuttingDown;
        self.bus.dispatch(Event::Shutdown);
        self.processes.teardown();
    }

    /// Rebuilds the original invocation (executable + argv, plus a
    /// daemonize marker) and execs it, replacing this process image.
    /// Only reachable on the original parent of a daemonized run.
    fn exec_restart(&self) -> ! {
        use std::ffi::CString;

        let exe = CString::new(self.argv0.clone()).unwrap_or_else(|_| CString::new("/proc/self/exe").unwrap());
        let mut argv: Vec<CString> = vec![exe.clone()];
        argv.extend(self.args.iter().map(|a| CString::new(a.as_str()).unwrap()));
        argv.push(CString::new("--daemonize").unwrap());

        match nix::unistd::execv(&exe, &argv) {
            Ok(_) => unreachable!("execv only returns on failure"),
            Err(e) => {
                eprintln!("auto-restart exec failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

/// A single, non-retrying `nanosleep`. `std::thread::sleep` is unsuitable
/// here: its Unix implementation loops on `EINTR` to guarantee the full
/// duration elapses, which would swallow exactly the signal-driven early
/// wakeup (e.g. a worker's `SIGALRM` after posting `Return`) this wait is
/// supposed to honor. One raw call returns as soon as any unblocked signal
/// is delivered, matching the "any other delivered signal ends the sleep
/// early" semantics.
fn thread_sleep_interruptible(duration: Duration) {
    let req = libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(duration.subsec_nanos()),
    };
    let mut remaining = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::nanosleep(&req, &mut remaining);
    }
}

/// Sends `SIGALRM` to `pid`, used by a child worker to break the parent's
/// sleep after it has posted a `Return` header (see `mediator::run_child`).
pub fn wakeup(pid: i32) -> Result<(), DaemonError> {
    signal::kill(Pid::from_raw(pid), Signal::SIGALRM).map_err(DaemonError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_policy_is_deterministic_at_probability_boundaries() {
        let mut config = DaemonConfig::default();
        config.loop_interval = Duration::ZERO;
        config.idle_probability = 0.0;
        let daemon = Daemon::new(config.clone()).unwrap();
        assert!(!daemon.is_idle(Instant::now()));

        config.idle_probability = 1.0;
        let daemon = Daemon::new(config).unwrap();
        assert!(daemon.is_idle(Instant::now()));
    }

    #[test]
    fn fixed_interval_tick_with_slack_is_idle() {
        let mut config = DaemonConfig::default();
        config.loop_interval = Duration::from_secs(1);
        let daemon = Daemon::new(config).unwrap();
        assert!(daemon.is_idle(Instant::now()));
    }

    #[test]
    fn new_daemon_starts_in_created_state() {
        let daemon = Daemon::new(DaemonConfig::default()).unwrap();
        assert_eq!(daemon.state(), SchedulerState::Created);
        assert_eq!(daemon.interrupt_count(), 0);
    }

    #[test]
    fn shutdown_on_interrupt_respects_the_config_flag() {
        let mut config = DaemonConfig::default();
        config.shutdown_on_interrupt = false;
        let mut daemon = Daemon::new(config).unwrap();
        daemon.shutdown_on_interrupt();
        assert!(!daemon.is_shutting_down());

        let mut daemon = Daemon::new(DaemonConfig::default()).unwrap();
        daemon.shutdown_on_interrupt();
        assert!(daemon.is_shutting_down());
    }

    #[test]
    fn log_line_publishes_log_before_writing() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut daemon = Daemon::new(DaemonConfig::default()).unwrap();
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        daemon.bus().subscribe(crate::event::EventKind::Log, 0, move |event, _| {
            if let Event::Log { message, .. } = event {
                *seen_clone.borrow_mut() = Some(message.clone());
            }
        });
        daemon.log_line(log::Level::Info, "hello");
        assert_eq!(seen.borrow().as_deref(), Some("hello"));
    }

    #[test]
    fn a_subscriber_stopping_propagation_vetoes_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut config = DaemonConfig::default();
        config.log_path = Some(path.clone());
        let mut daemon = Daemon::new(config).unwrap();
        daemon
            .bus()
            .subscribe(crate::event::EventKind::Log, 0, |_, dispatch| dispatch.stop_propagation());
        daemon.log_line(log::Level::Info, "should not appear");
        assert!(!path.exists() || std::fs::read_to_string(&path).unwrap().is_empty());
    }
}

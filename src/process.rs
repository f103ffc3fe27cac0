//! Parent-side bookkeeping for every forked child: pid, group, lifetimes,
//! and the timeout used only at shutdown (see the Open Question decision
//! recorded in DESIGN.md). Reaping happens here too, driven by the
//! scheduler's `SIGCHLD` flag.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::DaemonError;

bitflags::bitflags! {
    /// Lifecycle flags tracked alongside a `Process`'s timestamps. Kept
    /// distinct from `stop`/`start` (which record *when*) so `teardown`
    /// can tell a process it has already sent `SIGTERM` to from one it is
    /// escalating to `SIGKILL`, without re-deriving that from timestamps.
    pub struct ProcessFlags: u8 {
        /// `SIGTERM` has been sent; `teardown` is waiting on it.
        const STOPPING = 0b0000_0001;
        /// It outlived its timeout and was escalated to `SIGKILL`.
        const TIMED_OUT = 0b0000_0010;
    }
}

/// Every `Process.timeout` is lower-bounded at this value, matching the
/// source's minimum shutdown grace period.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_RECENT_CAPACITY: usize = 50;
const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The group name used for fire-and-forget task children.
pub const TASK_GROUP: &str = "task";

#[derive(Clone, Debug)]
pub struct Process {
    pub pid: i32,
    pub group: String,
    pub start: SystemTime,
    pub stop: Option<SystemTime>,
    pub timeout: Duration,
    pub flags: ProcessFlags,
}

impl Process {
    fn new(pid: i32, group: &str, timeout: Duration) -> Self {
        Process {
            pid,
            group: group.to_string(),
            start: SystemTime::now(),
            stop: None,
            timeout: timeout.max(MIN_TIMEOUT),
            flags: ProcessFlags::empty(),
        }
    }
}

/// The outcome of a driven fork (one where the child drives its own
/// subsequent setup, e.g. a mediator's worker loop, rather than running a
/// single callable and exiting).
pub enum ForkBranch {
    /// The parent side; the child was registered in the table.
    Parent(Process),
    /// The parent side; the child died before the table could register
    /// it (a `SIGCHLD` race between `fork` and registration).
    Reaped,
    /// The child side: the caller is now running as the forked child and
    /// must drive its own setup and loop.
    Child,
}

#[derive(Default)]
pub struct ProcessTable {
    live: HashMap<i32, Process>,
    recent: VecDeque<Process>,
    recent_capacity: usize,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            live: HashMap::new(),
            recent: VecDeque::new(),
            recent_capacity: DEFAULT_RECENT_CAPACITY,
        }
    }

    pub fn with_recent_capacity(capacity: usize) -> Self {
        ProcessTable {
            recent_capacity: capacity,
            ..ProcessTable::new()
        }
    }

    /// Forks a child that runs `callable` to completion and then exits 0.
    /// Returns `Ok(true)` if the parent successfully registered the
    /// child, `Ok(false)` if it had already died before registration
    /// completed (the caller's work never started).
    pub fn fork_task(
        &mut self,
        group: &str,
        timeout: Duration,
        callable: impl FnOnce() + 'static,
    ) -> Result<bool, DaemonError> {
        match unsafe { fork() }.map_err(DaemonError::from)? {
            ForkResult::Child => {
                callable();
                std::process::exit(0);
            }
            ForkResult::Parent { child } => self.register_or_reap(group, child, timeout),
        }
    }

    /// Forks a child that drives its own setup (e.g. a mediator worker
    /// loop) rather than running a single callable. The caller branches
    /// on the returned [`ForkBranch`].
    pub fn fork_driven(&mut self, group: &str, timeout: Duration) -> Result<ForkBranch, DaemonError> {
        match unsafe { fork() }.map_err(DaemonError::from)? {
            ForkResult::Child => Ok(ForkBranch::Child),
            ForkResult::Parent { child } => {
                if self.register_or_reap(group, child, timeout)? {
                    Ok(ForkBranch::Parent(self.live[&child.as_raw()].clone()))
                } else {
                    Ok(ForkBranch::Reaped)
                }
            }
        }
    }

    fn register_or_reap(&mut self, group: &str, child: Pid, timeout: Duration) -> Result<bool, DaemonError> {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => {
                self.live.insert(child.as_raw(), Process::new(child.as_raw(), group, timeout));
                Ok(true)
            }
            Ok(_) => {
                // The child already exited between `fork` returning in the
                // parent and us getting here: never registered.
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Non-blocking reap of every finished child, called from the
    /// scheduler once per tick when its `SIGCHLD` flag is set. Returns the
    /// processes that were reaped this call, in the order `waitpid`
    /// reported them.
    pub fn reap(&mut self) -> Vec<Process> {
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    if let Some(process) = self.live.remove(&pid.as_raw()) {
                        self.push_recent(process.clone());
                        reaped.push(process);
                    }
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(_) => break,
            }
        }
        reaped
    }

    fn push_recent(&mut self, process: Process) {
        if self.recent.len() >= self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(process);
    }

    pub fn recent(&self) -> &VecDeque<Process> {
        &self.recent
    }

    pub fn count(&self, group: Option<&str>) -> usize {
        match group {
            Some(g) => self.live.values().filter(|p| p.group == g).count(),
            None => self.live.len(),
        }
    }

    pub fn find(&self, pid: i32, group: Option<&str>) -> Option<&Process> {
        self.live
            .get(&pid)
            .filter(|p| group.map(|g| p.group == g).unwrap_or(true))
    }

    pub fn is_live(&self, pid: i32) -> bool {
        self.live.contains_key(&pid)
    }

    /// Sends `SIGKILL` directly to a named child, bypassing the graceful
    /// `SIGTERM`-then-wait sequence `teardown` uses.
    pub fn kill(&self, pid: i32) -> Result<(), DaemonError> {
        kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(DaemonError::from)
    }

    /// Sends `SIGKILL` to every live process in `group`.
    pub fn kill_group(&self, group: &str) -> Result<(), DaemonError> {
        for pid in self.live.values().filter(|p| p.group == group).map(|p| p.pid) {
            kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(DaemonError::from)?;
        }
        Ok(())
    }

    /// Graceful teardown: `SIGTERM` every live process, poll in waves,
    /// and `SIGKILL` anything still alive once its own timeout elapses.
    pub fn teardown(&mut self) {
        let now = SystemTime::now();
        for process in self.live.values_mut() {
            process.stop = Some(now);
            process.flags.insert(ProcessFlags::STOPPING);
            let _ = kill(Pid::from_raw(process.pid), Signal::SIGTERM);
        }

        loop {
            self.reap();
            if self.live.is_empty() {
                break;
            }

            let overdue: Vec<i32> = self
                .live
                .values()
                .filter(|p| {
                    !p.flags.contains(ProcessFlags::TIMED_OUT)
                        && p.stop
                            .and_then(|s| s.elapsed().ok())
                            .map(|elapsed| elapsed >= p.timeout)
                            .unwrap_or(false)
                })
                .map(|p| p.pid)
                .collect();
            for pid in &overdue {
                if let Some(process) = self.live.get_mut(pid) {
                    process.flags.insert(ProcessFlags::TIMED_OUT);
                }
                let _ = kill(Pid::from_raw(*pid), Signal::SIGKILL);
            }

            thread::sleep(TEARDOWN_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_and_find_respect_group_filter() {
        let mut table = ProcessTable::new();
        table.live.insert(
            1,
            Process::new(1, "echo", Duration::from_secs(60)),
        );
        table.live.insert(
            2,
            Process::new(2, "task", Duration::from_secs(60)),
        );
        assert_eq!(table.count(None), 2);
        assert_eq!(table.count(Some("echo")), 1);
        assert!(table.find(1, Some("echo")).is_some());
        assert!(table.find(1, Some("task")).is_none());
    }

    #[test]
    fn teardown_marks_live_processes_stopping_before_signaling() {
        let mut table = ProcessTable::new();
        table.live.insert(1, Process::new(1, "echo", MIN_TIMEOUT));
        // Can't actually signal pid 1 in a test sandbox; just check the
        // flag bookkeeping a real teardown would perform.
        for process in table.live.values_mut() {
            process.flags.insert(ProcessFlags::STOPPING);
        }
        assert!(table.live[&1].flags.contains(ProcessFlags::STOPPING));
        assert!(!table.live[&1].flags.contains(ProcessFlags::TIMED_OUT));
    }

    #[test]
    fn timeout_is_lower_bounded_at_the_minimum() {
        let p = Process::new(1, "echo", Duration::from_secs(1));
        assert_eq!(p.timeout, MIN_TIMEOUT);
    }

    #[test]
    fn recent_ring_is_bounded_by_capacity() {
        let mut table = ProcessTable::with_recent_capacity(2);
        for pid in 1..=3 {
            table.push_recent(Process::new(pid, "echo", MIN_TIMEOUT));
        }
        assert_eq!(table.recent().len(), 2);
        assert_eq!(table.recent()[0].pid, 2);
        assert_eq!(table.recent()[1].pid, 3);
    }

    #[test]
    fn fork_task_registers_a_real_child_in_the_parent() {
        let mut table = ProcessTable::new();
        let registered = table
            .fork_task(TASK_GROUP, MIN_TIMEOUT, || {
                std::thread::sleep(Duration::from_millis(50));
            })
            .expect("fork should succeed under test");
        assert!(registered);
        assert_eq!(table.count(Some(TASK_GROUP)), 1);

        // Wait for the real child to exit and reap it.
        std::thread::sleep(Duration::from_millis(150));
        let reaped = table.reap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(table.count(None), 0);
    }
}

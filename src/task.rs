//! Fire-and-forget forked work: one child in the default `"task"` group,
//! no IPC, no return channel, reconciled only by the process table's
//! ordinary reaping.

use crate::error::DaemonError;
use crate::process::{ProcessTable, TASK_GROUP};
use std::time::Duration;

/// Spawns callables into the shared `"task"` process group. A thin,
/// stateless wrapper over `ProcessTable::fork_task` — kept as its own
/// type rather than a free function so callers can hold it alongside a
/// `Daemon`'s other collaborators and so a default timeout is applied
/// consistently across every call site.
pub struct TaskRunner {
    default_timeout: Duration,
}

impl TaskRunner {
    pub fn new(default_timeout: Duration) -> Self {
        TaskRunner { default_timeout }
    }

    /// Forks `callable` into the task group with the runner's default
    /// timeout. Returns `true` if the child was registered in the
    /// process table, `false` if it had already exited before the parent
    /// could register it (the callable's work still ran; there is simply
    /// nothing left to track).
    pub fn spawn(
        &self,
        processes: &mut ProcessTable,
        callable: impl FnOnce() + 'static,
    ) -> Result<bool, DaemonError> {
        self.spawn_with_timeout(processes, self.default_timeout, callable)
    }

    pub fn spawn_with_timeout(
        &self,
        processes: &mut ProcessTable,
        timeout: Duration,
        callable: impl FnOnce() + 'static,
    ) -> Result<bool, DaemonError> {
        processes.fork_task(TASK_GROUP, timeout, callable)
    }

    pub fn count(&self, processes: &ProcessTable) -> usize {
        processes.count(Some(TASK_GROUP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn spawn_runs_the_callable_in_a_real_child_and_is_reaped() {
        let runner = TaskRunner::new(Duration::from_secs(60));
        let mut processes = ProcessTable::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let registered = runner
            .spawn(&mut processes, move || {
                ran_clone.store(true, Ordering::SeqCst);
            })
            .expect("fork should succeed under test");

        assert!(registered);
        assert_eq!(runner.count(&processes), 1);

        std::thread::sleep(Duration::from_millis(100));
        let reaped = processes.reap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(runner.count(&processes), 0);
        // The parent's own copy of `ran` cannot observe the child's write
        // (separate address spaces); this only confirms reaping worked.
        let _ = ran;
    }
}

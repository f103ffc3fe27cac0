//! A library for building long-running, multi-process daemons on POSIX
//! hosts: a supervised event loop (`scheduler`) plus a forked-worker
//! request/response mediator (`mediator`) over a shared-memory call
//! buffer and a typed message queue.
//!
//! A daemon-author constructs a [`scheduler::Daemon`], registers workers
//! through [`mediator::Mediator`], and supplies one per-tick `execute`
//! closure. The framework owns the main loop, signal plumbing, forked
//! background task lifecycle, and reaping.

#[macro_use]
extern crate lazy_static;

pub mod call;
pub mod config;
pub mod error;
pub mod event;
pub mod ipc;
pub mod log;
pub mod mediator;
pub mod process;
pub mod scheduler;
pub mod task;

pub use call::{Call, CallId, CallStatus};
pub use config::DaemonConfig;
pub use error::{DaemonError, ErrorCategory};
pub use event::{Event, EventBus};
pub use mediator::{ForkingStrategy, Mediator, MediatorConfig, OperationTable};
pub use process::{Process, ProcessTable};
pub use scheduler::{Daemon, SchedulerState};
pub use task::TaskRunner;

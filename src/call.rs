//! A single remote method invocation: identity, status, timings, and the
//! payload that crosses the IPC transport. The `promise` field is the only
//! part of a `Call` that never leaves the parent process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::mediator::Promise;

/// The reserved payload-store slot holding the protocol header. Call ids
/// start one past it so a call's id always doubles as its store address.
pub const RESERVED_HEADER_SLOT: u64 = 1;
const FIRST_CALL_ID: u64 = 2;

pub type CallId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(FIRST_CALL_ID);

fn next_call_id() -> CallId {
    NEXT_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum CallStatus {
    Uncalled,
    Called,
    Running,
    Returned,
    Cancelled,
    Timeout,
}

impl CallStatus {
    /// Terminal states (`Returned`/`Cancelled`/`Timeout`) all rank above
    /// `Running`, but are not ordered against each other: a call settles
    /// exactly once, so no code path ever compares two terminal statuses.
    fn rank(self) -> u8 {
        match self {
            CallStatus::Uncalled => 0,
            CallStatus::Called => 1,
            CallStatus::Running => 2,
            CallStatus::Returned | CallStatus::Cancelled | CallStatus::Timeout => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }
}

/// Outcome of a call as seen by the parent: the raw JSON value on success,
/// or a message describing the failure. Kept string-based (rather than
/// wrapping `DaemonError`) so it can round-trip through the payload store
/// and be handed to a `Promise`, which must not assume its error type is
/// `Clone`.
pub type CallOutcome = Result<serde_json::Value, String>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum CallResult {
    Ok(serde_json::Value),
    Err(String),
}

impl From<CallResult> for CallOutcome {
    fn from(r: CallResult) -> Self {
        match r {
            CallResult::Ok(v) => Ok(v),
            CallResult::Err(e) => Err(e),
        }
    }
}

impl From<CallOutcome> for CallResult {
    fn from(o: CallOutcome) -> Self {
        match o {
            Ok(v) => CallResult::Ok(v),
            Err(e) => CallResult::Err(e),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A single remote method invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub pid: i32,
    pub status: CallStatus,
    pub method: String,
    pub args: Vec<serde_json::Value>,
    pub time: HashMap<CallStatus, i64>,
    pub result: Option<CallResult>,
    /// Approximate wire footprint in bytes, used for the payload-store
    /// size warning.
    pub size: usize,
    pub attempts: u32,
    pub errors: u32,
    #[serde(skip)]
    pub promise: Option<Promise>,
    #[serde(skip)]
    collected: bool,
}

impl Call {
    /// Creates a fresh call with a newly minted id and records its
    /// creation timestamp under `Uncalled`.
    pub fn create(method: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        let method = method.into();
        let size = serde_json::to_vec(&args).map(|v| v.len()).unwrap_or(0) + method.len();
        let mut time = HashMap::new();
        time.insert(CallStatus::Uncalled, now_millis());
        Call {
            id: next_call_id(),
            pid: 0,
            status: CallStatus::Uncalled,
            method,
            args,
            time,
            result: None,
            size,
            attempts: 0,
            errors: 0,
            promise: None,
            collected: false,
        }
    }

    fn enter(&mut self, status: CallStatus) -> Result<(), String> {
        if status != CallStatus::Uncalled && status.rank() < self.status.rank() {
            return Err(format!(
                "cannot move call {} from {:?} back to {:?}",
                self.id, self.status, status
            ));
        }
        self.status = status;
        self.time.insert(status, now_millis());
        Ok(())
    }

    pub fn uncalled(&mut self) {
        self.status = CallStatus::Uncalled;
        self.time.insert(CallStatus::Uncalled, now_millis());
    }

    pub fn called(&mut self) -> Result<(), String> {
        self.attempts += 1;
        self.enter(CallStatus::Called)
    }

    pub fn running(&mut self, pid: i32) -> Result<(), String> {
        self.pid = pid;
        self.enter(CallStatus::Running)
    }

    pub fn returned(&mut self, result: CallResult) -> Result<(), String> {
        self.result = Some(result);
        self.enter(CallStatus::Returned)
    }

    pub fn cancelled(&mut self) -> Result<(), String> {
        self.enter(CallStatus::Cancelled)
    }

    pub fn timeout(&mut self, error: impl Into<String>) -> Result<(), String> {
        self.result = Some(CallResult::Err(error.into()));
        self.enter(CallStatus::Timeout)
    }

    /// Resets the call back to `Uncalled`, keeping its id, for retry. Per
    /// the Open Question decision recorded in DESIGN.md: the id also
    /// addresses the payload-store slot, so minting a fresh one on retry
    /// would orphan the old slot until GC.
    pub fn retry(&mut self) {
        self.errors += 1;
        self.result = None;
        self.uncalled();
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        self.result.clone().map(CallOutcome::from)
    }

    /// Frees `args`/`result` once a call is terminal and its promise has
    /// settled, so a bounded history can be kept without retaining
    /// payloads.
    pub fn gc(&mut self) {
        if !self.status.is_terminal() {
            return;
        }
        self.args.clear();
        self.result = None;
        self.collected = true;
    }

    pub fn is_collected(&self) -> bool {
        self.collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_never_collide_with_the_header_slot() {
        let a = Call::create("echo", vec![]);
        let b = Call::create("echo", vec![]);
        assert!(a.id > RESERVED_HEADER_SLOT);
        assert!(b.id > a.id);
    }

    #[test]
    fn status_is_monotone_except_reset_to_uncalled() {
        let mut call = Call::create("echo", vec![]);
        call.called().unwrap();
        call.running(42).unwrap();
        assert!(call.enter(CallStatus::Called).is_err());
        call.returned(CallResult::Ok(serde_json::json!("hi"))).unwrap();
        assert_eq!(call.status, CallStatus::Returned);
    }

    #[test]
    fn retry_resets_to_uncalled_and_keeps_the_same_id() {
        let mut call = Call::create("echo", vec![]);
        let id = call.id;
        call.called().unwrap();
        call.running(7).unwrap();
        call.timeout("call died").unwrap();
        call.retry();
        assert_eq!(call.id, id);
        assert_eq!(call.status, CallStatus::Uncalled);
        assert_eq!(call.errors, 1);
    }

    #[test]
    fn gc_frees_args_and_result_only_once_terminal() {
        let mut call = Call::create("echo", vec![serde_json::json!(1)]);
        call.gc();
        assert!(!call.is_collected());
        assert_eq!(call.args.len(), 1);

        call.called().unwrap();
        call.running(1).unwrap();
        call.returned(CallResult::Ok(serde_json::json!(1))).unwrap();
        call.gc();
        assert!(call.is_collected());
        assert!(call.args.is_empty());
        assert!(call.result.is_none());
    }

    #[test]
    fn serialization_round_trips_the_wire_fields() {
        let mut call = Call::create("echo", vec![serde_json::json!("hi")]);
        call.called().unwrap();
        let json = serde_json::to_string(&call).unwrap();
        let back: Call = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, call.id);
        assert_eq!(back.pid, call.pid);
        assert_eq!(back.status, call.status);
        assert_eq!(back.method, call.method);
        assert_eq!(back.args, call.args);
        assert_eq!(back.time, call.time);
        assert!(back.promise.is_none());
    }
}

//! In-process publish/subscribe used to cross-wire the scheduler, the
//! mediator, and user plugins.
//!
//! The original framework this crate generalizes mutates one shared event
//! object per dispatch to avoid allocation churn. We reimplement that as a
//! small tagged `Event` enum per event kind instead: the "stop and resume
//! propagation" contract is met by a dispatcher-owned [`Dispatch`] guard,
//! not by mutating a shared value, so a stale propagation flag can never
//! leak from one dispatch into the next.

use crate::call::CallId;
use crate::error::ErrorCategory;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum EventKind {
    Init,
    Idle,
    Fork,
    ParentFork,
    PidChange,
    PreExecute,
    PostExecute,
    AutoRestart,
    Signal,
    Shutdown,
    Error,
    Log,
    Stats,
    GenerateGuid,
    Reaped,
}

/// A single published occurrence. Each variant carries exactly the data a
/// subscriber of that kind needs; there is no mutable shared payload.
#[derive(Clone, Debug)]
pub enum Event {
    Init,
    Idle,
    Fork { group: String, pid: i32 },
    ParentFork { group: String, pid: i32 },
    PidChange { old: i32, new: i32 },
    PreExecute,
    PostExecute,
    AutoRestart,
    Signal { signum: i32, count: u64 },
    Shutdown,
    Error { message: String, category: ErrorCategory },
    Log { level: log::Level, message: String },
    Stats { text: String },
    GenerateGuid { alias: String },
    Reaped { pid: i32, group: String, call: Option<CallId> },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Init => EventKind::Init,
            Event::Idle => EventKind::Idle,
            Event::Fork { .. } => EventKind::Fork,
            Event::ParentFork { .. } => EventKind::ParentFork,
            Event::PidChange { .. } => EventKind::PidChange,
            Event::PreExecute => EventKind::PreExecute,
            Event::PostExecute => EventKind::PostExecute,
            Event::AutoRestart => EventKind::AutoRestart,
            Event::Signal { .. } => EventKind::Signal,
            Event::Shutdown => EventKind::Shutdown,
            Event::Error { .. } => EventKind::Error,
            Event::Log { .. } => EventKind::Log,
            Event::Stats { .. } => EventKind::Stats,
            Event::GenerateGuid { .. } => EventKind::GenerateGuid,
            Event::Reaped { .. } => EventKind::Reaped,
        }
    }
}

/// Per-dispatch propagation state, handed to every subscriber in turn.
/// Always starts "propagating"; a subscriber that calls
/// [`Dispatch::stop_propagation`] prevents lower-priority subscribers of
/// the same dispatch from running. The next dispatch gets a fresh guard,
/// so propagation is always re-enabled by construction rather than by an
/// explicit reset step.
pub struct Dispatch {
    propagate: bool,
}

impl Dispatch {
    fn new() -> Self {
        Dispatch { propagate: true }
    }

    pub fn stop_propagation(&mut self) {
        self.propagate = false;
    }

    pub fn is_propagating(&self) -> bool {
        self.propagate
    }
}

type Subscriber = Box<dyn FnMut(&Event, &mut Dispatch)>;

struct Registration {
    priority: i32,
    seq: u64,
    callback: Subscriber,
}

/// A single-threaded, priority-ordered publish/subscribe registry. Not
/// thread-safe: used only from the main loop, which also owns the flags
/// that signal handlers set (see `scheduler`).
#[derive(Default)]
pub struct EventBus {
    subscribers: std::collections::HashMap<EventKind, Vec<Registration>>,
    next_seq: u64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: std::collections::HashMap::new(),
            next_seq: 0,
        }
    }

    /// Registers a subscriber for `kind`. Higher `priority` runs first;
    /// ties break in registration order. Registration is legal at any
    /// time, including after `Init` has already been dispatched.
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        priority: i32,
        callback: impl FnMut(&Event, &mut Dispatch) + 'static,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let list = self.subscribers.entry(kind).or_insert_with(Vec::new);
        list.push(Registration {
            priority,
            seq,
            callback: Box::new(callback),
        });
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map(|l| l.len()).unwrap_or(0)
    }

    /// Synchronously runs every subscriber of `event`'s kind, in priority
    /// order, stopping early if one calls `stop_propagation`. Returns the
    /// dispatch guard so the caller can check whether propagation ran to
    /// completion.
    pub fn dispatch(&mut self, event: Event) -> Dispatch {
        let mut dispatch = Dispatch::new();
        let kind = event.kind();
        if let Some(list) = self.subscribers.get_mut(&kind) {
            for reg in list.iter_mut() {
                (reg.callback)(&event, &mut dispatch);
                if !dispatch.is_propagating() {
                    break;
                }
            }
        }
        dispatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn subscribers_run_in_priority_order() {
        let mut bus = EventBus::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe(EventKind::Idle, 0, move |_, _| o1.borrow_mut().push("low"));
        let o2 = order.clone();
        bus.subscribe(EventKind::Idle, 10, move |_, _| o2.borrow_mut().push("high"));

        bus.dispatch(Event::Idle);
        assert_eq!(*order.borrow(), vec!["high", "low"]);
    }

    #[test]
    fn stop_propagation_prevents_lower_priority_subscribers() {
        let mut bus = EventBus::new();
        let ran = Rc::new(RefCell::new(false));

        bus.subscribe(EventKind::Shutdown, 10, |_, d| d.stop_propagation());
        let ran_clone = ran.clone();
        bus.subscribe(EventKind::Shutdown, 0, move |_, _| {
            *ran_clone.borrow_mut() = true;
        });

        let dispatch = bus.dispatch(Event::Shutdown);
        assert!(!dispatch.is_propagating());
        assert!(!*ran.borrow());
    }

    #[test]
    fn propagation_resets_between_dispatches() {
        let mut bus = EventBus::new();
        bus.subscribe(EventKind::Idle, 0, |_, d| d.stop_propagation());

        let first = bus.dispatch(Event::Idle);
        assert!(!first.is_propagating());
        let second = bus.dispatch(Event::Idle);
        // A fresh Dispatch starts propagating even though the single
        // subscriber stops it again immediately.
        assert!(!second.is_propagating());
    }

    #[test]
    fn registration_after_dispatch_is_allowed() {
        let mut bus = EventBus::new();
        bus.dispatch(Event::Init);
        let hit = Rc::new(RefCell::new(false));
        let hit_clone = hit.clone();
        bus.subscribe(EventKind::Init, 0, move |_, _| *hit_clone.borrow_mut() = true);
        bus.dispatch(Event::Init);
        assert!(*hit.borrow());
    }
}

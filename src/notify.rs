//! Change notifier - named-event publish/subscribe, scoped per annotation.
//!
//! Observers (views, scripts) connect handlers to named events and are
//! called synchronously, in subscription order, when the annotation store
//! emits. Dispatch snapshots the registry and re-checks each subscription
//! before invoking it, so a handler may disconnect itself or any other
//! handler mid-dispatch without unaffected handlers being skipped or called
//! twice. A handler that emits again simply recurses.
//!
//! Handler errors are not caught: the first failing handler aborts the
//! dispatch and its error propagates to the emitter. Collaborators
//! registering fallible handlers must guard accordingly; by the time a
//! store mutation emits, the mutation itself is already durable.
//!
//! The notifier is single-threaded by design, like the annotation it is
//! scoped to; clones share one registry.

use std::cell::RefCell;
use std::rc::Rc;

use crate::annotation::EventId;
use crate::error::Result;
use crate::track::TrackKind;

/// Well-known event names emitted by the core.
pub mod events {
    pub const EVENT_INSERTED: &str = "event_inserted";
    pub const EVENT_REMOVED: &str = "event_removed";
    pub const EVENT_TEXT_CHANGED: &str = "event_text_changed";
    pub const EVENT_BOUNDARY_CHANGED: &str = "event_boundary_changed";
    pub const ANALYSIS_READY: &str = "analysis_ready";
}

/// Payload delivered to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangePayload {
    EventInserted { layer: usize, event: EventId },
    EventRemoved { layer: usize, event: EventId },
    EventTextChanged { event: EventId },
    EventBoundaryChanged { event: EventId },
    AnalysisReady { kind: TrackKind },
}

/// Handle returned by [`Notifier::connect`], used to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Rc<dyn Fn(&ChangePayload) -> Result<()>>;

struct Subscription {
    id: u64,
    name: String,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subs: Vec<Subscription>,
}

/// Named-event bus with synchronous, subscription-ordered dispatch.
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Rc<RefCell<Registry>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a handler to a named event.
    ///
    /// Handlers fire in connection order. Connecting during a dispatch is
    /// allowed; the new handler first fires on the next emission.
    pub fn connect<F>(&self, event_name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ChangePayload) -> Result<()> + 'static,
    {
        let mut reg = self.inner.borrow_mut();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.subs.push(Subscription {
            id,
            name: event_name.to_owned(),
            handler: Rc::new(handler),
        });
        SubscriptionId(id)
    }

    /// Disconnect a subscription. Returns false if it was already gone.
    /// Safe to call from inside a handler, including on the running
    /// subscription itself.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut reg = self.inner.borrow_mut();
        let before = reg.subs.len();
        reg.subs.retain(|s| s.id != id.0);
        reg.subs.len() != before
    }

    /// Number of live subscriptions for a named event.
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.inner
            .borrow()
            .subs
            .iter()
            .filter(|s| s.name == event_name)
            .count()
    }

    /// Deliver `payload` to every handler connected to `event_name`,
    /// synchronously and in subscription order, before returning.
    ///
    /// The first handler error aborts the remaining dispatch and is
    /// returned to the caller.
    pub fn emit(&self, event_name: &str, payload: &ChangePayload) -> Result<()> {
        // Snapshot, then revalidate each subscription just before invoking
        // it: handlers may disconnect anything while we iterate.
        let snapshot: Vec<(u64, Handler)> = self
            .inner
            .borrow()
            .subs
            .iter()
            .filter(|s| s.name == event_name)
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        for (id, handler) in snapshot {
            let still_connected = self.inner.borrow().subs.iter().any(|s| s.id == id);
            if still_connected {
                handler(payload)?;
            }
        }
        Ok(())
    }
}

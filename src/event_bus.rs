//! In-process lifecycle event fan-out.
//!
//! The event bus is the backbone of engine observability: the runner, cost
//! tracker, and candidate engine publish lifecycle events; subscribers (live
//! UIs, the analytics scheduler, the embedding worker) consume them from
//! independent bounded queues.
//!
//! # Delivery semantics
//!
//! - `publish` is non-blocking. A subscriber whose queue is full loses the
//!   event **for that subscriber only**; the drop is counted and traced.
//! - Subscribers may filter by session id and event type at subscription
//!   time, so a per-request UI sees only its own session.
//! - Shutdown delivers a poison pill to every queue. Subscribers must
//!   tolerate missing events; the bus promises liveness, not completeness.
//!
//! ```
//! use rvbbit::event_bus::{Event, EventBus, SubscriptionFilter};
//!
//! let bus = EventBus::new(64);
//! let sub = bus.subscribe(SubscriptionFilter::session("s1"));
//! bus.publish(Event::now("cell_start", "s1", serde_json::json!({"cell": "extract"})));
//! let received = sub.try_recv().unwrap();
//! assert_eq!(received.event_type, "cell_start");
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default per-subscriber queue capacity.
const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

/// Event type published when a cascade starts.
pub const EVENT_CASCADE_START: &str = "cascade_start";
/// Event type published when a cascade completes.
pub const EVENT_CASCADE_COMPLETE: &str = "cascade_complete";
/// Event type published when a cascade fails.
pub const EVENT_CASCADE_ERROR: &str = "cascade_error";
/// Event type published at cell entry.
pub const EVENT_CELL_START: &str = "cell_start";
/// Event type published after lineage is appended.
pub const EVENT_CELL_COMPLETE: &str = "cell_complete";
/// Event type published when provider cost data is reconciled.
pub const EVENT_COST_UPDATE: &str = "cost_update";
/// Event type published when a session suspends at a checkpoint.
pub const EVENT_CHECKPOINT_SUSPENDED: &str = "checkpoint_suspended";
/// Event type published when a suspended session resumes.
pub const EVENT_CHECKPOINT_RESUMED: &str = "checkpoint_resumed";

/// An immutable lifecycle event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn now(event_type: impl Into<String>, session_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// A message delivered to a subscriber queue.
#[derive(Clone, Debug)]
pub enum BusMessage {
    Event(Event),
    /// Poison pill: the bus is shutting down and no further events arrive.
    Shutdown,
}

/// Filter applied before enqueueing an event for a subscriber.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    pub session_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl SubscriptionFilter {
    /// Receive every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Receive only events for one session.
    #[must_use]
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            event_types: None,
        }
    }

    /// Restrict to the given event types.
    #[must_use]
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(session) = &self.session_id {
            if session != &event.session_id {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    id: u64,
    filter: SubscriptionFilter,
    sender: flume::Sender<BusMessage>,
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle detaches the subscriber; the bus prunes its entry on
/// the next publish.
pub struct Subscription {
    id: u64,
    receiver: flume::Receiver<BusMessage>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Block (async) until the next event or shutdown.
    ///
    /// Returns `None` once the bus has shut down or the subscription is
    /// detached.
    pub async fn recv(&self) -> Option<Event> {
        match self.receiver.recv_async().await {
            Ok(BusMessage::Event(event)) => Some(event),
            Ok(BusMessage::Shutdown) | Err(_) => None,
        }
    }

    /// Non-blocking receive, for drain-style consumers and tests.
    pub fn try_recv(&self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(BusMessage::Event(event)) => Some(event),
            _ => None,
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.detach(self.id);
    }
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicUsize,
}

impl BusInner {
    fn detach(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }
}

/// The shared event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given per-subscriber queue capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                dropped: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a new subscriber with an independent bounded queue.
    #[must_use]
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let (sender, receiver) = flume::bounded(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(Subscriber {
            id,
            filter,
            sender,
        });
        Subscription {
            id,
            receiver,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Publish an event to all matching subscribers without blocking.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|subscriber| {
            if !subscriber.filter.matches(&event) {
                return !subscriber.sender.is_disconnected();
            }
            match subscriber.sender.try_send(BusMessage::Event(event.clone())) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    // Slow subscriber: drop for this subscriber only.
                    let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        target: "rvbbit::event_bus",
                        event_type = %event.event_type,
                        total_dropped = total,
                        "subscriber queue full; event dropped"
                    );
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Total events dropped across all subscribers since construction.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Current subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Deliver a poison pill to every subscriber and clear the registry.
    pub fn shutdown(&self) {
        let mut subscribers = self.inner.subscribers.lock();
        for subscriber in subscribers.drain(..) {
            let _ = subscriber.sender.try_send(BusMessage::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let bus = EventBus::new(1);
        let slow = bus.subscribe(SubscriptionFilter::all());
        let fast = bus.subscribe(SubscriptionFilter::all());

        bus.publish(Event::now("a", "s", json!({})));
        // The fast subscriber drains; the slow one leaves its queue full.
        assert_eq!(fast.drain().len(), 1);
        bus.publish(Event::now("b", "s", json!({})));

        // Only the slow subscriber lost the second event.
        assert_eq!(bus.dropped(), 1);
        assert_eq!(fast.drain().len(), 1);
        let slow_events = slow.drain();
        assert_eq!(slow_events.len(), 1);
        assert_eq!(slow_events[0].event_type, "a");
    }

    #[test]
    fn filter_by_session_and_type() {
        let bus = EventBus::new(16);
        let sub = bus
            .subscribe(SubscriptionFilter::session("s1").with_types(["cost_update"]));
        bus.publish(Event::now("cost_update", "s2", json!({})));
        bus.publish(Event::now("cell_start", "s1", json!({})));
        bus.publish(Event::now("cost_update", "s1", json!({"cost": 0.1})));
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["cost"], json!(0.1));
    }

    #[test]
    fn shutdown_delivers_poison_pill() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe(SubscriptionFilter::all());
        bus.shutdown();
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn dropped_subscription_is_pruned_on_publish() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe(SubscriptionFilter::all());
        drop(sub);
        bus.publish(Event::now("x", "s", json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }
}

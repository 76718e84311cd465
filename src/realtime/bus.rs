//! # Local Event Bus
//!
//! In-process fan-out from "a change arrived on topic T" to any number of
//! local listeners. UI data layers register here and invalidate their own
//! caches; the supervisor only ever publishes.
//!
//! Delivery is synchronous and, within one topic, in registration order.
//! A panicking listener is contained and the remaining listeners still run.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use super::event::ChangeEvent;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};

/// Listener callback
pub type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Listener,
}

/// Topic-keyed listener registry
pub struct EventBus {
    /// Registrations by topic, in registration order
    listeners: RwLock<HashMap<String, Vec<Registration>>>,

    next_id: AtomicU64,

    metrics: Option<Arc<MetricsRegistry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self
            .listeners
            .read()
            .map(|l| l.len())
            .unwrap_or(0);
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics: None,
        }
    }
}

/// Capability returned by [`EventBus::subscribe_local`]
///
/// Dropping the handle does not unregister; call [`ListenerHandle::unregister`].
pub struct ListenerHandle {
    topic: String,
    id: u64,
    active: Arc<AtomicBool>,
    bus: Weak<EventBus>,
}

impl ListenerHandle {
    /// Remove exactly this listener. Idempotent.
    pub fn unregister(&self) {
        // Flag first: an in-progress publish re-checks it before each call.
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.topic, self.id);
        }
    }

    /// Whether the listener is still registered
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Outcome of one publish
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Listeners that returned normally
    pub delivered: usize,
    /// Listeners that panicked
    pub faulted: usize,
}

impl EventBus {
    /// Create a new bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that records publish counters
    pub fn with_metrics(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    /// Register `listener` on `topic`
    pub fn subscribe_local<F>(self: &Arc<Self>, topic: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let registration = Registration {
            id,
            active: Arc::clone(&active),
            listener: Arc::new(listener),
        };

        if let Ok(mut listeners) = self.listeners.write() {
            listeners
                .entry(topic.to_string())
                .or_default()
                .push(registration);
        }

        ListenerHandle {
            topic: topic.to_string(),
            id,
            active,
            bus: Arc::downgrade(self),
        }
    }

    /// Deliver `payload` to every listener on `topic`
    ///
    /// The registration list is copied before delivery so listeners may
    /// (un)register from inside their callback without deadlocking.
    pub fn publish(&self, topic: &str, payload: &ChangeEvent) -> DeliveryReport {
        let registrations: Vec<Registration> = match self.listeners.read() {
            Ok(listeners) => listeners.get(topic).cloned().unwrap_or_default(),
            Err(_) => return DeliveryReport::default(),
        };

        let mut report = DeliveryReport::default();
        for registration in registrations {
            if !registration.active.load(Ordering::SeqCst) {
                continue;
            }
            let listener = &registration.listener;
            match panic::catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(()) => report.delivered += 1,
                Err(cause) => {
                    report.faulted += 1;
                    let message = panic_message(cause.as_ref());
                    log_event_with_fields(
                        Event::ListenerFault,
                        &[("topic", topic), ("message", message.as_str())],
                    );
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.increment_events_published();
            metrics.add_listener_faults(report.faulted as u64);
        }
        report
    }

    /// Publish under the event's own topic (its source table)
    pub fn publish_event(&self, event: &ChangeEvent) -> DeliveryReport {
        self.publish(event.topic(), event)
    }

    /// Number of live listeners on `topic`
    pub fn listener_count(&self, topic: &str) -> usize {
        self.listeners
            .read()
            .map(|l| l.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn remove(&self, topic: &str, id: u64) {
        if let Ok(mut listeners) = self.listeners.write() {
            if let Some(registrations) = listeners.get_mut(topic) {
                registrations.retain(|r| r.id != id);
                if registrations.is_empty() {
                    listeners.remove(topic);
                }
            }
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

//! Lifecycle event subscriptions

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use stagehand_service::ServiceId;
use tracing::trace;

/// Notification emitted by the service manager
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// A service reached `Running`
    ServiceStarted {
        /// Service id
        service: ServiceId,
        /// Display name
        name: String,
        /// Time spent in `start`
        elapsed: Duration,
    },
    /// A service reached `Stopped`
    ServiceStopped {
        /// Service id
        service: ServiceId,
        /// Display name
        name: String,
    },
    /// A start or stop attempt failed
    ServiceFailed {
        /// Service id
        service: ServiceId,
        /// Display name
        name: String,
        /// Failure description
        error: String,
        /// Whether a restart may be attempted
        can_restart: bool,
    },
    /// A staged initialization phase finished
    PhaseCompleted(PhaseCompletion),
}

/// Summary of a finished initialization phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCompletion {
    /// 1-based phase number
    pub phase_number: usize,
    /// Phase name
    pub phase_name: String,
    /// Whether every service in the phase started
    pub success: bool,
    /// Services that reached `Running`
    pub services_started: Vec<ServiceId>,
    /// Services that failed
    pub services_failed: Vec<ServiceId>,
    /// Wall time of the phase
    pub duration: Duration,
}

type Listeners = DashMap<u64, flume::Sender<ManagerEvent>>;

/// Fan-out of manager events to any number of subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    listeners: Arc<Listeners>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an event bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::unbounded();
        self.listeners.insert(id, tx);

        Subscription {
            id,
            receiver: rx,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver an event to every live subscriber
    pub fn emit(&self, event: &ManagerEvent) {
        let mut closed = Vec::new();

        for listener in self.listeners.iter() {
            if listener.value().send(event.clone()).is_err() {
                closed.push(*listener.key());
            }
        }

        for id in closed {
            trace!("Pruning closed event subscriber {}", id);
            self.listeners.remove(&id);
        }
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.listeners.clear();
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

/// A subscription handle that unsubscribes on drop
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: flume::Receiver<ManagerEvent>,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Wait for the next event; `None` once the bus has dropped this subscriber
    pub async fn recv(&self) -> Option<ManagerEvent> {
        self.receiver.recv_async().await.ok()
    }

    /// Take the next event if one is queued
    pub fn try_recv(&self) -> Option<ManagerEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drain every queued event
    pub fn drain(&self) -> Vec<ManagerEvent> {
        self.receiver.drain().collect()
    }

    /// Remove this subscriber from the bus
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(id: &str) -> ManagerEvent {
        ManagerEvent::ServiceStopped {
            service: ServiceId::from(id),
            name: id.to_string(),
        }
    }

    #[test]
    fn test_every_subscriber_receives_events() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.emit(&stopped("cache"));

        assert_eq!(first.drain(), vec![stopped("cache")]);
        assert_eq!(second.drain(), vec![stopped("cache")]);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let subscription = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        subscription.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        bus.emit(&stopped("cache"));
    }

    #[tokio::test]
    async fn test_clear_ends_subscriptions() {
        let bus = EventBus::new();
        let subscription = bus.subscribe();

        bus.clear();

        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(subscription.recv().await, None);
    }
}

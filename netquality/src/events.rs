//! Change and sample notifications.
//!
//! Consumers either register keyed callbacks ([`EventHub::subscribe`]) or
//! take a broadcast receiver ([`EventHub::subscribe_channel`]). Callbacks run
//! synchronously on the publishing task, outside any internal lock, so a
//! listener may unsubscribe itself or read engine state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::measurement::MeasurementSample;
use crate::state::ConnectionChange;

/// Capacity of the broadcast channel; slow receivers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notification published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Connection state was updated.
    Change(ConnectionChange),
    /// A probe produced a raw sample.
    Sample(MeasurementSample),
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Change(_) => EventKind::Change,
            EngineEvent::Sample(_) => EventKind::Sample,
        }
    }
}

/// Event type a callback listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Change,
    Sample,
}

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

struct Registration {
    kind: EventKind,
    listener: Listener,
}

/// Observer list plus broadcast channel.
pub struct EventHub {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<ListenerId, Registration>>,
    channel: broadcast::Sender<EngineEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(BTreeMap::new()),
            channel,
        }
    }

    /// Register a callback for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(
            id,
            Registration {
                kind,
                listener: Arc::new(listener),
            },
        );
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    /// Receive every event over a broadcast channel.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<EngineEvent> {
        self.channel.subscribe()
    }

    /// Number of registered callbacks.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn publish_sample(&self, sample: &MeasurementSample) {
        self.publish(EngineEvent::Sample(sample.clone()));
    }

    pub fn publish_change(&self, change: &ConnectionChange) {
        self.publish(EngineEvent::Change(change.clone()));
    }

    fn publish(&self, event: EngineEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .values()
            .filter(|registration| registration.kind == kind)
            .map(|registration| Arc::clone(&registration.listener))
            .collect();

        for listener in targets {
            listener(&event);
        }

        // No receivers is not an error.
        let _ = self.channel.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listener_count())
            .field("channel_receivers", &self.channel.receiver_count())
            .finish()
    }
}

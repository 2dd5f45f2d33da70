//! Process-local beacon lifecycle events
//!
//! Delivery is best-effort: publishing with no subscribers, or to a subscriber
//! that has fallen behind, is not an error.

use crate::model::Beacon;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default capacity of the local broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A beacon joined the active set
    Added,
    /// The radio started advertising a beacon
    Started,
    /// A beacon stopped advertising or left the active set
    Stopped,
    Paused,
    /// The radio could not advertise a beacon
    Failed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => write!(f, "added"),
            EventKind::Started => write!(f, "started"),
            EventKind::Stopped => write!(f, "stopped"),
            EventKind::Paused => write!(f, "paused"),
            EventKind::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BeaconEvent {
    pub kind: EventKind,
    pub beacon: Arc<Beacon>,
}

impl BeaconEvent {
    pub fn new(kind: EventKind, beacon: Arc<Beacon>) -> Self {
        Self { kind, beacon }
    }
}

/// Publish side of the lifecycle event bus
pub trait EventNotifier: Send + Sync {
    fn publish(&self, event: BeaconEvent);
}

/// Event bus backed by a tokio broadcast channel
#[derive(Clone)]
pub struct LocalBroadcaster {
    tx: broadcast::Sender<BeaconEvent>,
}

impl LocalBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BeaconEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventNotifier for LocalBroadcaster {
    fn publish(&self, event: BeaconEvent) {
        let kind = event.kind;
        let storage_id = event.beacon.saved_id();
        if self.tx.send(event).is_err() {
            tracing::trace!("No subscribers for {} event (beacon {})", kind, storage_id);
        }
    }
}

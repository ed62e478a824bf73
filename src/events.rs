//! Notifications produced by the cell cache
//!
//! Implements a fan-out of cell events with:
//! - Synchronous sinks called on the thread that produced the event
//! - Broadcast subscriptions for async consumers
//!
//! Sinks run inline on lifecycle and download threads and must return quickly.

use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::transform::{CellBounds, CellTransform};
use crate::types::{CellId, CellStatus, ChangeSource};

/// Event emitted toward rendering and UI collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellEvent {
    /// A cell moved one lifecycle step
    StatusChanged {
        /// Cell
        cell: CellId,
        /// Previous status
        from: CellStatus,
        /// New status
        to: CellStatus,
    },
    /// A cell's world transform was recomputed
    TransformChanged {
        /// Cell
        cell: CellId,
        /// Origin of the change
        source: ChangeSource,
        /// New world transform
        world: Option<CellTransform>,
        /// New world bounds
        world_bounds: Option<CellBounds>,
    },
    /// A cell was created and attached
    Loaded {
        /// Cell
        cell: CellId,
        /// Type identifier
        type_name: String,
    },
    /// A cell was removed from the cache
    Unloaded {
        /// Cell
        cell: CellId,
    },
    /// Creating a cell failed
    LoadFailed {
        /// Cell that failed
        cell: CellId,
        /// Type identifier it declared
        type_name: String,
        /// Parent it declared
        parent: Option<CellId>,
        /// Failure description
        cause: String,
    },
}

impl CellEvent {
    /// Get the event type as string
    pub fn event_type(&self) -> &str {
        match self {
            CellEvent::StatusChanged { .. } => "STATUS",
            CellEvent::TransformChanged { .. } => "TRANSFORM",
            CellEvent::Loaded { .. } => "LOADED",
            CellEvent::Unloaded { .. } => "UNLOADED",
            CellEvent::LoadFailed { .. } => "LOAD_FAILED",
        }
    }

    /// Cell the event concerns
    pub fn cell(&self) -> CellId {
        match self {
            CellEvent::StatusChanged { cell, .. }
            | CellEvent::TransformChanged { cell, .. }
            | CellEvent::Loaded { cell, .. }
            | CellEvent::Unloaded { cell }
            | CellEvent::LoadFailed { cell, .. } => *cell,
        }
    }
}

/// Receiver of cell events
pub trait CellEventSink: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &CellEvent);
}

/// Shared event sink
pub type BoxedEventSink = Arc<dyn CellEventSink>;

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl CellEventSink for NullSink {
    fn on_event(&self, _event: &CellEvent) {}
}

impl<F> CellEventSink for F
where
    F: Fn(&CellEvent) + Send + Sync,
{
    fn on_event(&self, event: &CellEvent) {
        self(event)
    }
}

/// Stream of events for one subscriber
pub struct EventStream {
    rx: broadcast::Receiver<CellEvent>,
}

impl EventStream {
    /// Receive next event, `None` once the hub is gone.
    ///
    /// A lagging subscriber skips the events it missed.
    pub async fn recv(&mut self) -> Option<CellEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive an already-buffered event without waiting
    pub fn try_recv(&mut self) -> Option<CellEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Fan-out of events to registered sinks and broadcast subscribers
pub struct EventHub {
    tx: broadcast::Sender<CellEvent>,
    sinks: RwLock<Vec<BoxedEventSink>>,
}

impl EventHub {
    /// Create new hub with the given broadcast buffer size
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register a synchronous sink
    pub fn add_sink(&self, sink: BoxedEventSink) {
        self.sinks.write().push(sink);
    }

    /// Remove a previously registered sink
    pub fn remove_sink(&self, sink: &BoxedEventSink) -> bool {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        sinks.len() != before
    }

    /// Subscribe to the broadcast stream
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of broadcast subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl CellEventSink for EventHub {
    fn on_event(&self, event: &CellEvent) {
        // Snapshot so a sink may register or remove sinks while handling
        let sinks: Vec<BoxedEventSink> = self.sinks.read().clone();
        for sink in sinks {
            sink.on_event(event);
        }
        // Ignore send errors (no receivers)
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loaded(id: u64) -> CellEvent {
        CellEvent::Loaded {
            cell: CellId::new(id),
            type_name: "box".to_string(),
        }
    }

    #[test]
    fn test_event_accessors() {
        let event = CellEvent::StatusChanged {
            cell: CellId::new(3),
            from: CellStatus::Disk,
            to: CellStatus::Bounded,
        };
        assert_eq!(event.event_type(), "STATUS");
        assert_eq!(event.cell(), CellId::new(3));
    }

    #[test]
    fn test_hub_fans_out_to_sinks() {
        let hub = EventHub::default();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sink: BoxedEventSink = Arc::new(move |_: &CellEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        hub.add_sink(sink.clone());

        hub.on_event(&loaded(1));
        hub.on_event(&loaded(2));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(hub.remove_sink(&sink));
        hub.on_event(&loaded(3));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hub_stream() {
        let hub = Arc::new(EventHub::default());
        let mut stream = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        let hub_clone = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            hub_clone.on_event(&loaded(5));
        });

        let event = tokio::time::timeout(std::time::Duration::from_millis(500), stream.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(loaded(5)));
        assert_eq!(stream.try_recv(), None);
    }
}

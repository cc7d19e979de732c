use super::types::{AreaId, ConnectionId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Outbound notification for one listener of a storage area.
///
/// `area_id` is the listener's own area id. `source_area` is the id of the
/// area that made the change, but only when the listener lives on the same
/// connection as the writer; peers on other connections get `None`. A client
/// uses this to tell its own echo apart from someone else's change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageEvent {
    /// A single key was set or removed
    ItemChanged {
        area_id: AreaId,
        source_area: Option<AreaId>,
        key: String,
        old_value: Option<String>,
        new_value: Option<String>,
        url: String,
    },
    /// The whole area was cleared. Carries no key or values.
    Cleared {
        area_id: AreaId,
        source_area: Option<AreaId>,
        url: String,
    },
    /// The area was purged from outside; any client-side cache must be dropped.
    CacheInvalidated { area_id: AreaId },
}

impl StorageEvent {
    pub fn area_id(&self) -> AreaId {
        match self {
            StorageEvent::ItemChanged { area_id, .. }
            | StorageEvent::Cleared { area_id, .. }
            | StorageEvent::CacheInvalidated { area_id } => *area_id,
        }
    }
}

/// The transport side: delivers events to a connection.
///
/// Called from the storage worker only, so implementations should hand the
/// event off and return quickly.
pub trait EventSink: Send + Sync {
    fn send(&self, connection: ConnectionId, event: StorageEvent);
}

/// Deliveries as seen by a channel based transport.
pub type Delivery = (ConnectionId, StorageEvent);

impl EventSink for mpsc::UnboundedSender<Delivery> {
    fn send(&self, connection: ConnectionId, event: StorageEvent) {
        // Fails only when the receiver is gone, in which case nobody listens.
        let _ = mpsc::UnboundedSender::send(self, (connection, event));
    }
}

impl EventSink for broadcast::Sender<Delivery> {
    fn send(&self, connection: ConnectionId, event: StorageEvent) {
        // broadcast::Sender::send() fails only when there are 0 receivers.
        let _ = broadcast::Sender::send(self, (connection, event));
    }
}

/// Sink that drops every event, for embedders that only poll values.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, _connection: ConnectionId, _event: StorageEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_delivers_addressed_events() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let conn = ConnectionId::new();

        EventSink::send(&tx, conn, StorageEvent::CacheInvalidated { area_id: AreaId(7) });

        let (to, ev) = rx.try_recv().unwrap();
        assert_eq!(to, conn);
        assert_eq!(ev.area_id(), AreaId(7));
    }

    #[test]
    fn broadcast_sink_without_receivers_is_silent() {
        let (tx, rx) = broadcast::channel::<Delivery>(4);
        drop(rx);
        EventSink::send(
            &tx,
            ConnectionId::new(),
            StorageEvent::Cleared {
                area_id: AreaId(1),
                source_area: None,
                url: "https://example.com/".into(),
            },
        );
    }
}

//! Session name to the connection currently attached to it.
//!
//! All mutation goes through [`ConnectionRegistry::claim`] and
//! [`ConnectionRegistry::release`]. A claim overwrites the previous holder
//! and returns it so the claimant can evict it; a release only removes the
//! entry if the caller is still the holder, so a superseded connection
//! tearing down late cannot unregister its successor.

use std::time::Duration;

use dashmap::DashMap;
use pt_core::naming::SessionName;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Sent to a superseded connection. The connection acknowledges once its
/// close frame has been written.
#[derive(Debug)]
pub struct Eviction {
    pub ack: oneshot::Sender<()>,
}

/// Registry entry for one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    evict_tx: flume::Sender<Eviction>,
}

impl ConnectionHandle {
    pub fn new(id: Uuid, evict_tx: flume::Sender<Eviction>) -> Self {
        Self { id, evict_tx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ask the connection to close as superseded and wait up to `timeout`
    /// for it to confirm. Returns `false` if it was already gone or did not
    /// answer in time.
    pub async fn evict(&self, timeout: Duration) -> bool {
        let (ack, acked) = oneshot::channel();
        if self.evict_tx.send_async(Eviction { ack }).await.is_err() {
            debug!(conn_id = %self.id, "evicted connection already gone");
            return false;
        }
        matches!(tokio::time::timeout(timeout, acked).await, Ok(Ok(())))
    }
}

/// Process-wide map of attached connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SessionName, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the holder of `name`, returning the previous
    /// holder if there was one.
    pub fn claim(&self, name: SessionName, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(name, handle)
    }

    /// Remove the entry for `name` if connection `id` still holds it.
    pub fn release(&self, name: &SessionName, id: Uuid) -> bool {
        self.connections
            .remove_if(name, |_, holder| holder.id == id)
            .is_some()
    }

    pub fn is_attached(&self, name: &SessionName) -> bool {
        self.connections.contains_key(name)
    }

    /// Id of the connection currently holding `name`.
    pub fn holder(&self, name: &SessionName) -> Option<Uuid> {
        self.connections.get(name).map(|h| h.id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

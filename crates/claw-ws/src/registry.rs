//! Registry of live connections belonging to one endpoint.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::DEFAULT_CLOSE_TIMEOUT_MS;
use crate::conn::Conn;
use crate::error::CloseReason;
use crate::transport::ConnectionId;

/// Initial capacity of the connection map.
const INITIAL_CAPACITY: usize = 1024;

/// Concurrency-safe set of live connections keyed by [`ConnectionId`].
///
/// The lock only guards map membership. Close frames and socket teardown in
/// [`close_all`](Self::close_all) happen after it is released, so closing
/// connections can re-enter [`remove`](Self::remove) without deadlocking.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Conn>>,
    close_timeout: Duration,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_close_timeout(Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS))
    }

    /// Create an empty registry with a bound on close-frame delivery.
    #[must_use]
    pub fn with_close_timeout(close_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::with_capacity(INITIAL_CAPACITY)),
            close_timeout,
        }
    }

    /// Register a live connection.
    ///
    /// # Panics
    ///
    /// Panics if a connection with the same ID is already registered. IDs are
    /// unique per transport, so a duplicate means the transport is broken.
    #[allow(clippy::panic)]
    pub fn add(&self, conn: Conn) {
        let id = conn.id();
        let mut connections = self.connections.lock();
        if connections.contains_key(&id) {
            panic!("duplicate connection: {id}");
        }
        connections.insert(id, conn);
        debug!(conn_id = %id, total = connections.len(), "Connection registered");
    }

    /// Unregister a connection. Absent IDs are ignored.
    pub fn remove(&self, id: ConnectionId) -> Option<Conn> {
        let removed = self.connections.lock().remove(&id);
        if removed.is_some() {
            debug!(conn_id = %id, "Connection unregistered");
        }
        removed
    }

    /// Get a registered connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Conn> {
        self.connections.lock().get(&id).cloned()
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// IDs of all registered connections.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().copied().collect()
    }

    /// Snapshot of all registered connections.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Conn> {
        self.connections.lock().values().cloned().collect()
    }

    /// Drain the registry and close every connection that was in it.
    ///
    /// When `reason` is given, each connection first gets a close frame with
    /// that code and reason, and `on_close` later receives it as
    /// [`WsError::Closed`](crate::WsError::Closed). Delivery is best effort and
    /// bounded by the close timeout; the connection is closed either way.
    /// Reserved codes such as 1006 are never written.
    /// Connections added while this runs land in the fresh map.
    ///
    /// Returns the number of connections drained.
    pub async fn close_all(&self, reason: Option<CloseReason>) -> usize {
        let drained = {
            let mut connections = self.connections.lock();
            std::mem::replace(&mut *connections, HashMap::with_capacity(INITIAL_CAPACITY))
        };

        let count = drained.len();
        if count == 0 {
            return 0;
        }

        info!(
            count,
            code = reason.as_ref().map(|r| r.code),
            "Closing all connections"
        );

        let close_timeout = self.close_timeout;
        let reason = reason.as_ref();
        join_all(drained.into_values().map(|conn| async move {
            if let Some(reason) = reason {
                match tokio::time::timeout(
                    close_timeout,
                    conn.write_close(reason.code, &reason.reason),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(conn_id = %conn.id(), error = %e, "Close frame not delivered");
                    }
                    Err(_) => {
                        debug!(conn_id = %conn.id(), "Close frame timed out");
                    }
                }
                conn.close_with(reason.clone().into_error());
            } else {
                conn.close();
            }
        }))
        .await;

        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Connection Registry
//!
//! Maps an authenticated user to their single live transport handle. A user
//! can only hold one connection: registering again (say, after a page
//! refresh) replaces the old mapping, and unregistration is guarded by the
//! connection id so a stale close handler can never evict the newer
//! connection that superseded it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::network::protocol::ServerMessage;
use crate::session::state::UserId;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Cheap, cloneable handle to one connection's outbound queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Which physical connection this handle belongs to.
    pub connection_id: ConnectionId,
    sender: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    /// Wrap an outbound queue.
    pub fn new(connection_id: ConnectionId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    /// Queue a message without waiting. A full buffer drops the message
    /// rather than stall the caller; the writer task owns draining.
    fn try_send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection_id = self.connection_id,
                    "outbound buffer full, dropping message"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// The user-to-connection table.
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record the live connection for a user, replacing any prior one
    /// (last writer wins).
    pub async fn register(&self, user_id: UserId, handle: ConnectionHandle) {
        let mut connections = self.connections.write().await;
        connections.insert(user_id, handle);
    }

    /// Remove the mapping, but only if it still belongs to the caller's
    /// connection. Returns whether a mapping was removed.
    pub async fn unregister(&self, user_id: &UserId, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user_id) {
            Some(handle) if handle.connection_id == connection_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Best-effort delivery. `false` means "recipient offline", which is
    /// never an error for callers.
    pub async fn send(&self, user_id: &UserId, message: ServerMessage) -> bool {
        let handle = {
            let connections = self.connections.read().await;
            connections.get(user_id).cloned()
        };
        match handle {
            Some(handle) => handle.try_send(message),
            None => false,
        }
    }

    /// Point-in-time liveness check, not a guarantee.
    pub async fn is_online(&self, user_id: &UserId) -> bool {
        let connections = self.connections.read().await;
        connections.contains_key(user_id)
    }

    /// Number of registered users.
    pub async fn online_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

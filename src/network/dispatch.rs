//! Broadcast Dispatcher
//!
//! Fan-out of server messages to one user or to every member of a lobby.
//! Delivery is always best-effort: an offline member simply receives
//! nothing, and a slow consumer never delays the others (the registry send
//! is non-blocking).

use std::sync::Arc;

use crate::network::protocol::{LobbyUpdate, ServerMessage};
use crate::network::registry::ConnectionRegistry;
use crate::session::state::{LobbySession, UserId};

/// Message fan-out over the connection registry.
pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastDispatcher {
    /// Wrap a registry.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send to a single user. Returns whether delivery was attempted.
    pub async fn send_to_user(&self, user_id: &UserId, message: ServerMessage) -> bool {
        self.registry.send(user_id, message).await
    }

    /// Send to every member in a snapshot of lobby player ids. The snapshot
    /// is taken by the caller while holding the lobby lock; members who
    /// disconnect between snapshot and send just miss the message.
    ///
    /// Returns the number of members delivery was attempted for.
    pub async fn send_to_members(&self, members: &[UserId], message: ServerMessage) -> usize {
        let mut delivered = 0;
        for user_id in members {
            if self.registry.send(user_id, message.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Snapshot a lobby's state and broadcast it to its members.
    ///
    /// Takes the lobby read lock only long enough to copy the member list
    /// and build the update payload.
    pub async fn broadcast_lobby_update(&self, lobby: &tokio::sync::RwLock<LobbySession>) {
        let (members, update) = {
            let lobby = lobby.read().await;
            (lobby.player_ids(), LobbyUpdate::from_session(&lobby))
        };
        self.send_to_members(&members, ServerMessage::LobbyUpdate(update))
            .await;
    }
}

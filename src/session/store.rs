//! In-Memory Session Store
//!
//! The authoritative table of active lobbies for real-time reads. Each lobby
//! lives behind its own `RwLock` so that a start, a progress update, and a
//! leave racing for the same lobby serialize against each other without
//! blocking unrelated lobbies.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::state::{LobbyId, LobbySession, UserId};

/// Shared handle to one lobby.
pub type SharedLobby = Arc<RwLock<LobbySession>>;

/// Table of active lobbies.
pub struct SessionStore {
    lobbies: RwLock<BTreeMap<LobbyId, SharedLobby>>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            lobbies: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert a lobby, returning its shared handle.
    pub async fn insert(&self, lobby: LobbySession) -> SharedLobby {
        let id = lobby.id;
        let shared = Arc::new(RwLock::new(lobby));
        let mut lobbies = self.lobbies.write().await;
        lobbies.insert(id, shared.clone());
        shared
    }

    /// Look up a lobby by id.
    pub async fn get(&self, id: &LobbyId) -> Option<SharedLobby> {
        let lobbies = self.lobbies.read().await;
        lobbies.get(id).cloned()
    }

    /// Remove a lobby. Returns the handle if it was resident.
    pub async fn remove(&self, id: &LobbyId) -> Option<SharedLobby> {
        let mut lobbies = self.lobbies.write().await;
        lobbies.remove(id)
    }

    /// Whether a lobby is resident.
    pub async fn contains(&self, id: &LobbyId) -> bool {
        let lobbies = self.lobbies.read().await;
        lobbies.contains_key(id)
    }

    /// Number of resident lobbies.
    pub async fn len(&self) -> usize {
        let lobbies = self.lobbies.read().await;
        lobbies.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All lobbies a user is currently a member of.
    pub async fn lobbies_for_user(&self, user_id: &UserId) -> Vec<SharedLobby> {
        let snapshot: Vec<SharedLobby> = {
            let lobbies = self.lobbies.read().await;
            lobbies.values().cloned().collect()
        };

        let mut found = Vec::new();
        for lobby in snapshot {
            if lobby.read().await.contains_player(user_id) {
                found.push(lobby);
            }
        }
        found
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

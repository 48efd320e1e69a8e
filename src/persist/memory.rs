//! In-Process Durable Store
//!
//! Default [`DurableStore`] backend. Holds rows in process memory, which
//! makes it suitable for single-node deployments and tests; swap in a real
//! database implementation behind the same trait for anything else.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::persist::{DurableStore, LobbyRecord, PlayerRecord, StoreError};
use crate::session::state::{LobbyId, UserId};

#[derive(Default)]
struct Tables {
    lobbies: BTreeMap<LobbyId, LobbyRecord>,
    players: BTreeMap<(LobbyId, UserId), PlayerRecord>,
}

/// In-memory row store.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Row counts (lobbies, players), for tests and introspection.
    pub async fn counts(&self) -> (usize, usize) {
        let tables = self.tables.read().await;
        (tables.lobbies.len(), tables.players.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn create_lobby(&self, lobby: LobbyRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.lobbies.insert(lobby.id, lobby);
        Ok(())
    }

    async fn fetch_lobby(&self, id: &LobbyId) -> Result<Option<LobbyRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.lobbies.get(id).cloned())
    }

    async fn update_lobby(&self, lobby: LobbyRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.lobbies.insert(lobby.id, lobby);
        Ok(())
    }

    async fn delete_lobby(&self, id: &LobbyId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.lobbies.remove(id);
        tables.players.retain(|(lobby_id, _), _| lobby_id != id);
        Ok(())
    }

    async fn touch_lobby(&self, id: &LobbyId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(lobby) = tables.lobbies.get_mut(id) {
            lobby.last_active_at = at;
        }
        Ok(())
    }

    async fn upsert_player(&self, player: PlayerRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .players
            .insert((player.lobby_id, player.user_id), player);
        Ok(())
    }

    async fn fetch_player(
        &self,
        lobby_id: &LobbyId,
        user_id: &UserId,
    ) -> Result<Option<PlayerRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.players.get(&(*lobby_id, *user_id)).cloned())
    }

    async fn fetch_players(&self, lobby_id: &LobbyId) -> Result<Vec<PlayerRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .players
            .values()
            .filter(|p| p.lobby_id == *lobby_id)
            .cloned()
            .collect())
    }

    async fn delete_player(
        &self,
        lobby_id: &LobbyId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.players.remove(&(*lobby_id, *user_id));
        Ok(())
    }

    async fn memberships(&self, user_id: &UserId) -> Result<Vec<LobbyId>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .players
            .values()
            .filter(|p| p.user_id == *user_id)
            .map(|p| p.lobby_id)
            .collect())
    }

    async fn disconnected_players_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(LobbyId, UserId)>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .players
            .values()
            .filter(|p| matches!(p.disconnected_at, Some(at) if at < cutoff))
            .map(|p| (p.lobby_id, p.user_id))
            .collect())
    }

    async fn inactive_lobbies_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LobbyId>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .lobbies
            .values()
            .filter(|l| l.last_active_at < cutoff)
            .map(|l| l.id)
            .collect())
    }
}

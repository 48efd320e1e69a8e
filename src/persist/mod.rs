//! Durable Session Gateway
//!
//! Row-level mirror of the in-memory session model, consulted for
//! reconnect/restart recovery and for clients that only poll. Writes from
//! message handlers are best-effort: the in-memory state is the source of
//! truth for connected clients, the durable store for reconnection.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::state::{
    LobbyId, LobbySession, LobbySettings, LobbyStatus, PlayerSession, PlayerStatus, UserId,
};

pub use memory::MemoryStore;

/// Durable row for one lobby.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyRecord {
    /// Lobby identifier.
    pub id: LobbyId,
    /// Host user.
    pub host_id: UserId,
    /// Display name.
    pub name: String,
    /// Host-selected settings.
    pub settings: LobbySettings,
    /// Lifecycle status at last write.
    pub status: LobbyStatus,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last activity stamp, advanced by the handlers; the sweep uses it to
    /// find abandoned lobbies.
    pub last_active_at: DateTime<Utc>,
}

impl LobbyRecord {
    /// Capture a lobby's current state as a row.
    pub fn from_session(lobby: &LobbySession, now: DateTime<Utc>) -> Self {
        Self {
            id: lobby.id,
            host_id: lobby.host_id,
            name: lobby.name.clone(),
            settings: lobby.settings.clone(),
            status: lobby.status,
            created_at: lobby.created_at,
            last_active_at: now,
        }
    }
}

/// Durable row for one player-in-lobby.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Owning lobby.
    pub lobby_id: LobbyId,
    /// Player user id.
    pub user_id: UserId,
    /// Display name.
    pub display_name: String,
    /// Status at last write.
    pub status: PlayerStatus,
    /// Score at last write.
    pub score: u32,
    /// Progress at last write.
    pub progress: u8,
    /// Set while the player's transport is down; the sweep evicts rows
    /// older than the grace window.
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl PlayerRecord {
    /// Capture a player's current state as a row.
    pub fn from_session(lobby_id: LobbyId, player: &PlayerSession) -> Self {
        Self {
            lobby_id,
            user_id: player.user_id,
            display_name: player.display_name.clone(),
            status: player.status,
            score: player.score,
            progress: player.progress,
            disconnected_at: player.disconnected_at,
        }
    }
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or rejected the operation.
    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    /// Row could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The durable session gateway.
///
/// Implementations must tolerate redundant writes: handlers retry nothing,
/// but reconciliation may upsert or delete rows that are already in the
/// target state.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Create a lobby row.
    async fn create_lobby(&self, lobby: LobbyRecord) -> Result<(), StoreError>;

    /// Fetch a lobby row.
    async fn fetch_lobby(&self, id: &LobbyId) -> Result<Option<LobbyRecord>, StoreError>;

    /// Replace a lobby row (upsert).
    async fn update_lobby(&self, lobby: LobbyRecord) -> Result<(), StoreError>;

    /// Delete a lobby row and all its player rows.
    async fn delete_lobby(&self, id: &LobbyId) -> Result<(), StoreError>;

    /// Advance a lobby's activity stamp.
    async fn touch_lobby(&self, id: &LobbyId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Insert or replace a player row.
    async fn upsert_player(&self, player: PlayerRecord) -> Result<(), StoreError>;

    /// Fetch one player row.
    async fn fetch_player(
        &self,
        lobby_id: &LobbyId,
        user_id: &UserId,
    ) -> Result<Option<PlayerRecord>, StoreError>;

    /// Fetch all player rows of a lobby.
    async fn fetch_players(&self, lobby_id: &LobbyId) -> Result<Vec<PlayerRecord>, StoreError>;

    /// Delete one player row.
    async fn delete_player(&self, lobby_id: &LobbyId, user_id: &UserId)
        -> Result<(), StoreError>;

    /// Ids of every lobby a user has a player row in.
    async fn memberships(&self, user_id: &UserId) -> Result<Vec<LobbyId>, StoreError>;

    /// Player rows disconnected since before `cutoff`.
    async fn disconnected_players_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(LobbyId, UserId)>, StoreError>;

    /// Lobby ids with no activity since before `cutoff`.
    async fn inactive_lobbies_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LobbyId>, StoreError>;
}

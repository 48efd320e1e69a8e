//! Session Engine
//!
//! The lobby/game state machine and its in-memory store. State transitions
//! are pure functions in `state`; `store` owns the per-lobby locks that
//! serialize them.
//!
//! - `state`: lobby, player, and game state plus all transitions
//! - `store`: lobby-id keyed table, the real-time source of truth

pub mod state;
pub mod store;

// Re-export key types
pub use state::{
    GameState, LobbyId, LobbySession, LobbySettings, LobbyStatus, PlayerSession, PlayerStatus,
    ProgressOutcome, RankingEntry, SessionError, UserId,
};
pub use store::{SessionStore, SharedLobby};

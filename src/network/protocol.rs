//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every frame
//! is a JSON object of shape `{type: string, payload: object}`; the payload
//! schema is resolved once here, at the router boundary, so handlers only
//! ever see typed data.

use serde::{Deserialize, Serialize};

use crate::session::state::{
    LobbyId, LobbySession, LobbySettings, LobbyStatus, PlayerStatus, RankingEntry, UserId,
};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the connection.
    Authenticate(AuthenticateRequest),

    /// Liveness probe. Allowed before authentication.
    Ping,

    /// Create a lobby with the sender as host.
    CreateLobby(CreateLobbyRequest),

    /// Join an existing lobby.
    #[serde(rename_all = "camelCase")]
    JoinLobby { lobby_id: LobbyId },

    /// Leave a lobby. A leaving host dissolves it.
    #[serde(rename_all = "camelCase")]
    LeaveLobby { lobby_id: LobbyId },

    /// Set or clear the ready flag.
    #[serde(rename_all = "camelCase")]
    SetPlayerReady { lobby_id: LobbyId, ready: bool },

    /// Start the game (host only).
    #[serde(rename_all = "camelCase")]
    StartGame { lobby_id: LobbyId },

    /// Report answer progress for the running game.
    UpdatePlayerProgress(ProgressUpdateRequest),

    /// Request the current lobby/game state as a direct reply.
    #[serde(rename_all = "camelCase")]
    GetGameState { lobby_id: LobbyId },

    /// Reset a played lobby back to waiting (host only).
    #[serde(rename_all = "camelCase")]
    RestartGame { lobby_id: LobbyId },
}

/// Authentication payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    /// Bearer token from the external auth provider.
    pub token: String,
    /// Name to show other players.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Lobby creation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLobbyRequest {
    /// Room display name.
    pub name: String,
    /// Open settings bag (region filters, question count, ...).
    #[serde(default)]
    pub settings: LobbySettings,
}

/// Progress report payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdateRequest {
    /// Target lobby.
    pub lobby_id: LobbyId,
    /// Country ids answered correctly so far, in order.
    pub validated_countries: Vec<String>,
    /// Country ids answered incorrectly so far, in order.
    pub incorrect_countries: Vec<String>,
    /// Client-computed score.
    pub score: u32,
    /// Progress denominator.
    pub total_questions: u32,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting after the transport handshake.
    #[serde(rename_all = "camelCase")]
    Connected { server_version: String },

    /// Authentication succeeded.
    #[serde(rename_all = "camelCase")]
    Authenticated { user_id: UserId },

    /// Request failed; connection stays open.
    Error(ErrorReply),

    /// Full lobby state, broadcast on any membership or status change.
    LobbyUpdate(LobbyUpdate),

    /// The host started the game.
    #[serde(rename_all = "camelCase")]
    GameStart {
        lobby_id: LobbyId,
        start_time: chrono::DateTime<chrono::Utc>,
        settings: LobbySettings,
    },

    /// Player progress changed.
    #[serde(rename_all = "camelCase")]
    PlayerProgressUpdate {
        lobby_id: LobbyId,
        players: Vec<PlayerPublic>,
    },

    /// A player's score changed mid-game.
    #[serde(rename_all = "camelCase")]
    ScoreUpdate {
        lobby_id: LobbyId,
        user_id: UserId,
        score: u32,
        streak: u32,
    },

    /// Game over with final rankings. Always ordered after the final
    /// `lobby_update` so clients never see results for a lobby that still
    /// looks in progress.
    #[serde(rename_all = "camelCase")]
    GameEnd {
        lobby_id: LobbyId,
        rankings: Vec<RankingEntry>,
        end_time: chrono::DateTime<chrono::Utc>,
    },

    /// Reply to `ping`.
    Pong,
}

/// Error reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message requires prior authentication on this connection.
    AuthRequired,
    /// Token validation failed.
    AuthFailed,
    /// Frame was not valid JSON or did not match any payload schema.
    InvalidMessage,
    /// Lobby or player does not exist.
    NotFound,
    /// Operation conflicts with current state (e.g. starting a playing
    /// lobby).
    Conflict,
    /// Host-only action attempted by a non-host, or sender not a member.
    Unauthorized,
    /// Unexpected server-side failure.
    Internal,
}

/// Public view of a player, shared with every lobby member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPublic {
    /// Player user id.
    pub user_id: UserId,
    /// Display name.
    pub display_name: String,
    /// Current status.
    pub status: PlayerStatus,
    /// Current score.
    pub score: u32,
    /// Current progress percentage.
    pub progress: u8,
    /// Consecutive-correct streak.
    pub streak: u32,
}

/// Full lobby state payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyUpdate {
    /// Lobby identifier.
    pub lobby_id: LobbyId,
    /// Room display name.
    pub name: String,
    /// Host user id.
    pub host_id: UserId,
    /// Current settings.
    pub settings: LobbySettings,
    /// Lifecycle status.
    pub status: LobbyStatus,
    /// Member snapshot.
    pub players: Vec<PlayerPublic>,
}

impl LobbyUpdate {
    /// Snapshot a lobby under its lock.
    pub fn from_session(lobby: &LobbySession) -> Self {
        Self {
            lobby_id: lobby.id,
            name: lobby.name.clone(),
            host_id: lobby.host_id,
            settings: lobby.settings.clone(),
            status: lobby.status,
            players: lobby
                .players()
                .map(|p| PlayerPublic {
                    user_id: p.user_id,
                    display_name: p.display_name.clone(),
                    status: p.status,
                    score: p.score,
                    progress: p.progress,
                    streak: p.streak,
                })
                .collect(),
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to a JSON frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON frame.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to a JSON frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON frame.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::LobbySettings;
    use chrono::Utc;

    #[test]
    fn test_frame_shape_is_type_plus_payload() {
        let msg = ClientMessage::JoinLobby {
            lobby_id: uuid::Uuid::nil(),
        };
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "join_lobby");
        assert!(value["payload"]["lobbyId"].is_string());
    }

    #[test]
    fn test_ping_has_no_payload() {
        let json = ClientMessage::Ping.to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let parsed = ClientMessage::from_json(&json).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping));
    }

    #[test]
    fn test_progress_update_round_trip() {
        let msg = ClientMessage::UpdatePlayerProgress(ProgressUpdateRequest {
            lobby_id: uuid::Uuid::nil(),
            validated_countries: vec!["fr".into(), "de".into()],
            incorrect_countries: vec!["br".into()],
            score: 25,
            total_questions: 10,
        });

        let json = msg.to_json().unwrap();
        assert!(json.contains("validatedCountries"));
        assert!(json.contains("totalQuestions"));

        match ClientMessage::from_json(&json).unwrap() {
            ClientMessage::UpdatePlayerProgress(req) => {
                assert_eq!(req.validated_countries.len(), 2);
                assert_eq!(req.score, 25);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_fails_to_parse() {
        let result = ClientMessage::from_json(r#"{"type":"fire_missiles","payload":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_reply_wire_form() {
        let msg = ServerMessage::Error(ErrorReply {
            code: ErrorCode::AuthRequired,
            message: "authenticate first".into(),
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("auth_required"));
    }

    #[test]
    fn test_lobby_update_snapshot() {
        let mut lobby = LobbySession::new(
            uuid::Uuid::new_v4(),
            UserId([1; 16]),
            "alice".into(),
            "Room".into(),
            LobbySettings::new(),
            Utc::now(),
        );
        lobby.add_player(UserId([2; 16]), "bob".into()).unwrap();

        let update = LobbyUpdate::from_session(&lobby);
        assert_eq!(update.players.len(), 2);
        assert_eq!(update.host_id, UserId([1; 16]));
        assert_eq!(update.status, LobbyStatus::Waiting);

        let json = ServerMessage::LobbyUpdate(update).to_json().unwrap();
        assert!(json.contains("lobby_update"));
        assert!(json.contains("hostId"));
    }

    #[test]
    fn test_game_end_round_trip() {
        let msg = ServerMessage::GameEnd {
            lobby_id: uuid::Uuid::nil(),
            rankings: vec![RankingEntry {
                rank: 1,
                user_id: UserId([1; 16]),
                display_name: "alice".into(),
                score: 120,
                progress: 100,
            }],
            end_time: Utc::now(),
        };

        let json = msg.to_json().unwrap();
        let parsed = ServerMessage::from_json(&json).unwrap();
        match parsed {
            ServerMessage::GameEnd { rankings, .. } => {
                assert_eq!(rankings[0].rank, 1);
                assert_eq!(rankings[0].score, 120);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}

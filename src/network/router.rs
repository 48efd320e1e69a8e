//! Message Router
//!
//! Parses inbound frames, enforces the per-connection authentication gate,
//! and drives the lobby handlers. Every handler validates before it
//! mutates, applies the change to the in-memory session first, mirrors it
//! to the durable store best-effort, and only then broadcasts. A handler
//! failure is always a typed error reply to the sender; it never tears the
//! connection down.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::network::auth::{validate_token, AuthConfig};
use crate::network::dispatch::BroadcastDispatcher;
use crate::network::protocol::{
    AuthenticateRequest, ClientMessage, CreateLobbyRequest, ErrorCode, ErrorReply, LobbyUpdate,
    ProgressUpdateRequest, ServerMessage,
};
use crate::network::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::persist::{DurableStore, LobbyRecord, PlayerRecord};
use crate::presence::Presence;
use crate::reconcile::ReconciliationScheduler;
use crate::session::state::{
    LobbyId, LobbySession, LobbyStatus, SessionError, UserId,
};
use crate::session::store::{SessionStore, SharedLobby};

/// Per-connection routing state, owned by the connection's reader task.
pub struct ConnectionContext {
    /// The physical connection this context belongs to.
    pub connection_id: ConnectionId,
    /// Outbound queue shared with the writer task.
    pub outbound: mpsc::Sender<ServerMessage>,
    /// Set once `authenticate` succeeds.
    pub user: Option<AuthenticatedUser>,
}

/// Identity attached to a connection after authentication.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Opaque user id derived from the token subject.
    pub user_id: UserId,
    /// Name shown to other players.
    pub display_name: String,
}

impl ConnectionContext {
    /// Fresh, unauthenticated context.
    pub fn new(connection_id: ConnectionId, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            connection_id,
            outbound,
            user: None,
        }
    }
}

/// Routes client frames to lobby handlers.
pub struct MessageRouter {
    sessions: Arc<SessionStore>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<BroadcastDispatcher>,
    durable: Arc<dyn DurableStore>,
    reconciler: Arc<ReconciliationScheduler>,
    presence: Arc<Presence>,
    auth: AuthConfig,
}

impl MessageRouter {
    /// Wire the router over the shared session services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<BroadcastDispatcher>,
        durable: Arc<dyn DurableStore>,
        reconciler: Arc<ReconciliationScheduler>,
        presence: Arc<Presence>,
        auth: AuthConfig,
    ) -> Self {
        Self {
            sessions,
            registry,
            dispatcher,
            durable,
            reconciler,
            presence,
            auth,
        }
    }

    /// Handle one raw inbound frame. The return value is the direct reply
    /// for the sender, if any; broadcasts go out through the dispatcher as
    /// a side effect.
    pub async fn route(&self, ctx: &mut ConnectionContext, raw: &str) -> Option<ServerMessage> {
        let message = match ClientMessage::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id = ctx.connection_id, error = %e, "unparseable frame");
                return Some(error_reply(ErrorCode::InvalidMessage, "malformed message"));
            }
        };

        // Pre-auth gate: only authenticate and ping pass.
        let user = match (&message, &ctx.user) {
            (ClientMessage::Ping, _) => return Some(ServerMessage::Pong),
            (ClientMessage::Authenticate(req), _) => {
                return self.handle_authenticate(ctx, req.clone()).await;
            }
            (_, Some(user)) => user.clone(),
            (_, None) => {
                return Some(error_reply(ErrorCode::AuthRequired, "authenticate first"));
            }
        };

        match message {
            ClientMessage::Authenticate(_) | ClientMessage::Ping => unreachable!(),
            ClientMessage::CreateLobby(req) => self.handle_create_lobby(&user, req).await,
            ClientMessage::JoinLobby { lobby_id } => self.handle_join_lobby(&user, lobby_id).await,
            ClientMessage::LeaveLobby { lobby_id } => {
                self.handle_leave_lobby(&user, lobby_id).await
            }
            ClientMessage::SetPlayerReady { lobby_id, ready } => {
                self.handle_set_ready(&user, lobby_id, ready).await
            }
            ClientMessage::StartGame { lobby_id } => self.handle_start_game(&user, lobby_id).await,
            ClientMessage::UpdatePlayerProgress(req) => self.handle_progress(&user, req).await,
            ClientMessage::GetGameState { lobby_id } => {
                self.handle_get_game_state(&user, lobby_id).await
            }
            ClientMessage::RestartGame { lobby_id } => {
                self.handle_restart_game(&user, lobby_id).await
            }
        }
    }

    // =========================================================================
    // AUTHENTICATION
    // =========================================================================

    async fn handle_authenticate(
        &self,
        ctx: &mut ConnectionContext,
        req: AuthenticateRequest,
    ) -> Option<ServerMessage> {
        let claims = match validate_token(&req.token, &self.auth) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(connection_id = ctx.connection_id, error = %e, "authentication failed");
                return Some(error_reply(ErrorCode::AuthFailed, &e.to_string()));
            }
        };

        let user_id = claims.user_id();
        let display_name = req.display_name.unwrap_or_else(|| claims.display_name());
        ctx.user = Some(AuthenticatedUser {
            user_id,
            display_name,
        });

        self.registry
            .register(
                user_id,
                ConnectionHandle::new(ctx.connection_id, ctx.outbound.clone()),
            )
            .await;

        // The acknowledgement must reach the client before any lobby state
        // restoration broadcasts, which share the same outbound queue.
        if ctx
            .outbound
            .send(ServerMessage::Authenticated { user_id })
            .await
            .is_err()
        {
            return None;
        }

        info!(%user_id, connection_id = ctx.connection_id, "connection authenticated");

        let presence = self.presence.clone();
        tokio::spawn(async move {
            presence.announce_online(user_id).await;
        });
        self.reconciler.restore_user(user_id).await;

        None
    }

    // =========================================================================
    // LOBBY HANDLERS
    // =========================================================================

    async fn handle_create_lobby(
        &self,
        user: &AuthenticatedUser,
        req: CreateLobbyRequest,
    ) -> Option<ServerMessage> {
        let lobby = LobbySession::new(
            uuid::Uuid::new_v4(),
            user.user_id,
            user.display_name.clone(),
            req.name,
            req.settings,
            Utc::now(),
        );
        let lobby_id = lobby.id;

        let lobby_record = LobbyRecord::from_session(&lobby, Utc::now());
        let host_record = lobby
            .player(&user.user_id)
            .map(|p| PlayerRecord::from_session(lobby_id, p));
        let shared = self.sessions.insert(lobby).await;

        if let Err(e) = self.durable.create_lobby(lobby_record).await {
            warn!(%lobby_id, error = %e, "durable lobby write failed");
        }
        if let Some(record) = host_record {
            if let Err(e) = self.durable.upsert_player(record).await {
                warn!(%lobby_id, error = %e, "durable player write failed");
            }
        }

        info!(%lobby_id, host = %user.user_id, "lobby created");
        self.dispatcher.broadcast_lobby_update(&shared).await;
        None
    }

    async fn handle_join_lobby(
        &self,
        user: &AuthenticatedUser,
        lobby_id: LobbyId,
    ) -> Option<ServerMessage> {
        let lobby = match self.sessions.get(&lobby_id).await {
            Some(lobby) => lobby,
            None => return Some(error_reply(ErrorCode::NotFound, "lobby not found")),
        };

        let record = {
            let mut lobby = lobby.write().await;
            match lobby.add_player(user.user_id, user.display_name.clone()) {
                Ok(_) => lobby
                    .player(&user.user_id)
                    .map(|p| PlayerRecord::from_session(lobby_id, p)),
                Err(e) => return Some(session_error_reply(e)),
            }
        };

        if let Some(record) = record {
            if let Err(e) = self.durable.upsert_player(record).await {
                warn!(%lobby_id, error = %e, "durable player write failed");
            }
        }
        self.touch(&lobby_id).await;

        debug!(%lobby_id, user = %user.user_id, "player joined");
        self.dispatcher.broadcast_lobby_update(&lobby).await;
        None
    }

    async fn handle_leave_lobby(
        &self,
        user: &AuthenticatedUser,
        lobby_id: LobbyId,
    ) -> Option<ServerMessage> {
        let lobby = match self.sessions.get(&lobby_id).await {
            Some(lobby) => lobby,
            None => return Some(error_reply(ErrorCode::NotFound, "lobby not found")),
        };

        let is_host = {
            let lobby = lobby.read().await;
            if !lobby.contains_player(&user.user_id) {
                return Some(error_reply(ErrorCode::Unauthorized, "not a member"));
            }
            lobby.is_host(&user.user_id)
        };

        if is_host {
            self.dissolve_lobby(&lobby_id, &lobby).await;
            return None;
        }

        // Departure of the last unfinished player completes the game the
        // same way their final progress update would have.
        let (emptied, completed) = {
            let mut lobby = lobby.write().await;
            lobby.remove_player(&user.user_id);
            let emptied = lobby.player_count() == 0;
            (emptied, !emptied && lobby.finish_if_complete())
        };

        if let Err(e) = self.durable.delete_player(&lobby_id, &user.user_id).await {
            warn!(%lobby_id, error = %e, "durable player delete failed");
        }

        if emptied {
            self.sessions.remove(&lobby_id).await;
            if let Err(e) = self.durable.delete_lobby(&lobby_id).await {
                warn!(%lobby_id, error = %e, "durable lobby delete failed");
            }
            info!(%lobby_id, "empty lobby removed");
            return None;
        }

        self.touch(&lobby_id).await;
        debug!(%lobby_id, user = %user.user_id, "player left");
        self.dispatcher.broadcast_lobby_update(&lobby).await;

        if completed {
            let (members, rankings, record) = {
                let lobby = lobby.read().await;
                (
                    lobby.player_ids(),
                    lobby.rankings(),
                    LobbyRecord::from_session(&lobby, Utc::now()),
                )
            };
            if let Err(e) = self.durable.update_lobby(record).await {
                warn!(%lobby_id, error = %e, "durable lobby write failed");
            }

            info!(%lobby_id, "game finished after departure");
            self.dispatcher
                .send_to_members(
                    &members,
                    ServerMessage::GameEnd {
                        lobby_id,
                        rankings,
                        end_time: Utc::now(),
                    },
                )
                .await;
        }
        None
    }

    async fn handle_set_ready(
        &self,
        user: &AuthenticatedUser,
        lobby_id: LobbyId,
        ready: bool,
    ) -> Option<ServerMessage> {
        let lobby = match self.sessions.get(&lobby_id).await {
            Some(lobby) => lobby,
            None => return Some(error_reply(ErrorCode::NotFound, "lobby not found")),
        };

        let record = {
            let mut lobby = lobby.write().await;
            if let Err(e) = lobby.set_ready(&user.user_id, ready) {
                return Some(session_error_reply(e));
            }
            lobby
                .player(&user.user_id)
                .map(|p| PlayerRecord::from_session(lobby_id, p))
        };

        if let Some(record) = record {
            if let Err(e) = self.durable.upsert_player(record).await {
                warn!(%lobby_id, error = %e, "durable player write failed");
            }
        }
        self.touch(&lobby_id).await;
        self.dispatcher.broadcast_lobby_update(&lobby).await;
        None
    }

    async fn handle_start_game(
        &self,
        user: &AuthenticatedUser,
        lobby_id: LobbyId,
    ) -> Option<ServerMessage> {
        let lobby = match self.sessions.get(&lobby_id).await {
            Some(lobby) => lobby,
            None => return Some(error_reply(ErrorCode::NotFound, "lobby not found")),
        };

        let (game, members, records) = {
            let mut lobby = lobby.write().await;
            if !lobby.is_host(&user.user_id) {
                return Some(error_reply(
                    ErrorCode::Unauthorized,
                    "only the host can start the game",
                ));
            }
            let game = match lobby.start_game(Utc::now()) {
                Ok(game) => game,
                Err(e) => return Some(session_error_reply(e)),
            };
            (game, lobby.player_ids(), self.snapshot_rows(&lobby))
        };

        self.persist_rows(&lobby_id, records).await;

        info!(%lobby_id, "game started");
        // Members see the playing lobby before the start signal.
        self.dispatcher.broadcast_lobby_update(&lobby).await;
        self.dispatcher
            .send_to_members(
                &members,
                ServerMessage::GameStart {
                    lobby_id,
                    start_time: game.started_at,
                    settings: game.settings,
                },
            )
            .await;
        None
    }

    async fn handle_progress(
        &self,
        user: &AuthenticatedUser,
        req: ProgressUpdateRequest,
    ) -> Option<ServerMessage> {
        let lobby_id = req.lobby_id;
        let lobby = match self.sessions.get(&lobby_id).await {
            Some(lobby) => lobby,
            None => return Some(error_reply(ErrorCode::NotFound, "lobby not found")),
        };

        let (outcome, members, players, streak) = {
            let mut lobby = lobby.write().await;
            let outcome = match lobby.apply_progress(
                &user.user_id,
                req.validated_countries,
                req.incorrect_countries,
                req.score,
                req.total_questions,
                Utc::now(),
            ) {
                Ok(outcome) => outcome,
                Err(e) => return Some(session_error_reply(e)),
            };
            let streak = lobby.player(&user.user_id).map(|p| p.streak).unwrap_or(0);
            (
                outcome,
                lobby.player_ids(),
                LobbyUpdate::from_session(&lobby).players,
                streak,
            )
        };

        {
            let lobby = lobby.read().await;
            let record = lobby
                .player(&user.user_id)
                .map(|p| PlayerRecord::from_session(lobby_id, p));
            drop(lobby);
            if let Some(record) = record {
                if let Err(e) = self.durable.upsert_player(record).await {
                    warn!(%lobby_id, error = %e, "durable player write failed");
                }
            }
        }
        self.touch(&lobby_id).await;

        self.dispatcher
            .send_to_members(
                &members,
                ServerMessage::PlayerProgressUpdate { lobby_id, players },
            )
            .await;

        if outcome.score_changed && !outcome.lobby_finished {
            self.dispatcher
                .send_to_members(
                    &members,
                    ServerMessage::ScoreUpdate {
                        lobby_id,
                        user_id: user.user_id,
                        score: req.score,
                        streak,
                    },
                )
                .await;
        }

        if outcome.lobby_finished {
            let (rankings, record) = {
                let lobby = lobby.read().await;
                (
                    lobby.rankings(),
                    LobbyRecord::from_session(&lobby, Utc::now()),
                )
            };
            if let Err(e) = self.durable.update_lobby(record).await {
                warn!(%lobby_id, error = %e, "durable lobby write failed");
            }

            info!(%lobby_id, "game finished");
            // Final lobby state strictly before the results.
            self.dispatcher.broadcast_lobby_update(&lobby).await;
            self.dispatcher
                .send_to_members(
                    &members,
                    ServerMessage::GameEnd {
                        lobby_id,
                        rankings,
                        end_time: Utc::now(),
                    },
                )
                .await;
        }
        None
    }

    async fn handle_get_game_state(
        &self,
        user: &AuthenticatedUser,
        lobby_id: LobbyId,
    ) -> Option<ServerMessage> {
        let lobby = match self.sessions.get(&lobby_id).await {
            Some(lobby) => lobby,
            None => return Some(error_reply(ErrorCode::NotFound, "lobby not found")),
        };

        let lobby = lobby.read().await;
        if !lobby.contains_player(&user.user_id) {
            return Some(error_reply(ErrorCode::Unauthorized, "not a member"));
        }
        Some(ServerMessage::LobbyUpdate(LobbyUpdate::from_session(
            &lobby,
        )))
    }

    async fn handle_restart_game(
        &self,
        user: &AuthenticatedUser,
        lobby_id: LobbyId,
    ) -> Option<ServerMessage> {
        let lobby = match self.sessions.get(&lobby_id).await {
            Some(lobby) => lobby,
            None => return Some(error_reply(ErrorCode::NotFound, "lobby not found")),
        };

        let records = {
            let mut lobby = lobby.write().await;
            if !lobby.is_host(&user.user_id) {
                return Some(error_reply(
                    ErrorCode::Unauthorized,
                    "only the host can restart the game",
                ));
            }
            if let Err(e) = lobby.restart_game() {
                return Some(session_error_reply(e));
            }
            self.snapshot_rows(&lobby)
        };

        self.persist_rows(&lobby_id, records).await;

        info!(%lobby_id, "lobby reset to waiting");
        self.dispatcher.broadcast_lobby_update(&lobby).await;
        None
    }

    // =========================================================================
    // DURABLE WRITE-THROUGH
    // =========================================================================

    /// Capture the lobby row and every player row under the caller's lock.
    fn snapshot_rows(&self, lobby: &LobbySession) -> (LobbyRecord, Vec<PlayerRecord>) {
        let lobby_record = LobbyRecord::from_session(lobby, Utc::now());
        let players = lobby
            .players()
            .map(|p| PlayerRecord::from_session(lobby.id, p))
            .collect();
        (lobby_record, players)
    }

    /// Mirror a snapshot to the durable store. Best-effort.
    async fn persist_rows(&self, lobby_id: &LobbyId, rows: (LobbyRecord, Vec<PlayerRecord>)) {
        let (lobby_record, players) = rows;
        if let Err(e) = self.durable.update_lobby(lobby_record).await {
            warn!(%lobby_id, error = %e, "durable lobby write failed");
        }
        for record in players {
            if let Err(e) = self.durable.upsert_player(record).await {
                warn!(%lobby_id, error = %e, "durable player write failed");
            }
        }
    }

    async fn touch(&self, lobby_id: &LobbyId) {
        if let Err(e) = self.durable.touch_lobby(lobby_id, Utc::now()).await {
            warn!(%lobby_id, error = %e, "durable touch failed");
        }
    }

    /// Host left: final Finished broadcast, then eviction from both stores.
    async fn dissolve_lobby(&self, lobby_id: &LobbyId, lobby: &SharedLobby) {
        let (members, update) = {
            let mut lobby = lobby.write().await;
            lobby.status = LobbyStatus::Finished;
            (lobby.player_ids(), LobbyUpdate::from_session(&lobby))
        };

        self.sessions.remove(lobby_id).await;
        if let Err(e) = self.durable.delete_lobby(lobby_id).await {
            warn!(%lobby_id, error = %e, "durable lobby delete failed");
        }

        info!(%lobby_id, "lobby dissolved by host");
        self.dispatcher
            .send_to_members(&members, ServerMessage::LobbyUpdate(update))
            .await;
    }
}

fn error_reply(code: ErrorCode, message: &str) -> ServerMessage {
    ServerMessage::Error(ErrorReply {
        code,
        message: message.into(),
    })
}

fn session_error_reply(err: SessionError) -> ServerMessage {
    let code = match err {
        SessionError::LobbyNotFound | SessionError::PlayerNotFound => ErrorCode::NotFound,
        SessionError::NotHost => ErrorCode::Unauthorized,
        SessionError::AlreadyStarted
        | SessionError::NotPlaying
        | SessionError::NotStarted
        | SessionError::GameInProgress => ErrorCode::Conflict,
    };
    error_reply(code, &err.to_string())
}

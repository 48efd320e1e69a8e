//! Reconciliation Scheduler
//!
//! Repairs the gap between transports and sessions. A dropped connection
//! marks the player Disconnected and arms a grace timer; a reconnect within
//! the window restores them in place, pulling the lobby back from the
//! durable store if the process restarted in between. A periodic sweep
//! backstops the timers against rows the in-memory path never saw.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::dispatch::BroadcastDispatcher;
use crate::network::protocol::{LobbyUpdate, ServerMessage};
use crate::persist::{DurableStore, LobbyRecord, PlayerRecord, StoreError};
use crate::presence::Presence;
use crate::session::state::{LobbyId, LobbySession, LobbyStatus, PlayerSession, PlayerStatus, UserId};
use crate::session::store::{SessionStore, SharedLobby};

/// Reconciliation timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// How long a disconnected player keeps their seat.
    pub grace_window: Duration,
    /// Interval between sweep cycles.
    pub sweep_interval: Duration,
    /// Lobbies with no activity for this long are evicted by the sweep.
    pub cleanup_window: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            cleanup_window: Duration::from_secs(30 * 60),
        }
    }
}

impl ReconcileConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            grace_window: env_secs("GRACE_WINDOW_SECS", defaults.grace_window),
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            cleanup_window: env_secs("CLEANUP_WINDOW_SECS", defaults.cleanup_window),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// What a scheduled timer will do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TaskKind {
    /// Remove a disconnected player whose grace window expired.
    Evict,
}

/// Coordinates disconnect grace timers, reconnect restoration, and the
/// periodic durable sweep.
pub struct ReconciliationScheduler {
    sessions: Arc<SessionStore>,
    durable: Arc<dyn DurableStore>,
    dispatcher: Arc<BroadcastDispatcher>,
    presence: Arc<Presence>,
    config: ReconcileConfig,
    /// Pending timers. Arming a key aborts the previous timer for that key.
    timers: Mutex<HashMap<(TaskKind, UserId), JoinHandle<()>>>,
    /// Users with a restoration currently in flight.
    restoring: Mutex<HashSet<UserId>>,
}

impl ReconciliationScheduler {
    /// Wire the scheduler over the shared session services.
    pub fn new(
        sessions: Arc<SessionStore>,
        durable: Arc<dyn DurableStore>,
        dispatcher: Arc<BroadcastDispatcher>,
        presence: Arc<Presence>,
        config: ReconcileConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            durable,
            dispatcher,
            presence,
            config,
            timers: Mutex::new(HashMap::new()),
            restoring: Mutex::new(HashSet::new()),
        })
    }

    // =========================================================================
    // RECONNECT PATH
    // =========================================================================

    /// Restore a user's seats after they authenticate.
    ///
    /// Cancels any pending eviction, then reverts Disconnected back to the
    /// pre-disconnect status in every lobby the user belongs to, rehydrating
    /// lobbies from the durable store when they are not resident. Concurrent
    /// calls for the same user collapse into one.
    pub async fn restore_user(self: &Arc<Self>, user_id: UserId) {
        {
            let mut restoring = self.restoring.lock().await;
            if !restoring.insert(user_id) {
                debug!(%user_id, "restore already in flight");
                return;
            }
        }

        self.cancel_timer(TaskKind::Evict, &user_id).await;

        if let Err(e) = self.restore_memberships(&user_id).await {
            warn!(%user_id, error = %e, "membership restore incomplete");
        }

        let mut restoring = self.restoring.lock().await;
        restoring.remove(&user_id);
    }

    async fn restore_memberships(&self, user_id: &UserId) -> Result<(), StoreError> {
        // Union of resident membership and durable rows; after a restart
        // only the durable side knows this user.
        let mut lobby_ids: Vec<LobbyId> = Vec::new();
        for lobby in self.sessions.lobbies_for_user(user_id).await {
            lobby_ids.push(lobby.read().await.id);
        }
        match self.durable.memberships(user_id).await {
            Ok(ids) => {
                for id in ids {
                    if !lobby_ids.contains(&id) {
                        lobby_ids.push(id);
                    }
                }
            }
            Err(e) => warn!(%user_id, error = %e, "durable membership lookup failed"),
        }

        for lobby_id in lobby_ids {
            let lobby = match self.sessions.get(&lobby_id).await {
                Some(lobby) => lobby,
                None => match self.rehydrate(&lobby_id).await? {
                    Some(lobby) => {
                        info!(%lobby_id, "lobby rehydrated from durable store");
                        lobby
                    }
                    None => continue,
                },
            };

            let restored = {
                let mut lobby = lobby.write().await;
                let restored = lobby.restore_player(user_id);
                restored.map(|status| {
                    (
                        status,
                        lobby
                            .player(user_id)
                            .map(|p| PlayerRecord::from_session(lobby_id, p)),
                    )
                })
            };

            if let Some((status, record)) = restored {
                debug!(%user_id, %lobby_id, ?status, "player restored");
                if let Some(record) = record {
                    if let Err(e) = self.durable.upsert_player(record).await {
                        warn!(%lobby_id, error = %e, "durable player write failed");
                    }
                }
                self.touch(&lobby_id).await;
                self.dispatcher.broadcast_lobby_update(&lobby).await;
            }
        }
        Ok(())
    }

    /// Rebuild a lobby from its durable rows. Returns `None` when the lobby
    /// has no row or no players.
    async fn rehydrate(&self, lobby_id: &LobbyId) -> Result<Option<SharedLobby>, StoreError> {
        let record = match self.durable.fetch_lobby(lobby_id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let rows = self.durable.fetch_players(lobby_id).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut players = BTreeMap::new();
        for row in rows {
            let mut player = PlayerSession::new(row.user_id, row.display_name);
            player.status = row.status;
            player.score = row.score;
            player.progress = row.progress;
            player.disconnected_at = row.disconnected_at;
            players.insert(row.user_id, player);
        }

        let lobby = LobbySession::from_parts(
            record.id,
            record.host_id,
            record.name,
            record.settings,
            record.status,
            players,
            record.created_at,
        );
        Ok(Some(self.sessions.insert(lobby).await))
    }

    // =========================================================================
    // DISCONNECT PATH
    // =========================================================================

    /// React to a user's transport going down.
    ///
    /// A disconnecting host dissolves their lobby on the spot; everyone else
    /// is marked Disconnected and given a grace window to come back.
    pub async fn handle_disconnect(self: &Arc<Self>, user_id: UserId) {
        let presence = self.presence.clone();
        tokio::spawn(async move {
            presence.announce_offline(user_id).await;
        });

        let now = Utc::now();
        let mut armed = false;

        for lobby in self.sessions.lobbies_for_user(&user_id).await {
            let is_host = {
                let lobby = lobby.read().await;
                lobby.is_host(&user_id)
            };

            if is_host {
                let lobby_id = lobby.read().await.id;
                self.dissolve_lobby(&lobby_id, &lobby).await;
                continue;
            }

            let (lobby_id, record) = {
                let mut lobby = lobby.write().await;
                lobby.mark_disconnected(&user_id, now);
                (
                    lobby.id,
                    lobby
                        .player(&user_id)
                        .map(|p| PlayerRecord::from_session(lobby.id, p)),
                )
            };

            if let Some(record) = record {
                if let Err(e) = self.durable.upsert_player(record).await {
                    warn!(%lobby_id, error = %e, "durable player write failed");
                }
            }
            self.dispatcher.broadcast_lobby_update(&lobby).await;
            armed = true;
        }

        if armed {
            self.arm_eviction(user_id).await;
        }
    }

    /// Dissolve a lobby: final Finished broadcast, then eviction from both
    /// stores.
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

        info!(%lobby_id, "lobby dissolved");
        self.dispatcher
            .send_to_members(&members, ServerMessage::LobbyUpdate(update))
            .await;
    }

    /// Arm (or re-arm) the grace timer for a user. Supersedes any timer
    /// already pending for them.
    async fn arm_eviction(self: &Arc<Self>, user_id: UserId) {
        let scheduler = self.clone();
        let grace = self.config.grace_window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            scheduler.evict_user(user_id).await;
        });

        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.insert((TaskKind::Evict, user_id), handle) {
            old.abort();
        }
    }

    /// Cancel a pending timer. Missing timers are a no-op.
    async fn cancel_timer(&self, kind: TaskKind, user_id: &UserId) {
        let mut timers = self.timers.lock().await;
        if let Some(handle) = timers.remove(&(kind, *user_id)) {
            handle.abort();
            debug!(%user_id, ?kind, "timer cancelled");
        }
    }

    /// Grace window expired: remove the user's seat everywhere they are
    /// still Disconnected, dissolving lobbies that empty out (or that they
    /// hosted).
    async fn evict_user(self: &Arc<Self>, user_id: UserId) {
        {
            let mut timers = self.timers.lock().await;
            timers.remove(&(TaskKind::Evict, user_id));
        }

        for lobby in self.sessions.lobbies_for_user(&user_id).await {
            let verdict = {
                let lobby = lobby.read().await;
                match lobby.player(&user_id) {
                    Some(player) if player.is_disconnected() => {
                        Some((lobby.id, lobby.is_host(&user_id)))
                    }
                    _ => None,
                }
            };

            let (lobby_id, is_host) = match verdict {
                Some(v) => v,
                // Reconnected in the meantime.
                None => continue,
            };

            if is_host {
                self.dissolve_lobby(&lobby_id, &lobby).await;
                continue;
            }

            // Removing the last unfinished player can complete the game,
            // same as the final progress update would.
            let (emptied, completed) = {
                let mut lobby = lobby.write().await;
                lobby.remove_player(&user_id);
                let emptied = lobby.player_count() == 0;
                (emptied, !emptied && lobby.finish_if_complete())
            };

            if let Err(e) = self.durable.delete_player(&lobby_id, &user_id).await {
                warn!(%lobby_id, error = %e, "durable player delete failed");
            }

            if emptied {
                self.sessions.remove(&lobby_id).await;
                if let Err(e) = self.durable.delete_lobby(&lobby_id).await {
                    warn!(%lobby_id, error = %e, "durable lobby delete failed");
                }
                info!(%lobby_id, "empty lobby evicted");
                continue;
            }

            info!(%user_id, %lobby_id, "disconnected player evicted");
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
                info!(%lobby_id, "game finished after eviction");
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
        }
    }

    // =========================================================================
    // SWEEP
    // =========================================================================

    /// Run the sweep loop until the task is aborted.
    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh server
            // does not sweep before anything happened.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scheduler.sweep_once().await;
            }
        })
    }

    /// One sweep cycle over the durable store. Every failure is logged and
    /// skipped so one bad row never stops the cycle.
    pub async fn sweep_once(self: &Arc<Self>) {
        debug!("reconciliation sweep starting");

        match self
            .durable
            .disconnected_players_before(cutoff(self.config.grace_window))
            .await
        {
            Ok(stale) => {
                for (lobby_id, user_id) in stale {
                    self.sweep_stale_player(lobby_id, user_id).await;
                }
            }
            Err(e) => warn!(error = %e, "stale player scan failed"),
        }

        match self
            .durable
            .inactive_lobbies_before(cutoff(self.config.cleanup_window))
            .await
        {
            Ok(inactive) => {
                for lobby_id in inactive {
                    // Only sweep lobbies nobody is left in. A lobby with any
                    // player still connected is idle, not abandoned.
                    let occupied = match self.durable.fetch_players(&lobby_id).await {
                        Ok(rows) => rows.iter().any(|p| p.status != PlayerStatus::Disconnected),
                        Err(e) => {
                            warn!(%lobby_id, error = %e, "durable player scan failed");
                            continue;
                        }
                    };
                    if occupied {
                        debug!(%lobby_id, "inactive lobby still occupied, skipping");
                        continue;
                    }
                    if let Some(lobby) = self.sessions.get(&lobby_id).await {
                        self.dissolve_lobby(&lobby_id, &lobby).await;
                    } else if let Err(e) = self.durable.delete_lobby(&lobby_id).await {
                        warn!(%lobby_id, error = %e, "durable lobby delete failed");
                    } else {
                        info!(%lobby_id, "inactive lobby swept");
                    }
                }
            }
            Err(e) => warn!(error = %e, "inactive lobby scan failed"),
        }
    }

    /// Remove one stale disconnected player found by the sweep.
    async fn sweep_stale_player(self: &Arc<Self>, lobby_id: LobbyId, user_id: UserId) {
        if let Some(lobby) = self.sessions.get(&lobby_id).await {
            let still_disconnected = {
                let lobby = lobby.read().await;
                lobby
                    .player(&user_id)
                    .map(|p| p.is_disconnected())
                    .unwrap_or(false)
            };
            if !still_disconnected {
                return;
            }
            // Same path as a fired grace timer.
            self.evict_user(user_id).await;
            return;
        }

        // Not resident; clean the rows directly.
        if let Err(e) = self.durable.delete_player(&lobby_id, &user_id).await {
            warn!(%lobby_id, error = %e, "durable player delete failed");
            return;
        }
        match self.durable.fetch_players(&lobby_id).await {
            Ok(rows) if rows.is_empty() => {
                if let Err(e) = self.durable.delete_lobby(&lobby_id).await {
                    warn!(%lobby_id, error = %e, "durable lobby delete failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(%lobby_id, error = %e, "durable player scan failed"),
        }
    }

    /// Advance a lobby's durable activity stamp. Best-effort.
    async fn touch(&self, lobby_id: &LobbyId) {
        if let Err(e) = self.durable.touch_lobby(lobby_id, Utc::now()).await {
            warn!(%lobby_id, error = %e, "durable touch failed");
        }
    }
}

fn cutoff(window: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::ConnectionRegistry;
    use crate::persist::MemoryStore;
    use crate::presence::NullNotifier;
    use crate::session::state::LobbySettings;

    fn user(n: u8) -> UserId {
        UserId([n; 16])
    }

    fn scheduler_with(
        grace: Duration,
    ) -> (Arc<ReconciliationScheduler>, Arc<SessionStore>, Arc<MemoryStore>) {
        let sessions = Arc::new(SessionStore::new());
        let durable = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone()));
        let presence = Arc::new(Presence::new(registry, Arc::new(NullNotifier)));
        let config = ReconcileConfig {
            grace_window: grace,
            ..ReconcileConfig::default()
        };
        let scheduler = ReconciliationScheduler::new(
            sessions.clone(),
            durable.clone(),
            dispatcher,
            presence,
            config,
        );
        (scheduler, sessions, durable)
    }

    async fn seed_lobby(
        sessions: &SessionStore,
        durable: &MemoryStore,
        host: UserId,
        others: &[UserId],
    ) -> LobbyId {
        let mut lobby = LobbySession::new(
            uuid::Uuid::new_v4(),
            host,
            "host".into(),
            "Room".into(),
            LobbySettings::new(),
            Utc::now(),
        );
        for (i, u) in others.iter().enumerate() {
            lobby.add_player(*u, format!("player{}", i)).unwrap();
        }
        let id = lobby.id;

        durable
            .create_lobby(LobbyRecord::from_session(&lobby, Utc::now()))
            .await
            .unwrap();
        for p in lobby.players() {
            durable
                .upsert_player(PlayerRecord::from_session(id, p))
                .await
                .unwrap();
        }
        sessions.insert(lobby).await;
        id
    }

    #[tokio::test]
    async fn test_disconnect_marks_and_grace_evicts() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_millis(20));
        let id = seed_lobby(&sessions, &durable, user(1), &[user(2)]).await;

        scheduler.handle_disconnect(user(2)).await;
        {
            let lobby = sessions.get(&id).await.unwrap();
            let lobby = lobby.read().await;
            assert_eq!(
                lobby.player(&user(2)).unwrap().status,
                PlayerStatus::Disconnected
            );
        }

        tokio::time::sleep(Duration::from_millis(80)).await;

        let lobby = sessions.get(&id).await.unwrap();
        let lobby = lobby.read().await;
        assert!(!lobby.contains_player(&user(2)));
        assert!(lobby.contains_player(&user(1)));
        assert!(durable
            .fetch_player(&id, &user(2))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_cancels_eviction() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_millis(40));
        let id = seed_lobby(&sessions, &durable, user(1), &[user(2)]).await;

        scheduler.handle_disconnect(user(2)).await;
        scheduler.restore_user(user(2)).await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        let lobby = sessions.get(&id).await.unwrap();
        let lobby = lobby.read().await;
        assert_eq!(lobby.player(&user(2)).unwrap().status, PlayerStatus::Joined);
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_secs(60));
        let id = seed_lobby(&sessions, &durable, user(1), &[user(2)]).await;

        {
            let lobby = sessions.get(&id).await.unwrap();
            lobby.write().await.mark_disconnected(&user(2), Utc::now());
        }

        // Two racing reconnects for the same user collapse into one restore.
        tokio::join!(
            scheduler.restore_user(user(2)),
            scheduler.restore_user(user(2)),
        );

        let lobby = sessions.get(&id).await.unwrap();
        let lobby = lobby.read().await;
        let player = lobby.player(&user(2)).unwrap();
        assert_eq!(player.status, PlayerStatus::Joined);
        assert!(player.disconnected_at.is_none());
    }

    #[tokio::test]
    async fn test_host_disconnect_dissolves_lobby() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_secs(60));
        let id = seed_lobby(&sessions, &durable, user(1), &[user(2)]).await;

        scheduler.handle_disconnect(user(1)).await;

        assert!(sessions.get(&id).await.is_none());
        assert!(durable.fetch_lobby(&id).await.unwrap().is_none());
        assert!(durable.fetch_players(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rehydrates_lobby_after_restart() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_secs(60));
        let id = seed_lobby(&sessions, &durable, user(1), &[user(2)]).await;

        // Mark disconnected in the durable rows, then simulate a restart by
        // dropping the resident copy.
        {
            let lobby = sessions.get(&id).await.unwrap();
            let mut lobby = lobby.write().await;
            lobby.mark_disconnected(&user(2), Utc::now());
            let record = PlayerRecord::from_session(id, lobby.player(&user(2)).unwrap());
            durable.upsert_player(record).await.unwrap();
        }
        sessions.remove(&id).await;

        scheduler.restore_user(user(2)).await;

        let lobby = sessions.get(&id).await.unwrap();
        let lobby = lobby.read().await;
        assert_eq!(lobby.id, id);
        assert_eq!(lobby.host_id, user(1));
        assert_eq!(lobby.player(&user(2)).unwrap().status, PlayerStatus::Joined);
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_durable_rows() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_secs(60));
        let id = seed_lobby(&sessions, &durable, user(1), &[user(2)]).await;

        // Rows linger from before a restart; nothing resident.
        sessions.remove(&id).await;
        let lobby_row = durable.fetch_lobby(&id).await.unwrap().unwrap();
        for user_id in [user(1), user(2)] {
            let mut row = durable.fetch_player(&id, &user_id).await.unwrap().unwrap();
            row.status = PlayerStatus::Disconnected;
            row.disconnected_at = Some(Utc::now() - chrono::Duration::hours(1));
            durable.upsert_player(row).await.unwrap();
        }
        durable.update_lobby(lobby_row).await.unwrap();

        scheduler.sweep_once().await;

        assert!(durable.fetch_players(&id).await.unwrap().is_empty());
        assert!(durable.fetch_lobby(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_inactive_lobby() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_secs(60));
        let id = seed_lobby(&sessions, &durable, user(1), &[]).await;

        let mut row = durable.fetch_lobby(&id).await.unwrap().unwrap();
        row.last_active_at = Utc::now() - chrono::Duration::hours(2);
        durable.update_lobby(row).await.unwrap();
        let mut host_row = durable.fetch_player(&id, &user(1)).await.unwrap().unwrap();
        host_row.status = PlayerStatus::Disconnected;
        host_row.disconnected_at = Some(Utc::now() - chrono::Duration::hours(2));
        durable.upsert_player(host_row).await.unwrap();

        scheduler.sweep_once().await;

        assert!(sessions.get(&id).await.is_none());
        assert!(durable.fetch_lobby(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_inactive_lobby_with_connected_players() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_secs(60));
        let id = seed_lobby(&sessions, &durable, user(1), &[user(2)]).await;

        // Long-idle lobby, but both players are still connected.
        let mut row = durable.fetch_lobby(&id).await.unwrap().unwrap();
        row.last_active_at = Utc::now() - chrono::Duration::hours(2);
        durable.update_lobby(row).await.unwrap();

        scheduler.sweep_once().await;

        assert!(sessions.get(&id).await.is_some());
        assert!(durable.fetch_lobby(&id).await.unwrap().is_some());
        assert_eq!(durable.fetch_players(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_eviction_completes_finished_game() {
        let (scheduler, sessions, durable) = scheduler_with(Duration::from_millis(20));
        let id = seed_lobby(&sessions, &durable, user(1), &[user(2)]).await;

        // Host finishes; the other player stalls at zero and drops.
        {
            let lobby = sessions.get(&id).await.unwrap();
            let mut lobby = lobby.write().await;
            lobby.start_game(Utc::now()).unwrap();
            lobby
                .apply_progress(
                    &user(1),
                    vec!["FR".into(), "DE".into()],
                    vec![],
                    200,
                    2,
                    Utc::now(),
                )
                .unwrap();
        }

        scheduler.handle_disconnect(user(2)).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let lobby = sessions.get(&id).await.unwrap();
        let lobby = lobby.read().await;
        assert_eq!(lobby.status, LobbyStatus::Finished);
        assert!(!lobby.contains_player(&user(2)));

        let record = durable.fetch_lobby(&id).await.unwrap().unwrap();
        assert_eq!(record.status, LobbyStatus::Finished);
    }
}

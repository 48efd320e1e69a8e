//! Lobby and Player Session State
//!
//! The pure state machine for multiplayer quiz lobbies. Everything in this
//! module is synchronous and lock-free; callers serialize access per lobby
//! (see [`crate::session::store::SessionStore`]).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Unique lobby identifier.
pub type LobbyId = uuid::Uuid;

/// Open key/value bag of host-selected lobby settings (region filters,
/// question count, and whatever else the client sends).
pub type LobbySettings = BTreeMap<String, serde_json::Value>;

/// Stable 16-byte user identity, derived from the auth provider subject.
///
/// Serialized as a 32-character hex string on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub [u8; 16]);

impl UserId {
    /// Derive a deterministic id from an auth provider subject claim.
    pub fn from_subject(sub: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"terra-quiz-user:");
        hasher.update(sub.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        UserId(id)
    }

    /// Parse from the 32-character hex wire form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Some(UserId(id))
    }

    /// Hex wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", &self.to_hex()[..8])
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UserId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 32 hex chars"))
    }
}

/// Lobby lifecycle status.
///
/// Transitions are monotonic forward except the explicit restart
/// (`Playing | Finished -> Waiting`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyStatus {
    /// Players gathering and readying up.
    Waiting,
    /// Game in progress.
    Playing,
    /// Game over, rankings available.
    Finished,
}

/// Per-player status within a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    /// Invited but not yet joined.
    Invited,
    /// Present in the lobby.
    Joined,
    /// Ready to start.
    Ready,
    /// Answering questions.
    Playing,
    /// Reached 100% progress.
    Finished,
    /// Marked away.
    Absent,
    /// Transport dropped; pending reconnect or eviction.
    Disconnected,
}

/// A player's state inside one lobby.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSession {
    /// Owning user.
    pub user_id: UserId,
    /// Display name shown to other players.
    pub display_name: String,
    /// Current status.
    pub status: PlayerStatus,
    /// Current score.
    pub score: u32,
    /// Percentage of total questions answered, clamped to [0, 100].
    pub progress: u8,
    /// Country ids answered correctly, in answer order.
    pub validated_countries: Vec<String>,
    /// Country ids answered incorrectly, in answer order.
    pub incorrect_countries: Vec<String>,
    /// Milliseconds between the two most recent progress updates.
    pub last_answer_latency_ms: Option<i64>,
    /// Consecutive-correct answer streak.
    pub streak: u32,
    /// When the transport dropped, if currently disconnected.
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Status to revert to on reconnect.
    status_before_disconnect: Option<PlayerStatus>,
    /// Instant of the previous progress update (latency bookkeeping).
    last_progress_at: Option<DateTime<Utc>>,
}

impl PlayerSession {
    /// Create a freshly joined player.
    pub fn new(user_id: UserId, display_name: String) -> Self {
        Self {
            user_id,
            display_name,
            status: PlayerStatus::Joined,
            score: 0,
            progress: 0,
            validated_countries: Vec::new(),
            incorrect_countries: Vec::new(),
            last_answer_latency_ms: None,
            streak: 0,
            disconnected_at: None,
            status_before_disconnect: None,
            last_progress_at: None,
        }
    }

    /// Zero score/progress/answer sets. Status is left to the caller.
    fn reset_counters(&mut self) {
        self.score = 0;
        self.progress = 0;
        self.validated_countries.clear();
        self.incorrect_countries.clear();
        self.last_answer_latency_ms = None;
        self.streak = 0;
        self.last_progress_at = None;
    }

    /// Whether the transport for this player is currently down.
    pub fn is_disconnected(&self) -> bool {
        self.status == PlayerStatus::Disconnected
    }
}

/// State of a running game, owned by its [`LobbySession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    /// When the host started the game.
    pub started_at: DateTime<Utc>,
    /// Settings snapshot taken at start; later settings edits do not apply
    /// to a game already in flight.
    pub settings: LobbySettings,
}

/// Outcome of applying one progress update.
#[derive(Debug, Clone, Copy)]
pub struct ProgressOutcome {
    /// Clamped progress after the update.
    pub progress: u8,
    /// The update changed the player's score.
    pub score_changed: bool,
    /// The player crossed into Finished with this update.
    pub just_finished: bool,
    /// Every player is now Finished; the lobby flipped to Finished.
    pub lobby_finished: bool,
}

/// One row of the end-of-game ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    /// 1-based rank.
    pub rank: u32,
    /// Ranked player.
    pub user_id: UserId,
    /// Display name at game end.
    pub display_name: String,
    /// Final score.
    pub score: u32,
    /// Final progress (tiebreaker).
    pub progress: u8,
}

/// Session state machine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Lobby does not exist.
    #[error("lobby not found")]
    LobbyNotFound,

    /// Player is not a member of the lobby.
    #[error("player not in lobby")]
    PlayerNotFound,

    /// Action reserved for the lobby host.
    #[error("only the host may do that")]
    NotHost,

    /// Game already started.
    #[error("game already started")]
    AlreadyStarted,

    /// Game is not in progress.
    #[error("game not in progress")]
    NotPlaying,

    /// Nothing to restart.
    #[error("game has not been started")]
    NotStarted,

    /// Lobby is not accepting new players right now.
    #[error("game in progress, cannot join")]
    GameInProgress,
}

/// An active game room: players, settings, status, and (while playing) the
/// game state. All mutation happens under the owning lobby lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbySession {
    /// Lobby identifier.
    pub id: LobbyId,
    /// The player with start/restart/dissolve rights.
    pub host_id: UserId,
    /// Display name of the room.
    pub name: String,
    /// Host-selected settings.
    pub settings: LobbySettings,
    /// Lifecycle status.
    pub status: LobbyStatus,
    /// Member players, keyed by user id.
    players: BTreeMap<UserId, PlayerSession>,
    /// Present while a game is running (or finished, until restart).
    pub game: Option<GameState>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

impl LobbySession {
    /// Create a lobby with its host as the first joined player.
    pub fn new(
        id: LobbyId,
        host_id: UserId,
        host_name: String,
        name: String,
        settings: LobbySettings,
        now: DateTime<Utc>,
    ) -> Self {
        let mut players = BTreeMap::new();
        players.insert(host_id, PlayerSession::new(host_id, host_name));

        Self {
            id,
            host_id,
            name,
            settings,
            status: LobbyStatus::Waiting,
            players,
            game: None,
            created_at: now,
        }
    }

    /// Rebuild a lobby from previously captured parts (durable-store
    /// rehydration after a process restart).
    pub fn from_parts(
        id: LobbyId,
        host_id: UserId,
        name: String,
        settings: LobbySettings,
        status: LobbyStatus,
        players: BTreeMap<UserId, PlayerSession>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            host_id,
            name,
            settings,
            status,
            players,
            game: None,
            created_at,
        }
    }

    /// Member iterator in stable (user id) order.
    pub fn players(&self) -> impl Iterator<Item = &PlayerSession> {
        self.players.values()
    }

    /// Member lookup.
    pub fn player(&self, user_id: &UserId) -> Option<&PlayerSession> {
        self.players.get(user_id)
    }

    /// Member count.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Membership check.
    pub fn contains_player(&self, user_id: &UserId) -> bool {
        self.players.contains_key(user_id)
    }

    /// Whether `user_id` holds host rights here.
    pub fn is_host(&self, user_id: &UserId) -> bool {
        self.host_id == *user_id
    }

    /// Snapshot of member ids, for fan-out outside the lobby lock.
    pub fn player_ids(&self) -> Vec<UserId> {
        self.players.keys().copied().collect()
    }

    /// Invariant: the host is a member, and is the only member with host
    /// rights. Used by tests and debug assertions.
    pub fn host_invariant_holds(&self) -> bool {
        self.players.contains_key(&self.host_id)
            && self
                .players
                .keys()
                .filter(|id| self.is_host(id))
                .count()
                == 1
    }

    /// Add a player, or no-op if they are already a member (clients resend
    /// join after flaky transports).
    ///
    /// Returns `true` when the player was newly added.
    pub fn add_player(
        &mut self,
        user_id: UserId,
        display_name: String,
    ) -> Result<bool, SessionError> {
        if self.players.contains_key(&user_id) {
            return Ok(false);
        }
        if self.status != LobbyStatus::Waiting {
            return Err(SessionError::GameInProgress);
        }

        self.players
            .insert(user_id, PlayerSession::new(user_id, display_name));
        Ok(true)
    }

    /// Remove a player. Returns the removed session, if any.
    pub fn remove_player(&mut self, user_id: &UserId) -> Option<PlayerSession> {
        self.players.remove(user_id)
    }

    /// Set or clear a player's ready flag. Idempotent.
    pub fn set_ready(&mut self, user_id: &UserId, ready: bool) -> Result<(), SessionError> {
        if self.status != LobbyStatus::Waiting {
            return Err(SessionError::AlreadyStarted);
        }
        let player = self
            .players
            .get_mut(user_id)
            .ok_or(SessionError::PlayerNotFound)?;

        player.status = if ready {
            PlayerStatus::Ready
        } else {
            PlayerStatus::Joined
        };
        Ok(())
    }

    /// Start the game: snapshot settings, flip every player to Playing with
    /// zeroed counters, and move the lobby to Playing.
    ///
    /// Callers hold the lobby lock, so no progress update can interleave
    /// with the reset.
    pub fn start_game(&mut self, now: DateTime<Utc>) -> Result<GameState, SessionError> {
        if self.status != LobbyStatus::Waiting {
            return Err(SessionError::AlreadyStarted);
        }

        let game = GameState {
            started_at: now,
            settings: self.settings.clone(),
        };

        for player in self.players.values_mut() {
            player.reset_counters();
            if !player.is_disconnected() {
                player.status = PlayerStatus::Playing;
            } else {
                player.status_before_disconnect = Some(PlayerStatus::Playing);
            }
        }

        self.status = LobbyStatus::Playing;
        self.game = Some(game.clone());
        Ok(game)
    }

    /// Apply a progress update for one player.
    ///
    /// `progress = min(100, 100 * (validated + incorrect) / total_questions)`.
    /// Reaching 100 flips the player to Finished exactly once; repeated 100%
    /// updates are accepted but report `just_finished = false`.
    pub fn apply_progress(
        &mut self,
        user_id: &UserId,
        validated: Vec<String>,
        incorrect: Vec<String>,
        score: u32,
        total_questions: u32,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, SessionError> {
        if self.status != LobbyStatus::Playing {
            return Err(SessionError::NotPlaying);
        }
        let player = self
            .players
            .get_mut(user_id)
            .ok_or(SessionError::PlayerNotFound)?;

        let answered = (validated.len() + incorrect.len()) as u64;
        let progress = if total_questions == 0 {
            0
        } else {
            (100u64 * answered / total_questions as u64).min(100) as u8
        };

        // Streak: grows with new correct answers, dies on any new mistake.
        let new_correct = validated.len().saturating_sub(player.validated_countries.len());
        let new_wrong = incorrect.len().saturating_sub(player.incorrect_countries.len());
        if new_wrong > 0 {
            player.streak = 0;
        } else {
            player.streak += new_correct as u32;
        }

        if let Some(prev) = player.last_progress_at {
            player.last_answer_latency_ms = Some((now - prev).num_milliseconds());
        }
        player.last_progress_at = Some(now);

        let score_changed = player.score != score;
        player.score = score;
        player.progress = progress;
        player.validated_countries = validated;
        player.incorrect_countries = incorrect;

        let just_finished = progress >= 100 && player.status == PlayerStatus::Playing;
        if just_finished {
            player.status = PlayerStatus::Finished;
        }

        let lobby_finished = just_finished && self.all_players_finished();
        if lobby_finished {
            self.status = LobbyStatus::Finished;
        }

        Ok(ProgressOutcome {
            progress,
            score_changed,
            just_finished,
            lobby_finished,
        })
    }

    /// Completion check: every current player has reached Finished.
    pub fn all_players_finished(&self) -> bool {
        !self.players.is_empty()
            && self
                .players
                .values()
                .all(|p| p.status == PlayerStatus::Finished)
    }

    /// Flip a playing lobby to Finished if every current player is done.
    /// Returns whether the lobby just completed. Player removal can complete
    /// a game the same way the final progress update does, so leave and
    /// eviction paths run this after shrinking the player map.
    pub fn finish_if_complete(&mut self) -> bool {
        if self.status == LobbyStatus::Playing && self.all_players_finished() {
            self.status = LobbyStatus::Finished;
            true
        } else {
            false
        }
    }

    /// End-of-game ranking: score descending, ties broken by progress
    /// descending.
    pub fn rankings(&self) -> Vec<RankingEntry> {
        let mut entries: Vec<RankingEntry> = self
            .players
            .values()
            .map(|p| RankingEntry {
                rank: 0,
                user_id: p.user_id,
                display_name: p.display_name.clone(),
                score: p.score,
                progress: p.progress,
            })
            .collect();

        entries.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.progress.cmp(&a.progress))
        });

        for (i, entry) in entries.iter_mut().enumerate() {
            entry.rank = (i + 1) as u32;
        }
        entries
    }

    /// Restart: everyone back to Joined with zeroed counters, lobby back to
    /// Waiting, game state cleared. Players are retained.
    pub fn restart_game(&mut self) -> Result<(), SessionError> {
        if self.status == LobbyStatus::Waiting {
            return Err(SessionError::NotStarted);
        }

        for player in self.players.values_mut() {
            player.reset_counters();
            if player.is_disconnected() {
                player.status_before_disconnect = Some(PlayerStatus::Joined);
            } else {
                player.status = PlayerStatus::Joined;
            }
        }

        self.status = LobbyStatus::Waiting;
        self.game = None;
        Ok(())
    }

    /// Mark a player's transport as down, remembering the status to restore
    /// on reconnect. Idempotent.
    pub fn mark_disconnected(&mut self, user_id: &UserId, now: DateTime<Utc>) -> bool {
        match self.players.get_mut(user_id) {
            Some(player) => {
                if player.status != PlayerStatus::Disconnected {
                    player.status_before_disconnect = Some(player.status);
                    player.status = PlayerStatus::Disconnected;
                    player.disconnected_at = Some(now);
                }
                true
            }
            None => false,
        }
    }

    /// Restore a disconnected player to their pre-disconnect status
    /// (Joined when none was recorded). Returns the restored status, or
    /// `None` if the player was not disconnected (idempotent).
    pub fn restore_player(&mut self, user_id: &UserId) -> Option<PlayerStatus> {
        let player = self.players.get_mut(user_id)?;
        if player.status != PlayerStatus::Disconnected {
            return None;
        }

        let restored = player
            .status_before_disconnect
            .take()
            .unwrap_or(PlayerStatus::Joined);
        player.status = restored;
        player.disconnected_at = None;
        Some(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn user(n: u8) -> UserId {
        UserId([n; 16])
    }

    fn test_lobby() -> LobbySession {
        LobbySession::new(
            uuid::Uuid::new_v4(),
            user(1),
            "alice".into(),
            "Test Room".into(),
            LobbySettings::new(),
            Utc::now(),
        )
    }

    fn countries(n: usize, prefix: &str) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_host_is_sole_host_member() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.add_player(user(3), "carol".into()).unwrap();

        assert!(lobby.host_invariant_holds());
        assert!(lobby.is_host(&user(1)));
        assert!(!lobby.is_host(&user(2)));
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut lobby = test_lobby();
        assert!(lobby.add_player(user(2), "bob".into()).unwrap());
        assert!(!lobby.add_player(user(2), "bob".into()).unwrap());
        assert_eq!(lobby.player_count(), 2);
    }

    #[test]
    fn test_join_rejected_while_playing() {
        let mut lobby = test_lobby();
        lobby.start_game(Utc::now()).unwrap();

        let result = lobby.add_player(user(2), "bob".into());
        assert_eq!(result, Err(SessionError::GameInProgress));

        // But a current member re-sending join is still fine.
        assert!(!lobby.add_player(user(1), "alice".into()).unwrap());
    }

    #[test]
    fn test_ready_flow() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();

        lobby.set_ready(&user(1), true).unwrap();
        lobby.set_ready(&user(1), true).unwrap(); // idempotent
        assert_eq!(lobby.player(&user(1)).unwrap().status, PlayerStatus::Ready);

        lobby.set_ready(&user(1), false).unwrap();
        assert_eq!(lobby.player(&user(1)).unwrap().status, PlayerStatus::Joined);

        let missing = lobby.set_ready(&user(9), true);
        assert_eq!(missing, Err(SessionError::PlayerNotFound));
    }

    #[test]
    fn test_start_resets_players() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.set_ready(&user(1), true).unwrap();
        lobby.set_ready(&user(2), true).unwrap();

        let game = lobby.start_game(Utc::now()).unwrap();
        assert_eq!(lobby.status, LobbyStatus::Playing);
        assert_eq!(game.settings, lobby.settings);

        for player in lobby.players() {
            assert_eq!(player.status, PlayerStatus::Playing);
            assert_eq!(player.score, 0);
            assert_eq!(player.progress, 0);
            assert!(player.validated_countries.is_empty());
        }
    }

    #[test]
    fn test_start_twice_is_conflict() {
        let mut lobby = test_lobby();
        lobby.start_game(Utc::now()).unwrap();

        let result = lobby.start_game(Utc::now());
        assert_eq!(result, Err(SessionError::AlreadyStarted));
        assert_eq!(lobby.status, LobbyStatus::Playing);
    }

    #[test]
    fn test_progress_formula_and_clamp() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();

        let out = lobby
            .apply_progress(&user(1), countries(3, "v"), countries(2, "i"), 30, 10, Utc::now())
            .unwrap();
        assert_eq!(out.progress, 50);
        assert!(!out.just_finished);

        // Answered counts beyond the denominator clamp at 100.
        let out = lobby
            .apply_progress(&user(1), countries(9, "v"), countries(4, "i"), 90, 10, Utc::now())
            .unwrap();
        assert_eq!(out.progress, 100);
        assert!(out.just_finished);
    }

    #[test]
    fn test_finish_exactly_once() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();

        let first = lobby
            .apply_progress(&user(1), countries(10, "v"), vec![], 100, 10, Utc::now())
            .unwrap();
        assert!(first.just_finished);
        assert!(!first.lobby_finished); // bob still playing

        let second = lobby
            .apply_progress(&user(1), countries(10, "v"), vec![], 100, 10, Utc::now())
            .unwrap();
        assert!(!second.just_finished);
        assert_eq!(lobby.player(&user(1)).unwrap().status, PlayerStatus::Finished);
    }

    #[test]
    fn test_completion_flips_lobby() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();

        lobby
            .apply_progress(&user(1), countries(10, "v"), vec![], 80, 10, Utc::now())
            .unwrap();
        assert_eq!(lobby.status, LobbyStatus::Playing);

        let out = lobby
            .apply_progress(&user(2), countries(8, "v"), countries(2, "i"), 60, 10, Utc::now())
            .unwrap();
        assert!(out.lobby_finished);
        assert_eq!(lobby.status, LobbyStatus::Finished);
    }

    #[test]
    fn test_removing_last_unfinished_player_completes_game() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();
        lobby
            .apply_progress(&user(1), countries(10, "v"), vec![], 80, 10, Utc::now())
            .unwrap();

        // Bob drops out; alice is now the only player and she is done.
        lobby.remove_player(&user(2));
        assert!(lobby.finish_if_complete());
        assert_eq!(lobby.status, LobbyStatus::Finished);

        // Repeat runs are no-ops once the lobby is Finished.
        assert!(!lobby.finish_if_complete());
    }

    #[test]
    fn test_finish_if_complete_needs_everyone_done() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();

        assert!(!lobby.finish_if_complete());
        assert_eq!(lobby.status, LobbyStatus::Playing);
    }

    #[test]
    fn test_progress_rejected_before_start() {
        let mut lobby = test_lobby();
        let result =
            lobby.apply_progress(&user(1), countries(1, "v"), vec![], 10, 10, Utc::now());
        assert_eq!(result.err(), Some(SessionError::NotPlaying));
    }

    #[test]
    fn test_rankings_tiebreak_on_progress() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.add_player(user(3), "carol".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();

        lobby
            .apply_progress(&user(1), countries(5, "v"), vec![], 50, 10, Utc::now())
            .unwrap();
        lobby
            .apply_progress(&user(2), countries(5, "v"), countries(3, "i"), 50, 10, Utc::now())
            .unwrap();
        lobby
            .apply_progress(&user(3), countries(9, "v"), vec![], 90, 10, Utc::now())
            .unwrap();

        let rankings = lobby.rankings();
        assert_eq!(rankings[0].user_id, user(3));
        assert_eq!(rankings[0].rank, 1);
        // Equal scores: bob answered 8 of 10 (80%) vs alice's 5 of 10 (50%).
        assert_eq!(rankings[1].user_id, user(2));
        assert_eq!(rankings[2].user_id, user(1));
    }

    #[test]
    fn test_restart_returns_to_waiting() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();
        lobby
            .apply_progress(&user(1), countries(10, "v"), vec![], 100, 10, Utc::now())
            .unwrap();

        lobby.restart_game().unwrap();
        assert_eq!(lobby.status, LobbyStatus::Waiting);
        assert!(lobby.game.is_none());
        assert_eq!(lobby.player_count(), 2);
        for player in lobby.players() {
            assert_eq!(player.status, PlayerStatus::Joined);
            assert_eq!(player.score, 0);
            assert_eq!(player.progress, 0);
        }
    }

    #[test]
    fn test_restart_without_start_is_conflict() {
        let mut lobby = test_lobby();
        assert_eq!(lobby.restart_game(), Err(SessionError::NotStarted));
    }

    #[test]
    fn test_disconnect_restore_round_trip() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();

        assert!(lobby.mark_disconnected(&user(2), Utc::now()));
        assert_eq!(
            lobby.player(&user(2)).unwrap().status,
            PlayerStatus::Disconnected
        );

        // Restores to the pre-disconnect status, here Playing.
        let restored = lobby.restore_player(&user(2));
        assert_eq!(restored, Some(PlayerStatus::Playing));
        assert!(lobby.player(&user(2)).unwrap().disconnected_at.is_none());

        // Second restore is a no-op.
        assert_eq!(lobby.restore_player(&user(2)), None);
    }

    #[test]
    fn test_mark_disconnected_is_idempotent() {
        let mut lobby = test_lobby();
        let t0 = Utc::now();
        assert!(lobby.mark_disconnected(&user(1), t0));
        assert!(lobby.mark_disconnected(&user(1), Utc::now()));

        // First timestamp and pre-disconnect status are preserved.
        assert_eq!(lobby.player(&user(1)).unwrap().disconnected_at, Some(t0));
        assert_eq!(lobby.restore_player(&user(1)), Some(PlayerStatus::Joined));
    }

    #[test]
    fn test_streak_tracking() {
        let mut lobby = test_lobby();
        lobby.add_player(user(2), "bob".into()).unwrap();
        lobby.start_game(Utc::now()).unwrap();

        lobby
            .apply_progress(&user(1), countries(3, "v"), vec![], 30, 20, Utc::now())
            .unwrap();
        assert_eq!(lobby.player(&user(1)).unwrap().streak, 3);

        lobby
            .apply_progress(&user(1), countries(5, "v"), vec![], 50, 20, Utc::now())
            .unwrap();
        assert_eq!(lobby.player(&user(1)).unwrap().streak, 5);

        lobby
            .apply_progress(&user(1), countries(5, "v"), countries(1, "i"), 50, 20, Utc::now())
            .unwrap();
        assert_eq!(lobby.player(&user(1)).unwrap().streak, 0);
    }

    #[test]
    fn test_user_id_hex_round_trip() {
        let id = UserId::from_subject("user123");
        let parsed = UserId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);

        assert_ne!(id, UserId::from_subject("user456"));
        assert!(UserId::from_hex("zz").is_none());
    }

    proptest! {
        #[test]
        fn progress_always_in_bounds(
            validated in 0usize..300,
            incorrect in 0usize..300,
            total in 0u32..200,
            score in 0u32..10_000,
        ) {
            let mut lobby = test_lobby();
            lobby.start_game(Utc::now()).unwrap();

            let out = lobby.apply_progress(
                &user(1),
                countries(validated, "v"),
                countries(incorrect, "i"),
                score,
                total,
                Utc::now(),
            ).unwrap();

            prop_assert!(out.progress <= 100);
            if total > 0 && (validated + incorrect) as u32 >= total {
                prop_assert_eq!(out.progress, 100);
            }
        }
    }
}

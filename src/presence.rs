//! Presence Surface
//!
//! The narrow interface the friends subsystem consumes: push a message to a
//! user and ask whether they are online. Online/offline announcements go
//! out through a pluggable notifier; announcement failures are logged and
//! never escalated into the session engine.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::network::protocol::ServerMessage;
use crate::network::registry::ConnectionRegistry;
use crate::session::state::UserId;

/// Presence announcement errors.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// The friends backend rejected or never received the announcement.
    #[error("presence notification failed: {0}")]
    NotifyFailed(String),
}

/// Sink for online/offline announcements, implemented by the friends
/// subsystem.
#[async_trait]
pub trait FriendNotifier: Send + Sync {
    /// A user's transport came up.
    async fn user_online(&self, user_id: UserId) -> Result<(), PresenceError>;

    /// A user's transport went down.
    async fn user_offline(&self, user_id: UserId) -> Result<(), PresenceError>;
}

/// Default notifier: logs announcements and succeeds.
pub struct NullNotifier;

#[async_trait]
impl FriendNotifier for NullNotifier {
    async fn user_online(&self, user_id: UserId) -> Result<(), PresenceError> {
        debug!(%user_id, "user online");
        Ok(())
    }

    async fn user_offline(&self, user_id: UserId) -> Result<(), PresenceError> {
        debug!(%user_id, "user offline");
        Ok(())
    }
}

/// The outward presence handle.
pub struct Presence {
    registry: Arc<ConnectionRegistry>,
    notifier: Arc<dyn FriendNotifier>,
}

impl Presence {
    /// Wire presence over the registry and a notifier.
    pub fn new(registry: Arc<ConnectionRegistry>, notifier: Arc<dyn FriendNotifier>) -> Self {
        Self { registry, notifier }
    }

    /// Point-in-time online check for the friends subsystem.
    pub async fn is_user_online(&self, user_id: &UserId) -> bool {
        self.registry.is_online(user_id).await
    }

    /// Push a message to a user if they are online.
    pub async fn notify_user(&self, user_id: &UserId, message: ServerMessage) -> bool {
        self.registry.send(user_id, message).await
    }

    /// Announce that a user came online. Failures are logged only.
    pub async fn announce_online(&self, user_id: UserId) {
        if let Err(e) = self.notifier.user_online(user_id).await {
            warn!(%user_id, error = %e, "online announcement failed");
        }
    }

    /// Announce that a user went offline. Failures are logged only.
    pub async fn announce_offline(&self, user_id: UserId) {
        if let Err(e) = self.notifier.user_offline(user_id).await {
            warn!(%user_id, error = %e, "offline announcement failed");
        }
    }
}

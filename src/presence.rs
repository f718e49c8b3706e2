//! Directory of live push connections.
//!
//! The transport layer owns a [`ConnectionRegistry`]: it calls
//! [`connect`](ConnectionRegistry::connect) when a client attaches and
//! [`disconnect`](ConnectionRegistry::disconnect) when it goes away. The
//! notification adapter only ever sees the registry through the read-only
//! [`PresenceDirectory`] trait.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::slot::UserId;
use crate::notify::Notification;

/// Default per-connection channel capacity.
pub const DEFAULT_CONNECTION_BUFFER: usize = 64;

/// Identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Read-only lookup from a user to their push channel.
pub trait PresenceDirectory: Send + Sync {
    /// The channel of the user's live connection, if they are online.
    fn channel_for(&self, user: &UserId) -> Option<mpsc::Sender<Notification>>;
}

#[derive(Debug)]
struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Notification>,
}

/// Handed to the transport on connect. Dropping the receiver makes future
/// pushes to this connection fail silently.
#[derive(Debug)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub user: UserId,
    pub receiver: mpsc::Receiver<Notification>,
}

/// Registry of live connections, at most one per user.
#[derive(Debug)]
pub struct ConnectionRegistry {
    by_user: DashMap<UserId, Connection>,
    owners: DashMap<ConnectionId, UserId>,
    buffer: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_buffer(DEFAULT_CONNECTION_BUFFER)
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            by_user: DashMap::new(),
            owners: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Register a live connection for `user`.
    ///
    /// A newer connection replaces any older one for the same user.
    pub fn connect(&self, user: UserId) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = ConnectionId(Uuid::new_v4());

        self.owners.insert(id, user.clone());
        if let Some(previous) = self.by_user.insert(user.clone(), Connection { id, sender }) {
            self.owners.remove(&previous.id);
            tracing::debug!(user = %user, replaced = %previous.id, "Replaced existing connection");
        }
        tracing::debug!(user = %user, connection_id = %id, "User connected");

        Subscription {
            connection_id: id,
            user,
            receiver,
        }
    }

    /// Remove a connection. Returns false if it was unknown or already replaced.
    pub fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some((_, user)) = self.owners.remove(&connection_id) else {
            return false;
        };
        let removed = self
            .by_user
            .remove_if(&user, |_, conn| conn.id == connection_id)
            .is_some();
        if removed {
            tracing::debug!(user = %user, connection_id = %connection_id, "User disconnected");
        }
        removed
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.by_user.contains_key(user)
    }

    pub fn online_count(&self) -> usize {
        self.by_user.len()
    }
}

impl PresenceDirectory for ConnectionRegistry {
    fn channel_for(&self, user: &UserId) -> Option<mpsc::Sender<Notification>> {
        self.by_user.get(user).map(|conn| conn.sender.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_then_disconnect() {
        let registry = ConnectionRegistry::new();
        let sub = registry.connect("alice".into());
        assert!(registry.is_online(&"alice".into()));
        assert!(registry.channel_for(&"alice".into()).is_some());

        assert!(registry.disconnect(sub.connection_id));
        assert!(!registry.is_online(&"alice".into()));
        assert!(registry.channel_for(&"alice".into()).is_none());
        assert!(!registry.disconnect(sub.connection_id));
    }

    #[test]
    fn test_stale_disconnect_keeps_newer_connection() {
        let registry = ConnectionRegistry::new();
        let old = registry.connect("alice".into());
        let new = registry.connect("alice".into());
        assert_eq!(registry.online_count(), 1);

        assert!(!registry.disconnect(old.connection_id));
        assert!(registry.is_online(&"alice".into()));

        assert!(registry.disconnect(new.connection_id));
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn test_unknown_user_has_no_channel() {
        let registry = ConnectionRegistry::new();
        registry.connect("alice".into());
        assert!(registry.channel_for(&"bob".into()).is_none());
    }
}

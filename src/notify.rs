//! Outbound notifications.
//!
//! The coordinator calls [`NotificationPort::notify`] after a unit of work
//! has committed. Notifications are best-effort: implementations must not
//! panic or block, and an undeliverable notification is dropped. The stores
//! remain the only authoritative state.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::exchange::{AnyExchangeRequest, ExchangeRequest, TerminalState};
use crate::domain::slot::UserId;
use crate::presence::PresenceDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// A new exchange was proposed to the recipient.
    Proposal,
    /// The recipient's proposal was answered.
    Response,
}

/// Payload pushed to a user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub human_message: String,
    /// Snapshot of the request as committed.
    pub request: AnyExchangeRequest,
}

impl Notification {
    /// Tell the receiver about a newly proposed exchange.
    pub fn proposal(request: &AnyExchangeRequest) -> Self {
        let data = request.data();
        Self {
            recipient_id: data.receiver.clone(),
            kind: NotificationKind::Proposal,
            human_message: format!("You have a new swap request from {}!", data.requester),
            request: request.clone(),
        }
    }

    /// Tell the requester how their exchange was resolved.
    pub fn response<T>(request: &ExchangeRequest<T>) -> Self
    where
        T: TerminalState + Clone,
        ExchangeRequest<T>: Into<AnyExchangeRequest>,
    {
        Self {
            recipient_id: request.data.requester.clone(),
            kind: NotificationKind::Response,
            human_message: format!("Your swap request was {}.", T::STATUS),
            request: request.clone().into(),
        }
    }
}

/// Fire-and-forget push of a notification to one user.
pub trait NotificationPort: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl<T: NotificationPort + ?Sized> NotificationPort for Arc<T> {
    fn notify(&self, notification: Notification) {
        (**self).notify(notification)
    }
}

/// Pushes notifications onto the recipient's live connection, if any.
pub struct PushNotifier<D: PresenceDirectory> {
    directory: Arc<D>,
}

impl<D: PresenceDirectory> PushNotifier<D> {
    pub fn new(directory: Arc<D>) -> Self {
        Self { directory }
    }
}

impl<D: PresenceDirectory> NotificationPort for PushNotifier<D> {
    #[tracing::instrument(skip(self, notification), fields(recipient = %notification.recipient_id, kind = ?notification.kind, request_id = %notification.request.id()))]
    fn notify(&self, notification: Notification) {
        let Some(channel) = self.directory.channel_for(&notification.recipient_id) else {
            counter!("slotswap_notifications_dropped_total", "reason" => "offline").increment(1);
            tracing::debug!("Recipient offline, dropping notification");
            return;
        };
        match channel.try_send(notification) {
            Ok(()) => tracing::trace!("Notification queued"),
            Err(TrySendError::Full(_)) => {
                counter!("slotswap_notifications_dropped_total", "reason" => "full").increment(1);
                tracing::debug!("Connection buffer full, dropping notification");
            }
            Err(TrySendError::Closed(_)) => {
                counter!("slotswap_notifications_dropped_total", "reason" => "closed").increment(1);
                tracing::debug!("Connection closed, dropping notification");
            }
        }
    }
}

/// Notifier that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl NotificationPort for NoopNotifier {
    fn notify(&self, _notification: Notification) {}
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Notifier that records every notification it is given.
#[derive(Debug, Clone, Default)]
pub struct MockNotifier {
    sent: Arc<parking_lot::Mutex<Vec<Notification>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, user: &UserId) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| &n.recipient_id == user)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl NotificationPort for MockNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange::{
        Accepted, ExchangeData, ExchangeId, ExchangeStatus, Pending, Rejected,
    };
    use crate::domain::slot::SlotId;
    use crate::presence::ConnectionRegistry;
    use chrono::Utc;

    fn data() -> ExchangeData {
        ExchangeData {
            id: ExchangeId::new(),
            requester: "alice".into(),
            requester_slot: SlotId::new(),
            receiver: "bob".into(),
            receiver_slot: SlotId::new(),
            created_at: Utc::now(),
        }
    }

    fn pending() -> AnyExchangeRequest {
        ExchangeRequest {
            state: Pending {},
            data: data(),
        }
        .into()
    }

    #[test]
    fn test_proposal_goes_to_receiver() {
        let n = Notification::proposal(&pending());
        assert_eq!(n.recipient_id, UserId::from("bob"));
        assert_eq!(n.kind, NotificationKind::Proposal);
        assert_eq!(n.human_message, "You have a new swap request from alice!");
    }

    #[test]
    fn test_response_goes_to_requester() {
        let rejected = ExchangeRequest {
            state: Rejected {
                responded_at: Utc::now(),
            },
            data: data(),
        };
        let n = Notification::response(&rejected);
        assert_eq!(n.recipient_id, UserId::from("alice"));
        assert_eq!(n.human_message, "Your swap request was rejected.");

        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["recipientId"], "alice");
        assert_eq!(json["kind"], "response");
        assert_eq!(json["request"]["status"], "REJECTED");
    }

    #[test]
    fn test_response_message_follows_terminal_state() {
        let accepted = ExchangeRequest {
            state: Accepted {
                responded_at: Utc::now(),
            },
            data: data(),
        };
        let n = Notification::response(&accepted);
        assert_eq!(n.human_message, "Your swap request was accepted.");
        assert_eq!(n.request.status(), ExchangeStatus::Accepted);
        assert_eq!(n.request.id(), accepted.data.id);
    }

    #[tokio::test]
    async fn test_push_delivers_to_online_user() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut sub = registry.connect("bob".into());
        let notifier = PushNotifier::new(registry.clone());

        notifier.notify(Notification::proposal(&pending()));

        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.kind, NotificationKind::Proposal);
    }

    #[test]
    fn test_push_to_offline_or_closed_user_is_silently_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let notifier = PushNotifier::new(registry.clone());
        notifier.notify(Notification::proposal(&pending()));

        let sub = registry.connect("bob".into());
        drop(sub.receiver);
        notifier.notify(Notification::proposal(&pending()));
    }

    #[test]
    fn test_push_drops_when_buffer_full() {
        let registry = Arc::new(ConnectionRegistry::with_buffer(1));
        let mut sub = registry.connect("bob".into());
        let notifier = PushNotifier::new(registry.clone());

        notifier.notify(Notification::proposal(&pending()));
        notifier.notify(Notification::proposal(&pending()));

        assert!(sub.receiver.try_recv().is_ok());
        assert!(sub.receiver.try_recv().is_err());
    }
}

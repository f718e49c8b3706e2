//! Exchange request types.
//!
//! An exchange request moves through its lifecycle using the typestate
//! pattern: `ExchangeRequest<Pending>` is the only state that exposes
//! `accept` and `reject`, and the terminal states expose nothing that
//! writes. Storage and listing code work with [`AnyExchangeRequest`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::slot::{SlotId, UserId};
use crate::error::SwapError;

/// Unique identifier for an exchange request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        ExchangeId(Uuid::new_v4())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ExchangeId {
    fn from(uuid: Uuid) -> Self {
        ExchangeId(uuid)
    }
}

impl std::ops::Deref for ExchangeId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Marker trait for valid exchange request states.
pub trait ExchangeState: Send + Sync {}

/// A state no transition leaves.
pub trait TerminalState: ExchangeState {
    const STATUS: ExchangeStatus;
}

/// An exchange request in state `T`.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRequest<T: ExchangeState> {
    pub state: T,
    pub data: ExchangeData,
}

/// Fields fixed at proposal time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeData {
    pub id: ExchangeId,
    /// Owner of `requester_slot` when the exchange was proposed.
    pub requester: UserId,
    pub requester_slot: SlotId,
    /// Owner of `receiver_slot` when the exchange was proposed.
    pub receiver: UserId,
    pub receiver_slot: SlotId,
    pub created_at: DateTime<Utc>,
}

impl ExchangeData {
    /// Both slot ids in ascending order, the order units of work lock them in.
    pub fn slots_in_lock_order(&self) -> [SlotId; 2] {
        if self.requester_slot <= self.receiver_slot {
            [self.requester_slot, self.receiver_slot]
        } else {
            [self.receiver_slot, self.requester_slot]
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.requester == user || &self.receiver == user
    }
}

// ============================================================================
// Exchange States
// ============================================================================

/// Awaiting the receiver's answer. Both slots are PENDING.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {}

impl ExchangeState for Pending {}

/// Receiver accepted; slot owners were swapped (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub responded_at: DateTime<Utc>,
}

impl ExchangeState for Accepted {}

impl TerminalState for Accepted {
    const STATUS: ExchangeStatus = ExchangeStatus::Accepted;
}

/// Receiver rejected; both slots went back to SWAPPABLE (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Rejected {
    pub responded_at: DateTime<Utc>,
}

impl ExchangeState for Rejected {}

impl TerminalState for Rejected {
    const STATUS: ExchangeStatus = ExchangeStatus::Rejected;
}

// ============================================================================
// Unified Representation
// ============================================================================

/// Exchange status as stored and filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ExchangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeStatus::Pending => "PENDING",
            ExchangeStatus::Accepted => "ACCEPTED",
            ExchangeStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExchangeStatus::Pending)
    }
}

impl std::fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_lowercase())
    }
}

impl std::str::FromStr for ExchangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExchangeStatus::Pending),
            "ACCEPTED" => Ok(ExchangeStatus::Accepted),
            "REJECTED" => Ok(ExchangeStatus::Rejected),
            _ => Err(format!("Invalid exchange status: {}", s)),
        }
    }
}

/// An exchange request in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "request", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnyExchangeRequest {
    Pending(ExchangeRequest<Pending>),
    Accepted(ExchangeRequest<Accepted>),
    Rejected(ExchangeRequest<Rejected>),
}

impl AnyExchangeRequest {
    pub fn id(&self) -> ExchangeId {
        self.data().id
    }

    pub fn data(&self) -> &ExchangeData {
        match self {
            AnyExchangeRequest::Pending(r) => &r.data,
            AnyExchangeRequest::Accepted(r) => &r.data,
            AnyExchangeRequest::Rejected(r) => &r.data,
        }
    }

    pub fn status(&self) -> ExchangeStatus {
        match self {
            AnyExchangeRequest::Pending(_) => ExchangeStatus::Pending,
            AnyExchangeRequest::Accepted(_) => ExchangeStatus::Accepted,
            AnyExchangeRequest::Rejected(_) => ExchangeStatus::Rejected,
        }
    }

    pub fn responded_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyExchangeRequest::Pending(_) => None,
            AnyExchangeRequest::Accepted(r) => Some(r.state.responded_at),
            AnyExchangeRequest::Rejected(r) => Some(r.state.responded_at),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Rebuild a typed request from stored columns.
    ///
    /// A PENDING row must have no response time and a terminal row must have
    /// one. Anything else is a corrupt row and fails with `StorageFailure`.
    pub fn from_parts(
        data: ExchangeData,
        status: ExchangeStatus,
        responded_at: Option<DateTime<Utc>>,
    ) -> crate::error::Result<Self> {
        let request = match (status, responded_at) {
            (ExchangeStatus::Pending, None) => AnyExchangeRequest::Pending(ExchangeRequest {
                state: Pending {},
                data,
            }),
            (ExchangeStatus::Accepted, Some(responded_at)) => {
                AnyExchangeRequest::Accepted(ExchangeRequest {
                    state: Accepted { responded_at },
                    data,
                })
            }
            (ExchangeStatus::Rejected, Some(responded_at)) => {
                AnyExchangeRequest::Rejected(ExchangeRequest {
                    state: Rejected { responded_at },
                    data,
                })
            }
            (status, responded_at) => {
                return Err(SwapError::StorageFailure(anyhow::anyhow!(
                    "exchange request {} is {} but responded_at is {}",
                    data.id,
                    status.as_str(),
                    if responded_at.is_some() { "set" } else { "missing" }
                )));
            }
        };
        Ok(request)
    }
}

impl From<ExchangeRequest<Pending>> for AnyExchangeRequest {
    fn from(r: ExchangeRequest<Pending>) -> Self {
        AnyExchangeRequest::Pending(r)
    }
}

impl From<ExchangeRequest<Accepted>> for AnyExchangeRequest {
    fn from(r: ExchangeRequest<Accepted>) -> Self {
        AnyExchangeRequest::Accepted(r)
    }
}

impl From<ExchangeRequest<Rejected>> for AnyExchangeRequest {
    fn from(r: ExchangeRequest<Rejected>) -> Self {
        AnyExchangeRequest::Rejected(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_lock_order_is_ascending() {
        let d = data();
        let [first, second] = d.slots_in_lock_order();
        assert!(first < second);
        assert!([d.requester_slot, d.receiver_slot].contains(&first));
    }

    #[test]
    fn test_from_parts_restores_state() {
        let d = data();
        let responded_at = d.created_at + chrono::Duration::minutes(5);
        let any =
            AnyExchangeRequest::from_parts(d.clone(), ExchangeStatus::Accepted, Some(responded_at))
                .unwrap();
        assert_eq!(any.status(), ExchangeStatus::Accepted);
        assert!(any.is_terminal());
        assert_eq!(any.responded_at(), Some(responded_at));
        assert_eq!(any.data(), &d);
    }

    #[test]
    fn test_from_parts_rejects_inconsistent_response_time() {
        for status in [ExchangeStatus::Accepted, ExchangeStatus::Rejected] {
            let err = AnyExchangeRequest::from_parts(data(), status, None).unwrap_err();
            assert!(matches!(err, SwapError::StorageFailure(_)), "{err:?}");
        }
        let err = AnyExchangeRequest::from_parts(data(), ExchangeStatus::Pending, Some(Utc::now()))
            .unwrap_err();
        assert!(matches!(err, SwapError::StorageFailure(_)), "{err:?}");
    }

    #[test]
    fn test_serialized_shape_is_tagged_by_status() {
        let any = AnyExchangeRequest::from_parts(data(), ExchangeStatus::Pending, None).unwrap();
        let json = serde_json::to_value(&any).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["request"]["data"]["requester"], "alice");
    }

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(ExchangeStatus::Accepted.to_string(), "accepted");
        assert_eq!("REJECTED".parse::<ExchangeStatus>(), Ok(ExchangeStatus::Rejected));
    }
}

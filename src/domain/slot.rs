//! Slot types and the slot status state machine.
//!
//! ```text
//!            mark_swappable              propose
//!   BUSY ─────────────────────> SWAPPABLE ─────────> PENDING
//!     ^ <─────────────────────     ^                  │  │
//!     │       mark_busy            └──── reject ──────┘  │
//!     └──────────────────────── accept ──────────────────┘
//! ```
//!
//! The owner drives the BUSY/SWAPPABLE toggle. PENDING is entered and left
//! only by the swap coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SwapError};

/// Opaque identifier of an authenticated user, as supplied by the identity port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        UserId(value)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a slot.
///
/// Ordered, so units of work touching two slots can lock them ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub Uuid);

impl SlotId {
    pub fn new() -> Self {
        SlotId(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SlotId {
    fn from(uuid: Uuid) -> Self {
        SlotId(uuid)
    }
}

impl std::ops::Deref for SlotId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Swap status of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Busy,
    Swappable,
    Pending,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Busy => "BUSY",
            SlotStatus::Swappable => "SWAPPABLE",
            SlotStatus::Pending => "PENDING",
        }
    }

    /// Apply an event to this status, returning the next status.
    ///
    /// Returns `None` when the event is not allowed from this status.
    pub fn next(self, event: SlotEvent) -> Option<SlotStatus> {
        match (self, event) {
            (SlotStatus::Busy, SlotEvent::MarkSwappable) => Some(SlotStatus::Swappable),
            (SlotStatus::Swappable, SlotEvent::MarkBusy) => Some(SlotStatus::Busy),
            (SlotStatus::Swappable, SlotEvent::Propose) => Some(SlotStatus::Pending),
            (SlotStatus::Pending, SlotEvent::Accept) => Some(SlotStatus::Busy),
            (SlotStatus::Pending, SlotEvent::Reject) => Some(SlotStatus::Swappable),
            _ => None,
        }
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "BUSY" => Ok(SlotStatus::Busy),
            "SWAPPABLE" => Ok(SlotStatus::Swappable),
            "PENDING" => Ok(SlotStatus::Pending),
            _ => Err(format!("Invalid slot status: {}", s)),
        }
    }
}

/// Events that move a slot between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    /// Owner lists the slot for exchange.
    MarkSwappable,
    /// Owner withdraws the slot from exchange.
    MarkBusy,
    /// Slot is offered or requested in a new exchange.
    Propose,
    /// The exchange holding the slot was accepted.
    Accept,
    /// The exchange holding the slot was rejected.
    Reject,
}

impl SlotEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotEvent::MarkSwappable => "mark_swappable",
            SlotEvent::MarkBusy => "mark_busy",
            SlotEvent::Propose => "propose",
            SlotEvent::Accept => "accept",
            SlotEvent::Reject => "reject",
        }
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(SwapError::Validation(format!(
                "time range start {} must be before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }
}

/// A user-owned time interval that can be offered for exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub owner: UserId,
    pub title: String,
    pub range: TimeRange,
    pub status: SlotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Slot {
    /// Create a new slot, BUSY and owned by `owner`.
    pub fn new(owner: UserId, title: impl Into<String>, range: TimeRange) -> Result<Self> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(SwapError::Validation("slot title must not be empty".into()));
        }
        let now = Utc::now();
        Ok(Self {
            id: SlotId::new(),
            owner,
            title,
            range,
            status: SlotStatus::Busy,
            created_at: now,
            updated_at: now,
        })
    }

    /// Validate an event against the state machine and describe the resulting write.
    ///
    /// The returned update leaves the owner untouched; accepted exchanges
    /// attach the new owner with [`SlotUpdate::with_owner`].
    pub fn transition(&self, event: SlotEvent) -> Result<SlotUpdate> {
        let status = self
            .status
            .next(event)
            .ok_or(SwapError::InvalidStateTransition {
                slot: self.id,
                from: self.status,
                event: event.as_str(),
            })?;
        Ok(SlotUpdate::status(status))
    }

    /// Describe an owner edit of the title and/or time range.
    ///
    /// The status is left as observed. A slot held by a pending exchange
    /// cannot be edited.
    pub fn edit(&self, title: Option<String>, range: Option<TimeRange>) -> Result<SlotUpdate> {
        if self.status == SlotStatus::Pending {
            return Err(SwapError::SlotLocked(self.id));
        }
        if let Some(title) = &title
            && title.trim().is_empty()
        {
            return Err(SwapError::Validation("slot title must not be empty".into()));
        }
        Ok(SlotUpdate {
            title,
            range,
            ..SlotUpdate::status(self.status)
        })
    }
}

/// The fields a conditional slot write may change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotUpdate {
    pub status: SlotStatus,
    /// New owner, if ownership changes.
    pub owner: Option<UserId>,
    pub title: Option<String>,
    pub range: Option<TimeRange>,
}

impl SlotUpdate {
    /// An update that only sets the status.
    pub fn status(status: SlotStatus) -> Self {
        Self {
            status,
            owner: None,
            title: None,
            range: None,
        }
    }

    pub fn with_owner(mut self, owner: UserId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Produce the slot as it looks after this update.
    pub fn apply_to(&self, slot: &Slot) -> Slot {
        Slot {
            status: self.status,
            owner: self.owner.clone().unwrap_or_else(|| slot.owner.clone()),
            title: self.title.clone().unwrap_or_else(|| slot.title.clone()),
            range: self.range.unwrap_or(slot.range),
            updated_at: Utc::now(),
            ..slot.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn range() -> TimeRange {
        let start = Utc::now();
        TimeRange::new(start, start + Duration::hours(1)).unwrap()
    }

    #[test]
    fn test_allowed_transitions() {
        use SlotEvent::*;
        use SlotStatus::*;

        assert_eq!(Busy.next(MarkSwappable), Some(Swappable));
        assert_eq!(Swappable.next(MarkBusy), Some(Busy));
        assert_eq!(Swappable.next(Propose), Some(Pending));
        assert_eq!(Pending.next(Accept), Some(Busy));
        assert_eq!(Pending.next(Reject), Some(Swappable));
    }

    #[test]
    fn test_pending_cannot_be_toggled_by_owner() {
        assert_eq!(SlotStatus::Pending.next(SlotEvent::MarkBusy), None);
        assert_eq!(SlotStatus::Pending.next(SlotEvent::MarkSwappable), None);
        assert_eq!(SlotStatus::Pending.next(SlotEvent::Propose), None);
    }

    #[test]
    fn test_busy_cannot_be_proposed_or_resolved() {
        assert_eq!(SlotStatus::Busy.next(SlotEvent::Propose), None);
        assert_eq!(SlotStatus::Busy.next(SlotEvent::Accept), None);
        assert_eq!(SlotStatus::Swappable.next(SlotEvent::Reject), None);
    }

    #[test]
    fn test_transition_reports_invalid_state() {
        let slot = Slot::new("alice".into(), "Standup", range()).unwrap();
        let err = slot.transition(SlotEvent::Accept).unwrap_err();
        match err {
            SwapError::InvalidStateTransition { slot: id, from, event } => {
                assert_eq!(id, slot.id);
                assert_eq!(from, SlotStatus::Busy);
                assert_eq!(event, "accept");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_new_slot_is_busy() {
        let slot = Slot::new("alice".into(), "Standup", range()).unwrap();
        assert_eq!(slot.status, SlotStatus::Busy);
        assert_eq!(slot.owner, UserId::from("alice"));
    }

    #[test]
    fn test_empty_range_and_title_rejected() {
        let now = Utc::now();
        assert!(matches!(
            TimeRange::new(now, now),
            Err(SwapError::Validation(_))
        ));
        assert!(matches!(
            Slot::new("alice".into(), "  ", range()),
            Err(SwapError::Validation(_))
        ));
    }

    #[test]
    fn test_update_with_owner_swaps_ownership() {
        let slot = Slot::new("alice".into(), "Standup", range()).unwrap();
        let update = SlotUpdate::status(SlotStatus::Busy).with_owner("bob".into());
        let updated = update.apply_to(&slot);
        assert_eq!(updated.owner, UserId::from("bob"));
        assert_eq!(updated.id, slot.id);
        assert_eq!(updated.range, slot.range);
    }

    #[test]
    fn test_edit_changes_details_but_not_status() {
        let slot = Slot::new("alice".into(), "Standup", range()).unwrap();
        let later = TimeRange::new(
            slot.range.start + Duration::hours(2),
            slot.range.end + Duration::hours(2),
        )
        .unwrap();
        let updated = slot
            .edit(Some("Retro".into()), Some(later))
            .unwrap()
            .apply_to(&slot);
        assert_eq!(updated.title, "Retro");
        assert_eq!(updated.range, later);
        assert_eq!(updated.status, SlotStatus::Busy);
        assert_eq!(updated.owner, slot.owner);
    }

    #[test]
    fn test_edit_rejects_blank_title_and_pending_slot() {
        let mut slot = Slot::new("alice".into(), "Standup", range()).unwrap();
        assert!(matches!(
            slot.edit(Some(" ".into()), None),
            Err(SwapError::Validation(_))
        ));
        slot.status = SlotStatus::Pending;
        assert!(matches!(
            slot.edit(Some("Retro".into()), None),
            Err(SwapError::SlotLocked(id)) if id == slot.id
        ));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [SlotStatus::Busy, SlotStatus::Swappable, SlotStatus::Pending] {
            assert_eq!(status.as_str().parse::<SlotStatus>().unwrap(), status);
        }
        assert!("SWAP_PENDING".parse::<SlotStatus>().is_err());
    }
}

//! Error types for the swap coordination engine.

use serde::Serialize;
use thiserror::Error;

use crate::domain::exchange::{ExchangeId, ExchangeStatus};
use crate::domain::slot::{SlotId, SlotStatus};

/// Result type alias using the slotswap error type.
pub type Result<T> = std::result::Result<T, SwapError>;

/// Which kind of entity a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Slot,
    ExchangeRequest,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Slot => write!(f, "slot"),
            Entity::ExchangeRequest => write!(f, "exchange request"),
        }
    }
}

/// Main error type for the swap engine.
///
/// Every domain-rule variant is raised before any write in the unit of work
/// that detected it, so a caller seeing one of them can rely on no state
/// having changed.
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    /// The caller tried to offer or edit a slot they do not own.
    #[error("slot {0} is not owned by the caller")]
    NotOwner(SlotId),

    /// The caller is not the receiver of the exchange request.
    #[error("not authorized to respond to exchange request {0}")]
    NotAuthorized(ExchangeId),

    #[error("cannot swap a slot with yourself")]
    SelfSwap,

    #[error("slot {slot} is {status}, both slots must be SWAPPABLE")]
    NotSwappable { slot: SlotId, status: SlotStatus },

    #[error("exchange request {id} has already been {status}")]
    AlreadyActioned { id: ExchangeId, status: ExchangeStatus },

    /// A slot referenced by a pending request no longer exists.
    #[error("slot {slot} referenced by exchange request {request} no longer exists")]
    Gone { request: ExchangeId, slot: SlotId },

    #[error("invalid state transition for slot {slot}: {from} cannot {event}")]
    InvalidStateTransition {
        slot: SlotId,
        from: SlotStatus,
        event: &'static str,
    },

    /// The slot is part of a pending exchange and cannot be edited or deleted.
    #[error("slot {0} cannot be changed while an exchange is pending")]
    SlotLocked(SlotId),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Lost an optimistic race or the storage round-trip timed out. Safe to retry.
    #[error("conflicting update, retry the operation: {0}")]
    Conflict(String),

    /// Non-concurrency storage fault.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] anyhow::Error),
}

/// Stable discriminant for [`SwapError`], suitable for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NotOwner,
    NotAuthorized,
    SelfSwap,
    NotSwappable,
    AlreadyActioned,
    Gone,
    InvalidStateTransition,
    SlotLocked,
    Validation,
    Unauthenticated,
    Conflict,
    StorageFailure,
}

/// Serialisable error body: a discriminant plus the human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl SwapError {
    pub(crate) fn slot_not_found(id: SlotId) -> Self {
        SwapError::NotFound {
            entity: Entity::Slot,
            id: id.to_string(),
        }
    }

    pub(crate) fn exchange_not_found(id: ExchangeId) -> Self {
        SwapError::NotFound {
            entity: Entity::ExchangeRequest,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SwapError::NotFound { .. } => ErrorKind::NotFound,
            SwapError::NotOwner(_) => ErrorKind::NotOwner,
            SwapError::NotAuthorized(_) => ErrorKind::NotAuthorized,
            SwapError::SelfSwap => ErrorKind::SelfSwap,
            SwapError::NotSwappable { .. } => ErrorKind::NotSwappable,
            SwapError::AlreadyActioned { .. } => ErrorKind::AlreadyActioned,
            SwapError::Gone { .. } => ErrorKind::Gone,
            SwapError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            SwapError::SlotLocked(_) => ErrorKind::SlotLocked,
            SwapError::Validation(_) => ErrorKind::Validation,
            SwapError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            SwapError::Conflict(_) => ErrorKind::Conflict,
            SwapError::StorageFailure(_) => ErrorKind::StorageFailure,
        }
    }

    /// Only lost optimistic races are worth retrying; domain-rule failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwapError::Conflict(_))
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

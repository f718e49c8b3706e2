//! Storage traits for slots and exchange requests.
//!
//! Writes only ever happen inside a [`UnitOfWork`]: a storage-native atomic
//! scope (a database transaction, or a versioned compare-and-swap commit for
//! the in-memory backend). Every write inside a unit is conditional on the
//! status last observed for that record, and the unit commits all of its
//! writes or none of them. Dropping a unit without committing rolls it back.
//!
//! Reads outside a unit go through [`Storage`] directly and never lock.

use async_trait::async_trait;

use crate::domain::exchange::{AnyExchangeRequest, ExchangeId, ExchangeRequest, ExchangeStatus, Pending};
use crate::domain::slot::{Slot, SlotId, SlotStatus, SlotUpdate, UserId};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The record no longer had the expected status (or no longer exists).
    Conflict,
}

/// Slot access within a unit of work.
#[async_trait]
pub trait SlotStore: Send {
    /// Read a slot, locking it for the rest of the unit where the backend supports it.
    async fn get_slot(&mut self, id: SlotId) -> Result<Option<Slot>>;

    async fn create_slot(&mut self, slot: &Slot) -> Result<()>;

    /// Apply `update` only if the slot's status is still `expected`.
    async fn compare_and_set_slot(
        &mut self,
        id: SlotId,
        expected: SlotStatus,
        update: &SlotUpdate,
    ) -> Result<CasOutcome>;

    /// Delete the slot only if its status is still `expected`.
    async fn delete_slot(&mut self, id: SlotId, expected: SlotStatus) -> Result<CasOutcome>;
}

/// Exchange request access within a unit of work.
///
/// There is no delete: terminal requests are kept as audit history.
#[async_trait]
pub trait ExchangeRequestStore: Send {
    async fn get_exchange(&mut self, id: ExchangeId) -> Result<Option<AnyExchangeRequest>>;

    async fn create_exchange(&mut self, request: &ExchangeRequest<Pending>) -> Result<()>;

    /// Replace the request only if its status is still `expected`.
    async fn compare_and_set_exchange(
        &mut self,
        id: ExchangeId,
        expected: ExchangeStatus,
        next: &AnyExchangeRequest,
    ) -> Result<CasOutcome>;
}

/// One atomic, serializable scope over both stores.
#[async_trait]
pub trait UnitOfWork: SlotStore + ExchangeRequestStore {
    /// Make every write in this unit visible at once, or fail with
    /// [`SwapError::Conflict`](crate::SwapError::Conflict) and apply none.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every tentative write.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Entry point to a storage backend.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Start a new unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// Read a slot without locking. Fails with `NotFound`.
    async fn find_slot(&self, id: SlotId) -> Result<Slot>;

    /// Read an exchange request without locking. Fails with `NotFound`.
    async fn find_exchange(&self, id: ExchangeId) -> Result<AnyExchangeRequest>;

    /// SWAPPABLE slots not owned by `excluding`.
    async fn list_swappable_slots(&self, excluding: &UserId) -> Result<Vec<Slot>>;

    /// Slots owned by `owner`, ordered by start time ascending.
    async fn list_slots_owned_by(&self, owner: &UserId) -> Result<Vec<Slot>>;

    /// Requests where `user` is requester or receiver, newest first.
    async fn list_exchanges_for(&self, user: &UserId) -> Result<Vec<AnyExchangeRequest>>;
}

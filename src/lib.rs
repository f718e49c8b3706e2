//! Coordination engine for a slot-swap marketplace.
//!
//! Users own time slots and may list them as swappable. Another user can
//! propose to exchange one of their own swappable slots for a listed one;
//! the receiver accepts (ownership of the two slots is swapped) or rejects
//! (both slots go back on the market). The [`SwapCoordinator`] is the only
//! component that moves slots and exchange requests between states, and it
//! does so atomically across both stores through a [`storage::UnitOfWork`].
//!
//! Storage backends: an in-process [`MemoryStorage`] and, behind the
//! `postgres` feature, a PostgreSQL backend.

pub mod coordinator;
pub mod domain;
pub mod error;
pub mod identity;
pub mod notify;
pub mod presence;
pub mod storage;

// Re-export commonly used types
pub use coordinator::{CoordinatorConfig, SwapCoordinator};
pub use domain::exchange::{
    Accepted, AnyExchangeRequest, ExchangeData, ExchangeId, ExchangeRequest, ExchangeStatus,
    Pending, Rejected, TerminalState,
};
pub use domain::slot::{Slot, SlotEvent, SlotId, SlotStatus, SlotUpdate, TimeRange, UserId};
pub use error::{ErrorBody, ErrorKind, Result, SwapError};
pub use identity::{IdentityPort, StaticIdentity, TrustedIdentity};
pub use notify::{MockNotifier, NoopNotifier, Notification, NotificationKind, NotificationPort, PushNotifier};
pub use presence::{ConnectionId, ConnectionRegistry, PresenceDirectory, Subscription};
pub use storage::memory::MemoryStorage;
#[cfg(feature = "postgres")]
pub use storage::postgres::PostgresStorage;
pub use storage::{CasOutcome, ExchangeRequestStore, SlotStore, Storage, UnitOfWork};

/// Get the slotswap database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

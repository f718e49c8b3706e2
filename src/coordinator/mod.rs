//! Swap coordinator: the only component that moves slots and exchange
//! requests between states.
//!
//! Each public operation runs as one unit of work: read the current state
//! through the unit, check every precondition, stage conditional writes,
//! commit. Preconditions are checked before the first write, so a failed
//! operation never leaves anything behind. Units that lose an optimistic
//! race are re-run from scratch (re-reading everything) a bounded number of
//! times. Notifications are sent only after a successful commit.
//!
//! The storage timeout bounds staging and commit separately. A unit that
//! times out while staging has written nothing and is retried. A commit that
//! times out may or may not have been applied, so it is reported as a
//! storage failure and never re-run.

use std::sync::Arc;

use anyhow::anyhow;
use metrics::counter;

use crate::domain::exchange::{
    Accepted, AnyExchangeRequest, ExchangeId, ExchangeRequest, Rejected,
};
use crate::domain::slot::{Slot, SlotId, UserId};
use crate::error::{Result, SwapError};
use crate::notify::{Notification, NotificationPort};
use crate::storage::{Storage, UnitOfWork};

pub mod config;
mod slots;

pub use config::CoordinatorConfig;

/// Coordinates exchange proposals and responses across both stores.
///
/// # Example
/// ```ignore
/// let storage = Arc::new(MemoryStorage::new());
/// let registry = Arc::new(ConnectionRegistry::new());
/// let coordinator = SwapCoordinator::new(storage, Arc::new(PushNotifier::new(registry)))
///     .with_config(CoordinatorConfig::default());
///
/// let request = coordinator.propose_exchange(&alice, alice_slot, bob_slot).await?;
/// coordinator.respond_to_exchange(&bob, request.id(), true).await?;
/// ```
pub struct SwapCoordinator<S: Storage, N: NotificationPort> {
    storage: Arc<S>,
    notifier: Arc<N>,
    config: CoordinatorConfig,
}

impl<S: Storage, N: NotificationPort> SwapCoordinator<S, N> {
    pub fn new(storage: Arc<S>, notifier: Arc<N>) -> Self {
        Self {
            storage,
            notifier,
            config: CoordinatorConfig::default(),
        }
    }

    /// Set a custom configuration.
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Offer `requester_slot` (owned by `identity`) in exchange for `receiver_slot`.
    ///
    /// Preconditions, in order: both slots exist (`NotFound`), the caller
    /// owns `requester_slot` (`NotOwner`), the caller does not own
    /// `receiver_slot` (`SelfSwap`), both slots are SWAPPABLE
    /// (`NotSwappable`). On success both slots are PENDING and the receiver
    /// has been notified.
    #[tracing::instrument(skip(self), fields(requester = %identity, %requester_slot, %receiver_slot))]
    pub async fn propose_exchange(
        &self,
        identity: &UserId,
        requester_slot: SlotId,
        receiver_slot: SlotId,
    ) -> Result<AnyExchangeRequest> {
        let request = self
            .run_unit("propose_exchange", move || {
                self.try_propose(identity, requester_slot, receiver_slot)
            })
            .await?;

        counter!("slotswap_exchanges_proposed_total").increment(1);
        tracing::info!(
            request_id = %request.id(),
            receiver = %request.data().receiver,
            "Exchange proposed"
        );
        self.notifier.notify(Notification::proposal(&request));
        Ok(request)
    }

    /// Accept or reject a pending exchange addressed to `identity`.
    ///
    /// Preconditions, in order: the request exists (`NotFound`), it is
    /// still PENDING (`AlreadyActioned`, carrying the terminal status), the
    /// caller is its receiver (`NotAuthorized`), both slots still exist
    /// (`Gone`). On success the requester has been notified.
    #[tracing::instrument(skip(self), fields(receiver = %identity, %request_id))]
    pub async fn respond_to_exchange(
        &self,
        identity: &UserId,
        request_id: ExchangeId,
        accept: bool,
    ) -> Result<AnyExchangeRequest> {
        let resolved = self
            .run_unit("respond_to_exchange", move || {
                self.try_respond(identity, request_id, accept)
            })
            .await?;
        let notification = resolved.notification();
        let request = AnyExchangeRequest::from(resolved);

        let outcome = request.status().as_str().to_lowercase();
        counter!("slotswap_exchanges_resolved_total", "outcome" => outcome.clone()).increment(1);
        tracing::info!(
            requester = %request.data().requester,
            outcome = %outcome,
            "Exchange resolved"
        );
        self.notifier.notify(notification);
        Ok(request)
    }

    /// SWAPPABLE slots owned by anyone but `identity`.
    #[tracing::instrument(skip(self), fields(user = %identity))]
    pub async fn list_swappable_slots(&self, identity: &UserId) -> Result<Vec<Slot>> {
        self.storage.list_swappable_slots(identity).await
    }

    /// Requests `identity` sent or received, newest first.
    #[tracing::instrument(skip(self), fields(user = %identity))]
    pub async fn list_my_requests(&self, identity: &UserId) -> Result<Vec<AnyExchangeRequest>> {
        self.storage.list_exchanges_for(identity).await
    }

    async fn try_propose(
        &self,
        identity: &UserId,
        requester_slot: SlotId,
        receiver_slot: SlotId,
    ) -> Result<Staged<AnyExchangeRequest>> {
        let mut uow = self.storage.begin().await?;
        let staged = stage_proposal(&mut *uow, identity, requester_slot, receiver_slot).await;
        staged_or_rollback(uow, staged).await
    }

    async fn try_respond(
        &self,
        identity: &UserId,
        request_id: ExchangeId,
        accept: bool,
    ) -> Result<Staged<Resolved>> {
        let mut uow = self.storage.begin().await?;
        let staged = stage_response(&mut *uow, identity, request_id, accept).await;
        staged_or_rollback(uow, staged).await
    }

    /// Stage and commit one unit of work, re-running it while it fails with
    /// a retryable error and retries remain.
    async fn run_unit<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Staged<T>>>,
    {
        let mut retries = 0;
        loop {
            // On timeout the attempt future is dropped, and the unit with it,
            // which discards every tentative write.
            let outcome = match tokio::time::timeout(self.config.storage_timeout(), attempt()).await
            {
                Ok(Ok(staged)) => self.commit_within(operation, staged).await,
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SwapError::Conflict(format!(
                    "{} exceeded the storage timeout of {} ms",
                    operation, self.config.storage_timeout_ms
                ))),
            };

            match outcome {
                Err(e) if e.is_retryable() && retries < self.config.max_conflict_retries => {
                    retries += 1;
                    counter!("slotswap_unit_conflicts_total", "operation" => operation)
                        .increment(1);
                    tracing::warn!(operation, retry = retries, error = %e, "Unit of work conflicted, retrying");
                    tokio::time::sleep(self.config.backoff_for(retries)).await;
                }
                Err(e) if e.is_retryable() => {
                    counter!("slotswap_unit_conflicts_total", "operation" => operation)
                        .increment(1);
                    tracing::warn!(operation, retries, error = %e, "Giving up after repeated conflicts");
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Commit a staged unit under its own timeout.
    ///
    /// A commit that does not finish in time has an unknown outcome, so it
    /// fails with a non-retryable `StorageFailure`.
    async fn commit_within<T>(&self, operation: &'static str, staged: Staged<T>) -> Result<T> {
        let Staged { uow, value } = staged;
        match tokio::time::timeout(self.config.storage_timeout(), uow.commit()).await {
            Ok(committed) => committed.map(|()| value),
            Err(_) => {
                tracing::error!(
                    operation,
                    timeout_ms = self.config.storage_timeout_ms,
                    "Commit timed out, outcome unknown"
                );
                Err(SwapError::StorageFailure(anyhow!(
                    "{} commit did not finish within {} ms, outcome unknown",
                    operation,
                    self.config.storage_timeout_ms
                )))
            }
        }
    }
}

/// A unit of work whose writes are staged but not yet committed.
struct Staged<T> {
    uow: Box<dyn UnitOfWork>,
    value: T,
}

/// Keep the unit for commit if staging succeeded, otherwise roll it back
/// and return the staging error.
async fn staged_or_rollback<T>(uow: Box<dyn UnitOfWork>, staged: Result<T>) -> Result<Staged<T>> {
    match staged {
        Ok(value) => Ok(Staged { uow, value }),
        Err(e) => {
            if let Err(rollback_err) = uow.rollback().await {
                tracing::error!(error = %rollback_err, "Failed to roll back unit of work");
            }
            Err(e)
        }
    }
}

/// How a response resolved its exchange.
enum Resolved {
    Accepted(ExchangeRequest<Accepted>),
    Rejected(ExchangeRequest<Rejected>),
}

impl Resolved {
    fn notification(&self) -> Notification {
        match self {
            Resolved::Accepted(request) => Notification::response(request),
            Resolved::Rejected(request) => Notification::response(request),
        }
    }
}

impl From<Resolved> for AnyExchangeRequest {
    fn from(resolved: Resolved) -> Self {
        match resolved {
            Resolved::Accepted(request) => request.into(),
            Resolved::Rejected(request) => request.into(),
        }
    }
}

/// Read two slots in ascending id order, returning them in argument order.
async fn read_pair(
    uow: &mut dyn UnitOfWork,
    first: SlotId,
    second: SlotId,
) -> Result<(Option<Slot>, Option<Slot>)> {
    if first == second {
        let slot = uow.get_slot(first).await?;
        return Ok((slot.clone(), slot));
    }
    let (low, high) = if first < second {
        (first, second)
    } else {
        (second, first)
    };
    let low_slot = uow.get_slot(low).await?;
    let high_slot = uow.get_slot(high).await?;
    Ok(if first < second {
        (low_slot, high_slot)
    } else {
        (high_slot, low_slot)
    })
}

async fn stage_proposal(
    uow: &mut dyn UnitOfWork,
    identity: &UserId,
    requester_slot_id: SlotId,
    receiver_slot_id: SlotId,
) -> Result<AnyExchangeRequest> {
    let (requester_slot, receiver_slot) =
        read_pair(uow, requester_slot_id, receiver_slot_id).await?;
    let requester_slot =
        requester_slot.ok_or_else(|| SwapError::slot_not_found(requester_slot_id))?;
    let receiver_slot = receiver_slot.ok_or_else(|| SwapError::slot_not_found(receiver_slot_id))?;

    if &requester_slot.owner != identity {
        return Err(SwapError::NotOwner(requester_slot.id));
    }
    if &receiver_slot.owner == identity {
        return Err(SwapError::SelfSwap);
    }

    let request = ExchangeRequest::propose(&requester_slot, &receiver_slot, uow).await?;
    Ok(request.into())
}

async fn stage_response(
    uow: &mut dyn UnitOfWork,
    identity: &UserId,
    request_id: ExchangeId,
    accept: bool,
) -> Result<Resolved> {
    let request = uow
        .get_exchange(request_id)
        .await?
        .ok_or_else(|| SwapError::exchange_not_found(request_id))?;

    let pending = match request {
        AnyExchangeRequest::Pending(pending) => pending,
        terminal => {
            return Err(SwapError::AlreadyActioned {
                id: request_id,
                status: terminal.status(),
            });
        }
    };
    if &pending.data.receiver != identity {
        return Err(SwapError::NotAuthorized(request_id));
    }

    let (requester_slot, receiver_slot) =
        read_pair(uow, pending.data.requester_slot, pending.data.receiver_slot).await?;
    let (requester_slot, receiver_slot) = match (requester_slot, receiver_slot) {
        (Some(requester_slot), Some(receiver_slot)) => (requester_slot, receiver_slot),
        (requester_slot, _) => {
            let slot = match requester_slot {
                None => pending.data.requester_slot,
                Some(_) => pending.data.receiver_slot,
            };
            tracing::error!(
                %request_id,
                %slot,
                "Integrity fault: slot referenced by a pending exchange no longer exists"
            );
            return Err(SwapError::Gone {
                request: request_id,
                slot,
            });
        }
    };

    if accept {
        Ok(Resolved::Accepted(
            pending.accept(&requester_slot, &receiver_slot, uow).await?,
        ))
    } else {
        Ok(Resolved::Rejected(
            pending.reject(&requester_slot, &receiver_slot, uow).await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange::ExchangeStatus;
    use crate::domain::slot::{SlotStatus, TimeRange};
    use crate::notify::MockNotifier;
    use crate::storage::memory::MemoryStorage;
    use chrono::{Duration, Utc};

    async fn setup() -> (SwapCoordinator<MemoryStorage, MockNotifier>, Arc<MockNotifier>) {
        let notifier = Arc::new(MockNotifier::new());
        let coordinator = SwapCoordinator::new(Arc::new(MemoryStorage::new()), notifier.clone());
        (coordinator, notifier)
    }

    async fn swappable_slot(
        coordinator: &SwapCoordinator<MemoryStorage, MockNotifier>,
        owner: &UserId,
    ) -> SlotId {
        let start = Utc::now();
        let range = TimeRange::new(start, start + Duration::hours(1)).unwrap();
        let slot = coordinator.create_slot(owner, "Shift", range).await.unwrap();
        coordinator
            .set_slot_swappable(owner, slot.id, true)
            .await
            .unwrap();
        slot.id
    }

    #[tokio::test]
    async fn test_missing_slot_is_not_found() {
        let (coordinator, notifier) = setup().await;
        let alice = UserId::from("alice");
        let mine = swappable_slot(&coordinator, &alice).await;

        let err = coordinator
            .propose_exchange(&alice, mine, SlotId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::NotFound { .. }));
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_offering_someone_elses_slot_is_not_owner() {
        let (coordinator, _) = setup().await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let carol = UserId::from("carol");
        let bobs = swappable_slot(&coordinator, &bob).await;
        let carols = swappable_slot(&coordinator, &carol).await;

        let err = coordinator
            .propose_exchange(&alice, bobs, carols)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::NotOwner(id) if id == bobs));
    }

    #[tokio::test]
    async fn test_own_slots_are_self_swap() {
        let (coordinator, _) = setup().await;
        let alice = UserId::from("alice");
        let first = swappable_slot(&coordinator, &alice).await;
        let second = swappable_slot(&coordinator, &alice).await;

        for (a, b) in [(first, second), (first, first)] {
            let err = coordinator.propose_exchange(&alice, a, b).await.unwrap_err();
            assert!(matches!(err, SwapError::SelfSwap), "{err:?}");
        }
    }

    #[tokio::test]
    async fn test_owner_check_precedes_swappable_check() {
        let (coordinator, _) = setup().await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let start = Utc::now();
        let range = TimeRange::new(start, start + Duration::hours(1)).unwrap();
        let busy_bob = coordinator.create_slot(&bob, "Busy", range).await.unwrap();
        let busy_bob2 = coordinator.create_slot(&bob, "Busy", range).await.unwrap();

        let err = coordinator
            .propose_exchange(&alice, busy_bob.id, busy_bob2.id)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::NotOwner(_)));
    }

    #[tokio::test]
    async fn test_respond_checks_status_before_receiver() {
        let (coordinator, _) = setup().await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let mine = swappable_slot(&coordinator, &alice).await;
        let theirs = swappable_slot(&coordinator, &bob).await;
        let request = coordinator.propose_exchange(&alice, mine, theirs).await.unwrap();

        let err = coordinator
            .respond_to_exchange(&alice, request.id(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::NotAuthorized(_)));

        coordinator
            .respond_to_exchange(&bob, request.id(), false)
            .await
            .unwrap();
        let err = coordinator
            .respond_to_exchange(&alice, request.id(), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SwapError::AlreadyActioned { status: ExchangeStatus::Rejected, .. }
        ));
    }

    #[tokio::test]
    async fn test_domain_errors_are_not_retried() {
        let notifier = Arc::new(MockNotifier::new());
        let coordinator = SwapCoordinator::new(Arc::new(MemoryStorage::new()), notifier)
            .with_config(CoordinatorConfig {
                max_conflict_retries: 5,
                retry_backoff_ms: 1000,
                ..Default::default()
            });
        let alice = UserId::from("alice");

        let started = std::time::Instant::now();
        let err = coordinator
            .respond_to_exchange(&alice, ExchangeId::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::NotFound { .. }));
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_listing_excludes_own_and_non_swappable() {
        let (coordinator, _) = setup().await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let _mine = swappable_slot(&coordinator, &alice).await;
        let theirs = swappable_slot(&coordinator, &bob).await;
        let start = Utc::now();
        coordinator
            .create_slot(&bob, "Busy", TimeRange::new(start, start + Duration::hours(2)).unwrap())
            .await
            .unwrap();

        let listed = coordinator.list_swappable_slots(&alice).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, theirs);
        assert_eq!(listed[0].status, SlotStatus::Swappable);
    }
}

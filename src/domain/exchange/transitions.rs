//! State transitions for exchange requests.
//!
//! ```text
//! propose() ──> ExchangeRequest<Pending> ──accept()──> ExchangeRequest<Accepted>
//!                                        └─reject()──> ExchangeRequest<Rejected>
//! ```
//!
//! Every transition validates all of its preconditions before issuing the
//! first write, then persists through the caller's [`UnitOfWork`]. Slot
//! writes are issued in ascending slot id order. Nothing here commits: the
//! caller owns the unit and decides whether it becomes visible.

use chrono::Utc;

use crate::domain::slot::{Slot, SlotEvent, SlotStatus, SlotUpdate};
use crate::error::{Result, SwapError};
use crate::storage::{CasOutcome, UnitOfWork};

use super::state::{
    Accepted, AnyExchangeRequest, ExchangeData, ExchangeId, ExchangeRequest, ExchangeStatus,
    Pending, Rejected,
};

impl ExchangeRequest<Pending> {
    /// Create a pending exchange of `requester_slot` for `receiver_slot`.
    ///
    /// The requester and receiver are the current owners of the two slots.
    /// Fails with `SelfSwap` if both slots have the same owner and
    /// `NotSwappable` if either slot is not SWAPPABLE.
    pub async fn propose<U: UnitOfWork + ?Sized>(
        requester_slot: &Slot,
        receiver_slot: &Slot,
        uow: &mut U,
    ) -> Result<Self> {
        if requester_slot.owner == receiver_slot.owner || requester_slot.id == receiver_slot.id {
            return Err(SwapError::SelfSwap);
        }
        let mut updates = Vec::with_capacity(2);
        for slot in [requester_slot, receiver_slot] {
            if slot.status != SlotStatus::Swappable {
                return Err(SwapError::NotSwappable {
                    slot: slot.id,
                    status: slot.status,
                });
            }
            updates.push((slot, slot.transition(SlotEvent::Propose)?));
        }

        let request = ExchangeRequest {
            state: Pending {},
            data: ExchangeData {
                id: ExchangeId::new(),
                requester: requester_slot.owner.clone(),
                requester_slot: requester_slot.id,
                receiver: receiver_slot.owner.clone(),
                receiver_slot: receiver_slot.id,
                created_at: Utc::now(),
            },
        };

        uow.create_exchange(&request).await?;
        write_slots_in_order(uow, updates).await?;
        Ok(request)
    }

    /// Swap the owners of both slots, mark them BUSY and close the request.
    pub async fn accept<U: UnitOfWork + ?Sized>(
        self,
        requester_slot: &Slot,
        receiver_slot: &Slot,
        uow: &mut U,
    ) -> Result<ExchangeRequest<Accepted>> {
        self.check_slots(requester_slot, receiver_slot)?;
        let updates = vec![
            (
                requester_slot,
                requester_slot
                    .transition(SlotEvent::Accept)?
                    .with_owner(receiver_slot.owner.clone()),
            ),
            (
                receiver_slot,
                receiver_slot
                    .transition(SlotEvent::Accept)?
                    .with_owner(requester_slot.owner.clone()),
            ),
        ];

        let request = ExchangeRequest {
            data: self.data,
            state: Accepted {
                responded_at: Utc::now(),
            },
        };

        write_slots_in_order(uow, updates).await?;
        close(uow, request.clone().into()).await?;
        Ok(request)
    }

    /// Return both slots to SWAPPABLE with owners unchanged and close the request.
    pub async fn reject<U: UnitOfWork + ?Sized>(
        self,
        requester_slot: &Slot,
        receiver_slot: &Slot,
        uow: &mut U,
    ) -> Result<ExchangeRequest<Rejected>> {
        self.check_slots(requester_slot, receiver_slot)?;
        let updates = vec![
            (requester_slot, requester_slot.transition(SlotEvent::Reject)?),
            (receiver_slot, receiver_slot.transition(SlotEvent::Reject)?),
        ];

        let request = ExchangeRequest {
            data: self.data,
            state: Rejected {
                responded_at: Utc::now(),
            },
        };

        write_slots_in_order(uow, updates).await?;
        close(uow, request.clone().into()).await?;
        Ok(request)
    }

    fn check_slots(&self, requester_slot: &Slot, receiver_slot: &Slot) -> Result<()> {
        if requester_slot.id != self.data.requester_slot
            || receiver_slot.id != self.data.receiver_slot
        {
            return Err(anyhow::anyhow!(
                "slots {} and {} do not belong to exchange request {}",
                requester_slot.id,
                receiver_slot.id,
                self.data.id
            )
            .into());
        }
        Ok(())
    }
}

async fn write_slots_in_order<U: UnitOfWork + ?Sized>(
    uow: &mut U,
    mut updates: Vec<(&Slot, SlotUpdate)>,
) -> Result<()> {
    updates.sort_by_key(|(slot, _)| slot.id);
    for (slot, update) in updates {
        match uow
            .compare_and_set_slot(slot.id, slot.status, &update)
            .await?
        {
            CasOutcome::Applied => {}
            CasOutcome::Conflict => {
                return Err(SwapError::Conflict(format!(
                    "slot {} changed since it was read as {}",
                    slot.id, slot.status
                )));
            }
        }
    }
    Ok(())
}

async fn close<U: UnitOfWork + ?Sized>(uow: &mut U, request: AnyExchangeRequest) -> Result<()> {
    match uow
        .compare_and_set_exchange(request.id(), ExchangeStatus::Pending, &request)
        .await?
    {
        CasOutcome::Applied => Ok(()),
        CasOutcome::Conflict => Err(SwapError::Conflict(format!(
            "exchange request {} was resolved concurrently",
            request.id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::slot::{TimeRange, UserId};
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{ExchangeRequestStore, SlotStore, Storage};
    use chrono::Duration;

    fn slot(owner: &str, status: SlotStatus) -> Slot {
        let start = Utc::now();
        let mut slot = Slot::new(
            owner.into(),
            format!("{owner}'s slot"),
            TimeRange::new(start, start + Duration::hours(1)).unwrap(),
        )
        .unwrap();
        slot.status = status;
        slot
    }

    async fn seeded(slots: &[&Slot]) -> MemoryStorage {
        let storage = MemoryStorage::new();
        let mut uow = storage.begin().await.unwrap();
        for s in slots {
            uow.create_slot(s).await.unwrap();
        }
        uow.commit().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_propose_marks_both_slots_pending() {
        let a = slot("alice", SlotStatus::Swappable);
        let b = slot("bob", SlotStatus::Swappable);
        let storage = seeded(&[&a, &b]).await;

        let mut uow = storage.begin().await.unwrap();
        let request = ExchangeRequest::propose(&a, &b, &mut *uow).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(request.data.requester, UserId::from("alice"));
        assert_eq!(request.data.receiver, UserId::from("bob"));
        assert_eq!(storage.find_slot(a.id).await.unwrap().status, SlotStatus::Pending);
        assert_eq!(storage.find_slot(b.id).await.unwrap().status, SlotStatus::Pending);
        assert_eq!(
            storage.find_exchange(request.data.id).await.unwrap().status(),
            ExchangeStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_propose_rejects_busy_slot_before_writing() {
        let a = slot("alice", SlotStatus::Swappable);
        let b = slot("bob", SlotStatus::Busy);
        let storage = seeded(&[&a, &b]).await;

        let mut uow = storage.begin().await.unwrap();
        let err = ExchangeRequest::propose(&a, &b, &mut *uow).await.unwrap_err();
        assert!(matches!(err, SwapError::NotSwappable { slot, .. } if slot == b.id));
        uow.commit().await.unwrap();

        assert_eq!(storage.find_slot(a.id).await.unwrap().status, SlotStatus::Swappable);
        assert!(storage.list_exchanges_for(&"alice".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_propose_same_owner_is_self_swap() {
        let a = slot("alice", SlotStatus::Swappable);
        let b = slot("alice", SlotStatus::Swappable);
        let storage = seeded(&[&a, &b]).await;

        let mut uow = storage.begin().await.unwrap();
        let err = ExchangeRequest::propose(&a, &b, &mut *uow).await.unwrap_err();
        assert!(matches!(err, SwapError::SelfSwap));
    }

    #[tokio::test]
    async fn test_accept_swaps_owners() {
        let a = slot("alice", SlotStatus::Swappable);
        let b = slot("bob", SlotStatus::Swappable);
        let storage = seeded(&[&a, &b]).await;

        let mut uow = storage.begin().await.unwrap();
        let request = ExchangeRequest::propose(&a, &b, &mut *uow).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = storage.begin().await.unwrap();
        let a_now = uow.get_slot(a.id).await.unwrap().unwrap();
        let b_now = uow.get_slot(b.id).await.unwrap().unwrap();
        let accepted = request.accept(&a_now, &b_now, &mut *uow).await.unwrap();
        uow.commit().await.unwrap();

        let a_after = storage.find_slot(a.id).await.unwrap();
        let b_after = storage.find_slot(b.id).await.unwrap();
        assert_eq!(a_after.owner, UserId::from("bob"));
        assert_eq!(b_after.owner, UserId::from("alice"));
        assert_eq!(a_after.status, SlotStatus::Busy);
        assert_eq!(b_after.status, SlotStatus::Busy);
        assert_eq!(
            storage.find_exchange(accepted.data.id).await.unwrap().status(),
            ExchangeStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_reject_keeps_owners() {
        let a = slot("alice", SlotStatus::Swappable);
        let b = slot("bob", SlotStatus::Swappable);
        let storage = seeded(&[&a, &b]).await;

        let mut uow = storage.begin().await.unwrap();
        let request = ExchangeRequest::propose(&a, &b, &mut *uow).await.unwrap();
        let a_now = uow.get_slot(a.id).await.unwrap().unwrap();
        let b_now = uow.get_slot(b.id).await.unwrap().unwrap();
        request.reject(&a_now, &b_now, &mut *uow).await.unwrap();
        uow.commit().await.unwrap();

        let a_after = storage.find_slot(a.id).await.unwrap();
        assert_eq!(a_after.owner, UserId::from("alice"));
        assert_eq!(a_after.status, SlotStatus::Swappable);
        let exchanges = storage.list_exchanges_for(&"bob".into()).await.unwrap();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].status(), ExchangeStatus::Rejected);
    }

    #[tokio::test]
    async fn test_accept_with_non_pending_slot_is_invalid_transition() {
        let a = slot("alice", SlotStatus::Swappable);
        let b = slot("bob", SlotStatus::Swappable);
        let storage = seeded(&[&a, &b]).await;

        let mut uow = storage.begin().await.unwrap();
        let request = ExchangeRequest::propose(&a, &b, &mut *uow).await.unwrap();
        uow.commit().await.unwrap();
        let id = request.data.id;

        // Stale snapshots still say SWAPPABLE.
        let mut uow = storage.begin().await.unwrap();
        let err = request.accept(&a, &b, &mut *uow).await.unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));
        let stored = uow.get_exchange(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), ExchangeStatus::Pending);
    }
}

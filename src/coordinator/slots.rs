//! Owner-driven slot operations: create, toggle, edit, delete, list.

use metrics::counter;

use super::{Staged, SwapCoordinator, staged_or_rollback};
use crate::domain::slot::{Slot, SlotEvent, SlotId, SlotStatus, TimeRange, UserId};
use crate::error::{Result, SwapError};
use crate::notify::NotificationPort;
use crate::storage::{CasOutcome, Storage, UnitOfWork};

impl<S: Storage, N: NotificationPort> SwapCoordinator<S, N> {
    /// Create a BUSY slot owned by `identity`.
    #[tracing::instrument(skip(self, title), fields(owner = %identity))]
    pub async fn create_slot(
        &self,
        identity: &UserId,
        title: &str,
        range: TimeRange,
    ) -> Result<Slot> {
        let slot = Slot::new(identity.clone(), title, range)?;
        let staged = &slot;
        self.run_unit("create_slot", move || self.try_create_slot(staged))
            .await?;

        counter!("slotswap_slots_created_total").increment(1);
        tracing::debug!(slot_id = %slot.id, "Slot created");
        Ok(slot)
    }

    /// Move an owned slot between BUSY and SWAPPABLE.
    ///
    /// Setting the status the slot already has is a no-op. A PENDING slot
    /// can only be moved by the coordinator, so toggling it fails with
    /// `InvalidStateTransition`.
    #[tracing::instrument(skip(self), fields(owner = %identity, %slot_id))]
    pub async fn set_slot_swappable(
        &self,
        identity: &UserId,
        slot_id: SlotId,
        swappable: bool,
    ) -> Result<Slot> {
        self.run_unit("set_slot_swappable", move || {
            self.try_set_swappable(identity, slot_id, swappable)
        })
        .await
    }

    /// Change the title and/or time range of an owned slot.
    ///
    /// Fields left as `None` keep their current value and the status is
    /// untouched. A PENDING slot fails with `SlotLocked`.
    #[tracing::instrument(skip(self, title), fields(owner = %identity, %slot_id))]
    pub async fn update_slot(
        &self,
        identity: &UserId,
        slot_id: SlotId,
        title: Option<String>,
        range: Option<TimeRange>,
    ) -> Result<Slot> {
        let slot = self
            .run_unit("update_slot", move || {
                self.try_update_slot(identity, slot_id, title.clone(), range)
            })
            .await?;
        tracing::debug!("Slot updated");
        Ok(slot)
    }

    /// Delete an owned slot that no open exchange refers to.
    #[tracing::instrument(skip(self), fields(owner = %identity, %slot_id))]
    pub async fn delete_slot(&self, identity: &UserId, slot_id: SlotId) -> Result<()> {
        self.run_unit("delete_slot", move || self.try_delete_slot(identity, slot_id))
            .await?;
        tracing::debug!("Slot deleted");
        Ok(())
    }

    /// Slots owned by `identity`, earliest first.
    #[tracing::instrument(skip(self), fields(owner = %identity))]
    pub async fn list_my_slots(&self, identity: &UserId) -> Result<Vec<Slot>> {
        self.storage.list_slots_owned_by(identity).await
    }

    async fn try_create_slot(&self, slot: &Slot) -> Result<Staged<()>> {
        let mut uow = self.storage.begin().await?;
        let staged = uow.create_slot(slot).await;
        staged_or_rollback(uow, staged).await
    }

    async fn try_set_swappable(
        &self,
        identity: &UserId,
        slot_id: SlotId,
        swappable: bool,
    ) -> Result<Staged<Slot>> {
        let mut uow = self.storage.begin().await?;
        let staged = stage_toggle(&mut *uow, identity, slot_id, swappable).await;
        staged_or_rollback(uow, staged).await
    }

    async fn try_update_slot(
        &self,
        identity: &UserId,
        slot_id: SlotId,
        title: Option<String>,
        range: Option<TimeRange>,
    ) -> Result<Staged<Slot>> {
        let mut uow = self.storage.begin().await?;
        let staged = stage_edit(&mut *uow, identity, slot_id, title, range).await;
        staged_or_rollback(uow, staged).await
    }

    async fn try_delete_slot(&self, identity: &UserId, slot_id: SlotId) -> Result<Staged<()>> {
        let mut uow = self.storage.begin().await?;
        let staged = stage_delete(&mut *uow, identity, slot_id).await;
        staged_or_rollback(uow, staged).await
    }
}

/// Read a slot the caller must own.
async fn owned_slot(uow: &mut dyn UnitOfWork, identity: &UserId, slot_id: SlotId) -> Result<Slot> {
    let slot = uow
        .get_slot(slot_id)
        .await?
        .ok_or_else(|| SwapError::slot_not_found(slot_id))?;
    if &slot.owner != identity {
        return Err(SwapError::NotOwner(slot_id));
    }
    Ok(slot)
}

/// Read a slot the caller must own and that no exchange currently holds.
async fn owned_unlocked_slot(
    uow: &mut dyn UnitOfWork,
    identity: &UserId,
    slot_id: SlotId,
) -> Result<Slot> {
    let slot = owned_slot(uow, identity, slot_id).await?;
    if slot.status == SlotStatus::Pending {
        return Err(SwapError::SlotLocked(slot_id));
    }
    Ok(slot)
}

async fn stage_toggle(
    uow: &mut dyn UnitOfWork,
    identity: &UserId,
    slot_id: SlotId,
    swappable: bool,
) -> Result<Slot> {
    let slot = owned_slot(uow, identity, slot_id).await?;
    let (target, event) = if swappable {
        (SlotStatus::Swappable, SlotEvent::MarkSwappable)
    } else {
        (SlotStatus::Busy, SlotEvent::MarkBusy)
    };
    if slot.status == target {
        return Ok(slot);
    }

    let update = slot.transition(event)?;
    match uow.compare_and_set_slot(slot_id, slot.status, &update).await? {
        CasOutcome::Applied => uow
            .get_slot(slot_id)
            .await?
            .ok_or_else(|| SwapError::slot_not_found(slot_id)),
        CasOutcome::Conflict => Err(SwapError::Conflict(format!(
            "slot {} changed while toggling",
            slot_id
        ))),
    }
}

async fn stage_edit(
    uow: &mut dyn UnitOfWork,
    identity: &UserId,
    slot_id: SlotId,
    title: Option<String>,
    range: Option<TimeRange>,
) -> Result<Slot> {
    let slot = owned_slot(uow, identity, slot_id).await?;
    let update = slot.edit(title, range)?;
    match uow.compare_and_set_slot(slot_id, slot.status, &update).await? {
        CasOutcome::Applied => uow
            .get_slot(slot_id)
            .await?
            .ok_or_else(|| SwapError::slot_not_found(slot_id)),
        CasOutcome::Conflict => Err(SwapError::Conflict(format!(
            "slot {} changed while editing",
            slot_id
        ))),
    }
}

async fn stage_delete(uow: &mut dyn UnitOfWork, identity: &UserId, slot_id: SlotId) -> Result<()> {
    let slot = owned_unlocked_slot(uow, identity, slot_id).await?;
    match uow.delete_slot(slot_id, slot.status).await? {
        CasOutcome::Applied => Ok(()),
        CasOutcome::Conflict => Err(SwapError::Conflict(format!(
            "slot {} changed while deleting",
            slot_id
        ))),
    }
}

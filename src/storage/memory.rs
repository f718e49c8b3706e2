//! In-process storage backend using versioned compare-and-swap commits.
//!
//! Each record carries a revision that changes on every committed write.
//! A [`MemoryUnit`] copies a record out of the tables the first time it
//! touches it, remembers the revision it saw, and evaluates its conditional
//! writes against that copy. `commit` takes the table lock once, checks that
//! every record it is about to write still has the revision it saw, and then
//! applies every staged write, or none of them if any check fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CasOutcome, ExchangeRequestStore, SlotStore, Storage, UnitOfWork};
use crate::domain::exchange::{
    AnyExchangeRequest, ExchangeId, ExchangeRequest, ExchangeStatus, Pending,
};
use crate::domain::slot::{Slot, SlotId, SlotStatus, SlotUpdate, UserId};
use crate::error::{Result, SwapError};

#[derive(Debug, Clone)]
struct Versioned<T> {
    revision: u64,
    value: T,
}

#[derive(Debug, Default)]
struct Tables {
    slots: BTreeMap<SlotId, Versioned<Slot>>,
    exchanges: HashMap<ExchangeId, Versioned<AnyExchangeRequest>>,
    /// Revisions are never reused, even across delete and re-create.
    next_revision: u64,
}

/// In-memory [`Storage`] implementation.
///
/// Cheap to clone; clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every slot currently stored, in id order.
    pub fn all_slots(&self) -> Vec<Slot> {
        self.tables
            .lock()
            .slots
            .values()
            .map(|v| v.value.clone())
            .collect()
    }

    /// Every exchange request currently stored, in no particular order.
    pub fn all_exchanges(&self) -> Vec<AnyExchangeRequest> {
        self.tables
            .lock()
            .exchanges
            .values()
            .map(|v| v.value.clone())
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnit {
            tables: self.tables.clone(),
            slots: BTreeMap::new(),
            exchanges: HashMap::new(),
        }))
    }

    async fn find_slot(&self, id: SlotId) -> Result<Slot> {
        self.tables
            .lock()
            .slots
            .get(&id)
            .map(|v| v.value.clone())
            .ok_or_else(|| SwapError::slot_not_found(id))
    }

    async fn find_exchange(&self, id: ExchangeId) -> Result<AnyExchangeRequest> {
        self.tables
            .lock()
            .exchanges
            .get(&id)
            .map(|v| v.value.clone())
            .ok_or_else(|| SwapError::exchange_not_found(id))
    }

    async fn list_swappable_slots(&self, excluding: &UserId) -> Result<Vec<Slot>> {
        let mut slots: Vec<Slot> = self
            .tables
            .lock()
            .slots
            .values()
            .filter(|v| v.value.status == SlotStatus::Swappable && &v.value.owner != excluding)
            .map(|v| v.value.clone())
            .collect();
        slots.sort_by_key(|s| (s.range.start, s.id));
        Ok(slots)
    }

    async fn list_slots_owned_by(&self, owner: &UserId) -> Result<Vec<Slot>> {
        let mut slots: Vec<Slot> = self
            .tables
            .lock()
            .slots
            .values()
            .filter(|v| &v.value.owner == owner)
            .map(|v| v.value.clone())
            .collect();
        slots.sort_by_key(|s| (s.range.start, s.id));
        Ok(slots)
    }

    async fn list_exchanges_for(&self, user: &UserId) -> Result<Vec<AnyExchangeRequest>> {
        let mut exchanges: Vec<AnyExchangeRequest> = self
            .tables
            .lock()
            .exchanges
            .values()
            .filter(|v| v.value.data().involves(user))
            .map(|v| v.value.clone())
            .collect();
        exchanges.sort_by(|a, b| {
            b.data()
                .created_at
                .cmp(&a.data().created_at)
                .then_with(|| b.id().cmp(&a.id()))
        });
        Ok(exchanges)
    }
}

/// What a unit knows about one record: the revision it read (if it read
/// a committed copy) and the value it intends to leave behind.
#[derive(Debug, Clone)]
struct Entry<T> {
    /// Committed revision observed on first read, `None` if the record did not exist.
    observed: Option<u64>,
    /// Current view inside this unit, `None` if absent or deleted.
    current: Option<T>,
    dirty: bool,
}

/// A unit of work against [`MemoryStorage`].
pub struct MemoryUnit {
    tables: Arc<Mutex<Tables>>,
    slots: BTreeMap<SlotId, Entry<Slot>>,
    exchanges: HashMap<ExchangeId, Entry<AnyExchangeRequest>>,
}

impl MemoryUnit {
    fn slot_entry(&mut self, id: SlotId) -> &mut Entry<Slot> {
        let tables = &self.tables;
        self.slots.entry(id).or_insert_with(|| {
            let committed = tables.lock().slots.get(&id).cloned();
            Entry {
                observed: committed.as_ref().map(|v| v.revision),
                current: committed.map(|v| v.value),
                dirty: false,
            }
        })
    }

    fn exchange_entry(&mut self, id: ExchangeId) -> &mut Entry<AnyExchangeRequest> {
        let tables = &self.tables;
        self.exchanges.entry(id).or_insert_with(|| {
            let committed = tables.lock().exchanges.get(&id).cloned();
            Entry {
                observed: committed.as_ref().map(|v| v.revision),
                current: committed.map(|v| v.value),
                dirty: false,
            }
        })
    }
}

#[async_trait]
impl SlotStore for MemoryUnit {
    async fn get_slot(&mut self, id: SlotId) -> Result<Option<Slot>> {
        Ok(self.slot_entry(id).current.clone())
    }

    async fn create_slot(&mut self, slot: &Slot) -> Result<()> {
        let entry = self.slot_entry(slot.id);
        if entry.current.is_some() {
            return Err(SwapError::Conflict(format!("slot {} already exists", slot.id)));
        }
        entry.current = Some(slot.clone());
        entry.dirty = true;
        Ok(())
    }

    async fn compare_and_set_slot(
        &mut self,
        id: SlotId,
        expected: SlotStatus,
        update: &SlotUpdate,
    ) -> Result<CasOutcome> {
        let entry = self.slot_entry(id);
        match &entry.current {
            Some(slot) if slot.status == expected => {
                entry.current = Some(update.apply_to(slot));
                entry.dirty = true;
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn delete_slot(&mut self, id: SlotId, expected: SlotStatus) -> Result<CasOutcome> {
        let entry = self.slot_entry(id);
        match &entry.current {
            Some(slot) if slot.status == expected => {
                entry.current = None;
                entry.dirty = true;
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }
}

#[async_trait]
impl ExchangeRequestStore for MemoryUnit {
    async fn get_exchange(&mut self, id: ExchangeId) -> Result<Option<AnyExchangeRequest>> {
        Ok(self.exchange_entry(id).current.clone())
    }

    async fn create_exchange(&mut self, request: &ExchangeRequest<Pending>) -> Result<()> {
        let entry = self.exchange_entry(request.data.id);
        if entry.current.is_some() {
            return Err(SwapError::Conflict(format!(
                "exchange request {} already exists",
                request.data.id
            )));
        }
        entry.current = Some(request.clone().into());
        entry.dirty = true;
        Ok(())
    }

    async fn compare_and_set_exchange(
        &mut self,
        id: ExchangeId,
        expected: ExchangeStatus,
        next: &AnyExchangeRequest,
    ) -> Result<CasOutcome> {
        let entry = self.exchange_entry(id);
        match &entry.current {
            Some(current) if current.status() == expected => {
                entry.current = Some(next.clone());
                entry.dirty = true;
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryUnit {
            tables,
            slots,
            exchanges,
        } = *self;
        let mut tables = tables.lock();

        for (id, entry) in slots.iter().filter(|(_, e)| e.dirty) {
            let committed = tables.slots.get(id).map(|v| v.revision);
            if committed != entry.observed {
                return Err(SwapError::Conflict(format!(
                    "slot {} was modified by a concurrent unit of work",
                    id
                )));
            }
        }
        for (id, entry) in exchanges.iter().filter(|(_, e)| e.dirty) {
            let committed = tables.exchanges.get(id).map(|v| v.revision);
            if committed != entry.observed {
                return Err(SwapError::Conflict(format!(
                    "exchange request {} was modified by a concurrent unit of work",
                    id
                )));
            }
        }

        for (id, entry) in slots.into_iter().filter(|(_, e)| e.dirty) {
            match entry.current {
                Some(value) => {
                    tables.next_revision += 1;
                    let revision = tables.next_revision;
                    tables.slots.insert(id, Versioned { revision, value });
                }
                None => {
                    tables.slots.remove(&id);
                }
            }
        }
        for (id, entry) in exchanges.into_iter().filter(|(_, e)| e.dirty) {
            if let Some(value) = entry.current {
                tables.next_revision += 1;
                let revision = tables.next_revision;
                tables.exchanges.insert(id, Versioned { revision, value });
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

mod availability;
mod conflict;
mod error;
mod journal;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use conflict::check_availability;
pub use error::{EngineError, Entity, ErrorClass};
pub use journal::{Journal, MemoryJournal, WalJournal};

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedLedger = Arc<RwLock<RoomLedger>>;

/// Booking engine: room and user registries plus one ledger per room.
///
/// Every mutation goes journal-append → apply. Booking writes on a room
/// hold that room's ledger write lock across check, append and apply.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, Room>,
    pub(super) users: DashMap<Ulid, User>,
    /// Normalised email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Ledgers by room id. Outlive the room's registry entry.
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_rooms: DashMap<Ulid, Ulid>,
    /// Serialises room/user registry writes.
    pub(super) registry_lock: Mutex<()>,
    pub(super) journal: Arc<dyn Journal>,
}

impl Engine {
    /// Build an engine on an injected journal, rebuilding state from `history`.
    pub fn new(journal: Arc<dyn Journal>, history: &[Event]) -> Self {
        let engine = Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            ledgers: DashMap::new(),
            booking_rooms: DashMap::new(),
            registry_lock: Mutex::new(()),
            journal,
        };
        for event in history {
            engine.replay_event(event);
        }
        engine
    }

    /// Engine persisted to a WAL file at `path`.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let (journal, history) = WalJournal::open(path)?;
        tracing::info!("replayed {} events from {}", history.len(), path.display());
        Ok(Self::new(Arc::new(journal), &history))
    }

    /// Engine with no durability.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJournal::new()), &[])
    }

    fn replay_event(&self, event: &Event) {
        match event.ledger_room() {
            Some(room_id) => {
                // Nothing else holds a ledger during replay.
                let ledger = self.ledger_for(room_id);
                if let Ok(mut guard) = ledger.try_write() {
                    self.apply_to_ledger(&mut guard, event);
                }
            }
            None => self.apply_to_registry(event),
        }
    }

    /// Apply a booking event to a ledger the caller has locked.
    pub(super) fn apply_to_ledger(&self, ledger: &mut RoomLedger, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                self.booking_rooms.insert(booking.id, booking.room_id);
                ledger.insert_booking(booking.clone());
            }
            Event::BookingUpdated {
                id,
                span,
                title,
                updated_at,
                ..
            } => {
                ledger.reschedule(*id, *span, title.clone(), *updated_at);
            }
            Event::BookingCancelled { id, updated_at, .. } => {
                if let Some(booking) = ledger.get_mut(*id) {
                    booking.is_cancelled = true;
                    booking.updated_at = *updated_at;
                }
            }
            Event::BookingDeleted { id, .. } => {
                ledger.remove_booking(*id);
                self.booking_rooms.remove(id);
            }
            _ => {}
        }
    }

    /// Apply a room/user event. The caller holds `registry_lock` (or is replaying).
    pub(super) fn apply_to_registry(&self, event: &Event) {
        match event {
            Event::RoomCreated { room } => {
                // Booking writes never create ledgers; only here and replay.
                self.ledger_for(room.id);
                self.rooms.insert(room.id, room.clone());
            }
            Event::RoomUpdated { room } => {
                self.rooms.insert(room.id, room.clone());
            }
            Event::RoomDeleted { id } => {
                self.rooms.remove(id);
            }
            Event::UserUpserted { user } => {
                if let Some(previous) = self.users.get(&user.id).map(|u| u.email.clone())
                    && previous != user.email
                {
                    self.emails.remove(&previous);
                }
                self.emails.insert(user.email.clone(), user.id);
                self.users.insert(user.id, user.clone());
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.emails.remove(&user.email);
                }
            }
            _ => {}
        }
    }

    /// Ledger for a room, created empty on first use.
    pub(super) fn ledger_for(&self, room_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomLedger::new(room_id))))
            .value()
            .clone()
    }

    pub(super) fn existing_ledger(&self, room_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(room_id).map(|e| e.value().clone())
    }

    /// Journal then apply a booking event on a locked ledger.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut RoomLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal.append(event).await?;
        self.apply_to_ledger(ledger, event);
        Ok(())
    }

    /// Journal then apply a registry event. Caller holds `registry_lock`.
    pub(super) async fn persist_registry(&self, event: &Event) -> Result<(), EngineError> {
        self.journal.append(event).await?;
        self.apply_to_registry(event);
        Ok(())
    }

    /// Booking id → room id → ledger write lock. Re-checks the booking is
    /// still on the ledger once the lock is held.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomLedger>, EngineError> {
        let not_found = || EngineError::NotFound(Entity::Booking, *booking_id);
        let room_id = self
            .booking_rooms
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or_else(not_found)?;
        let ledger = self.existing_ledger(&room_id).ok_or_else(not_found)?;
        let guard = ledger.write_owned().await;
        if guard.get(*booking_id).is_none() {
            return Err(not_found());
        }
        Ok(guard)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }
}

use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_interval};
use super::{Engine, EngineError, Entity};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_optional_len(value: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) => check_len(v, MAX_FIELD_LEN, what),
        None => Ok(()),
    }
}

fn validate_room(room: &Room) -> Result<(), EngineError> {
    if room.name.trim().is_empty() {
        return Err(EngineError::InvalidInput("room name is required"));
    }
    check_len(&room.name, MAX_NAME_LEN, "room name too long")?;
    check_optional_len(&room.location, "room location too long")?;
    check_optional_len(&room.phone, "room phone too long")
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, room: Room) -> Result<(), EngineError> {
        validate_room(&room)?;
        let _registry = self.registry_lock.lock().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }

        let id = room.id;
        self.persist_registry(&Event::RoomCreated { room }).await?;
        metrics::gauge!(crate::observability::ROOMS_TOTAL).set(self.rooms.len() as f64);
        tracing::info!("room {id} created");
        Ok(())
    }

    pub async fn update_room(&self, id: Ulid, patch: RoomPatch) -> Result<Room, EngineError> {
        let _registry = self.registry_lock.lock().await;
        let mut room = self
            .rooms
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(Entity::Room, id))?;
        if patch.is_empty() {
            return Ok(room);
        }
        room.apply_patch(&patch);
        validate_room(&room)?;

        self.persist_registry(&Event::RoomUpdated { room: room.clone() })
            .await?;
        tracing::info!("room {id} updated (working: {})", room.is_working);
        Ok(room)
    }

    /// Removes the room from the registry. Its ledger and bookings stay.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        if !self.rooms.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Room, id));
        }
        self.persist_registry(&Event::RoomDeleted { id }).await?;
        metrics::gauge!(crate::observability::ROOMS_TOTAL).set(self.rooms.len() as f64);
        tracing::info!("room {id} deleted");
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────

    /// Insert or update by normalised email. An existing user keeps its id
    /// and `created_at`; `input.id` is only used for new users.
    pub async fn upsert_user(&self, input: UserUpsert) -> Result<UpsertOutcome, EngineError> {
        let email = normalize_email(&input.email);
        if email.is_empty() || !email.contains('@') {
            return Err(EngineError::InvalidInput("user email is invalid"));
        }
        if input.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("user name is required"));
        }
        check_len(&email, MAX_FIELD_LEN, "user email too long")?;
        check_len(&input.name, MAX_NAME_LEN, "user name too long")?;
        check_optional_len(&input.phone, "user phone too long")?;
        check_optional_len(&input.employee_id, "employee id too long")?;

        let _registry = self.registry_lock.lock().await;
        let existing = self
            .emails
            .get(&email)
            .and_then(|id| self.users.get(id.value()).map(|u| u.value().clone()));

        let (user, outcome) = match existing {
            Some(current) => {
                let user = User {
                    employee_id: input.employee_id,
                    name: input.name,
                    phone: input.phone,
                    verified: input.verified.unwrap_or(current.verified),
                    ..current
                };
                let id = user.id;
                (user, UpsertOutcome::Updated(id))
            }
            None => {
                if self.users.contains_key(&input.id) {
                    return Err(EngineError::AlreadyExists(input.id));
                }
                if self.users.len() >= MAX_USERS {
                    return Err(EngineError::LimitExceeded("too many users"));
                }
                let user = User {
                    id: input.id,
                    employee_id: input.employee_id,
                    name: input.name,
                    email,
                    phone: input.phone,
                    verified: input.verified.unwrap_or(false),
                    created_at: now_ms(),
                };
                (user, UpsertOutcome::Inserted(input.id))
            }
        };

        self.persist_registry(&Event::UserUpserted { user }).await?;
        metrics::gauge!(crate::observability::USERS_TOTAL).set(self.users.len() as f64);
        tracing::debug!("user upserted: {outcome:?}");
        Ok(outcome)
    }

    /// Removes the user. Bookings they own stay on their ledgers.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::User, id));
        }
        self.persist_registry(&Event::UserDeleted { id }).await?;
        metrics::gauge!(crate::observability::USERS_TOTAL).set(self.users.len() as f64);
        tracing::info!("user {id} deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Check-then-write under the room's ledger lock.
    pub async fn create_booking(
        &self,
        id: Ulid,
        room_id: Ulid,
        owner_id: Ulid,
        start: Ms,
        end: Ms,
        title: String,
    ) -> Result<Ulid, EngineError> {
        let span = validate_interval(start, end)?;
        check_len(&title, MAX_TITLE_LEN, "booking title too long")?;
        let ledger = match self.existing_ledger(&room_id) {
            Some(l) if self.rooms.contains_key(&room_id) => l,
            _ => return Err(EngineError::NotFound(Entity::Room, room_id)),
        };
        if !self.users.contains_key(&owner_id) {
            return Err(EngineError::NotFound(Entity::User, owner_id));
        }

        let mut guard = ledger.write().await;
        // Room may have been edited or removed while we waited.
        match self.rooms.get(&room_id).map(|r| r.is_working) {
            None => return Err(EngineError::NotFound(Entity::Room, room_id)),
            Some(false) => return Err(EngineError::RoomUnavailable(room_id)),
            Some(true) => {}
        }
        // Claim the id across every room before journaling; released on failure.
        match self.booking_rooms.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(room_id);
            }
        }
        let outcome = self
            .insert_claimed_booking(&mut guard, id, room_id, owner_id, span, title)
            .await;
        if outcome.is_err() {
            self.booking_rooms.remove(&id);
        }
        outcome?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::debug!("booking {id} created on room {room_id} [{start}, {end})");
        Ok(id)
    }

    async fn insert_claimed_booking(
        &self,
        ledger: &mut RoomLedger,
        id: Ulid,
        room_id: Ulid,
        owner_id: Ulid,
        span: Span,
        title: String,
    ) -> Result<(), EngineError> {
        if ledger.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        check_no_conflict(ledger, &span, None)?;

        let now = now_ms();
        let booking = Booking {
            id,
            room_id,
            owner_id,
            span,
            title,
            is_cancelled: false,
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(ledger, &Event::BookingCreated { booking })
            .await
    }

    /// Move a live booking. `title: None` keeps the current title.
    pub async fn update_booking(
        &self,
        id: Ulid,
        start: Ms,
        end: Ms,
        title: Option<String>,
    ) -> Result<Booking, EngineError> {
        let span = validate_interval(start, end)?;
        if let Some(t) = &title {
            check_len(t, MAX_TITLE_LEN, "booking title too long")?;
        }

        let mut guard = self.resolve_booking_write(&id).await?;
        let current = match guard.get(id) {
            Some(b) if b.is_active() => b.clone(),
            _ => return Err(EngineError::NotFound(Entity::Booking, id)),
        };
        check_no_conflict(&guard, &span, Some(id))?;

        let event = Event::BookingUpdated {
            id,
            room_id: current.room_id,
            span,
            title: title.unwrap_or(current.title),
            updated_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!("booking {id} moved to [{start}, {end})");
        guard
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, id))
    }

    /// Soft delete. A cancelled booking counts as gone.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let room_id = match guard.get(id) {
            Some(b) if b.is_active() => b.room_id,
            _ => return Err(EngineError::NotFound(Entity::Booking, id)),
        };
        let event = Event::BookingCancelled {
            id,
            room_id,
            updated_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        tracing::debug!("booking {id} cancelled");
        Ok(())
    }

    /// Hard delete, cancelled or not.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let room_id = guard.room_id;
        self.persist_and_apply(&mut guard, &Event::BookingDeleted { id, room_id })
            .await?;
        tracing::debug!("booking {id} deleted from room {room_id}");
        Ok(())
    }

    // ── Storage maintenance ──────────────────────────────────

    /// Rewrite the journal as the minimal event sequence for current state.
    /// Holds the registry lock and every ledger write lock for the duration,
    /// so no write can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;

        let mut ledgers: Vec<_> = self
            .ledgers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        ledgers.sort_by_key(|(room_id, _)| *room_id);
        let mut guards = Vec::with_capacity(ledgers.len());
        for (_, ledger) in ledgers {
            guards.push(ledger.write_owned().await);
        }

        let mut rooms: Vec<Room> = self.rooms.iter().map(|r| r.value().clone()).collect();
        rooms.sort_by_key(|r| r.id);
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);

        let mut events: Vec<Event> = rooms
            .into_iter()
            .map(|room| Event::RoomCreated { room })
            .chain(users.into_iter().map(|user| Event::UserUpserted { user }))
            .collect();
        for guard in &guards {
            events.extend(
                guard
                    .bookings
                    .iter()
                    .map(|b| Event::BookingCreated { booking: b.clone() }),
            );
        }

        let count = events.len();
        self.journal.compact(events).await?;
        tracing::info!("journal compacted to {count} events");
        Ok(())
    }
}

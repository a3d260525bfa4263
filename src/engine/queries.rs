use std::cmp::Ordering;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_slots;
use super::conflict::{check_availability, validate_interval};
use super::{Engine, EngineError, Entity, SharedLedger};

/// A read window: `start < end`, no longer than `MAX_QUERY_WINDOW_MS`.
fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::checked(start, end).ok_or(EngineError::InvalidInterval { start, end })?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too large"));
    }
    Ok(span)
}

fn compare_users(a: &User, b: &User, field: UserSortField) -> Ordering {
    match field {
        UserSortField::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        UserSortField::Email => a.email.cmp(&b.email),
        UserSortField::PhoneNumber => a.phone.cmp(&b.phone),
        UserSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        UserSortField::EmployeeId => a.employee_id.cmp(&b.employee_id),
    }
}

fn compare_views(a: &BookingView, b: &BookingView, field: BookingSortField) -> Ordering {
    match field {
        BookingSortField::StartTime => a.booking.span.start.cmp(&b.booking.span.start),
        BookingSortField::EndTime => a.booking.span.end.cmp(&b.booking.span.end),
        BookingSortField::CreatedAt => a.booking.created_at.cmp(&b.booking.created_at),
        BookingSortField::RoomName => a.room_name.cmp(&b.room_name),
        BookingSortField::EmployeeName => a.owner_name.cmp(&b.owner_name),
    }
}

fn user_matches(user: &User, needle: &str) -> bool {
    let hit = |field: &str| field.to_lowercase().contains(needle);
    hit(&user.name)
        || hit(&user.email)
        || user.phone.as_deref().is_some_and(hit)
        || user.employee_id.as_deref().is_some_and(hit)
}

impl Engine {
    // ── Registries ───────────────────────────────────────────

    pub fn get_room(&self, id: &Ulid) -> Option<Room> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    /// All rooms, ordered by name.
    pub fn list_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.iter().map(|r| r.value().clone()).collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        rooms
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn find_user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(&normalize_email(email))?.value();
        self.get_user(&id)
    }

    /// Case-insensitive substring search over name, email, phone and
    /// employee id, sorted on an allow-listed field, then paged.
    pub fn list_users(
        &self,
        search: Option<&str>,
        sort: UserSort,
        pagination: Pagination,
    ) -> Page<User> {
        let needle = search
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|u| needle.as_deref().is_none_or(|n| user_matches(u.value(), n)))
            .map(|u| u.value().clone())
            .collect();
        users.sort_by(|a, b| {
            sort.order
                .apply(compare_users(a, b, sort.field))
                .then(a.id.cmp(&b.id))
        });
        Page::from_sorted(users, pagination)
    }

    // ── Bookings ─────────────────────────────────────────────

    fn ledger_or_not_found(&self, room_id: &Ulid) -> Result<SharedLedger, EngineError> {
        self.existing_ledger(room_id)
            .ok_or(EngineError::NotFound(Entity::Room, *room_id))
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let room_id = *self.booking_rooms.get(id)?.value();
        let ledger = self.existing_ledger(&room_id)?;
        let guard = ledger.read().await;
        guard.get(*id).cloned()
    }

    /// Bookings on a room (cancelled ones included) overlapping `range`,
    /// or all of them, ordered by start. Works for deleted rooms whose
    /// bookings are still retained.
    pub async fn list_bookings_for_room(
        &self,
        room_id: Ulid,
        range: Option<(Ms, Ms)>,
    ) -> Result<Vec<Booking>, EngineError> {
        let window = range
            .map(|(start, end)| validate_window(start, end))
            .transpose()?;
        let ledger = self.ledger_or_not_found(&room_id)?;
        let guard = ledger.read().await;
        Ok(match window {
            Some(w) => guard.overlapping(&w).cloned().collect(),
            None => guard.bookings.clone(),
        })
    }

    /// Every booking owned by `owner_id`, joined with room and owner names,
    /// sorted (ties on id) and paged. `total` counts the whole result set.
    pub async fn list_bookings_for_owner(
        &self,
        owner_id: Ulid,
        pagination: Pagination,
        sort: BookingSort,
    ) -> Page<BookingView> {
        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let owner_name = self.users.get(&owner_id).map(|u| u.name.clone());

        let mut views = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            let room_name = self.rooms.get(&guard.room_id).map(|r| r.name.clone());
            views.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.owner_id == owner_id)
                    .map(|b| BookingView {
                        booking: b.clone(),
                        room_name: room_name.clone(),
                        owner_name: owner_name.clone(),
                    }),
            );
        }

        views.sort_by(|a, b| {
            sort.order
                .apply(compare_views(a, b, sort.field))
                .then(a.booking.id.cmp(&b.booking.id))
        });
        Page::from_sorted(views, pagination)
    }

    /// Availability verdict for a candidate interval. Read lock only.
    pub async fn check_availability(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Availability, EngineError> {
        let candidate = validate_interval(start, end)?;
        let ledger = self.ledger_or_not_found(&room_id)?;
        let guard = ledger.read().await;
        Ok(check_availability(&guard, &candidate, exclude))
    }

    /// Free sub-intervals of `[start, end)` on a room, dropping slots
    /// shorter than `min_duration`. A room out of service has none.
    pub async fn compute_free_slots(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = validate_window(start, end)?;
        let working = self
            .rooms
            .get(&room_id)
            .map(|r| r.is_working)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        if !working {
            return Ok(Vec::new());
        }
        let ledger = self.ledger_or_not_found(&room_id)?;
        let guard = ledger.read().await;
        let mut slots = free_slots(&guard, &window);
        if let Some(min) = min_duration {
            slots.retain(|s| s.duration_ms() >= min);
        }
        Ok(slots)
    }
}

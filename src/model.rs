use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The overlap predicate. Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Registries ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location: Option<String>,
    pub phone: Option<String>,
    pub chairs: u32,
    pub has_tv: bool,
    pub has_monitor: bool,
    pub has_board: bool,
    pub is_working: bool,
}

impl Room {
    pub fn new(id: Ulid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            capacity: 0,
            location: None,
            phone: None,
            chairs: 0,
            has_tv: false,
            has_monitor: false,
            has_board: false,
            is_working: true,
        }
    }

    /// Apply a partial update in place.
    pub fn apply_patch(&mut self, patch: &RoomPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(capacity) = patch.capacity {
            self.capacity = capacity;
        }
        if let Some(location) = &patch.location {
            self.location = location.clone();
        }
        if let Some(phone) = &patch.phone {
            self.phone = phone.clone();
        }
        if let Some(chairs) = patch.chairs {
            self.chairs = chairs;
        }
        if let Some(v) = patch.has_tv {
            self.has_tv = v;
        }
        if let Some(v) = patch.has_monitor {
            self.has_monitor = v;
        }
        if let Some(v) = patch.has_board {
            self.has_board = v;
        }
        if let Some(v) = patch.is_working {
            self.is_working = v;
        }
    }
}

/// Fields to change on a room; `None` leaves the field as is.
/// `location`/`phone` are doubly optional so they can be cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub location: Option<Option<String>>,
    pub phone: Option<Option<String>>,
    pub chairs: Option<u32>,
    pub has_tv: Option<bool>,
    pub has_monitor: Option<bool>,
    pub has_board: Option<bool>,
    pub is_working: Option<bool>,
}

impl RoomPatch {
    pub fn is_empty(&self) -> bool {
        *self == RoomPatch::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub employee_id: Option<String>,
    pub name: String,
    /// Normalised (trimmed, lower-case). Natural key for upserts.
    pub email: String,
    pub phone: Option<String>,
    pub verified: bool,
    pub created_at: Ms,
}

/// Input for `upsert_user`. `id` is only used when the email is new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpsert {
    pub id: Ulid,
    pub employee_id: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// `None` keeps an existing user's flag; new users start unverified.
    pub verified: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Ulid),
    Updated(Ulid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Ulid {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ── Booking ledger ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub owner_id: Ulid,
    pub span: Span,
    pub title: String,
    pub is_cancelled: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        !self.is_cancelled
    }
}

/// All bookings ever made on one room, cancelled ones included.
#[derive(Debug, Clone)]
pub struct RoomLedger {
    pub room_id: Ulid,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl RoomLedger {
    pub fn new(room_id: Ulid) -> Self {
        Self {
            room_id,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Move a booking to a new span, keeping the vector sorted.
    pub fn reschedule(&mut self, id: Ulid, span: Span, title: String, updated_at: Ms) -> bool {
        let Some(mut booking) = self.remove_booking(id) else {
            return false;
        };
        booking.span = span;
        booking.title = title;
        booking.updated_at = updated_at;
        self.insert_booking(booking);
        true
    }

    /// Bookings (cancelled included) whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn active(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.is_active())
    }
}

// ── Journal events ───────────────────────────────────────────────

/// Flat event records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomDeleted {
        id: Ulid,
    },
    UserUpserted {
        user: User,
    },
    UserDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        id: Ulid,
        room_id: Ulid,
        span: Span,
        title: String,
        updated_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        room_id: Ulid,
        updated_at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        room_id: Ulid,
    },
}

impl Event {
    /// Room whose ledger this event mutates, if it is a booking event.
    pub fn ledger_room(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking } => Some(booking.room_id),
            Event::BookingUpdated { room_id, .. }
            | Event::BookingCancelled { room_id, .. }
            | Event::BookingDeleted { room_id, .. } => Some(*room_id),
            _ => None,
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

/// A booking joined with the names of its room and owner.
/// Names are `None` when the room or user has since been deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingView {
    pub booking: Booking,
    pub room_name: Option<String>,
    pub owner_name: Option<String>,
}

/// Checker verdict for a candidate interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub is_free: bool,
    pub conflicts: Vec<Booking>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Pagination {
    /// Clamp `limit` into `[1, MAX_PAGE_LIMIT]`; missing values take the defaults.
    pub fn new(offset: Option<usize>, limit: Option<usize>) -> Self {
        use crate::limits::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
        Self {
            offset: offset.unwrap_or(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Slice a fully sorted result set.
    pub fn from_sorted(all: Vec<T>, pagination: Pagination) -> Self {
        let total = all.len();
        let items = all
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect();
        Self {
            items,
            total,
            offset: pagination.offset,
            limit: pagination.limit,
            has_more: pagination.offset.saturating_add(pagination.limit) < total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn apply(self, ord: std::cmp::Ordering) -> std::cmp::Ordering {
        match self {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}

/// Allow-listed sort keys for booking listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BookingSortField {
    #[default]
    StartTime,
    EndTime,
    CreatedAt,
    RoomName,
    EmployeeName,
}

impl BookingSortField {
    /// Unknown names fall back to `StartTime`.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "start_time" | "starttime" | "start" => BookingSortField::StartTime,
            "end_time" | "endtime" | "end" => BookingSortField::EndTime,
            "created_at" | "createdat" => BookingSortField::CreatedAt,
            "room_name" | "roomname" => BookingSortField::RoomName,
            "employee_name" | "employeename" | "owner_name" => BookingSortField::EmployeeName,
            _ => BookingSortField::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BookingSort {
    pub field: BookingSortField,
    pub order: SortOrder,
}

/// Allow-listed sort keys for user listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserSortField {
    #[default]
    Name,
    Email,
    PhoneNumber,
    CreatedAt,
    EmployeeId,
}

impl UserSortField {
    /// Unknown names fall back to `Name`.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "name" => UserSortField::Name,
            "email" => UserSortField::Email,
            "phone" | "phone_number" | "phonenumber" => UserSortField::PhoneNumber,
            "created_at" | "createdat" => UserSortField::CreatedAt,
            "employee_id" | "employeeid" => UserSortField::EmployeeId,
            _ => UserSortField::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSort {
    pub field: UserSortField,
    pub order: SortOrder,
}

impl Default for UserSort {
    fn default() -> Self {
        Self {
            field: UserSortField::Name,
            order: SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportStats {
    pub inserted: usize,
    pub updated: usize,
    pub errors: usize,
    pub total: usize,
}

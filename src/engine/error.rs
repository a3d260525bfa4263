use ulid::Ulid;

use crate::model::{Booking, Ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Room,
    User,
    Booking,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Room => "room",
            Entity::User => "user",
            Entity::Booking => "booking",
        })
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// `start >= end`.
    InvalidInterval { start: Ms, end: Ms },
    /// Candidate overlaps these non-cancelled bookings.
    BookingConflict { room_id: Ulid, conflicts: Vec<Booking> },
    /// Missing entity, or a booking that is already cancelled.
    NotFound(Entity, Ulid),
    RoomUnavailable(Ulid),
    AlreadyExists(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    StorageError(String),
}

/// Coarse classification used by API collaborators to pick a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorClass {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorClass::BadRequest => 400,
            ErrorClass::NotFound => 404,
            ErrorClass::Conflict => 409,
            ErrorClass::Internal => 500,
        }
    }

    pub fn sqlstate(self) -> &'static str {
        match self {
            ErrorClass::BadRequest => "22023",
            ErrorClass::NotFound => "P0002",
            ErrorClass::Conflict => "23P01",
            ErrorClass::Internal => "XX000",
        }
    }
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidInterval { .. }
            | EngineError::InvalidInput(_)
            | EngineError::LimitExceeded(_) => ErrorClass::BadRequest,
            EngineError::NotFound(..) => ErrorClass::NotFound,
            EngineError::BookingConflict { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::RoomUnavailable(_) => ErrorClass::Conflict,
            EngineError::StorageError(_) => ErrorClass::Internal,
        }
    }

    /// Safe to retry unchanged: nothing was applied.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::StorageError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::BookingConflict { room_id, conflicts } => {
                let ids: Vec<String> = conflicts.iter().map(|b| b.id.to_string()).collect();
                write!(
                    f,
                    "room {room_id} is already booked for the selected time (conflicts: {})",
                    ids.join(", ")
                )
            }
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::RoomUnavailable(id) => {
                write!(f, "room {id} is not working and cannot be booked")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageError(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

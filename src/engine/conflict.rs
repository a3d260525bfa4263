use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build the candidate span, rejecting empty/inverted intervals and
/// out-of-range timestamps before anything touches a ledger.
pub(crate) fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    let span = Span::checked(start, end).ok_or(EngineError::InvalidInterval { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Is `candidate` free on this ledger? Cancelled bookings and the
/// `exclude` booking (the one being edited) never count.
pub fn check_availability(ledger: &RoomLedger, candidate: &Span, exclude: Option<Ulid>) -> Availability {
    let conflicts: Vec<Booking> = ledger
        .overlapping(candidate)
        .filter(|b| b.is_active() && Some(b.id) != exclude)
        .cloned()
        .collect();
    Availability {
        is_free: conflicts.is_empty(),
        conflicts,
    }
}

/// `check_availability` as a guard for mutations.
pub(crate) fn check_no_conflict(
    ledger: &RoomLedger,
    candidate: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let verdict = check_availability(ledger, candidate, exclude);
    if verdict.is_free {
        return Ok(());
    }
    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
    Err(EngineError::BookingConflict {
        room_id: ledger.room_id,
        conflicts: verdict.conflicts,
    })
}

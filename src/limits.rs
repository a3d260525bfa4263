//! Hard bounds on input sizes. Everything a client can grow is capped here.

use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Longest single booking.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;
/// Widest window accepted by range queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 1024;
pub const MAX_FIELD_LEN: usize = 256;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 200_000;
pub const MAX_IMPORT_ROWS: usize = 100_000;

pub const DEFAULT_PAGE_LIMIT: usize = 10;
pub const MAX_PAGE_LIMIT: usize = 2_000;

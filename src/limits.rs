// Hard caps enforced by the engine and the SQL layer.

pub const MAX_AUTHORS: usize = 100_000;
pub const MAX_INTERVIEW_TYPES_PER_AUTHOR: usize = 256;
pub const MAX_RULES_PER_AUTHOR: usize = 1_024;
pub const MAX_OVERRIDES_PER_AUTHOR: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_AUTHOR: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_NOTE_LEN: usize = 1_024;
pub const MAX_LOCATION_LEN: usize = 1_024;
pub const MAX_TIMEZONE_LEN: usize = 64;

pub const MAX_DURATION_OPTIONS: usize = 16;
/// Longest bookable slot.
pub const MAX_DURATION_MIN: u32 = 24 * 60;
/// Finest slot step; smaller steps make slot lists explode.
pub const MIN_GRANULARITY_MIN: u32 = 5;
pub const MAX_BUFFER_MIN: u32 = 24 * 60;
pub const MAX_NOTICE_HOURS: u32 = 24 * 365;

/// Widest ListSlots query, in caller-local days (inclusive of both ends).
pub const MAX_SLOT_RANGE_DAYS: i64 = 62;

/// Appointments must sit between 2000-01-01 and 2200-01-01 UTC.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;

pub const MAX_SQL_LEN: usize = 64 * 1024;

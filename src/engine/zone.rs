use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use super::EngineError;

pub fn parse_tz(name: &str) -> Result<Tz, EngineError> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::validation(format!("unknown time zone: {name}")))
}

/// Resolve a wall-clock time in `tz` to an instant.
///
/// A time skipped by a DST gap moves forward one hour; an ambiguous time
/// takes the earlier instant.
pub fn localize(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = local + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
                // No real zone has back-to-back gaps; treat the wall clock as UTC.
                LocalResult::None => Utc.from_utc_datetime(&shifted),
            }
        }
    }
}

/// Project an instant into `tz`, keeping only the fixed offset in effect.
pub fn project(tz: &Tz, at: DateTime<Utc>) -> DateTime<FixedOffset> {
    let local = at.with_timezone(tz);
    local.with_timezone(&local.offset().fix())
}

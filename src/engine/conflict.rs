use chrono::{DateTime, Datelike, Utc};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<UtcSpan, EngineError> {
    use crate::limits::*;
    let span = Span::try_new(start, end)
        .ok_or_else(|| EngineError::validation(format!("start {start} must be before end {end}")))?;
    if span.start.year() < MIN_VALID_YEAR || span.end.year() >= MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration() > chrono::Duration::minutes(MAX_DURATION_MIN.into()) {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(span)
}

/// Raw overlap against the author's time-blocking appointments, ignoring
/// `exclude`. Buffers are not applied on either side.
pub(crate) fn check_no_conflict(
    st: &AuthorState,
    span: &UtcSpan,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for a in st.overlapping(span) {
        if Some(a.id) == exclude || !a.status.blocks_time() {
            continue;
        }
        return Err(EngineError::Conflict(a.id));
    }
    Ok(())
}

/// Cancel and reschedule close `cancellation_policy_hours` before the
/// current start.
pub(crate) fn check_policy_window(
    current_start: DateTime<Utc>,
    policy_hours: u32,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let until = current_start - now;
    if until < chrono::Duration::hours(policy_hours.into()) {
        return Err(EngineError::PolicyViolation {
            start_at: current_start,
            hours_until_start: until.num_seconds() as f64 / 3600.0,
            policy_hours,
        });
    }
    Ok(())
}

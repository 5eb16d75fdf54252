use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::model::*;

use super::windows::windows_for_date;
use super::zone::{localize, project};

/// Everything the slot generator needs besides the author's rows.
#[derive(Debug, Clone)]
pub struct SlotQuery {
    pub author_tz: Tz,
    pub caller_tz: Tz,
    /// Caller-local, inclusive.
    pub from_date: NaiveDate,
    /// Caller-local, inclusive.
    pub to_date: NaiveDate,
    pub duration_min: u32,
    pub granularity_min: u32,
    pub buffer_before_min: u32,
    pub buffer_after_min: u32,
    pub min_notice_hours: u32,
    /// `None` or `Some(0)` disables the cap.
    pub max_bookings_per_day: Option<u32>,
    pub now: DateTime<Utc>,
}

impl SlotQuery {
    /// Caller's requested range as instants: `[from 00:00, to+1 00:00)`.
    fn caller_range(&self) -> UtcSpan {
        let start = localize(&self.caller_tz, self.from_date.and_time(NaiveTime::MIN));
        let end_date = self.to_date.succ_opt().unwrap_or(self.to_date);
        let end = localize(&self.caller_tz, end_date.and_time(NaiveTime::MIN));
        Span { start, end }
    }

    fn cap(&self) -> Option<usize> {
        self.max_bookings_per_day.filter(|&c| c > 0).map(|c| c as usize)
    }
}

/// Bookable slots for the query, in window-processing order.
///
/// Pure: the result depends only on the arguments. Windows are visited date by
/// date in the author's zone; within a date in the order the window builder
/// produced them, and within a window by ascending start.
pub fn generate_slots(
    query: &SlotQuery,
    rules: &[AvailabilityRule],
    overrides: &[AvailabilityOverride],
    appointments: &[Appointment],
) -> Vec<Slot> {
    if query.duration_min == 0 || query.granularity_min == 0 || query.from_date > query.to_date {
        return Vec::new();
    }

    let caller = query.caller_range();
    let duration = Duration::minutes(query.duration_min.into());
    let step = Duration::minutes(query.granularity_min.into());
    let before = Duration::minutes(query.buffer_before_min.into());
    let after = Duration::minutes(query.buffer_after_min.into());
    let earliest_start = query.now + Duration::hours(query.min_notice_hours.into());

    let mut busy: Vec<UtcSpan> = appointments
        .iter()
        .filter(|a| a.status.blocks_time())
        .map(|a| a.span())
        .collect();
    busy.sort_by_key(|s| s.start);

    // A caller's day can straddle two of the author's days; walk them all.
    let first_day = caller.start.with_timezone(&query.author_tz).date_naive();
    let last_day = caller.end.with_timezone(&query.author_tz).date_naive();

    let mut slots = Vec::new();
    let mut day = first_day;
    while day <= last_day {
        if let Some(cap) = query.cap() {
            let booked = busy
                .iter()
                .filter(|s| s.start.with_timezone(&query.author_tz).date_naive() == day)
                .count();
            if booked >= cap {
                tracing::debug!(%day, booked, cap, "daily cap reached, skipping date");
                day = match day.succ_opt() {
                    Some(next) => next,
                    None => break,
                };
                continue;
            }
        }

        for window in windows_for_date(day, rules, overrides) {
            let w_start = localize(&query.author_tz, window.start);
            let w_end = localize(&query.author_tz, window.end);
            let Some(window) = Span::try_new(w_start, w_end) else {
                continue;
            };

            let mut cursor = window.start;
            while cursor + duration <= window.end {
                let end = cursor + duration;
                let buffered = Span::new(cursor - before, end + after);
                let fits = window.contains_span(&buffered);
                let noticed = cursor >= earliest_start;
                if fits && noticed && !overlaps_any(&busy, &buffered) {
                    slots.push(Slot {
                        start_utc: cursor,
                        end_utc: end,
                        start_local_author: project(&query.author_tz, cursor),
                        end_local_author: project(&query.author_tz, end),
                        start_local_caller: project(&query.caller_tz, cursor),
                        end_local_caller: project(&query.caller_tz, end),
                    });
                }
                cursor += step;
            }
        }

        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }

    slots.retain(|s| caller.contains_instant(s.start_utc));
    slots
}

/// Half-open overlap against sorted busy spans. No buffer on the busy side.
fn overlaps_any(busy: &[UtcSpan], candidate: &UtcSpan) -> bool {
    let right_bound = busy.partition_point(|s| s.start < candidate.end);
    busy[..right_bound].iter().any(|s| s.end > candidate.start)
}

use chrono::{Datelike, NaiveDate};

use crate::model::*;

use super::interval::{subtract_one, union};

/// Weekday index with Sunday = 0.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Raw bookable windows for one author-local date.
///
/// Active rules for the weekday form the base set (overlapping rules are kept
/// side by side). A full-day `REMOVE` override for the date empties it.
/// Otherwise the date's overrides are folded over the base set in insertion
/// order: timed `ADD` appends a window, timed `REMOVE` is subtracted from
/// every current window.
pub fn windows_for_date(
    date: NaiveDate,
    rules: &[AvailabilityRule],
    overrides: &[AvailabilityOverride],
) -> Vec<LocalSpan> {
    let todays: Vec<&AvailabilityOverride> =
        overrides.iter().filter(|o| o.date_local == date).collect();
    if todays.iter().any(|o| o.is_full_day_block()) {
        return Vec::new();
    }

    let dow = day_of_week(date);
    let base: Vec<LocalSpan> = rules
        .iter()
        .filter(|r| r.active && r.day_of_week == dow)
        .filter_map(|r| Span::try_new(date.and_time(r.start_time_local), date.and_time(r.end_time_local)))
        .collect();

    todays.into_iter().fold(base, |windows, o| {
        let Some((start, end)) = o.times() else {
            return windows;
        };
        let Some(span) = Span::try_new(date.and_time(start), date.and_time(end)) else {
            return windows;
        };
        match o.kind {
            OverrideKind::Add => {
                let mut next = windows;
                next.push(span);
                next
            }
            OverrideKind::Remove => subtract_one(&windows, &span),
        }
    })
}

/// The date's windows collapsed into sorted disjoint spans.
pub fn coalesced_windows_for_date(
    date: NaiveDate,
    rules: &[AvailabilityRule],
    overrides: &[AvailabilityOverride],
) -> Vec<LocalSpan> {
    union(&windows_for_date(date, rules, overrides))
}

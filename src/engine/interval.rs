use std::fmt::Debug;

use crate::model::Span;

/// Remove `removal` from every window, preserving window order.
///
/// `[a, b) - [r1, r2)` yields `[a, r1)` when `r1 > a` and `[r2, b)` when
/// `r2 < b`. Windows that don't overlap the removal pass through unchanged.
pub fn subtract_one<T: Ord + Copy + Debug>(windows: &[Span<T>], removal: &Span<T>) -> Vec<Span<T>> {
    let mut out = Vec::with_capacity(windows.len() + 1);
    for w in windows {
        if !w.overlaps(removal) {
            out.push(*w);
            continue;
        }
        if removal.start > w.start {
            out.push(Span::new(w.start, removal.start));
        }
        if removal.end < w.end {
            out.push(Span::new(removal.end, w.end));
        }
    }
    out
}

/// Merge sorted spans that overlap or touch.
pub fn merge_overlapping<T: Ord + Copy + Debug>(sorted: &[Span<T>]) -> Vec<Span<T>> {
    let mut merged: Vec<Span<T>> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Union of arbitrary spans, returned sorted and disjoint.
pub fn union<T: Ord + Copy + Debug>(spans: &[Span<T>]) -> Vec<Span<T>> {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|s| s.start);
    merge_overlapping(&sorted)
}

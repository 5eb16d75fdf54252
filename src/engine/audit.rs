use chrono::{DateTime, Utc};

use crate::model::*;

/// The appointment as of `at`, rebuilt by replaying its entries in order.
/// `None` when the appointment did not exist yet.
pub fn state_at(entries: &[AuditEntry], at: DateTime<Utc>) -> Option<Appointment> {
    entries
        .iter()
        .take_while(|e| e.at <= at)
        .last()
        .map(|e| e.after.clone())
}

/// A history is well formed when it opens with a `Created` entry with no
/// "before", and every later entry's "before" equals the previous "after".
pub fn is_consistent(entries: &[AuditEntry]) -> bool {
    let Some(first) = entries.first() else {
        return true;
    };
    if first.action != AuditAction::Created || first.before.is_some() {
        return false;
    }
    entries.windows(2).all(|pair| {
        pair[1].action != AuditAction::Created
            && pair[1].before.as_ref() == Some(&pair[0].after)
            && pair[0].at <= pair[1].at
    })
}

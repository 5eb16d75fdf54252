use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)`.
///
/// Generic so the same algebra serves UTC instants and author-local wall-clock
/// windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span<T> {
    pub start: T,
    pub end: T,
}

/// Interval between two instants.
pub type UtcSpan = Span<DateTime<Utc>>;

/// Wall-clock interval in some zone, anchored to a calendar date.
pub type LocalSpan = Span<NaiveDateTime>;

impl<T: Ord + Copy + std::fmt::Debug> Span<T> {
    pub fn new(start: T, end: T) -> Self {
        debug_assert!(start < end, "Span start must be before end: {start:?} >= {end:?}");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for an empty or inverted interval.
    pub fn try_new(start: T, end: T) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &Span<T>) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: T) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span<T>) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl UtcSpan {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

// ── Author-owned inputs ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub id: Ulid,
    pub name: Option<String>,
    pub email: Option<String>,
    /// IANA zone name, e.g. `America/Los_Angeles`.
    pub timezone: String,
    pub slot_granularity_min: u32,
    /// `None` (or 0) means no daily cap.
    pub max_bookings_per_day: Option<u32>,
    pub default_buffer_before_min: u32,
    pub default_buffer_after_min: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewType {
    pub id: Ulid,
    pub author_id: Ulid,
    pub name: String,
    pub duration_options_min: Vec<u32>,
    /// Falls back to the author's default when unset.
    pub buffer_before_min: Option<u32>,
    pub buffer_after_min: Option<u32>,
    pub min_notice_hours: u32,
    pub cancellation_policy_hours: u32,
    pub location_required: bool,
}

impl InterviewType {
    pub fn allows_duration(&self, minutes: u32) -> bool {
        self.duration_options_min.contains(&minutes)
    }
}

/// Recurring weekly window. `day_of_week` counts from Sunday = 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub author_id: Ulid,
    pub day_of_week: u8,
    pub start_time_local: NaiveTime,
    pub end_time_local: NaiveTime,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideKind {
    Add,
    Remove,
}

impl OverrideKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideKind::Add => "add",
            OverrideKind::Remove => "remove",
        }
    }
}

/// Date-specific change layered over the weekly rules. Insertion order matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityOverride {
    pub id: Ulid,
    pub author_id: Ulid,
    pub date_local: NaiveDate,
    pub kind: OverrideKind,
    pub start_time_local: Option<NaiveTime>,
    pub end_time_local: Option<NaiveTime>,
    pub note: Option<String>,
}

impl AvailabilityOverride {
    /// `REMOVE` with neither time set blocks the whole date.
    pub fn is_full_day_block(&self) -> bool {
        self.kind == OverrideKind::Remove
            && self.start_time_local.is_none()
            && self.end_time_local.is_none()
    }

    /// Both times, when present.
    pub fn times(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.start_time_local, self.end_time_local) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => None,
        }
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    /// Statuses that occupy the author's calendar.
    pub fn blocks_time(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(AppointmentStatus::Pending),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            "completed" => Some(AppointmentStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub author_id: Ulid,
    pub interview_type_id: Ulid,
    pub customer_email: String,
    pub start_at_utc: DateTime<Utc>,
    pub end_at_utc: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub customer_timezone: String,
    pub author_timezone: String,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
}

impl Appointment {
    pub fn span(&self) -> UtcSpan {
        Span::new(self.start_at_utc, self.end_at_utc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Created,
    Rescheduled,
    Cancelled,
    Confirmed,
    AdminEdited,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Rescheduled => "rescheduled",
            AuditAction::Cancelled => "cancelled",
            AuditAction::Confirmed => "confirmed",
            AuditAction::AdminEdited => "admin_edited",
        }
    }
}

/// One immutable step of an appointment's history. `after` is the row as
/// committed by the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub actor: String,
    pub action: AuditAction,
    pub before: Option<Appointment>,
    pub after: Appointment,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

// ── Per-author state ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AuthorState {
    pub profile: AuthorProfile,
    pub interview_types: Vec<InterviewType>,
    pub rules: Vec<AvailabilityRule>,
    /// Insertion order.
    pub overrides: Vec<AvailabilityOverride>,
    /// All appointments regardless of status, sorted by `start_at_utc`.
    pub appointments: Vec<Appointment>,
    /// Commit order.
    pub audit: Vec<AuditEntry>,
}

impl AuthorState {
    pub fn new(profile: AuthorProfile) -> Self {
        Self {
            profile,
            interview_types: Vec::new(),
            rules: Vec::new(),
            overrides: Vec::new(),
            appointments: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub fn interview_type(&self, id: &Ulid) -> Option<&InterviewType> {
        self.interview_types.iter().find(|t| t.id == *id)
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    /// Replace (or insert) an appointment, keeping sort order by start.
    pub fn upsert_appointment(&mut self, appointment: Appointment) {
        if let Some(pos) = self.appointments.iter().position(|a| a.id == appointment.id) {
            self.appointments.remove(pos);
        }
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.start_at_utc, |a| a.start_at_utc)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    /// Appointments (any status) whose span overlaps the query window.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &UtcSpan) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.start_at_utc < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.end_at_utc > query.start)
    }

    pub fn history(&self, appointment_id: &Ulid) -> Vec<AuditEntry> {
        self.audit
            .iter()
            .filter(|e| e.appointment_id == *appointment_id)
            .cloned()
            .collect()
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
///
/// Every appointment mutation is a single `AppointmentCommitted` record: the
/// row is the entry's `after` snapshot, so the row and its audit entry are
/// durable together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AuthorRegistered {
        profile: AuthorProfile,
    },
    InterviewTypeAdded {
        interview_type: InterviewType,
    },
    RuleAdded {
        rule: AvailabilityRule,
    },
    RuleActiveSet {
        id: Ulid,
        author_id: Ulid,
        active: bool,
    },
    OverrideAdded {
        entry: AvailabilityOverride,
    },
    AppointmentCommitted {
        entry: AuditEntry,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A bookable slot, as UTC instants plus local projections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub start_local_author: DateTime<FixedOffset>,
    pub end_local_author: DateTime<FixedOffset>,
    pub start_local_caller: DateTime<FixedOffset>,
    pub end_local_caller: DateTime<FixedOffset>,
}

/// Which lookahead band picked an appointment up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderLead {
    DayAhead,
    HourAhead,
}

impl ReminderLead {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderLead::DayAhead => "24h",
            ReminderLead::HourAhead => "1h",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueReminder {
    pub lead: ReminderLead,
    pub appointment: Appointment,
}

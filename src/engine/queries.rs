use chrono::{DateTime, Duration, NaiveDate, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{dispatch, Notice, NoticeKind};

use super::audit::state_at;
use super::slots::{generate_slots, SlotQuery};
use super::windows::coalesced_windows_for_date;
use super::zone::parse_tz;
use super::{Engine, EngineError};

/// Input of ListSlots. The caller zone defaults to the author's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotRequest {
    pub author_id: Option<Ulid>,
    pub interview_type_id: Option<Ulid>,
    pub duration_min: Option<u32>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub caller_timezone: Option<String>,
}

fn missing(field: &'static str) -> EngineError {
    EngineError::validation(format!("missing required parameter: {field}"))
}

/// Reminder lookahead bands, inclusive on both ends.
const DAY_AHEAD_BAND: (i64, i64) = (23 * 60 + 45, 24 * 60 + 15);
const HOUR_AHEAD_BAND: (i64, i64) = (45, 75);

impl Engine {
    /// Bookable slots for one interview type over a caller-local date range.
    pub async fn list_slots(&self, req: SlotRequest) -> Result<Vec<Slot>, EngineError> {
        let author_id = req.author_id.ok_or_else(|| missing("author_id"))?;
        let type_id = req.interview_type_id.ok_or_else(|| missing("interview_type_id"))?;
        let duration_min = req.duration_min.ok_or_else(|| missing("duration"))?;
        let from_date = req.from_date.ok_or_else(|| missing("from_date"))?;
        let to_date = req.to_date.ok_or_else(|| missing("to_date"))?;
        if to_date < from_date {
            return Err(EngineError::validation(format!(
                "to_date {to_date} is before from_date {from_date}"
            )));
        }
        if (to_date - from_date).num_days() >= MAX_SLOT_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("slot query range too wide"));
        }

        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        let guard = st.read().await;
        let interview_type = guard
            .interview_type(&type_id)
            .ok_or_else(|| EngineError::type_not_found(type_id))?;
        if !interview_type.allows_duration(duration_min) {
            return Err(EngineError::validation(format!(
                "duration {duration_min} is not offered by this interview type (allowed: {:?})",
                interview_type.duration_options_min
            )));
        }

        let author_tz = parse_tz(&guard.profile.timezone)?;
        let caller_tz = match req.caller_timezone.as_deref() {
            Some(name) => parse_tz(name)?,
            None => author_tz,
        };
        let query = SlotQuery {
            author_tz,
            caller_tz,
            from_date,
            to_date,
            duration_min,
            granularity_min: guard.profile.slot_granularity_min,
            buffer_before_min: interview_type
                .buffer_before_min
                .unwrap_or(guard.profile.default_buffer_before_min),
            buffer_after_min: interview_type
                .buffer_after_min
                .unwrap_or(guard.profile.default_buffer_after_min),
            min_notice_hours: interview_type.min_notice_hours,
            max_bookings_per_day: guard.profile.max_bookings_per_day,
            now: self.clock.now(),
        };
        let slots = generate_slots(&query, &guard.rules, &guard.overrides, &guard.appointments);
        tracing::debug!(%author_id, %from_date, %to_date, slots = slots.len(), "slots listed");
        Ok(slots)
    }

    /// Disjoint raw windows for one author-local date, before any slot policy.
    pub async fn raw_windows(&self, author_id: Ulid, date: NaiveDate) -> Result<Vec<LocalSpan>, EngineError> {
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        let guard = st.read().await;
        Ok(coalesced_windows_for_date(date, &guard.rules, &guard.overrides))
    }

    pub async fn get_author_profile(&self, author_id: Ulid) -> Result<AuthorProfile, EngineError> {
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        let guard = st.read().await;
        Ok(guard.profile.clone())
    }

    pub async fn list_rules(&self, author_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        let guard = st.read().await;
        Ok(guard.rules.clone())
    }

    pub async fn list_overrides(&self, author_id: Ulid) -> Result<Vec<AvailabilityOverride>, EngineError> {
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        let guard = st.read().await;
        Ok(guard.overrides.clone())
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let guard = self
            .resolve_entity_read(&id, EngineError::appointment_not_found)
            .await?;
        guard
            .appointment(&id)
            .cloned()
            .ok_or_else(|| EngineError::appointment_not_found(id))
    }

    /// All of an author's appointments, any status, by start time.
    pub async fn list_appointments(&self, author_id: Ulid) -> Result<Vec<Appointment>, EngineError> {
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        let guard = st.read().await;
        Ok(guard.appointments.clone())
    }

    /// The appointment's audit entries in commit order.
    pub async fn appointment_history(&self, id: Ulid) -> Result<Vec<AuditEntry>, EngineError> {
        let guard = self
            .resolve_entity_read(&id, EngineError::appointment_not_found)
            .await?;
        Ok(guard.history(&id))
    }

    /// The appointment as it stood at `at`, rebuilt from its history.
    pub async fn appointment_as_of(&self, id: Ulid, at: DateTime<Utc>) -> Result<Option<Appointment>, EngineError> {
        let history = self.appointment_history(id).await?;
        Ok(state_at(&history, at))
    }

    /// CONFIRMED appointments starting inside either reminder band around `now`.
    pub async fn due_reminders(&self, now: DateTime<Utc>) -> Vec<DueReminder> {
        let bands = [
            (ReminderLead::DayAhead, DAY_AHEAD_BAND),
            (ReminderLead::HourAhead, HOUR_AHEAD_BAND),
        ];
        let mut due = Vec::new();
        for st in self.author_arcs() {
            let guard = st.read().await;
            for (lead, (lo, hi)) in bands {
                let from = now + Duration::minutes(lo);
                let to = now + Duration::minutes(hi);
                due.extend(
                    guard
                        .appointments
                        .iter()
                        .filter(|a| a.status == AppointmentStatus::Confirmed)
                        .filter(|a| a.start_at_utc >= from && a.start_at_utc <= to)
                        .map(|a| DueReminder { lead, appointment: a.clone() }),
                );
            }
        }
        due.sort_by_key(|r| (r.lead == ReminderLead::HourAhead, r.appointment.start_at_utc));
        due
    }

    /// On-demand reminder sweep. When a job secret is configured the caller
    /// must present it.
    pub async fn run_reminder_job(&self, secret: Option<&str>) -> Result<Vec<DueReminder>, EngineError> {
        if let Some(expected) = &self.job_secret
            && secret != Some(expected.as_str())
        {
            tracing::warn!("reminder job refused: bad or missing secret");
            return Err(EngineError::Unauthorized);
        }
        Ok(self.dispatch_due_reminders().await)
    }

    /// Notify both parties of every appointment due a reminder now.
    pub async fn dispatch_due_reminders(&self) -> Vec<DueReminder> {
        let due = self.due_reminders(self.clock.now()).await;
        for reminder in &due {
            let author_email = match self.get_author(&reminder.appointment.author_id) {
                Some(st) => st.read().await.profile.email.clone(),
                None => None,
            };
            let notices = Notice::for_parties(
                NoticeKind::Reminder { lead: reminder.lead },
                &reminder.appointment,
                author_email.as_deref(),
            );
            dispatch(self.notifier.clone(), notices);
        }
        metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL).increment(due.len() as u64);
        if !due.is_empty() {
            tracing::info!(count = due.len(), "reminders dispatched");
        }
        due
    }
}

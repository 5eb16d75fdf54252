use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{dispatch, Notice, NoticeKind};

use super::conflict::{check_no_conflict, check_policy_window, validate_span};
use super::zone::parse_tz;
use super::{Engine, EngineError, WalCommand};

/// Input of CreateAppointment. Everything but `id` and `location` is required;
/// fields are optional so that absence surfaces as a validation error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingRequest {
    pub id: Option<Ulid>,
    pub author_id: Option<Ulid>,
    pub interview_type_id: Option<Ulid>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub customer_timezone: Option<String>,
    pub customer_email: Option<String>,
    pub location: Option<String>,
}

/// Fields an administrator may overwrite. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdminEdit {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: Option<AppointmentStatus>,
    pub interview_type_id: Option<Ulid>,
    /// Recorded on the audit entry; the customer when absent.
    pub actor: Option<String>,
    pub note: Option<String>,
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_email(email: &str) -> Result<(), EngineError> {
    check_len(Some(email), MAX_EMAIL_LEN, "email too long")?;
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
    if !valid {
        return Err(EngineError::validation(format!("invalid email: {email}")));
    }
    Ok(())
}

fn validate_time_range(start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::validation(format!(
            "start time {start} must be before end time {end}"
        )));
    }
    Ok(())
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, EngineError> {
    value.ok_or_else(|| EngineError::validation(format!("missing required field: {field}")))
}

impl Engine {
    // ── Author-owned inputs ──────────────────────────────

    pub async fn register_author(&self, profile: AuthorProfile) -> Result<(), EngineError> {
        check_len(Some(&profile.timezone), MAX_TIMEZONE_LEN, "time zone name too long")?;
        parse_tz(&profile.timezone)?;
        check_len(profile.name.as_deref(), MAX_NAME_LEN, "author name too long")?;
        if let Some(email) = &profile.email {
            validate_email(email)?;
        }
        if profile.slot_granularity_min < MIN_GRANULARITY_MIN {
            return Err(EngineError::validation(format!(
                "slot granularity must be at least {MIN_GRANULARITY_MIN} minutes"
            )));
        }
        if profile.default_buffer_before_min > MAX_BUFFER_MIN || profile.default_buffer_after_min > MAX_BUFFER_MIN {
            return Err(EngineError::LimitExceeded("buffer too long"));
        }

        // Exclusive: the existence check, append and insert must not interleave
        // with another registration of the same id.
        let _gate = self.commit_gate.write().await;
        if self.state.len() >= MAX_AUTHORS {
            return Err(EngineError::LimitExceeded("too many authors"));
        }
        if self.state.contains_key(&profile.id) {
            return Err(EngineError::AlreadyExists(profile.id));
        }

        let event = Event::AuthorRegistered { profile: profile.clone() };
        self.wal_append(&event).await?;
        let id = profile.id;
        self.state.insert(id, Arc::new(RwLock::new(AuthorState::new(profile))));
        metrics::gauge!(crate::observability::AUTHORS_ACTIVE).set(self.state.len() as f64);
        tracing::info!(author_id = %id, "author registered");
        Ok(())
    }

    pub async fn add_interview_type(&self, interview_type: InterviewType) -> Result<(), EngineError> {
        let t = &interview_type;
        check_len(Some(&t.name), MAX_NAME_LEN, "interview type name too long")?;
        if t.duration_options_min.is_empty() {
            return Err(EngineError::validation("at least one duration option is required"));
        }
        if t.duration_options_min.len() > MAX_DURATION_OPTIONS {
            return Err(EngineError::LimitExceeded("too many duration options"));
        }
        if let Some(bad) = t.duration_options_min.iter().find(|&&d| d == 0 || d > MAX_DURATION_MIN) {
            return Err(EngineError::validation(format!("invalid duration option: {bad} minutes")));
        }
        let buffer = t.buffer_before_min.unwrap_or(0).max(t.buffer_after_min.unwrap_or(0));
        if buffer > MAX_BUFFER_MIN {
            return Err(EngineError::LimitExceeded("buffer too long"));
        }
        if t.min_notice_hours > MAX_NOTICE_HOURS || t.cancellation_policy_hours > MAX_NOTICE_HOURS {
            return Err(EngineError::LimitExceeded("notice too long"));
        }

        let _gate = self.commit_gate.read().await;
        let st = self
            .get_author(&t.author_id)
            .ok_or_else(|| EngineError::author_not_found(t.author_id))?;
        let mut guard = st.write().await;
        if guard.interview_types.len() >= MAX_INTERVIEW_TYPES_PER_AUTHOR {
            return Err(EngineError::LimitExceeded("too many interview types for author"));
        }
        if self.entity_to_author.contains_key(&t.id) {
            return Err(EngineError::AlreadyExists(t.id));
        }

        let event = Event::InterviewTypeAdded { interview_type };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Add a weekly rule. Rules start active and are never deleted.
    pub async fn add_rule(
        &self,
        id: Ulid,
        author_id: Ulid,
        day_of_week: u8,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<AvailabilityRule, EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::validation(format!(
                "day_of_week must be 0 (Sunday) to 6 (Saturday), got {day_of_week}"
            )));
        }
        validate_time_range(start, end)?;

        let _gate = self.commit_gate.read().await;
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        let mut guard = st.write().await;
        if guard.rules.len() >= MAX_RULES_PER_AUTHOR {
            return Err(EngineError::LimitExceeded("too many rules for author"));
        }
        if self.entity_to_author.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let rule = AvailabilityRule {
            id,
            author_id,
            day_of_week,
            start_time_local: start,
            end_time_local: end,
            active: true,
        };
        let event = Event::RuleAdded { rule: rule.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(rule)
    }

    pub async fn set_rule_active(&self, id: Ulid, active: bool) -> Result<AvailabilityRule, EngineError> {
        let _gate = self.commit_gate.read().await;
        let not_found = |id: Ulid| EngineError::NotFound { entity: "availability rule", id };
        let mut guard = self.resolve_entity_write(&id, not_found).await?;
        let author_id = guard.profile.id;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(not_found(id));
        }

        let event = Event::RuleActiveSet { id, author_id, active };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    /// Append a date override. Order of insertion is the order of application.
    pub async fn add_override(&self, entry: AvailabilityOverride) -> Result<(), EngineError> {
        check_len(entry.note.as_deref(), MAX_NOTE_LEN, "note too long")?;
        match (entry.start_time_local, entry.end_time_local) {
            (Some(start), Some(end)) => validate_time_range(start, end)?,
            (None, None) if entry.kind == OverrideKind::Remove => {}
            (None, None) => {
                return Err(EngineError::validation("an ADD override needs both start and end time"));
            }
            _ => {
                return Err(EngineError::validation(
                    "override start and end time must both be set or both be empty",
                ));
            }
        }

        let _gate = self.commit_gate.read().await;
        let st = self
            .get_author(&entry.author_id)
            .ok_or_else(|| EngineError::author_not_found(entry.author_id))?;
        let mut guard = st.write().await;
        if guard.overrides.len() >= MAX_OVERRIDES_PER_AUTHOR {
            return Err(EngineError::LimitExceeded("too many overrides for author"));
        }
        if self.entity_to_author.contains_key(&entry.id) {
            return Err(EngineError::AlreadyExists(entry.id));
        }

        let event = Event::OverrideAdded { entry };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Booking transactions ─────────────────────────────

    /// Book `[start, end)` for a customer. The overlap re-check and the write
    /// happen under the author's write lock, so of two racing requests for
    /// overlapping times exactly one commits.
    pub async fn create_appointment(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let author_id = required(req.author_id, "author_id")?;
        let type_id = required(req.interview_type_id, "interview_type_id")?;
        let start = required(req.start_at, "start_at")?;
        let end = required(req.end_at, "end_at")?;
        let customer_timezone = required(req.customer_timezone, "customer_timezone")?;
        let customer_email = required(req.customer_email, "customer_email")?;
        let span = validate_span(start, end)?;
        check_len(Some(&customer_timezone), MAX_TIMEZONE_LEN, "time zone name too long")?;
        parse_tz(&customer_timezone)?;
        validate_email(&customer_email)?;
        let location = req.location.filter(|l| !l.trim().is_empty());
        check_len(location.as_deref(), MAX_LOCATION_LEN, "location too long")?;
        let id = req.id.unwrap_or_else(Ulid::new);

        let _gate = self.commit_gate.read().await;
        let st = self
            .get_author(&author_id)
            .ok_or_else(|| EngineError::author_not_found(author_id))?;
        let mut guard = st.write().await;
        let interview_type = guard
            .interview_type(&type_id)
            .ok_or_else(|| EngineError::type_not_found(type_id))?;
        if interview_type.location_required && location.is_none() {
            return Err(EngineError::validation("this interview type requires a location"));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_AUTHOR {
            return Err(EngineError::LimitExceeded("too many appointments for author"));
        }
        if self.entity_to_author.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        if let Err(e) = check_no_conflict(&guard, &span, None) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let appointment = Appointment {
            id,
            author_id,
            interview_type_id: type_id,
            customer_email: customer_email.clone(),
            start_at_utc: span.start,
            end_at_utc: span.end,
            status: AppointmentStatus::Confirmed,
            customer_timezone,
            author_timezone: guard.profile.timezone.clone(),
            location,
            meeting_link: None,
        };
        let entry = AuditEntry {
            id: Ulid::new(),
            appointment_id: id,
            actor: customer_email,
            action: AuditAction::Created,
            before: None,
            after: appointment.clone(),
            note: None,
            at: self.clock.now(),
        };
        self.persist_and_apply(&mut guard, &Event::AppointmentCommitted { entry }).await?;

        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "action" => "created").increment(1);
        tracing::info!(appointment_id = %id, %author_id, start = %span.start, "appointment created");
        let notices = Notice::for_parties(NoticeKind::Confirmed, &appointment, guard.profile.email.as_deref());
        drop(guard);
        dispatch(self.notifier.clone(), notices);
        Ok(appointment)
    }

    /// Move an appointment. Closed once fewer than the type's
    /// `cancellation_policy_hours` remain before the current start.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
    ) -> Result<Appointment, EngineError> {
        let span = validate_span(new_start, new_end)?;

        let _gate = self.commit_gate.read().await;
        let mut guard = self
            .resolve_entity_write(&id, EngineError::appointment_not_found)
            .await?;
        let before = guard
            .appointment(&id)
            .cloned()
            .ok_or_else(|| EngineError::appointment_not_found(id))?;
        if !before.status.blocks_time() {
            return Err(EngineError::validation(format!(
                "cannot reschedule a {} appointment",
                before.status.as_str()
            )));
        }
        let policy_hours = guard
            .interview_type(&before.interview_type_id)
            .map(|t| t.cancellation_policy_hours)
            .ok_or_else(|| EngineError::type_not_found(before.interview_type_id))?;
        if let Err(e) = check_policy_window(before.start_at_utc, policy_hours, self.clock.now()) {
            metrics::counter!(crate::observability::POLICY_REJECTIONS_TOTAL, "action" => "reschedule").increment(1);
            return Err(e);
        }
        if let Err(e) = check_no_conflict(&guard, &span, Some(id)) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let mut after = before.clone();
        after.start_at_utc = span.start;
        after.end_at_utc = span.end;
        let entry = AuditEntry {
            id: Ulid::new(),
            appointment_id: id,
            actor: before.customer_email.clone(),
            action: AuditAction::Rescheduled,
            before: Some(before.clone()),
            after: after.clone(),
            note: None,
            at: self.clock.now(),
        };
        self.persist_and_apply(&mut guard, &Event::AppointmentCommitted { entry }).await?;

        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "action" => "rescheduled").increment(1);
        tracing::info!(appointment_id = %id, from = %before.start_at_utc, to = %span.start, "appointment rescheduled");
        let notices = Notice::for_parties(
            NoticeKind::Rescheduled { previous: before },
            &after,
            guard.profile.email.as_deref(),
        );
        drop(guard);
        dispatch(self.notifier.clone(), notices);
        Ok(after)
    }

    /// Cancel under the same policy window as reschedule.
    pub async fn cancel_appointment(&self, id: Ulid, reason: Option<String>) -> Result<Appointment, EngineError> {
        check_len(reason.as_deref(), MAX_NOTE_LEN, "reason too long")?;

        let _gate = self.commit_gate.read().await;
        let mut guard = self
            .resolve_entity_write(&id, EngineError::appointment_not_found)
            .await?;
        let before = guard
            .appointment(&id)
            .cloned()
            .ok_or_else(|| EngineError::appointment_not_found(id))?;
        if !before.status.blocks_time() {
            return Err(EngineError::validation(format!(
                "cannot cancel a {} appointment",
                before.status.as_str()
            )));
        }
        let policy_hours = guard
            .interview_type(&before.interview_type_id)
            .map(|t| t.cancellation_policy_hours)
            .ok_or_else(|| EngineError::type_not_found(before.interview_type_id))?;
        if let Err(e) = check_policy_window(before.start_at_utc, policy_hours, self.clock.now()) {
            metrics::counter!(crate::observability::POLICY_REJECTIONS_TOTAL, "action" => "cancel").increment(1);
            return Err(e);
        }

        let mut after = before.clone();
        after.status = AppointmentStatus::Cancelled;
        let entry = AuditEntry {
            id: Ulid::new(),
            appointment_id: id,
            actor: before.customer_email.clone(),
            action: AuditAction::Cancelled,
            before: Some(before),
            after: after.clone(),
            note: reason.clone(),
            at: self.clock.now(),
        };
        self.persist_and_apply(&mut guard, &Event::AppointmentCommitted { entry }).await?;

        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "action" => "cancelled").increment(1);
        tracing::info!(appointment_id = %id, "appointment cancelled");
        let notices = Notice::for_parties(NoticeKind::Cancelled { reason }, &after, guard.profile.email.as_deref());
        drop(guard);
        dispatch(self.notifier.clone(), notices);
        Ok(after)
    }

    /// PENDING → CONFIRMED.
    pub async fn confirm_appointment(&self, id: Ulid, actor: Option<String>) -> Result<Appointment, EngineError> {
        check_len(actor.as_deref(), MAX_EMAIL_LEN, "actor too long")?;

        let _gate = self.commit_gate.read().await;
        let mut guard = self
            .resolve_entity_write(&id, EngineError::appointment_not_found)
            .await?;
        let before = guard
            .appointment(&id)
            .cloned()
            .ok_or_else(|| EngineError::appointment_not_found(id))?;
        if before.status != AppointmentStatus::Pending {
            return Err(EngineError::validation(format!(
                "only pending appointments can be confirmed, this one is {}",
                before.status.as_str()
            )));
        }

        let mut after = before.clone();
        after.status = AppointmentStatus::Confirmed;
        let entry = AuditEntry {
            id: Ulid::new(),
            appointment_id: id,
            actor: actor.unwrap_or_else(|| before.customer_email.clone()),
            action: AuditAction::Confirmed,
            before: Some(before),
            after: after.clone(),
            note: None,
            at: self.clock.now(),
        };
        self.persist_and_apply(&mut guard, &Event::AppointmentCommitted { entry }).await?;

        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "action" => "confirmed").increment(1);
        let notices = Notice::for_parties(NoticeKind::Confirmed, &after, guard.profile.email.as_deref());
        drop(guard);
        dispatch(self.notifier.clone(), notices);
        Ok(after)
    }

    /// Administrative override. Skips the policy window and the overlap
    /// check, so an edited appointment may land on top of another one.
    pub async fn admin_edit_appointment(&self, id: Ulid, edit: AdminEdit) -> Result<Appointment, EngineError> {
        check_len(edit.actor.as_deref(), MAX_EMAIL_LEN, "actor too long")?;
        check_len(edit.note.as_deref(), MAX_NOTE_LEN, "note too long")?;

        let _gate = self.commit_gate.read().await;
        let mut guard = self
            .resolve_entity_write(&id, EngineError::appointment_not_found)
            .await?;
        let before = guard
            .appointment(&id)
            .cloned()
            .ok_or_else(|| EngineError::appointment_not_found(id))?;

        let mut after = before.clone();
        let span = validate_span(
            edit.start_at.unwrap_or(before.start_at_utc),
            edit.end_at.unwrap_or(before.end_at_utc),
        )?;
        after.start_at_utc = span.start;
        after.end_at_utc = span.end;
        if let Some(status) = edit.status {
            after.status = status;
        }
        if let Some(type_id) = edit.interview_type_id {
            if guard.interview_type(&type_id).is_none() {
                return Err(EngineError::type_not_found(type_id));
            }
            after.interview_type_id = type_id;
        }

        let entry = AuditEntry {
            id: Ulid::new(),
            appointment_id: id,
            actor: edit.actor.unwrap_or_else(|| before.customer_email.clone()),
            action: AuditAction::AdminEdited,
            before: Some(before),
            after: after.clone(),
            note: edit.note,
            at: self.clock.now(),
        };
        self.persist_and_apply(&mut guard, &Event::AppointmentCommitted { entry }).await?;

        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "action" => "admin_edited").increment(1);
        tracing::info!(appointment_id = %id, status = after.status.as_str(), "appointment edited by admin");
        Ok(after)
    }

    // ── Maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Every audit entry is kept; the rows are rebuilt from them.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut snapshots = Vec::new();
        for st in self.author_arcs() {
            snapshots.push(st.read_owned().await);
        }
        let mut events = Vec::new();
        for guard in &snapshots {
            events.push(Event::AuthorRegistered { profile: guard.profile.clone() });
            for t in &guard.interview_types {
                events.push(Event::InterviewTypeAdded { interview_type: t.clone() });
            }
            for rule in &guard.rules {
                events.push(Event::RuleAdded { rule: rule.clone() });
            }
            for entry in &guard.overrides {
                events.push(Event::OverrideAdded { entry: entry.clone() });
            }
            for entry in &guard.audit {
                events.push(Event::AppointmentCommitted { entry: entry.clone() });
            }
        }
        drop(snapshots);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

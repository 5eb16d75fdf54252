use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

use super::*;
use crate::clock::FixedClock;
use crate::limits::MAX_SLOT_RANGE_DAYS;
use crate::notify::{Notice, NoticeKind, NotifyError, NotifyHub, Recipient};

// 2031-06-02 is a Monday.
const MONDAY: (i32, u32, u32) = (2031, 6, 2);

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bookd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

fn monday(h: u32, min: u32) -> DateTime<Utc> {
    utc(MONDAY.0, MONDAY.1, MONDAY.2, h, min)
}

fn monday_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(MONDAY.0, MONDAY.1, MONDAY.2).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// Notifier that keeps every notice it is handed.
#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    async fn wait_for(&self, count: usize) -> Vec<Notice> {
        for _ in 0..100 {
            if self.notices.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, notice: Notice) -> Result<(), NotifyError> {
        self.notices.lock().unwrap().push(notice);
        Ok(())
    }
}

/// Notifier whose every delivery fails.
#[derive(Default)]
struct FailingNotifier {
    attempts: AtomicUsize,
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn deliver(&self, notice: Notice) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Delivery {
            address: notice.address,
            reason: "smtp unreachable".into(),
        })
    }
}

struct Fixture {
    engine: Arc<Engine>,
    clock: Arc<FixedClock>,
    author_id: Ulid,
    type_id: Ulid,
}

fn profile(id: Ulid, timezone: &str) -> AuthorProfile {
    AuthorProfile {
        id,
        name: Some("Ada".into()),
        email: Some("ada@example.test".into()),
        timezone: timezone.into(),
        slot_granularity_min: 30,
        max_bookings_per_day: None,
        default_buffer_before_min: 0,
        default_buffer_after_min: 0,
    }
}

fn interview_type(id: Ulid, author_id: Ulid, policy_hours: u32) -> InterviewType {
    InterviewType {
        id,
        author_id,
        name: "Screening".into(),
        duration_options_min: vec![30, 60],
        buffer_before_min: None,
        buffer_after_min: None,
        min_notice_hours: 0,
        cancellation_policy_hours: policy_hours,
        location_required: false,
    }
}

/// One UTC author with a Monday 09:00-12:00 rule and a 60/30 minute type.
async fn fixture_with(name: &str, notifier: Arc<dyn Notifier>, policy_hours: u32) -> Fixture {
    let clock = Arc::new(FixedClock::new(utc(2031, 6, 1, 0, 0)));
    let engine = Arc::new(Engine::new(test_wal_path(name), notifier, clock.clone()).unwrap());
    let author_id = Ulid::new();
    let type_id = Ulid::new();
    engine.register_author(profile(author_id, "UTC")).await.unwrap();
    engine
        .add_interview_type(interview_type(type_id, author_id, policy_hours))
        .await
        .unwrap();
    engine
        .add_rule(Ulid::new(), author_id, 1, hm(9, 0), hm(12, 0))
        .await
        .unwrap();
    Fixture {
        engine,
        clock,
        author_id,
        type_id,
    }
}

async fn fixture(name: &str) -> Fixture {
    fixture_with(name, Arc::new(NotifyHub::new()), 0).await
}

impl Fixture {
    fn booking(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> BookingRequest {
        BookingRequest {
            id: None,
            author_id: Some(self.author_id),
            interview_type_id: Some(self.type_id),
            start_at: Some(start),
            end_at: Some(end),
            customer_timezone: Some("Europe/Berlin".into()),
            customer_email: Some("grace@example.test".into()),
            location: None,
        }
    }

    async fn book(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Appointment {
        self.engine.create_appointment(self.booking(start, end)).await.unwrap()
    }

    fn slot_request(&self, duration: u32) -> SlotRequest {
        SlotRequest {
            author_id: Some(self.author_id),
            interview_type_id: Some(self.type_id),
            duration_min: Some(duration),
            from_date: Some(monday_date()),
            to_date: Some(monday_date()),
            caller_timezone: None,
        }
    }

    async fn slot_starts(&self, duration: u32) -> Vec<DateTime<Utc>> {
        self.engine
            .list_slots(self.slot_request(duration))
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.start_utc)
            .collect()
    }
}

// ── Author-owned inputs ──────────────────────────────────

#[tokio::test]
async fn register_author_rejects_duplicates_and_bad_zone() {
    let f = fixture("register_dup.wal").await;
    let err = f
        .engine
        .register_author(profile(f.author_id, "UTC"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == f.author_id));

    let err = f
        .engine
        .register_author(profile(Ulid::new(), "Mars/Olympus_Mons"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_registration_commits_once() {
    let path = test_wal_path("register_race.wal");
    let clock = Arc::new(FixedClock::new(utc(2031, 6, 1, 0, 0)));
    let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap());

    for _ in 0..20 {
        let id = Ulid::new();
        let (a, b) = tokio::join!(
            {
                let engine = engine.clone();
                tokio::spawn(async move { engine.register_author(profile(id, "UTC")).await })
            },
            {
                let engine = engine.clone();
                tokio::spawn(async move { engine.register_author(profile(id, "UTC")).await })
            },
        );
        let results = [a.unwrap(), b.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(EngineError::AlreadyExists(dup)) if *dup == id))
        );
    }

    // The log holds one registration per author, so rules survive replay.
    let id = Ulid::new();
    engine.register_author(profile(id, "UTC")).await.unwrap();
    engine.add_rule(Ulid::new(), id, 1, hm(9, 0), hm(12, 0)).await.unwrap();
    assert!(engine.register_author(profile(id, "UTC")).await.is_err());
    drop(engine);

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap();
    assert_eq!(engine.list_rules(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn interview_type_for_unknown_author_not_found() {
    let f = fixture("type_unknown_author.wal").await;
    let err = f
        .engine
        .add_interview_type(interview_type(Ulid::new(), Ulid::new(), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn rule_validation() {
    let f = fixture("rule_validation.wal").await;
    let bad_day = f.engine.add_rule(Ulid::new(), f.author_id, 7, hm(9, 0), hm(10, 0)).await;
    assert!(matches!(bad_day, Err(EngineError::Validation(_))));
    let inverted = f.engine.add_rule(Ulid::new(), f.author_id, 2, hm(10, 0), hm(9, 0)).await;
    assert!(matches!(inverted, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn add_override_requires_times_for_add() {
    let f = fixture("override_add_times.wal").await;
    let err = f
        .engine
        .add_override(AvailabilityOverride {
            id: Ulid::new(),
            author_id: f.author_id,
            date_local: monday_date(),
            kind: OverrideKind::Add,
            start_time_local: None,
            end_time_local: None,
            note: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn deactivated_rule_stops_producing_slots() {
    let f = fixture("rule_deactivate.wal").await;
    let rule_id = f.engine.list_rules(f.author_id).await.unwrap()[0].id;
    let rule = f.engine.set_rule_active(rule_id, false).await.unwrap();
    assert!(!rule.active);
    assert!(f.slot_starts(60).await.is_empty());

    f.engine.set_rule_active(rule_id, true).await.unwrap();
    assert_eq!(f.slot_starts(60).await.len(), 5);

    let err = f.engine.set_rule_active(Ulid::new(), true).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

// ── ListSlots ────────────────────────────────────────────

#[tokio::test]
async fn list_slots_steps_through_window() {
    let f = fixture("slots_basic.wal").await;
    assert_eq!(
        f.slot_starts(60).await,
        vec![monday(9, 0), monday(9, 30), monday(10, 0), monday(10, 30), monday(11, 0)]
    );
}

#[tokio::test]
async fn booked_time_is_excluded_from_slots() {
    let f = fixture("slots_booked.wal").await;
    f.book(monday(10, 0), monday(11, 0)).await;
    assert_eq!(f.slot_starts(60).await, vec![monday(9, 0), monday(11, 0)]);
}

#[tokio::test]
async fn cancelled_booking_frees_its_slot() {
    let f = fixture("slots_cancelled.wal").await;
    let appt = f.book(monday(10, 0), monday(11, 0)).await;
    f.engine.cancel_appointment(appt.id, None).await.unwrap();
    assert_eq!(f.slot_starts(60).await.len(), 5);
}

#[tokio::test]
async fn full_day_remove_clears_date() {
    let f = fixture("slots_full_day_remove.wal").await;
    f.engine
        .add_override(AvailabilityOverride {
            id: Ulid::new(),
            author_id: f.author_id,
            date_local: monday_date(),
            kind: OverrideKind::Remove,
            start_time_local: None,
            end_time_local: None,
            note: Some("conference".into()),
        })
        .await
        .unwrap();
    assert!(f.slot_starts(60).await.is_empty());
    assert!(f.engine.raw_windows(f.author_id, monday_date()).await.unwrap().is_empty());
}

#[tokio::test]
async fn add_override_extends_raw_windows() {
    let f = fixture("windows_add.wal").await;
    f.engine
        .add_override(AvailabilityOverride {
            id: Ulid::new(),
            author_id: f.author_id,
            date_local: monday_date(),
            kind: OverrideKind::Add,
            start_time_local: Some(hm(11, 0)),
            end_time_local: Some(hm(14, 0)),
            note: None,
        })
        .await
        .unwrap();
    let windows = f.engine.raw_windows(f.author_id, monday_date()).await.unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].start.time(), hm(9, 0));
    assert_eq!(windows[0].end.time(), hm(14, 0));
}

#[tokio::test]
async fn list_slots_parameter_errors() {
    let f = fixture("slots_params.wal").await;

    let missing = SlotRequest {
        duration_min: None,
        ..f.slot_request(60)
    };
    assert!(matches!(
        f.engine.list_slots(missing).await,
        Err(EngineError::Validation(_))
    ));

    assert!(matches!(
        f.engine.list_slots(f.slot_request(45)).await,
        Err(EngineError::Validation(_))
    ));

    let wide = SlotRequest {
        to_date: Some(monday_date() + Duration::days(MAX_SLOT_RANGE_DAYS)),
        ..f.slot_request(60)
    };
    assert!(matches!(
        f.engine.list_slots(wide).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let unknown_author = SlotRequest {
        author_id: Some(Ulid::new()),
        ..f.slot_request(60)
    };
    assert!(matches!(
        f.engine.list_slots(unknown_author).await,
        Err(EngineError::NotFound { .. })
    ));

    let bad_zone = SlotRequest {
        caller_timezone: Some("Nowhere/Special".into()),
        ..f.slot_request(60)
    };
    assert!(matches!(
        f.engine.list_slots(bad_zone).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn list_slots_projects_into_caller_zone() {
    let f = fixture("slots_caller_zone.wal").await;
    let req = SlotRequest {
        caller_timezone: Some("Asia/Tokyo".into()),
        ..f.slot_request(60)
    };
    // 09:00 UTC is 18:00 in Tokyo, still Monday there.
    let slots = f.engine.list_slots(req).await.unwrap();
    assert_eq!(slots.len(), 5);
    assert_eq!(slots[0].start_local_caller.to_rfc3339(), "2031-06-02T18:00:00+09:00");
    assert_eq!(slots[0].start_local_author.to_rfc3339(), "2031-06-02T09:00:00+00:00");
}

#[tokio::test]
async fn daily_cap_hides_the_day() {
    let clock = Arc::new(FixedClock::new(utc(2031, 6, 1, 0, 0)));
    let engine = Engine::new(
        test_wal_path("slots_cap.wal"),
        Arc::new(NotifyHub::new()),
        clock,
    )
    .unwrap();
    let author_id = Ulid::new();
    let type_id = Ulid::new();
    engine
        .register_author(AuthorProfile {
            max_bookings_per_day: Some(1),
            ..profile(author_id, "UTC")
        })
        .await
        .unwrap();
    engine
        .add_interview_type(interview_type(type_id, author_id, 0))
        .await
        .unwrap();
    engine.add_rule(Ulid::new(), author_id, 1, hm(9, 0), hm(12, 0)).await.unwrap();
    engine
        .create_appointment(BookingRequest {
            author_id: Some(author_id),
            interview_type_id: Some(type_id),
            start_at: Some(monday(9, 0)),
            end_at: Some(monday(9, 30)),
            customer_timezone: Some("UTC".into()),
            customer_email: Some("x@example.test".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let slots = engine
        .list_slots(SlotRequest {
            author_id: Some(author_id),
            interview_type_id: Some(type_id),
            duration_min: Some(30),
            from_date: Some(monday_date()),
            to_date: Some(monday_date()),
            caller_timezone: None,
        })
        .await
        .unwrap();
    assert!(slots.is_empty());
}

// ── CreateAppointment ────────────────────────────────────

#[tokio::test]
async fn create_appointment_commits_row_and_audit() {
    let f = fixture("create_basic.wal").await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;
    assert_eq!(appt.status, AppointmentStatus::Confirmed);
    assert_eq!(appt.author_timezone, "UTC");
    assert_eq!(appt.customer_timezone, "Europe/Berlin");

    let stored = f.engine.get_appointment(appt.id).await.unwrap();
    assert_eq!(stored, appt);

    let history = f.engine.appointment_history(appt.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, AuditAction::Created);
    assert_eq!(history[0].actor, "grace@example.test");
    assert!(history[0].before.is_none());
    assert_eq!(history[0].after, appt);
    assert!(is_consistent(&history));
}

#[tokio::test]
async fn create_appointment_missing_fields() {
    let f = fixture("create_missing.wal").await;
    let req = BookingRequest {
        customer_email: None,
        ..f.booking(monday(9, 0), monday(10, 0))
    };
    assert!(matches!(
        f.engine.create_appointment(req).await,
        Err(EngineError::Validation(_))
    ));

    let inverted = f.booking(monday(10, 0), monday(9, 0));
    assert!(matches!(
        f.engine.create_appointment(inverted).await,
        Err(EngineError::Validation(_))
    ));

    let bad_email = BookingRequest {
        customer_email: Some("not-an-email".into()),
        ..f.booking(monday(9, 0), monday(10, 0))
    };
    assert!(matches!(
        f.engine.create_appointment(bad_email).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn create_appointment_unknown_author_or_type() {
    let f = fixture("create_unknown.wal").await;
    let req = BookingRequest {
        author_id: Some(Ulid::new()),
        ..f.booking(monday(9, 0), monday(10, 0))
    };
    assert!(matches!(
        f.engine.create_appointment(req).await,
        Err(EngineError::NotFound { entity: "author", .. })
    ));
    let req = BookingRequest {
        interview_type_id: Some(Ulid::new()),
        ..f.booking(monday(9, 0), monday(10, 0))
    };
    assert!(matches!(
        f.engine.create_appointment(req).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn create_appointment_overlap_conflicts() {
    let f = fixture("create_overlap.wal").await;
    let first = f.book(monday(10, 0), monday(11, 0)).await;
    let err = f
        .engine
        .create_appointment(f.booking(monday(10, 30), monday(11, 30)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == first.id));

    // Touching ends do not overlap.
    f.book(monday(11, 0), monday(12, 0)).await;
    f.book(monday(9, 0), monday(10, 0)).await;
}

#[tokio::test]
async fn concurrent_creates_commit_exactly_one() {
    let f = fixture("create_concurrent.wal").await;
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = f.engine.clone();
        let req = BookingRequest {
            customer_email: Some(format!("c{i}@example.test")),
            ..f.booking(monday(10, 0), monday(11, 0))
        };
        handles.push(tokio::spawn(async move { engine.create_appointment(req).await }));
    }

    let mut committed = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => committed += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(f.engine.list_appointments(f.author_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn location_required_type() {
    let f = fixture("create_location.wal").await;
    let type_id = Ulid::new();
    f.engine
        .add_interview_type(InterviewType {
            location_required: true,
            ..interview_type(type_id, f.author_id, 0)
        })
        .await
        .unwrap();

    let blank = BookingRequest {
        interview_type_id: Some(type_id),
        location: Some("   ".into()),
        ..f.booking(monday(9, 0), monday(10, 0))
    };
    assert!(matches!(
        f.engine.create_appointment(blank).await,
        Err(EngineError::Validation(_))
    ));

    let with_location = BookingRequest {
        interview_type_id: Some(type_id),
        location: Some("Room 4".into()),
        ..f.booking(monday(9, 0), monday(10, 0))
    };
    let appt = f.engine.create_appointment(with_location).await.unwrap();
    assert_eq!(appt.location.as_deref(), Some("Room 4"));
}

#[tokio::test]
async fn duplicate_appointment_id_rejected() {
    let f = fixture("create_dup_id.wal").await;
    let id = Ulid::new();
    let req = BookingRequest {
        id: Some(id),
        ..f.booking(monday(9, 0), monday(10, 0))
    };
    f.engine.create_appointment(req.clone()).await.unwrap();
    let again = BookingRequest {
        start_at: Some(monday(11, 0)),
        end_at: Some(monday(12, 0)),
        ..req
    };
    assert!(matches!(
        f.engine.create_appointment(again).await,
        Err(EngineError::AlreadyExists(dup)) if dup == id
    ));
}

// ── Reschedule / cancel / confirm ────────────────────────

#[tokio::test]
async fn reschedule_moves_and_audits() {
    let f = fixture("reschedule_basic.wal").await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;
    // Overlapping only its own old time is fine.
    let moved = f
        .engine
        .reschedule_appointment(appt.id, monday(9, 30), monday(10, 30))
        .await
        .unwrap();
    assert_eq!(moved.start_at_utc, monday(9, 30));

    let history = f.engine.appointment_history(appt.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].action, AuditAction::Rescheduled);
    assert_eq!(history[1].before.as_ref(), Some(&appt));
    assert_eq!(history[1].after, moved);
    assert!(is_consistent(&history));
}

#[tokio::test]
async fn reschedule_onto_other_booking_conflicts() {
    let f = fixture("reschedule_conflict.wal").await;
    let a = f.book(monday(9, 0), monday(10, 0)).await;
    let b = f.book(monday(11, 0), monday(12, 0)).await;
    let err = f
        .engine
        .reschedule_appointment(a.id, monday(10, 30), monday(11, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == b.id));
    assert_eq!(f.engine.get_appointment(a.id).await.unwrap(), a);
    assert_eq!(f.engine.appointment_history(a.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn policy_window_blocks_reschedule_and_cancel() {
    let f = fixture_with("policy_window.wal", Arc::new(NotifyHub::new()), 24).await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;

    // 21 hours before the start, inside a 24 hour policy.
    f.clock.set(utc(2031, 6, 1, 12, 0));
    let err = f
        .engine
        .reschedule_appointment(appt.id, monday(11, 0), monday(12, 0))
        .await
        .unwrap_err();
    match err {
        EngineError::PolicyViolation {
            start_at,
            hours_until_start,
            policy_hours,
        } => {
            assert_eq!(start_at, appt.start_at_utc);
            assert_eq!(policy_hours, 24);
            assert!((hours_until_start - 21.0).abs() < 1e-9);
        }
        other => panic!("expected PolicyViolation, got {other:?}"),
    }
    assert!(matches!(
        f.engine.cancel_appointment(appt.id, None).await,
        Err(EngineError::PolicyViolation { .. })
    ));

    assert_eq!(f.engine.get_appointment(appt.id).await.unwrap(), appt);
    assert_eq!(f.engine.appointment_history(appt.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn policy_window_boundary_is_open() {
    let f = fixture_with("policy_boundary.wal", Arc::new(NotifyHub::new()), 24).await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;
    // Exactly 24 hours before: still allowed.
    f.clock.set(monday(9, 0) - Duration::hours(24));
    f.engine.cancel_appointment(appt.id, None).await.unwrap();
}

#[tokio::test]
async fn cancel_records_reason_and_blocks_further_changes() {
    let f = fixture("cancel_basic.wal").await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;
    let cancelled = f
        .engine
        .cancel_appointment(appt.id, Some("found another job".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

    let history = f.engine.appointment_history(appt.id).await.unwrap();
    assert_eq!(history[1].action, AuditAction::Cancelled);
    assert_eq!(history[1].note.as_deref(), Some("found another job"));

    assert!(matches!(
        f.engine.cancel_appointment(appt.id, None).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        f.engine
            .reschedule_appointment(appt.id, monday(11, 0), monday(12, 0))
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn unknown_appointment_not_found() {
    let f = fixture("appointment_not_found.wal").await;
    let id = Ulid::new();
    assert!(matches!(
        f.engine.reschedule_appointment(id, monday(9, 0), monday(10, 0)).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(
        f.engine.cancel_appointment(id, None).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(
        f.engine.get_appointment(id).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn confirm_only_from_pending() {
    let f = fixture("confirm.wal").await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;
    assert!(matches!(
        f.engine.confirm_appointment(appt.id, None).await,
        Err(EngineError::Validation(_))
    ));

    f.engine
        .admin_edit_appointment(
            appt.id,
            AdminEdit {
                status: Some(AppointmentStatus::Pending),
                actor: Some("ops@example.test".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let confirmed = f
        .engine
        .confirm_appointment(appt.id, Some("ada@example.test".into()))
        .await
        .unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);

    let actions: Vec<_> = f
        .engine
        .appointment_history(appt.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.action, e.actor))
        .collect();
    assert_eq!(
        actions,
        vec![
            (AuditAction::Created, "grace@example.test".to_string()),
            (AuditAction::AdminEdited, "ops@example.test".to_string()),
            (AuditAction::Confirmed, "ada@example.test".to_string()),
        ]
    );
}

// ── Admin edit ───────────────────────────────────────────

#[tokio::test]
async fn admin_edit_skips_overlap_and_policy() {
    let f = fixture_with("admin_edit.wal", Arc::new(NotifyHub::new()), 48).await;
    f.book(monday(9, 0), monday(10, 0)).await;
    let b = f.book(monday(10, 0), monday(11, 0)).await;
    f.clock.set(monday(8, 0));

    let edited = f
        .engine
        .admin_edit_appointment(
            b.id,
            AdminEdit {
                start_at: Some(monday(9, 30)),
                end_at: Some(monday(10, 30)),
                note: Some("moved by phone".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.start_at_utc, monday(9, 30));

    let history = f.engine.appointment_history(b.id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.action, AuditAction::AdminEdited);
    assert_eq!(last.actor, "grace@example.test");
    assert_eq!(last.note.as_deref(), Some("moved by phone"));
}

#[tokio::test]
async fn admin_edit_still_validates_span_and_type() {
    let f = fixture("admin_edit_invalid.wal").await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;
    let inverted = AdminEdit {
        end_at: Some(monday(8, 0)),
        ..Default::default()
    };
    assert!(matches!(
        f.engine.admin_edit_appointment(appt.id, inverted).await,
        Err(EngineError::Validation(_))
    ));
    let unknown_type = AdminEdit {
        interview_type_id: Some(Ulid::new()),
        ..Default::default()
    };
    assert!(matches!(
        f.engine.admin_edit_appointment(appt.id, unknown_type).await,
        Err(EngineError::NotFound { .. })
    ));
    assert_eq!(f.engine.appointment_history(appt.id).await.unwrap().len(), 1);
}

// ── Audit reconstruction ─────────────────────────────────

#[tokio::test]
async fn appointment_as_of_replays_history() {
    let f = fixture("as_of.wal").await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;
    f.clock.advance(Duration::hours(1));
    f.engine
        .reschedule_appointment(appt.id, monday(11, 0), monday(12, 0))
        .await
        .unwrap();

    let before_create = utc(2031, 5, 31, 0, 0);
    assert_eq!(f.engine.appointment_as_of(appt.id, before_create).await.unwrap(), None);

    let after_create = utc(2031, 6, 1, 0, 30);
    let then = f.engine.appointment_as_of(appt.id, after_create).await.unwrap().unwrap();
    assert_eq!(then.start_at_utc, monday(9, 0));

    let now = f.engine.appointment_as_of(appt.id, f.engine.now()).await.unwrap().unwrap();
    assert_eq!(now.start_at_utc, monday(11, 0));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn notices_go_to_both_parties_after_commit() {
    let notifier = Arc::new(RecordingNotifier::default());
    let f = fixture_with("notify_parties.wal", notifier.clone(), 0).await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;

    let notices = notifier.wait_for(2).await;
    assert_eq!(notices.len(), 2);
    assert!(notices.iter().all(|n| n.kind == NoticeKind::Confirmed));
    assert!(notices.iter().all(|n| n.appointment.id == appt.id));
    let customer = notices.iter().find(|n| n.recipient == Recipient::Customer).unwrap();
    assert_eq!(customer.address, "grace@example.test");
    let author = notices.iter().find(|n| n.recipient == Recipient::Author).unwrap();
    assert_eq!(author.address, "ada@example.test");
}

#[tokio::test]
async fn rejected_transaction_sends_nothing() {
    let notifier = Arc::new(RecordingNotifier::default());
    let f = fixture_with("notify_rejected.wal", notifier.clone(), 0).await;
    f.book(monday(9, 0), monday(10, 0)).await;
    notifier.wait_for(2).await;

    let _ = f.engine.create_appointment(f.booking(monday(9, 0), monday(10, 0))).await;
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(notifier.notices.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn failing_notifier_does_not_roll_back() {
    let notifier = Arc::new(FailingNotifier::default());
    let f = fixture_with("notify_failing.wal", notifier.clone(), 0).await;
    let appt = f.book(monday(9, 0), monday(10, 0)).await;

    for _ in 0..100 {
        if notifier.attempts.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(notifier.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        f.engine.get_appointment(appt.id).await.unwrap().status,
        AppointmentStatus::Confirmed
    );
}

// ── Reminders ────────────────────────────────────────────

#[tokio::test]
async fn due_reminders_pick_both_bands() {
    let f = fixture("reminders_bands.wal").await;
    let now = f.engine.now();
    let day_ahead = f.book(now + Duration::hours(24), now + Duration::hours(25)).await;
    let hour_ahead = f.book(now + Duration::hours(1), now + Duration::hours(2)).await;
    f.book(now + Duration::hours(3), now + Duration::hours(4)).await;
    f.book(now + Duration::hours(48), now + Duration::hours(49)).await;

    let due = f.engine.due_reminders(now).await;
    let picked: Vec<_> = due.iter().map(|r| (r.lead, r.appointment.id)).collect();
    assert_eq!(
        picked,
        vec![
            (ReminderLead::DayAhead, day_ahead.id),
            (ReminderLead::HourAhead, hour_ahead.id),
        ]
    );
}

#[tokio::test]
async fn reminder_bands_are_inclusive() {
    let f = fixture("reminders_inclusive.wal").await;
    let now = f.engine.now();
    let low = f
        .book(now + Duration::minutes(45), now + Duration::minutes(60))
        .await;
    let high = f
        .book(now + Duration::minutes(24 * 60 + 15), now + Duration::minutes(24 * 60 + 45))
        .await;
    f.book(now + Duration::minutes(76), now + Duration::minutes(90)).await;

    let ids: Vec<_> = f.engine.due_reminders(now).await.into_iter().map(|r| r.appointment.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&low.id));
    assert!(ids.contains(&high.id));
}

#[tokio::test]
async fn cancelled_appointments_get_no_reminder() {
    let f = fixture("reminders_cancelled.wal").await;
    let now = f.engine.now();
    let appt = f.book(now + Duration::hours(1), now + Duration::hours(2)).await;
    f.engine.cancel_appointment(appt.id, None).await.unwrap();
    assert!(f.engine.due_reminders(now).await.is_empty());
}

#[tokio::test]
async fn reminder_job_checks_secret() {
    let clock = Arc::new(FixedClock::new(utc(2031, 6, 1, 0, 0)));
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::new(test_wal_path("reminders_secret.wal"), notifier.clone(), clock)
        .unwrap()
        .with_job_secret(Some("s3cret".into()));
    let author_id = Ulid::new();
    let type_id = Ulid::new();
    engine.register_author(profile(author_id, "UTC")).await.unwrap();
    engine
        .add_interview_type(interview_type(type_id, author_id, 0))
        .await
        .unwrap();
    engine
        .create_appointment(BookingRequest {
            author_id: Some(author_id),
            interview_type_id: Some(type_id),
            start_at: Some(utc(2031, 6, 1, 1, 0)),
            end_at: Some(utc(2031, 6, 1, 2, 0)),
            customer_timezone: Some("UTC".into()),
            customer_email: Some("c@example.test".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    notifier.wait_for(2).await;

    assert!(matches!(
        engine.run_reminder_job(None).await,
        Err(EngineError::Unauthorized)
    ));
    assert!(matches!(
        engine.run_reminder_job(Some("guess")).await,
        Err(EngineError::Unauthorized)
    ));
    let due = engine.run_reminder_job(Some("s3cret")).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].lead, ReminderLead::HourAhead);

    let notices = notifier.wait_for(4).await;
    let reminders: Vec<_> = notices
        .iter()
        .filter(|n| matches!(n.kind, NoticeKind::Reminder { .. }))
        .collect();
    assert_eq!(reminders.len(), 2);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let clock = Arc::new(FixedClock::new(utc(2031, 6, 1, 0, 0)));
    let author_id = Ulid::new();
    let type_id = Ulid::new();
    let appt_id;
    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap();
        engine.register_author(profile(author_id, "UTC")).await.unwrap();
        engine
            .add_interview_type(interview_type(type_id, author_id, 0))
            .await
            .unwrap();
        engine.add_rule(Ulid::new(), author_id, 1, hm(9, 0), hm(12, 0)).await.unwrap();
        let appt = engine
            .create_appointment(BookingRequest {
                author_id: Some(author_id),
                interview_type_id: Some(type_id),
                start_at: Some(monday(9, 0)),
                end_at: Some(monday(10, 0)),
                customer_timezone: Some("UTC".into()),
                customer_email: Some("c@example.test".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        engine
            .reschedule_appointment(appt.id, monday(10, 0), monday(11, 0))
            .await
            .unwrap();
        appt_id = appt.id;
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap();
    let appt = engine.get_appointment(appt_id).await.unwrap();
    assert_eq!(appt.start_at_utc, monday(10, 0));
    let history = engine.appointment_history(appt_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(is_consistent(&history));
    assert_eq!(engine.list_rules(author_id).await.unwrap().len(), 1);

    // The restored appointment still blocks its time.
    let err = engine
        .create_appointment(BookingRequest {
            author_id: Some(author_id),
            interview_type_id: Some(type_id),
            start_at: Some(monday(10, 30)),
            end_at: Some(monday(11, 30)),
            customer_timezone: Some("UTC".into()),
            customer_email: Some("d@example.test".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == appt_id));
}

#[tokio::test]
async fn compaction_keeps_audit_and_rule_state() {
    let path = test_wal_path("compaction.wal");
    let clock = Arc::new(FixedClock::new(utc(2031, 6, 1, 0, 0)));
    let author_id = Ulid::new();
    let type_id = Ulid::new();
    let rule_id = Ulid::new();
    let first;
    let second;
    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap();
        engine.register_author(profile(author_id, "UTC")).await.unwrap();
        engine
            .add_interview_type(interview_type(type_id, author_id, 0))
            .await
            .unwrap();
        engine.add_rule(rule_id, author_id, 1, hm(9, 0), hm(12, 0)).await.unwrap();
        engine.set_rule_active(rule_id, false).await.unwrap();
        let req = BookingRequest {
            author_id: Some(author_id),
            interview_type_id: Some(type_id),
            start_at: Some(monday(9, 0)),
            end_at: Some(monday(10, 0)),
            customer_timezone: Some("UTC".into()),
            customer_email: Some("c@example.test".into()),
            ..Default::default()
        };
        first = engine.create_appointment(req.clone()).await.unwrap();
        engine.cancel_appointment(first.id, Some("sick".into())).await.unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        second = engine.create_appointment(req).await.unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), clock).unwrap();
    let history = engine.appointment_history(first.id).await.unwrap();
    assert_eq!(
        history.iter().map(|e| e.action).collect::<Vec<_>>(),
        vec![AuditAction::Created, AuditAction::Cancelled]
    );
    assert_eq!(history[1].note.as_deref(), Some("sick"));
    assert_eq!(
        engine.get_appointment(first.id).await.unwrap().status,
        AppointmentStatus::Cancelled
    );
    assert_eq!(engine.get_appointment(second.id).await.unwrap(), second);
    let rules = engine.list_rules(author_id).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert!(!rules[0].active);
}

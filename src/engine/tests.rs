use super::*;
use crate::limits::*;
use crate::notify::testing::{RecordingMailer, recording_notifier};
use crate::notify::{Invoice, InvoiceLine};

use tokio_test::{assert_err, assert_ok};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("shopbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn t(s: &str) -> TimeOfDay {
    s.parse().unwrap()
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 6, 3).unwrap()
}

fn tuesday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 6, 4).unwrap()
}

struct Shop {
    engine: Arc<Engine>,
    mailer: Arc<RecordingMailer>,
    oil: Ulid,
    brakes: Ulid,
}

async fn shop(name: &str) -> Shop {
    let (notifier, mailer) = recording_notifier();
    let engine = Arc::new(Engine::new(test_wal_path(name), notifier).unwrap());
    let oil = Ulid::new();
    let brakes = Ulid::new();
    engine.add_service(oil, "Oil Change", 30, true).await.unwrap();
    engine
        .add_service(brakes, "Brake Inspection", 45, true)
        .await
        .unwrap();
    Shop {
        engine,
        mailer,
        oil,
        brakes,
    }
}

fn request(date: NaiveDate, time: &str, services: &[Ulid]) -> BookingRequest {
    BookingRequest {
        customer: Customer {
            name: "Dana Whitfield".into(),
            email: "dana@example.ca".into(),
            phone: "902-555-0147".into(),
        },
        vehicle: Vehicle {
            make: "Honda".into(),
            model: "Civic".into(),
            year: 2016,
        },
        date,
        time: t(time),
        service_ids: services.to_vec(),
        notes: None,
    }
}

fn assert_no_overlaps(spans: &[Span]) {
    for (i, a) in spans.iter().enumerate() {
        for b in &spans[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn booking_two_services_blocks_seventy_five_minutes() {
    let s = shop("scenario_75.wal").await;
    let both = [s.oil, s.brakes];

    let first = s
        .engine
        .submit_booking(request(monday(), "09:00", &both))
        .await
        .unwrap();
    assert_eq!(first.duration_minutes, 75);
    assert_eq!(first.span(), Span::new(540, 615));

    match s
        .engine
        .submit_booking(request(monday(), "09:30", &both))
        .await
    {
        Err(EngineError::SlotUnavailable { conflicting, time, .. }) => {
            assert_eq!(conflicting, first.id);
            assert_eq!(time, t("09:30"));
        }
        other => panic!("expected SlotUnavailable, got {other:?}"),
    }

    let touching = s
        .engine
        .submit_booking(request(monday(), "10:15", &both))
        .await
        .unwrap();
    assert_eq!(touching.span(), Span::new(615, 690));
    assert_eq!(
        s.engine.occupied_spans(monday()).await,
        vec![Span::new(540, 615), Span::new(615, 690)]
    );
}

#[tokio::test]
async fn booking_returns_pending_appointment_with_code() {
    let s = shop("book_basic.wal").await;
    let mut req = request(monday(), "11:00", &[s.oil]);
    req.customer.email = "  dana@example.ca ".into();
    req.notes = Some(" squeaky brakes ".into());

    let appt = s.engine.submit_booking(req).await.unwrap();
    assert_eq!(appt.status, AppointmentStatus::Pending);
    assert_eq!(appt.customer.email, "dana@example.ca");
    assert_eq!(appt.notes.as_deref(), Some("squeaky brakes"));
    assert_eq!(appt.confirmation_code.len(), CONFIRMATION_CODE_LEN);
    assert!(
        appt.confirmation_code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    );
    assert_eq!(s.engine.get_appointment(appt.id).unwrap(), appt);
    assert_eq!(s.engine.appointments_on(monday()).len(), 1);
}

#[tokio::test]
async fn rejected_booking_leaves_no_trace() {
    let s = shop("book_rejected.wal").await;

    let mut bad_email = request(monday(), "09:00", &[s.oil]);
    bad_email.customer.email = "not-an-email".into();
    assert!(matches!(
        s.engine.submit_booking(bad_email).await,
        Err(EngineError::Validation(_))
    ));

    let unknown = Ulid::new();
    assert!(matches!(
        s.engine
            .submit_booking(request(monday(), "09:00", &[unknown]))
            .await,
        Err(EngineError::UnknownService(id)) if id == unknown
    ));

    assert!(matches!(
        s.engine.submit_booking(request(monday(), "08:30", &[s.oil])).await,
        Err(EngineError::OutsideBusinessHours(_))
    ));
    assert!(matches!(
        s.engine.submit_booking(request(monday(), "17:30", &[s.oil])).await,
        Err(EngineError::OutsideBusinessHours(_))
    ));

    assert!(s.engine.appointments_on(monday()).is_empty());
    assert!(s.engine.occupied_spans(monday()).await.is_empty());
    assert!(s.engine.codes.is_empty());
}

#[tokio::test]
async fn closing_time_is_a_valid_start() {
    let s = shop("book_closing.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "17:00", &[s.brakes]))
        .await
        .unwrap();
    assert_eq!(appt.span(), Span::new(1020, 1065));
}

#[tokio::test]
async fn submission_after_slot_was_taken_is_refused() {
    let s = shop("book_stale_view.wal").await;
    let offered = s
        .engine
        .available_slots(monday(), &[s.oil], None)
        .await
        .unwrap();
    assert!(offered.contains(&t("13:00")));

    // Someone else takes 13:00 while the first customer is still typing.
    s.engine
        .submit_booking(request(monday(), "13:00", &[s.oil]))
        .await
        .unwrap();

    let late = s
        .engine
        .submit_booking(request(monday(), "13:00", &[s.oil]))
        .await;
    assert!(matches!(late, Err(EngineError::SlotUnavailable { .. })));
    assert_eq!(s.engine.appointments_on(monday()).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_for_one_slot_admit_exactly_one() {
    let s = shop("book_race.wal").await;
    let mut handles = Vec::new();
    for _ in 0..24 {
        let engine = s.engine.clone();
        let oil = s.oil;
        handles.push(tokio::spawn(async move {
            engine
                .submit_booking(request(monday(), "10:00", &[oil]))
                .await
        }));
    }

    let mut booked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::SlotUnavailable { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 1);
    assert_eq!(s.engine.occupied_spans(monday()).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mixed_bookings_never_overlap() {
    let s = shop("book_mixed_race.wal").await;
    let mut handles = Vec::new();
    for i in 0..60 {
        let engine = s.engine.clone();
        let services = if i % 3 == 0 {
            vec![s.oil, s.brakes]
        } else if i % 3 == 1 {
            vec![s.brakes]
        } else {
            vec![s.oil]
        };
        let slot = engine.grid().slots()[i % engine.grid().slots().len()];
        handles.push(tokio::spawn(async move {
            let mut req = request(monday(), "09:00", &services);
            req.time = slot;
            engine.submit_booking(req).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Ok(_) | Err(EngineError::SlotUnavailable { .. })
        ));
    }

    let spans = s.engine.occupied_spans(monday()).await;
    assert!(!spans.is_empty());
    assert_no_overlaps(&spans);
}

#[tokio::test]
async fn confirmation_codes_retry_on_collision() {
    let s = shop("code_collision.wal").await;
    let taken = Ulid::new();
    s.engine.codes.insert("AAAAAAAA".into(), taken);

    let mut draws = vec!["BBBBBBBB".to_string(), "AAAAAAAA".to_string()];
    let code = s
        .engine
        .reserve_code(Ulid::new(), || draws.pop().unwrap())
        .unwrap();
    assert_eq!(code, "BBBBBBBB");

    let exhausted = s
        .engine
        .reserve_code(Ulid::new(), || "AAAAAAAA".to_string());
    assert!(matches!(exhausted, Err(EngineError::CodeSpaceExhausted)));
    assert_eq!(*s.engine.codes.get("AAAAAAAA").unwrap(), taken);
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn availability_drops_overlapping_grid_entries() {
    let s = shop("avail_basic.wal").await;
    s.engine
        .submit_booking(request(monday(), "10:00", &[s.oil, s.oil]))
        .await
        .unwrap();
    // Duplicates collapse: one oil change, 30 minutes.
    let free = s
        .engine
        .available_slots(monday(), &[s.oil], None)
        .await
        .unwrap();
    assert!(free.contains(&t("09:30")));
    assert!(!free.contains(&t("10:00")));
    assert!(free.contains(&t("10:30")));

    let other_day = s
        .engine
        .available_slots(tuesday(), &[s.oil], None)
        .await
        .unwrap();
    assert_eq!(other_day, s.engine.grid().slots());
}

#[tokio::test]
async fn availability_with_no_services_is_the_whole_grid() {
    let s = shop("avail_empty.wal").await;
    s.engine
        .submit_booking(request(monday(), "09:00", &[s.brakes]))
        .await
        .unwrap();
    let all = s.engine.available_slots(monday(), &[], None).await.unwrap();
    assert_eq!(all.len(), 17);
}

#[tokio::test]
async fn repeated_service_counts_once_in_availability_and_booking() {
    let s = shop("avail_repeated.wal").await;
    s.engine
        .submit_booking(request(monday(), "10:00", &[s.oil]))
        .await
        .unwrap();

    let once = s.engine.available_slots(monday(), &[s.oil], None).await.unwrap();
    let twice = s
        .engine
        .available_slots(monday(), &[s.oil, s.oil], None)
        .await
        .unwrap();
    assert_eq!(twice, once);
    assert!(twice.contains(&t("09:30")));

    let booked = s
        .engine
        .submit_booking(request(monday(), "09:30", &[s.oil, s.oil]))
        .await
        .unwrap();
    assert_eq!(booked.duration_minutes, 30);
    assert_eq!(booked.service_ids, vec![s.oil]);
}

// ── Reschedule ───────────────────────────────────────────

#[tokio::test]
async fn reschedule_to_own_slot_is_allowed() {
    let s = shop("resched_self.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "14:00", &[s.brakes]))
        .await
        .unwrap();

    let offered = s
        .engine
        .available_slots(monday(), &appt.service_ids, Some(appt.id))
        .await
        .unwrap();
    assert!(offered.contains(&t("14:00")));
    let without_exclusion = s
        .engine
        .available_slots(monday(), &appt.service_ids, None)
        .await
        .unwrap();
    assert!(!without_exclusion.contains(&t("14:00")));

    let same = s
        .engine
        .reschedule_appointment(appt.id, monday(), t("14:00"))
        .await
        .unwrap();
    assert_eq!(same.span(), appt.span());

    // Shifting into its own interval is fine too.
    let shifted = s
        .engine
        .reschedule_appointment(appt.id, monday(), t("14:30"))
        .await
        .unwrap();
    assert_eq!(s.engine.occupied_spans(monday()).await, vec![shifted.span()]);
}

#[tokio::test]
async fn reschedule_into_another_booking_fails_and_changes_nothing() {
    let s = shop("resched_conflict.wal").await;
    let a = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();
    let b = s
        .engine
        .submit_booking(request(monday(), "11:00", &[s.brakes]))
        .await
        .unwrap();

    match s
        .engine
        .reschedule_appointment(a.id, monday(), t("11:30"))
        .await
    {
        Err(EngineError::SlotUnavailable { conflicting, .. }) => assert_eq!(conflicting, b.id),
        other => panic!("expected SlotUnavailable, got {other:?}"),
    }
    assert_eq!(s.engine.get_appointment(a.id).unwrap().time, t("09:00"));
    assert_eq!(s.mailer.wait_for(2).await.len(), 2);
}

#[tokio::test]
async fn reschedule_across_days_moves_the_occupancy() {
    let s = shop("resched_days.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();

    let moved = s
        .engine
        .reschedule_appointment(appt.id, tuesday(), t("15:00"))
        .await
        .unwrap();
    assert_eq!(moved.date, tuesday());
    assert_eq!(moved.confirmation_code, appt.confirmation_code);
    assert!(s.engine.occupied_spans(monday()).await.is_empty());
    assert_eq!(
        s.engine.occupied_spans(tuesday()).await,
        vec![Span::new(900, 930)]
    );
    assert!(s.engine.appointments_on(monday()).is_empty());
    assert_eq!(s.engine.appointments_on(tuesday()).len(), 1);
}

#[tokio::test]
async fn terminal_appointments_cannot_be_rescheduled() {
    let s = shop("resched_terminal.wal").await;
    let done = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();
    s.engine
        .set_status(done.id, AppointmentStatus::InProgress)
        .await
        .unwrap();
    s.engine.complete_appointment(done.id, None).await.unwrap();

    match s
        .engine
        .reschedule_appointment(done.id, tuesday(), t("10:00"))
        .await
    {
        Err(EngineError::Terminal { status, .. }) => {
            assert_eq!(status, AppointmentStatus::Complete)
        }
        other => panic!("expected Terminal, got {other:?}"),
    }
    // The state check runs first: no day book was created for the target date.
    assert!(!s.engine.days.contains_key(&tuesday()));

    let gone = s
        .engine
        .submit_booking(request(monday(), "12:00", &[s.oil]))
        .await
        .unwrap();
    s.engine
        .set_status(gone.id, AppointmentStatus::Cancelled)
        .await
        .unwrap();
    assert!(matches!(
        s.engine
            .reschedule_appointment(gone.id, monday(), t("13:00"))
            .await,
        Err(EngineError::Terminal { .. })
    ));
}

#[tokio::test]
async fn reschedule_unknown_appointment() {
    let s = shop("resched_unknown.wal").await;
    let id = Ulid::new();
    assert!(matches!(
        s.engine.reschedule_appointment(id, monday(), t("10:00")).await,
        Err(EngineError::NotFound(missing)) if missing == id
    ));
}

#[tokio::test]
async fn reschedule_keeps_duration_of_deactivated_service() {
    let s = shop("resched_inactive.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.brakes]))
        .await
        .unwrap();
    s.engine.deactivate_service(s.brakes).await.unwrap();

    let moved = s
        .engine
        .reschedule_appointment(appt.id, monday(), t("16:00"))
        .await
        .unwrap();
    assert_eq!(moved.span(), Span::new(960, 1005));

    let offered = s
        .engine
        .available_slots(monday(), &[s.brakes], Some(appt.id))
        .await
        .unwrap();
    assert!(offered.contains(&t("16:00")));
}

// ── Status changes ───────────────────────────────────────

#[tokio::test]
async fn cancelling_frees_the_exact_interval() {
    let s = shop("cancel_frees.wal").await;
    let both = [s.oil, s.brakes];
    let first = s
        .engine
        .submit_booking(request(monday(), "10:00", &both))
        .await
        .unwrap();
    s.engine
        .set_status(first.id, AppointmentStatus::Cancelled)
        .await
        .unwrap();
    assert!(s.engine.occupied_spans(monday()).await.is_empty());

    let again = s
        .engine
        .submit_booking(request(monday(), "10:00", &both))
        .await
        .unwrap();
    assert_eq!(again.span(), first.span());
    assert_ne!(again.confirmation_code, first.confirmation_code);
    assert_eq!(s.engine.appointments_on(monday()).len(), 2);
}

#[tokio::test]
async fn status_follows_the_lifecycle() {
    let s = shop("status_lifecycle.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();

    assert!(matches!(
        s.engine.set_status(appt.id, AppointmentStatus::Complete).await,
        Err(EngineError::InvalidTransition {
            from: AppointmentStatus::Pending,
            to: AppointmentStatus::Complete
        })
    ));
    assert_ok!(s.engine.set_status(appt.id, AppointmentStatus::InProgress).await);
    assert_ok!(s.engine.set_status(appt.id, AppointmentStatus::Complete).await);
    assert_err!(s.engine.set_status(appt.id, AppointmentStatus::Cancelled).await);
    assert_err!(s.engine.set_status(appt.id, AppointmentStatus::Pending).await);

    // Completed work still blocks its interval.
    assert_eq!(s.engine.occupied_spans(monday()).await, vec![appt.span()]);
}

#[tokio::test]
async fn in_progress_appointments_can_be_cancelled_by_staff() {
    let s = shop("status_cancel_in_progress.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();
    s.engine
        .set_status(appt.id, AppointmentStatus::InProgress)
        .await
        .unwrap();
    let cancelled = s
        .engine
        .set_status(appt.id, AppointmentStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert!(s.engine.occupied_spans(monday()).await.is_empty());
}

// ── Customer self-service ────────────────────────────────

#[tokio::test]
async fn lookup_requires_matching_contact() {
    let s = shop("lookup.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();
    let code = appt.confirmation_code.to_lowercase();

    let by_email = s
        .engine
        .lookup_appointment(&code, &Contact::Email("dana@example.ca".into()))
        .unwrap();
    assert_eq!(by_email.id, appt.id);
    let by_phone = s
        .engine
        .lookup_appointment(
            &appt.confirmation_code,
            &Contact::Phone(" 902-555-0147 ".into()),
        )
        .unwrap();
    assert_eq!(by_phone.id, appt.id);

    assert!(matches!(
        s.engine
            .lookup_appointment(&code, &Contact::Email("someone@example.ca".into())),
        Err(EngineError::NoMatchingBooking)
    ));
    assert!(matches!(
        s.engine
            .lookup_appointment("ZZZZZZZZ", &Contact::Email("dana@example.ca".into())),
        Err(EngineError::NoMatchingBooking)
    ));
}

#[tokio::test]
async fn customer_cancellation_is_pending_only() {
    let s = shop("customer_cancel.wal").await;
    let contact = Contact::Email("dana@example.ca".into());

    let pending = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();
    let cancelled = s
        .engine
        .cancel_by_customer(&pending.confirmation_code, &contact)
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    // A cancelled booking no longer resolves.
    assert!(matches!(
        s.engine
            .lookup_appointment(&pending.confirmation_code, &contact),
        Err(EngineError::NoMatchingBooking)
    ));

    let started = s
        .engine
        .submit_booking(request(monday(), "11:00", &[s.oil]))
        .await
        .unwrap();
    s.engine
        .set_status(started.id, AppointmentStatus::InProgress)
        .await
        .unwrap();
    assert!(matches!(
        s.engine
            .cancel_by_customer(&started.confirmation_code, &contact)
            .await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn each_change_notifies_the_customer() {
    let s = shop("notify_flow.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil, s.brakes]))
        .await
        .unwrap();
    s.engine
        .reschedule_appointment(appt.id, tuesday(), t("10:00"))
        .await
        .unwrap();
    s.engine
        .set_status(appt.id, AppointmentStatus::InProgress)
        .await
        .unwrap();
    let invoice = Invoice {
        lines: vec![
            InvoiceLine {
                service: "Oil Change".into(),
                cost_cents: 4999,
            },
            InvoiceLine {
                service: "Brake Inspection".into(),
                cost_cents: 8000,
            },
        ],
        items_purchased: None,
        subtotal_cents: 12999,
        taxes_cents: 1950,
        total_cents: 14949,
    };
    s.engine
        .complete_appointment(appt.id, Some(invoice))
        .await
        .unwrap();

    let sent = s.mailer.wait_for(4).await;
    assert_eq!(sent.len(), 4);
    assert!(sent.iter().all(|e| e.to == "dana@example.ca"));
    assert!(sent[0].subject.starts_with("Appointment Confirmation"));
    assert!(sent[0].html.contains(&appt.confirmation_code));
    assert!(sent[0].html.contains("Oil Change, Brake Inspection"));
    assert!(sent[1].subject.starts_with("Appointment Updated"));
    assert!(sent[1].html.contains("Tuesday, June 4, 2030"));
    assert!(sent[2].subject.starts_with("Service In Progress"));
    assert!(sent[3].subject.starts_with("Service Complete"));
    assert!(sent[3].html.contains("$149.49"));
}

#[tokio::test]
async fn refused_operations_send_nothing() {
    let s = shop("notify_refused.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();
    let _ = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await;
    let _ = s.engine.set_status(appt.id, AppointmentStatus::Complete).await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(s.mailer.sent().len(), 1);
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn catalog_rules() {
    let s = shop("catalog.wal").await;
    assert!(matches!(
        s.engine.add_service(s.oil, "Oil Change", 30, true).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        s.engine.add_service(Ulid::new(), "Rebuild", 0, true).await,
        Err(EngineError::Validation(_))
    ));

    let names: Vec<String> = s
        .engine
        .list_services(false)
        .into_iter()
        .map(|svc| svc.name)
        .collect();
    assert_eq!(names, vec!["Brake Inspection", "Oil Change"]);

    s.engine.deactivate_service(s.oil).await.unwrap();
    assert_eq!(s.engine.list_services(false).len(), 1);
    assert_eq!(s.engine.list_services(true).len(), 2);
    assert!(!s.engine.get_service(s.oil).unwrap().active);
    assert!(matches!(
        s.engine.submit_booking(request(monday(), "09:00", &[s.oil])).await,
        Err(EngineError::InactiveService(id)) if id == s.oil
    ));
    assert!(matches!(
        s.engine.deactivate_service(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_appointments_and_occupancy() {
    let path = test_wal_path("replay.wal");
    let (ids, codes) = {
        let (notifier, _mailer) = recording_notifier();
        let engine = Engine::new(path.clone(), notifier).unwrap();
        let oil = Ulid::new();
        engine.add_service(oil, "Oil Change", 30, true).await.unwrap();
        let a = engine
            .submit_booking(request(monday(), "09:00", &[oil]))
            .await
            .unwrap();
        let b = engine
            .submit_booking(request(monday(), "10:00", &[oil]))
            .await
            .unwrap();
        let c = engine
            .submit_booking(request(monday(), "11:00", &[oil]))
            .await
            .unwrap();
        engine
            .reschedule_appointment(b.id, tuesday(), t("13:00"))
            .await
            .unwrap();
        engine
            .set_status(c.id, AppointmentStatus::Cancelled)
            .await
            .unwrap();
        engine.deactivate_service(oil).await.unwrap();
        (
            [a.id, b.id, c.id],
            [a.confirmation_code, b.confirmation_code, c.confirmation_code],
        )
    };

    let (notifier, _mailer) = recording_notifier();
    let engine = Engine::new(path, notifier).unwrap();
    assert_eq!(engine.occupied_spans(monday()).await, vec![Span::new(540, 570)]);
    assert_eq!(engine.occupied_spans(tuesday()).await, vec![Span::new(780, 810)]);
    assert_eq!(
        engine.get_appointment(ids[2]).unwrap().status,
        AppointmentStatus::Cancelled
    );
    assert_eq!(engine.list_services(true).len(), 1);
    assert!(engine.list_services(false).is_empty());
    for (id, code) in ids.iter().zip(codes.iter()) {
        assert_eq!(*engine.codes.get(code).unwrap(), *id);
    }
}

#[tokio::test]
async fn compaction_preserves_state_across_restart() {
    let path = test_wal_path("compact_restart.wal");
    let kept = {
        let (notifier, _mailer) = recording_notifier();
        let engine = Engine::new(path.clone(), notifier).unwrap();
        let oil = Ulid::new();
        engine.add_service(oil, "Oil Change", 30, true).await.unwrap();
        let mut kept = None;
        for slot in ["09:00", "10:00", "11:00", "12:00"] {
            let appt = engine
                .submit_booking(request(monday(), slot, &[oil]))
                .await
                .unwrap();
            engine
                .reschedule_appointment(appt.id, monday(), t(slot))
                .await
                .unwrap();
            engine
                .set_status(appt.id, AppointmentStatus::Cancelled)
                .await
                .unwrap();
            kept = Some(appt);
        }
        let last = kept.unwrap();
        let live = engine
            .submit_booking(request(monday(), "15:00", &[oil]))
            .await
            .unwrap();

        let size_before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let size_after = std::fs::metadata(&path).unwrap().len();
        assert!(size_after < size_before);

        // Appended after compaction, must survive too.
        engine
            .set_status(live.id, AppointmentStatus::InProgress)
            .await
            .unwrap();
        (last, live)
    };

    let (notifier, _mailer) = recording_notifier();
    let engine = Engine::new(path, notifier).unwrap();
    assert_eq!(engine.appointments_on(monday()).len(), 5);
    assert_eq!(
        engine.get_appointment(kept.0.id).unwrap().status,
        AppointmentStatus::Cancelled
    );
    assert_eq!(
        engine.get_appointment(kept.1.id).unwrap().status,
        AppointmentStatus::InProgress
    );
    assert_eq!(engine.occupied_spans(monday()).await, vec![Span::new(900, 930)]);
    // Codes of cancelled appointments stay reserved.
    assert!(engine.codes.contains_key(&kept.0.confirmation_code));
}

// ── WAL failures ─────────────────────────────────────────

/// Point the engine at a WAL writer that is gone, so every append fails.
fn disconnect_wal(engine: &mut Arc<Engine>) {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    Arc::get_mut(engine).unwrap().wal_tx = tx;
}

#[tokio::test]
async fn failed_wal_append_leaves_no_booking() {
    let mut s = shop("wal_down_booking.wal").await;
    disconnect_wal(&mut s.engine);

    let err = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WalError(_)), "got {err:?}");

    assert!(s.engine.codes.is_empty());
    assert!(s.engine.appointments_on(monday()).is_empty());
    assert!(s.engine.occupied_spans(monday()).await.is_empty());
    assert_eq!(
        s.engine.available_slots(monday(), &[s.oil], None).await.unwrap(),
        s.engine.grid().slots().to_vec()
    );

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(s.mailer.sent().is_empty());
}

#[tokio::test]
async fn failed_wal_append_leaves_appointment_in_place() {
    let mut s = shop("wal_down_reschedule.wal").await;
    let appt = s
        .engine
        .submit_booking(request(monday(), "09:00", &[s.oil]))
        .await
        .unwrap();
    assert_eq!(s.mailer.wait_for(1).await.len(), 1);
    disconnect_wal(&mut s.engine);

    let err = s
        .engine
        .reschedule_appointment(appt.id, tuesday(), t("11:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WalError(_)), "got {err:?}");
    let err = s
        .engine
        .set_status(appt.id, AppointmentStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WalError(_)), "got {err:?}");

    assert_eq!(s.engine.get_appointment(appt.id).unwrap(), appt);
    assert_eq!(s.engine.occupied_spans(monday()).await, vec![appt.span()]);
    assert!(s.engine.occupied_spans(tuesday()).await.is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(s.mailer.sent().len(), 1);
}

use super::*;
use crate::limits::MAX_SCAN_DAYS;
use crate::notify::Audience;
use chrono::{NaiveDate, NaiveTime, TimeZone};

const TZ: chrono_tz::Tz = chrono_tz::America::Sao_Paulo;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()
}

fn day_plus(n: u64) -> NaiveDate {
    day().checked_add_days(chrono::Days::new(n)).unwrap()
}

/// Instant of local `h:m` on `date` in the shop's zone.
fn at_on(date: NaiveDate, h: u32, m: u32) -> Ms {
    TZ.from_local_datetime(&date.and_hms_opt(h, m, 0).unwrap())
        .unwrap()
        .timestamp_millis()
}

fn at(h: u32, m: u32) -> Ms {
    at_on(day(), h, m)
}

fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn settings_row(open_h: u32, close_h: u32, interval: u32, max_concurrent: u32) -> SettingsRow {
    SettingsRow {
        opening_time: time(open_h, 0),
        closing_time: time(close_h, 0),
        slot_interval_minutes: interval,
        max_concurrent,
        timezone: "America/Sao_Paulo".into(),
        lunch_start: time(12, 0),
        lunch_end: time(13, 0),
    }
}

fn service(name: &str, minutes: u32, price: Money, group: Option<&str>) -> Service {
    Service {
        id: Ulid::new(),
        name: name.into(),
        duration_minutes: minutes,
        price,
        active: true,
        exclusivity_group: group.map(String::from),
    }
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bookd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Shop {
    engine: Arc<Engine>,
    clock: TestClock,
    path: PathBuf,
    wash: Service,
    polish: Service,
    ceramic: Service,
}

/// Shop open 08–18 with lunch 12–13. The clock starts the day before at 09:00.
async fn shop(name: &str, row: SettingsRow) -> Shop {
    let path = test_wal_path(name);
    let clock = TestClock::new(at_on(day_plus(0).pred_opt().unwrap(), 9, 0));
    let engine = Engine::with_clock(
        path.clone(),
        Arc::new(NotifyHub::new()),
        None,
        Arc::new(clock.clone()),
    )
    .unwrap();
    engine.put_settings(Actor::Business, row).await.unwrap();

    let wash = service("wash", 60, 5_000, None);
    let polish = service("polish", 180, 20_000, Some("paint"));
    let ceramic = service("ceramic", 360, 90_000, Some("paint"));
    for s in [&wash, &polish, &ceramic] {
        engine.upsert_service(Actor::Business, s.clone()).await.unwrap();
    }
    Shop {
        engine: Arc::new(engine),
        clock,
        path,
        wash,
        polish,
        ceramic,
    }
}

async fn standard_shop(name: &str, max_concurrent: u32) -> Shop {
    shop(name, settings_row(8, 18, 30, max_concurrent)).await
}

fn request(customer_id: Ulid, start: Ms, services: &[&Service]) -> NewAppointment {
    NewAppointment {
        id: Ulid::new(),
        customer_id,
        car_id: Ulid::new(),
        start,
        service_ids: services.iter().map(|s| s.id).collect(),
        notes: None,
    }
}

fn slot_times(slots: &[Slot]) -> Vec<NaiveTime> {
    slots.iter().map(|s| s.local_time).collect()
}

// ── Settings ─────────────────────────────────────────────

#[tokio::test]
async fn availability_without_any_settings_is_configuration_missing() {
    let path = test_wal_path("no_settings.wal");
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), None).unwrap();
    let r = engine.get_availability(day(), &[], false).await;
    assert!(matches!(r, Err(EngineError::ConfigurationMissing)));
}

#[tokio::test]
async fn global_default_settings_apply_until_tenant_row_exists() {
    let path = test_wal_path("global_defaults.wal");
    let global = Arc::new(settings_row(9, 17, 60, 4));
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), Some(global)).unwrap();
    assert_eq!(engine.settings().await.unwrap().max_concurrent, 4);

    engine
        .put_settings(Actor::Business, settings_row(8, 18, 30, 2))
        .await
        .unwrap();
    assert_eq!(engine.settings().await.unwrap().max_concurrent, 2);
}

#[tokio::test]
async fn invalid_settings_are_not_stored() {
    let s = standard_shop("invalid_settings.wal", 1).await;
    let mut bad = settings_row(8, 18, 30, 1);
    bad.timezone = "Nowhere/Special".into();
    assert!(matches!(
        s.engine.put_settings(Actor::Business, bad).await,
        Err(EngineError::InvalidSettings(_))
    ));
    let customer = Actor::Customer(Ulid::new());
    assert!(matches!(
        s.engine.put_settings(customer, settings_row(8, 18, 30, 1)).await,
        Err(EngineError::Forbidden(_))
    ));
    assert_eq!(s.engine.settings().await.unwrap().timezone, TZ);
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn availability_reports_slots_and_totals() {
    let s = standard_shop("availability_totals.wal", 1).await;
    let a = s
        .engine
        .get_availability(day(), &[s.wash.id, s.polish.id], false)
        .await
        .unwrap();
    assert_eq!(a.total_duration_minutes, 240);
    assert_eq!(a.total_price, 25_000);
    let times = slot_times(&a.slots);
    assert_eq!(times.first(), Some(&time(8, 0)));
    // 14:00 + 4h = 18:00 is the last start that fits; lunch starts are absent.
    assert_eq!(times.last(), Some(&time(14, 0)));
    assert!(!times.contains(&time(12, 0)));
    assert!(!times.contains(&time(12, 30)));
    assert!(a.alternatives.is_empty());
}

#[tokio::test]
async fn availability_with_no_services_is_empty() {
    let s = standard_shop("availability_empty.wal", 1).await;
    let a = s.engine.get_availability(day(), &[], true).await.unwrap();
    assert!(a.slots.is_empty());
    assert!(a.alternatives.is_empty());
    assert_eq!(a.total_price, 0);
}

#[tokio::test]
async fn availability_rejects_unknown_and_deactivated_services() {
    let s = standard_shop("availability_unknown.wal", 1).await;
    let missing = Ulid::new();
    assert!(matches!(
        s.engine.get_availability(day(), &[s.wash.id, missing], false).await,
        Err(EngineError::UnknownService(id)) if id == missing
    ));

    s.engine
        .deactivate_service(Actor::Business, s.wash.id)
        .await
        .unwrap();
    assert!(matches!(
        s.engine.get_availability(day(), &[s.wash.id], false).await,
        Err(EngineError::UnknownService(_))
    ));
    // Still listed, just inactive.
    let wash = s
        .engine
        .list_services()
        .into_iter()
        .find(|x| x.id == s.wash.id)
        .unwrap();
    assert!(!wash.active);
}

#[tokio::test]
async fn availability_rejects_exclusive_combination() {
    let s = standard_shop("availability_exclusive.wal", 1).await;
    assert!(matches!(
        s.engine
            .get_availability(day(), &[s.polish.id, s.ceramic.id], false)
            .await,
        Err(EngineError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn booked_slot_leaves_availability() {
    let s = standard_shop("booked_slot.wal", 1).await;
    let customer = Ulid::new();
    s.engine
        .create_appointment(Actor::Business, request(customer, at(9, 0), &[&s.wash]))
        .await
        .unwrap();
    let a = s.engine.get_availability(day(), &[s.wash.id], false).await.unwrap();
    let times = slot_times(&a.slots);
    assert!(times.contains(&time(8, 0)));
    assert!(!times.contains(&time(8, 30)));
    assert!(!times.contains(&time(9, 0)));
    assert!(!times.contains(&time(9, 30)));
    assert!(times.contains(&time(10, 0)));
}

#[tokio::test]
async fn full_day_offers_alternatives() {
    let s = shop("alternatives.wal", settings_row(8, 9, 60, 1)).await;
    s.engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(8, 0), &[&s.wash]))
        .await
        .unwrap();

    let plain = s.engine.get_availability(day(), &[s.wash.id], false).await.unwrap();
    assert!(plain.slots.is_empty());
    assert!(plain.alternatives.is_empty());

    let a = s.engine.get_availability(day(), &[s.wash.id], true).await.unwrap();
    assert!(a.slots.is_empty());
    let days: Vec<NaiveDate> = a.alternatives.iter().map(|d| d.day).collect();
    assert_eq!(days, vec![day_plus(1), day_plus(2), day_plus(3)]);
    assert_eq!(a.alternatives[0].slots[0].start, at_on(day_plus(1), 8, 0));
}

#[tokio::test]
async fn suggestions_respect_day_cap_and_horizon() {
    let s = shop("suggest_caps.wal", settings_row(8, 9, 60, 1)).await;

    let two = s
        .engine
        .suggest_next_available(day(), &[s.wash.id], 2)
        .await
        .unwrap();
    assert_eq!(two.len(), 2);

    let many = s
        .engine
        .suggest_next_available(day(), &[s.wash.id], 30)
        .await
        .unwrap();
    assert_eq!(many.len(), 3);

    // Fill the whole horizon: nothing further out is considered.
    for n in 0..u64::from(MAX_SCAN_DAYS) {
        s.engine
            .create_appointment(
                Actor::Business,
                request(Ulid::new(), at_on(day_plus(n), 8, 0), &[&s.wash]),
            )
            .await
            .unwrap();
    }
    let none = s
        .engine
        .suggest_next_available(day(), &[s.wash.id], 30)
        .await
        .unwrap();
    assert!(none.is_empty());
}

// ── Creation ─────────────────────────────────────────────

#[tokio::test]
async fn initial_status_depends_on_who_books() {
    let s = standard_shop("initial_status.wal", 2).await;
    let customer = Ulid::new();

    let by_shop = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    assert_eq!(by_shop.status, Status::Confirmed);
    assert_eq!(by_shop.confirmed_by_business_at, Some(s.clock.now_ms()));

    let by_customer = s
        .engine
        .create_appointment(Actor::Customer(customer), request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    assert_eq!(by_customer.status, Status::Pending);
    assert_eq!(by_customer.version, 1);

    let stranger = Actor::Customer(Ulid::new());
    assert!(matches!(
        s.engine
            .create_appointment(stranger, request(customer, at(10, 0), &[&s.wash]))
            .await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn lunch_spanning_booking_ends_after_break() {
    let s = standard_shop("lunch_span.wal", 1).await;
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(8, 0), &[&s.ceramic]))
        .await
        .unwrap();
    assert_eq!(appt.span, Span::new(at(8, 0), at(15, 0)));

    let short = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(15, 0), &[&s.polish]))
        .await
        .unwrap();
    assert_eq!(short.span, Span::new(at(15, 0), at(18, 0)));
}

#[tokio::test]
async fn create_rejections() {
    let s = standard_shop("create_rejections.wal", 1).await;
    let c = Ulid::new();
    let r = s
        .engine
        .create_appointment(Actor::Business, request(c, at(12, 30), &[&s.wash]))
        .await;
    assert!(matches!(r, Err(EngineError::SlotRejected(SlotRejection::DuringLunch))));

    let r = s
        .engine
        .create_appointment(Actor::Business, request(c, at(17, 30), &[&s.wash]))
        .await;
    assert!(matches!(
        r,
        Err(EngineError::SlotRejected(SlotRejection::OutsideBusinessHours))
    ));

    let yesterday = at_on(day().pred_opt().unwrap(), 8, 0);
    let r = s
        .engine
        .create_appointment(Actor::Business, request(c, yesterday, &[&s.wash]))
        .await;
    assert!(matches!(r, Err(EngineError::SlotRejected(SlotRejection::InPast))));

    let r = s
        .engine
        .create_appointment(Actor::Business, request(c, at(9, 0), &[]))
        .await;
    assert!(matches!(r, Err(EngineError::InvalidRequest(_))));

    let first = s
        .engine
        .create_appointment(Actor::Business, request(c, at(9, 0), &[&s.wash]))
        .await
        .unwrap();
    let mut dup = request(c, at(14, 0), &[&s.wash]);
    dup.id = first.id;
    assert!(matches!(
        s.engine.create_appointment(Actor::Business, dup).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert_eq!(s.engine.appointment_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_fill_exactly_capacity() {
    for capacity in [1u32, 3] {
        let s = standard_shop(&format!("race_{capacity}.wal"), capacity).await;
        let mut handles = Vec::new();
        for _ in 0..(capacity + 5) {
            let engine = s.engine.clone();
            let req = request(Ulid::new(), at(10, 0), &[&s.wash]);
            handles.push(tokio::spawn(async move {
                engine.create_appointment(Actor::Business, req).await
            }));
        }
        let mut ok = 0;
        let mut full = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EngineError::CapacityExceeded(n)) => {
                    assert_eq!(n, capacity);
                    full += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, capacity);
        assert_eq!(full, 5);
    }
}

#[tokio::test]
async fn prices_are_frozen_at_booking() {
    let s = standard_shop("frozen_price.wal", 1).await;
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    let mut pricier = s.wash.clone();
    pricier.price = 9_000;
    s.engine.upsert_service(Actor::Business, pricier).await.unwrap();

    let stored = s.engine.get_appointment(Actor::Business, appt.id).await.unwrap();
    assert_eq!(stored.total_price, 5_000);
    assert_eq!(stored.lines[0].price, 5_000);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_with_automatic_transitions() {
    let s = standard_shop("full_lifecycle.wal", 1).await;
    let customer = Ulid::new();
    let me = Actor::Customer(customer);
    let appt = s
        .engine
        .create_appointment(me, request(customer, at(8, 0), &[&s.polish]))
        .await
        .unwrap();

    // 23h before start: inside the confirmation window.
    let appt = s
        .engine
        .update_status(me, appt.id, Target::ConfirmedByClient, Some(1))
        .await
        .unwrap();
    assert_eq!(appt.status, Status::ConfirmedByClient);
    let appt = s
        .engine
        .update_status(Actor::Business, appt.id, Target::Confirmed, None)
        .await
        .unwrap();
    assert_eq!(appt.version, 3);

    s.clock.set_ms(at(7, 59));
    assert_eq!(s.engine.apply_due_transitions().await, 0);

    s.clock.set_ms(at(8, 0));
    assert_eq!(s.engine.apply_due_transitions().await, 1);
    assert_eq!(s.engine.apply_due_transitions().await, 0);
    let running = s.engine.get_appointment(me, appt.id).await.unwrap();
    assert_eq!(running.status, Status::InProgress);

    s.clock.set_ms(at(11, 0));
    assert_eq!(s.engine.apply_due_transitions().await, 1);
    let done = s.engine.get_appointment(me, appt.id).await.unwrap();
    assert_eq!(done.status, Status::Completed);

    let rep = s.engine.reputation(me, customer).await.unwrap();
    assert_eq!(rep.completed_count, 1);
    assert_eq!(rep.rating, Rating::MAX);
}

#[tokio::test]
async fn confirmation_outside_window_is_rejected() {
    let s = standard_shop("confirm_window.wal", 1).await;
    let customer = Ulid::new();
    let me = Actor::Customer(customer);
    let far = at_on(day_plus(3), 9, 0);
    let appt = s
        .engine
        .create_appointment(me, request(customer, far, &[&s.wash]))
        .await
        .unwrap();
    let r = s
        .engine
        .update_status(me, appt.id, Target::ConfirmedByClient, None)
        .await;
    assert!(matches!(r, Err(EngineError::InvalidTransition { .. })));
    let unchanged = s.engine.get_appointment(me, appt.id).await.unwrap();
    assert_eq!(unchanged, appt);
}

#[tokio::test]
async fn concurrent_scan_ticks_apply_once() {
    let s = standard_shop("scan_ticks.wal", 1).await;
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    s.clock.set_ms(at(8, 15));
    let (a, b) = tokio::join!(
        s.engine.apply_due_transitions(),
        s.engine.apply_due_transitions()
    );
    assert_eq!(a + b, 1);
    let running = s.engine.get_appointment(Actor::Business, appt.id).await.unwrap();
    assert_eq!(running.status, Status::InProgress);
    assert_eq!(running.version, 2);
}

#[tokio::test]
async fn scan_skips_appointment_changed_after_collection() {
    let s = standard_shop("scan_race.wal", 1).await;
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    s.clock.set_ms(at(8, 15));
    let due = s.engine.collect_due_transitions(s.clock.now_ms()).await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].1, StatusKind::Confirmed);

    s.engine
        .update_status(
            Actor::Business,
            appt.id,
            Target::Canceled {
                reason: "storm".into(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(s.engine.apply_due_transitions().await, 0);
    let canceled = s.engine.get_appointment(Actor::Business, appt.id).await.unwrap();
    assert_eq!(canceled.status, Status::Canceled);
}

#[tokio::test]
async fn stale_version_changes_nothing() {
    let s = standard_shop("stale_version.wal", 1).await;
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    let cancel = || Target::Canceled {
        reason: "double booked".into(),
    };
    let r = s
        .engine
        .update_status(Actor::Business, appt.id, cancel(), Some(7))
        .await;
    assert!(matches!(
        r,
        Err(EngineError::StaleVersion {
            expected: 7,
            actual: 1
        })
    ));
    assert!(s
        .engine
        .update_status(Actor::Business, appt.id, cancel(), Some(1))
        .await
        .is_ok());
}

#[tokio::test]
async fn terminal_appointments_reject_transitions() {
    let s = standard_shop("terminal.wal", 1).await;
    let customer = Ulid::new();
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    s.engine
        .update_status(
            Actor::Business,
            appt.id,
            Target::Canceled {
                reason: "closed for holiday".into(),
            },
            None,
        )
        .await
        .unwrap();
    for target in [Target::Confirmed, Target::InProgress, Target::NoShow] {
        let r = s.engine.update_status(Actor::Business, appt.id, target, None).await;
        assert!(matches!(r, Err(EngineError::InvalidTransition { .. })));
    }
    // The canceled slot is free again.
    assert!(s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(8, 0), &[&s.wash]))
        .await
        .is_ok());
}

#[tokio::test]
async fn no_show_requires_advance_then_completion_recovers() {
    let s = standard_shop("no_show.wal", 1).await;
    let customer = Ulid::new();
    let me = Actor::Customer(customer);
    let first = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    assert!(first.advance_payment.is_none());

    let r = s
        .engine
        .update_status(Actor::Business, first.id, Target::NoShow, None)
        .await;
    assert!(matches!(r, Err(EngineError::InvalidTransition { .. })));

    s.clock.set_ms(at(8, 10));
    s.engine
        .update_status(Actor::Business, first.id, Target::NoShow, None)
        .await
        .unwrap();
    let rep = s.engine.reputation(me, customer).await.unwrap();
    assert_eq!(rep.rating, Rating::from_tenths(20));
    assert_eq!(rep.no_show_count, 1);
    assert!(rep.requires_advance_payment);
    assert_eq!(rep.advance_percent, 30);

    let second = s
        .engine
        .create_appointment(
            me,
            request(customer, at_on(day_plus(1), 9, 0), &[&s.wash, &s.polish]),
        )
        .await
        .unwrap();
    assert_eq!(
        second.advance_payment,
        Some(AdvancePayment {
            percent: 30,
            amount: 7_500
        })
    );

    let third = s
        .engine
        .create_appointment(
            Actor::Business,
            request(customer, at_on(day_plus(2), 9, 0), &[&s.wash]),
        )
        .await
        .unwrap();
    s.clock.set_ms(at_on(day_plus(2), 9, 0));
    s.engine
        .update_status(Actor::Business, third.id, Target::InProgress, None)
        .await
        .unwrap();
    s.engine
        .update_status(Actor::Business, third.id, Target::Completed, None)
        .await
        .unwrap();
    let rep = s.engine.reputation(me, customer).await.unwrap();
    assert_eq!(rep.rating, Rating::MAX);
    assert!(!rep.requires_advance_payment);
}

#[tokio::test]
async fn completion_without_recovery_adds_two_tenths() {
    let s = standard_shop("no_recovery.wal", 1).await;
    s.engine
        .put_policy(
            Actor::Business,
            ReputationPolicy {
                recover_on_show: false,
                ..ReputationPolicy::default()
            },
        )
        .await
        .unwrap();
    let customer = Ulid::new();
    let missed = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    let shown = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(10, 0), &[&s.wash]))
        .await
        .unwrap();
    s.clock.set_ms(at(10, 0));
    s.engine
        .update_status(Actor::Business, missed.id, Target::NoShow, None)
        .await
        .unwrap();
    s.engine
        .update_status(Actor::Business, shown.id, Target::InProgress, None)
        .await
        .unwrap();
    s.engine
        .update_status(Actor::Business, shown.id, Target::Completed, None)
        .await
        .unwrap();
    let rep = s.engine.reputation(Actor::Business, customer).await.unwrap();
    assert_eq!(rep.rating, Rating::from_tenths(22));
    assert_eq!(rep.completed_count, 1);
    assert_eq!(rep.no_show_count, 1);
}

#[tokio::test]
async fn accepted_reschedule_matches_fresh_booking() {
    let s = standard_shop("reschedule_roundtrip.wal", 2).await;
    let customer = Ulid::new();
    let me = Actor::Customer(customer);
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.polish]))
        .await
        .unwrap();

    let proposed = s
        .engine
        .update_status(
            Actor::Business,
            appt.id,
            Target::Rescheduled {
                suggested_start: at(10, 0),
                business_notes: "bay 2 is down in the morning".into(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(proposed.suggested_start(), Some(at(10, 0)));
    assert_eq!(proposed.span, appt.span);

    let accepted = s
        .engine
        .update_status(me, appt.id, Target::ConfirmedByClient, None)
        .await
        .unwrap();
    assert_eq!(accepted.suggested_start(), None);
    assert_eq!(accepted.status, Status::ConfirmedByClient);

    let fresh = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(10, 0), &[&s.polish]))
        .await
        .unwrap();
    assert_eq!(accepted.span, fresh.span);
    assert_eq!(accepted.span, Span::new(at(10, 0), at(14, 0)));
}

#[tokio::test]
async fn deactivated_service_does_not_strand_booked_appointments() {
    let s = standard_shop("reschedule_deactivated.wal", 2).await;
    let customer = Ulid::new();
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.polish]))
        .await
        .unwrap();
    s.engine
        .deactivate_service(Actor::Business, s.polish.id)
        .await
        .unwrap();

    // New bookings can no longer pick it.
    let r = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(14, 0), &[&s.polish]))
        .await;
    assert!(matches!(r, Err(EngineError::UnknownService(_))));

    let moved = s
        .engine
        .reschedule(Actor::Business, appt.id, at(9, 0), None, None)
        .await
        .unwrap();
    assert_eq!(moved.span, Span::new(at(9, 0), at(13, 0)));

    s.engine
        .update_status(
            Actor::Business,
            appt.id,
            Target::Rescheduled {
                suggested_start: at(14, 0),
                business_notes: "afternoon bay".into(),
            },
            None,
        )
        .await
        .unwrap();
    let accepted = s
        .engine
        .update_status(Actor::Customer(customer), appt.id, Target::ConfirmedByClient, None)
        .await
        .unwrap();
    assert_eq!(accepted.status, Status::ConfirmedByClient);
    assert_eq!(accepted.span, Span::new(at(14, 0), at(17, 0)));
    assert_eq!(accepted.total_price, 20_000);
    assert_eq!(accepted.lines[0].price, 20_000);
}

#[tokio::test]
async fn oversized_service_duration_is_refused() {
    let s = standard_shop("service_duration_cap.wal", 1).await;
    let huge = service("marathon", u32::MAX - 10, 5_000, None);
    let r = s.engine.upsert_service(Actor::Business, huge).await;
    assert!(matches!(r, Err(EngineError::LimitExceeded(_))));

    let day_long = service("full day", 24 * 60, 5_000, None);
    s.engine
        .upsert_service(Actor::Business, day_long.clone())
        .await
        .unwrap();
    let availability = s
        .engine
        .get_availability(day(), &[day_long.id], false)
        .await
        .unwrap();
    assert!(availability.slots.is_empty());
}

#[tokio::test]
async fn suggestion_into_full_slot_is_rejected() {
    let s = standard_shop("reschedule_full.wal", 1).await;
    let customer = Ulid::new();
    let mine = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    s.engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(10, 0), &[&s.wash]))
        .await
        .unwrap();
    let r = s
        .engine
        .update_status(
            Actor::Business,
            mine.id,
            Target::Rescheduled {
                suggested_start: at(10, 0),
                business_notes: "move?".into(),
            },
            None,
        )
        .await;
    assert!(matches!(r, Err(EngineError::CapacityExceeded(1))));
    let unchanged = s.engine.get_appointment(Actor::Business, mine.id).await.unwrap();
    assert_eq!(unchanged.status, Status::Confirmed);
    assert_eq!(unchanged.version, 1);
}

#[tokio::test]
async fn business_move_keeps_status_and_reprices_new_services() {
    let s = standard_shop("direct_move.wal", 1).await;
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(Ulid::new(), at(8, 0), &[&s.wash]))
        .await
        .unwrap();

    let moved = s
        .engine
        .reschedule(Actor::Business, appt.id, at(9, 0), None, Some(1))
        .await
        .unwrap();
    assert_eq!(moved.status, Status::Confirmed);
    assert_eq!(moved.span, Span::new(at(9, 0), at(10, 0)));
    assert_eq!(moved.total_price, 5_000);

    let moved = s
        .engine
        .reschedule(
            Actor::Business,
            appt.id,
            at(13, 0),
            Some(vec![s.wash.id, s.polish.id]),
            Some(2),
        )
        .await
        .unwrap();
    assert_eq!(moved.total_price, 25_000);
    assert_eq!(moved.span, Span::new(at(13, 0), at(17, 0)));

    let customer = Actor::Customer(appt.customer_id);
    assert!(matches!(
        s.engine.reschedule(customer, appt.id, at(9, 0), None, None).await,
        Err(EngineError::Forbidden(_))
    ));

    s.clock.set_ms(at(13, 0));
    s.engine
        .update_status(Actor::Business, appt.id, Target::InProgress, None)
        .await
        .unwrap();
    let r = s
        .engine
        .reschedule(Actor::Business, appt.id, at(16, 0), None, None)
        .await;
    assert!(matches!(r, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn delete_rules() {
    let s = standard_shop("delete.wal", 1).await;
    let customer = Ulid::new();
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    assert!(matches!(
        s.engine
            .delete_appointment(Actor::Customer(customer), appt.id)
            .await,
        Err(EngineError::Forbidden(_))
    ));

    s.clock.set_ms(at(9, 0));
    s.engine
        .update_status(Actor::Business, appt.id, Target::InProgress, None)
        .await
        .unwrap();
    s.engine
        .update_status(Actor::Business, appt.id, Target::Completed, None)
        .await
        .unwrap();
    assert!(matches!(
        s.engine.delete_appointment(Actor::Business, appt.id).await,
        Err(EngineError::Forbidden(_))
    ));

    let other = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(14, 0), &[&s.wash]))
        .await
        .unwrap();
    s.engine
        .delete_appointment(Actor::Business, other.id)
        .await
        .unwrap();
    assert!(matches!(
        s.engine.get_appointment(Actor::Business, other.id).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Reads ────────────────────────────────────────────────

#[tokio::test]
async fn customers_only_see_their_own() {
    let s = standard_shop("visibility.wal", 2).await;
    let alice = Ulid::new();
    let bob = Ulid::new();
    let a = s
        .engine
        .create_appointment(Actor::Business, request(alice, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    s.engine
        .create_appointment(Actor::Business, request(bob, at(8, 0), &[&s.wash]))
        .await
        .unwrap();

    let mine = s
        .engine
        .list_appointments(Actor::Customer(alice), day())
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, a.id);
    let all = s.engine.list_appointments(Actor::Business, day()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(s
        .engine
        .list_appointments(Actor::Business, day_plus(1))
        .await
        .unwrap()
        .is_empty());

    assert!(matches!(
        s.engine.get_appointment(Actor::Customer(bob), a.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        s.engine.reputation(Actor::Customer(bob), alice).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn notices_reach_customer_and_business() {
    let s = standard_shop("notices.wal", 1).await;
    let customer = Ulid::new();
    let mut shop_rx = s.engine.notify.subscribe(Audience::Business);
    let mut my_rx = s.engine.notify.subscribe(Audience::Customer(customer));

    let appt = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    let n = shop_rx.recv().await.unwrap();
    assert_eq!(n.appointment_id, appt.id);
    assert_eq!(n.status, StatusKind::Confirmed);
    assert_eq!(my_rx.recv().await.unwrap(), n);

    // Starting work is silent.
    s.clock.set_ms(at(8, 0));
    s.engine.apply_due_transitions().await;
    assert!(shop_rx.try_recv().is_err());
}

// ── Persistence ──────────────────────────────────────────

async fn reopen(s: &Shop) -> Engine {
    Engine::with_clock(
        s.path.clone(),
        Arc::new(NotifyHub::new()),
        None,
        Arc::new(s.clock.clone()),
    )
    .unwrap()
}

#[tokio::test]
async fn state_survives_restart() {
    let s = standard_shop("restart.wal", 1).await;
    let customer = Ulid::new();
    let appt = s
        .engine
        .create_appointment(Actor::Business, request(customer, at(8, 0), &[&s.wash]))
        .await
        .unwrap();
    s.clock.set_ms(at(8, 5));
    s.engine
        .update_status(Actor::Business, appt.id, Target::NoShow, None)
        .await
        .unwrap();

    let engine = reopen(&s).await;
    let stored = engine.get_appointment(Actor::Business, appt.id).await.unwrap();
    assert_eq!(stored.status, Status::NoShow);
    let rep = engine.reputation(Actor::Business, customer).await.unwrap();
    assert_eq!(rep.no_show_count, 1);
    assert_eq!(engine.settings().await.unwrap().max_concurrent, 1);
    assert_eq!(engine.list_services().len(), 3);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let s = standard_shop("compaction.wal", 1).await;
    let customer = Ulid::new();
    for h in [8, 9, 10] {
        let appt = s
            .engine
            .create_appointment(Actor::Business, request(customer, at(h, 0), &[&s.wash]))
            .await
            .unwrap();
        if h == 9 {
            s.engine
                .delete_appointment(Actor::Business, appt.id)
                .await
                .unwrap();
        }
    }
    s.clock.set_ms(at(8, 30));
    s.engine.apply_due_transitions().await;
    assert!(s.engine.wal_appends_since_compact().await > 0);

    s.engine.compact_wal().await.unwrap();
    assert_eq!(s.engine.wal_appends_since_compact().await, 0);

    let engine = reopen(&s).await;
    let listed = engine.list_appointments(Actor::Business, day()).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].status, Status::InProgress);
    assert_eq!(listed[1].status, Status::Confirmed);
    assert_eq!(engine.policy().await, ReputationPolicy::default());
}

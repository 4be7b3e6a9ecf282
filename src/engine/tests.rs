use super::*;
use super::conflict::validate_span;
use crate::lifecycle::BookingStatus;
use crate::limits::MAX_LABEL_LEN;
use crate::pricing::{PricingRule, RuleRepository, StrategyConfig};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::task::Poll;
use std::time::Duration;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
/// Monday 2026-02-09 00:00 UTC.
const T0: Ms = 1_770_595_200_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("parkline_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), EngineConfig::default()).unwrap()
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn car() -> Vehicle {
    Vehicle {
        id: Ulid::new(),
        class: VehicleClass::Car,
    }
}

fn truck() -> Vehicle {
    Vehicle {
        id: Ulid::new(),
        class: VehicleClass::Truck,
    }
}

async fn add_spot(engine: &Engine, facility: Ulid, label: &str, size: SpotSize) -> Ulid {
    let id = Ulid::new();
    engine
        .register_spot(id, facility, Ulid::new(), label, size, SpotFeatures::default())
        .await
        .unwrap();
    id
}

fn hourly_rule(facility: Ulid) -> PricingRule {
    PricingRule::from_json(
        facility,
        "Standard hourly",
        "HOURLY",
        &json!({"base_rate": 5, "after_hours": 1, "hourly_rate": 3}),
        0,
    )
    .unwrap()
}

fn pass(user: Ulid, facility: Ulid, entries: Option<u32>) -> UserSubscription {
    UserSubscription {
        id: Ulid::new(),
        user_id: user,
        plan_id: Ulid::new(),
        facility_id: facility,
        activated_at: now_ms() - H,
        expires_at: None,
        entries_remaining: entries,
        active: true,
    }
}

/// Spot state with claims, for pure-function tests.
fn spot_state(claims: Vec<Claim>) -> SpotState {
    let spot = Spot::new(Ulid::new(), Ulid::new(), Ulid::new(), "A-1", SpotSize::Medium, SpotFeatures::default());
    let mut st = SpotState::new(spot);
    for c in claims {
        st.insert_claim(c);
    }
    st
}

fn claim(start: Ms, end: Option<Ms>, status: BookingStatus) -> Claim {
    Claim {
        booking_id: Ulid::new(),
        start,
        end,
        status,
    }
}

// ── Pure checks ──────────────────────────────────────────

#[test]
fn conflict_half_open() {
    let existing = claim(10 * H, Some(12 * H), BookingStatus::Confirmed);
    let st = spot_state(vec![existing]);

    let err = check_no_conflict(&st, &Span::new(11 * H, 13 * H)).unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == existing.booking_id));

    // back-to-back on either side is fine
    assert!(check_no_conflict(&st, &Span::new(12 * H, 14 * H)).is_ok());
    assert!(check_no_conflict(&st, &Span::new(8 * H, 10 * H)).is_ok());
    // fully contained
    assert!(check_no_conflict(&st, &Span::new(10 * H + 30 * M, 11 * H)).is_err());
}

#[test]
fn conflict_ignores_claims_that_do_not_hold_the_spot() {
    let st = spot_state(vec![claim(10 * H, Some(12 * H), BookingStatus::Pending)]);
    assert!(check_no_conflict(&st, &Span::new(11 * H, 13 * H)).is_ok());
}

#[test]
fn open_ended_claim_blocks_everything_after_entry() {
    let drive_in = claim(10 * H, None, BookingStatus::Active);
    let st = spot_state(vec![drive_in]);
    assert!(check_no_conflict(&st, &Span::new(100 * H, 101 * H)).is_err());
    assert!(check_no_conflict(&st, &Span::new(9 * H, 10 * H)).is_ok());
}

#[test]
fn size_compatibility() {
    let medium = Spot::new(Ulid::new(), Ulid::new(), Ulid::new(), "M-1", SpotSize::Medium, SpotFeatures::default());
    let err = check_accommodates(&medium, VehicleClass::Truck).unwrap_err();
    assert!(matches!(
        err,
        EngineError::IncompatibleSize {
            spot: SpotSize::Medium,
            vehicle: SpotSize::XLarge
        }
    ));
    let xl = Spot { size: SpotSize::XLarge, ..medium };
    assert!(check_accommodates(&xl, VehicleClass::Truck).is_ok());
    assert!(check_accommodates(&xl, VehicleClass::Bicycle).is_ok());
}

#[test]
fn span_limits() {
    assert!(validate_span(&Span::new(T0, T0 + H)).is_ok());
    assert!(matches!(
        validate_span(&Span::new(0, H)),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        validate_span(&Span::new(T0, T0 + 400 * 24 * H)),
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Reserve ──────────────────────────────────────────────

#[tokio::test]
async fn reserve_prices_with_selected_rule() {
    let engine = new_engine("reserve_prices.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-101", SpotSize::Medium).await;
    engine.put_rule(hourly_rule(facility)).await.unwrap();

    let user = Ulid::new();
    let booking = engine
        .reserve(user, car(), spot, T0 + 10 * H, T0 + 12 * H + 15 * M)
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.mode, BookingMode::Reservation);
    assert_eq!(booking.estimated_price, Some(dec("11.00")));
    assert_eq!(booking.subscription_id, None);
    assert_eq!(booking.grace_period_minutes, 15);
    assert!(booking.ticket.starts_with("PKM-"));

    let s = engine.get_spot(spot).await.unwrap();
    assert_eq!(s.status, SpotStatus::Reserved);
    assert_eq!(s.occupant, Some(booking.id));

    let found = engine.find_by_ticket(&booking.ticket).await.unwrap().unwrap();
    assert_eq!(found.id, booking.id);
    assert!(engine.find_by_ticket("NOPE-00000000").await.unwrap().is_none());
}

#[tokio::test]
async fn reserve_without_rule_uses_fallback_rate() {
    let engine = new_engine("reserve_fallback.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;

    let booking = engine
        .reserve(Ulid::new(), car(), spot, T0, T0 + 2 * H + M)
        .await
        .unwrap();
    // 5.00 per started hour
    assert_eq!(booking.estimated_price, Some(dec("15")));
}

#[tokio::test]
async fn reserve_rejects_bad_span() {
    let engine = new_engine("reserve_bad_span.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;

    let err = engine.reserve(Ulid::new(), car(), spot, T0 + H, T0 + H).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidSpan));
    let err = engine.reserve(Ulid::new(), car(), spot, T0 + H, T0).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidSpan));
}

#[tokio::test]
async fn reserve_unknown_or_retired_spot() {
    let engine = new_engine("reserve_unknown.wal");
    let missing = Ulid::new();
    let err = engine.reserve(Ulid::new(), car(), missing, T0, T0 + H).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));

    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;
    engine.retire_spot(spot).await.unwrap();
    let err = engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == spot));
}

#[tokio::test]
async fn reserve_checks_vehicle_size() {
    let engine = new_engine("reserve_size.wal");
    let facility = Ulid::new();
    let medium = add_spot(&engine, facility, "M-1", SpotSize::Medium).await;
    let xl = add_spot(&engine, facility, "X-1", SpotSize::XLarge).await;

    let err = engine.reserve(Ulid::new(), truck(), medium, T0, T0 + H).await.unwrap_err();
    assert!(matches!(err, EngineError::IncompatibleSize { .. }));
    assert_eq!(engine.get_spot(medium).await.unwrap().status, SpotStatus::Available);

    engine.reserve(Ulid::new(), truck(), xl, T0, T0 + H).await.unwrap();
}

#[tokio::test]
async fn reserved_spot_rejects_second_booking() {
    let engine = new_engine("reserve_twice.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;
    engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap();

    // disjoint interval, still rejected: the spot is no longer Available
    let err = engine
        .reserve(Ulid::new(), car(), spot, T0 + 5 * H, T0 + 6 * H)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: SpotStatus::Reserved,
            ..
        }
    ));
    let err = engine.drive_in(Ulid::new(), car(), spot).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn reserve_conflicts_with_claim_on_available_spot() {
    let engine = new_engine("reserve_conflict.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;

    // A hold taken outside the status machinery, e.g. a pre-booked block.
    let existing = claim(T0 + 10 * H, Some(T0 + 12 * H), BookingStatus::Confirmed);
    engine
        .spot_handle(&spot)
        .unwrap()
        .write()
        .await
        .insert_claim(existing);

    let err = engine
        .reserve(Ulid::new(), car(), spot, T0 + 11 * H, T0 + 13 * H)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == existing.booking_id));
    assert_eq!(engine.tickets.len(), 0);

    engine
        .reserve(Ulid::new(), car(), spot, T0 + 12 * H, T0 + 14 * H)
        .await
        .unwrap();
}

// ── Drive-in & completion ────────────────────────────────

#[tokio::test]
async fn drive_in_occupies_spot() {
    let engine = new_engine("drive_in.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Large).await;
    let before = now_ms();
    let booking = engine.drive_in(Ulid::new(), car(), spot).await.unwrap();

    assert_eq!(booking.status, BookingStatus::Active);
    assert_eq!(booking.mode, BookingMode::DriveIn);
    assert_eq!(booking.expected_exit, None);
    assert_eq!(booking.estimated_price, None);
    assert!(booking.entry_time >= before);

    let s = engine.get_spot(spot).await.unwrap();
    assert_eq!(s.status, SpotStatus::Occupied);
    assert_eq!(s.occupant, Some(booking.id));
}

#[tokio::test]
async fn complete_releases_spot() {
    let engine = new_engine("complete.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    engine.put_rule(hourly_rule(facility)).await.unwrap();

    let booking = engine.drive_in(Ulid::new(), car(), spot).await.unwrap();
    let done = engine.complete(booking.id).await.unwrap();

    assert_eq!(done.status, BookingStatus::Completed);
    assert!(done.actual_exit.unwrap() >= booking.entry_time);
    // under a minute: zero chargeable hours
    assert_eq!(done.final_price, Some(Decimal::ZERO));

    let s = engine.get_spot(spot).await.unwrap();
    assert_eq!(s.status, SpotStatus::Available);
    assert_eq!(s.occupant, None);
    assert!(engine.spot_handle(&spot).unwrap().read().await.claims.is_empty());
}

#[tokio::test]
async fn complete_twice_is_already_completed() {
    let engine = new_engine("complete_twice.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;

    let first = engine.drive_in(Ulid::new(), car(), spot).await.unwrap();
    engine.complete(first.id).await.unwrap();

    let second = engine.drive_in(Ulid::new(), car(), spot).await.unwrap();
    let err = engine.complete(first.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCompleted(id) if id == first.id));

    let s = engine.get_spot(spot).await.unwrap();
    assert_eq!(s.status, SpotStatus::Occupied);
    assert_eq!(s.occupant, Some(second.id));
}

#[tokio::test]
async fn complete_unknown_booking() {
    let engine = new_engine("complete_unknown.wal");
    let id = Ulid::new();
    assert!(matches!(engine.complete(id).await, Err(EngineError::NotFound(got)) if got == id));
}

#[tokio::test]
async fn overstay_adds_penalty() {
    let engine = new_engine("overstay.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    let rule = PricingRule::new(
        facility,
        "Flat with penalty",
        StrategyConfig::from_json(crate::pricing::StrategyKind::FlatRate, &json!({"flat_rate": 10})).unwrap(),
        0,
    )
    .with_overstay_penalty(dec("4"));
    engine.put_rule(rule).await.unwrap();

    // expected exit two hours ago; grace ends 1h45m ago
    let now = now_ms();
    let booking = engine
        .reserve(Ulid::new(), car(), spot, now - 3 * H, now - 2 * H)
        .await
        .unwrap();
    let done = engine.complete(booking.id).await.unwrap();
    assert!(done.is_overstay());
    // flat 10 + 2 started hours past grace at 4
    assert_eq!(done.final_price, Some(dec("18")));
}

// ── Lifecycle operations ─────────────────────────────────

#[tokio::test]
async fn check_in_moves_to_active() {
    let engine = new_engine("check_in.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;
    let booking = engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap();

    let active = engine.check_in(booking.id).await.unwrap();
    assert_eq!(active.status, BookingStatus::Active);
    assert_eq!(engine.get_spot(spot).await.unwrap().status, SpotStatus::Occupied);

    let err = engine.check_in(booking.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Active,
            to: BookingStatus::Active
        }
    ));
}

#[tokio::test]
async fn cancel_releases_reserved_spot() {
    let engine = new_engine("cancel.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;
    let booking = engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap();

    let cancelled = engine.cancel(booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.final_price, None);
    assert_eq!(engine.get_spot(spot).await.unwrap().status, SpotStatus::Available);

    let err = engine.complete(booking.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Cancelled,
            to: BookingStatus::Completed
        }
    ));

    // the spot is bookable again for the same interval
    engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap();
}

#[tokio::test]
async fn active_booking_cannot_be_cancelled() {
    let engine = new_engine("cancel_active.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;
    let booking = engine.drive_in(Ulid::new(), car(), spot).await.unwrap();

    let err = engine.cancel(booking.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert_eq!(engine.get_spot(spot).await.unwrap().status, SpotStatus::Occupied);
}

#[tokio::test]
async fn no_show_releases_spot() {
    let engine = new_engine("no_show.wal");
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;
    let booking = engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap();

    let missed = engine.mark_no_show(booking.id).await.unwrap();
    assert_eq!(missed.status, BookingStatus::NoShow);
    assert_eq!(engine.get_spot(spot).await.unwrap().status, SpotStatus::Available);
    assert!(engine.mark_no_show(booking.id).await.is_err());
}

// ── Subscriptions ────────────────────────────────────────

#[tokio::test]
async fn subscription_short_circuits_pricing() {
    let engine = new_engine("subscription_gate.wal");
    let facility = Ulid::new();
    let a = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    let b = add_spot(&engine, facility, "A-2", SpotSize::Medium).await;
    engine.put_rule(hourly_rule(facility)).await.unwrap();

    let user = Ulid::new();
    let sub = pass(user, facility, Some(1));
    engine.grant_subscription(sub.clone()).await.unwrap();

    let covered = engine
        .reserve(user, car(), a, T0 + 10 * H, T0 + 12 * H + 15 * M)
        .await
        .unwrap();
    assert_eq!(covered.estimated_price, Some(Decimal::ZERO));
    assert_eq!(covered.subscription_id, Some(sub.id));
    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(0));

    // exhausted: back to rule pricing
    let paid = engine
        .reserve(user, car(), b, T0 + 10 * H, T0 + 12 * H + 15 * M)
        .await
        .unwrap();
    assert_eq!(paid.estimated_price, Some(dec("11.00")));
    assert_eq!(paid.subscription_id, None);

    // the entry spent at reservation keeps covering the exit
    let done = engine.complete(covered.id).await.unwrap();
    assert_eq!(done.final_price, Some(Decimal::ZERO));
    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(0));
}

#[tokio::test]
async fn pass_activated_during_stay_covers_exit() {
    let engine = new_engine("subscription_at_exit.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    let user = Ulid::new();

    let booking = engine.drive_in(user, car(), spot).await.unwrap();
    assert_eq!(booking.subscription_id, None);

    let sub = pass(user, facility, Some(2));
    engine.grant_subscription(sub.clone()).await.unwrap();

    let done = engine.complete(booking.id).await.unwrap();
    assert_eq!(done.final_price, Some(Decimal::ZERO));
    assert_eq!(done.subscription_id, Some(sub.id));
    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(1));
}

#[tokio::test]
async fn revoked_pass_no_longer_applies() {
    let engine = new_engine("subscription_revoked.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    let user = Ulid::new();
    let sub = pass(user, facility, None);
    engine.grant_subscription(sub.clone()).await.unwrap();
    engine.revoke_subscription(sub.id).await.unwrap();

    let booking = engine.reserve(user, car(), spot, T0, T0 + H).await.unwrap();
    assert_eq!(booking.subscription_id, None);
    assert_eq!(booking.estimated_price, Some(dec("5")));
}

#[tokio::test]
async fn failed_reserve_spends_nothing() {
    let engine = new_engine("subscription_failed.wal");
    let facility = Ulid::new();
    let small = add_spot(&engine, facility, "S-1", SpotSize::Small).await;
    let user = Ulid::new();
    let sub = pass(user, facility, Some(3));
    engine.grant_subscription(sub.clone()).await.unwrap();

    assert!(engine.reserve(user, car(), small, T0, T0 + H).await.is_err());
    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(3));
    assert!(engine.tickets.is_empty());
    assert!(engine.bookings.is_empty());
}

#[tokio::test]
async fn estimate_never_spends_entries() {
    let engine = new_engine("estimate.wal");
    let facility = Ulid::new();
    engine.put_rule(hourly_rule(facility)).await.unwrap();
    let user = Ulid::new();
    let sub = pass(user, facility, Some(1));
    engine.grant_subscription(sub.clone()).await.unwrap();

    let q = engine
        .estimate(facility, VehicleClass::Car, SpotSize::Medium, Some(user), 2 * H + 15 * M)
        .unwrap();
    assert_eq!(q.total, Decimal::ZERO);
    assert_eq!(q.subscription_id(), Some(sub.id));
    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(1));

    let q = engine
        .estimate(facility, VehicleClass::Car, SpotSize::Medium, None, 2 * H + 15 * M)
        .unwrap();
    assert_eq!(q.total, dec("11.00"));
    assert_eq!(q.discounts, Decimal::ZERO);
    assert_eq!(q.duration_minutes, 135);
}

#[tokio::test]
async fn estimate_rejects_unbounded_durations() {
    let engine = new_engine("estimate_bounds.wal");
    let facility = Ulid::new();
    let err = engine
        .estimate(facility, VehicleClass::Car, SpotSize::Medium, None, Ms::MAX)
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    let err = engine
        .estimate(facility, VehicleClass::Car, SpotSize::Medium, None, -H)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSpan));

    let q = engine
        .estimate(facility, VehicleClass::Car, SpotSize::Medium, None, crate::limits::MAX_SPAN_DURATION_MS)
        .unwrap();
    assert_eq!(q.total, dec("5") * Decimal::from(366 * 24));
}

// ── Metadata & extension ─────────────────────────────────

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[tokio::test]
async fn metadata_is_kept_and_bounded() {
    let engine = new_engine("metadata.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    let other = add_spot(&engine, facility, "A-2", SpotSize::Medium).await;

    let too_many: BTreeMap<String, String> = (0..=crate::limits::MAX_METADATA_ENTRIES)
        .map(|i| (format!("k{i}"), "v".to_string()))
        .collect();
    let err = engine
        .reserve_with_metadata(Ulid::new(), car(), spot, T0, T0 + H, too_many)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    let long_key = "k".repeat(crate::limits::MAX_METADATA_KEY_LEN + 1);
    let err = engine
        .drive_in_with_metadata(Ulid::new(), car(), spot, tags(&[(long_key.as_str(), "v")]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    assert!(engine.bookings.is_empty());

    let booking = engine
        .reserve_with_metadata(Ulid::new(), car(), spot, T0, T0 + H, tags(&[("plate", "AB-123"), ("channel", "app")]))
        .await
        .unwrap();
    assert_eq!(booking.metadata["plate"], "AB-123");
    let walk_up = engine
        .drive_in_with_metadata(Ulid::new(), car(), other, tags(&[("gate", "north")]))
        .await
        .unwrap();
    assert_eq!(engine.get_booking(walk_up.id).await.unwrap().metadata, tags(&[("gate", "north")]));
}

#[tokio::test]
async fn extend_prices_the_added_window() {
    let engine = new_engine("extend.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    engine.put_rule(hourly_rule(facility)).await.unwrap();

    let booking = engine
        .reserve(Ulid::new(), car(), spot, T0 + 10 * H, T0 + 12 * H)
        .await
        .unwrap();
    assert_eq!(booking.estimated_price, Some(dec("8")));

    // 2h → 3h: one more hour at the hourly rate
    let ext = engine.extend(booking.id, T0 + 13 * H).await.unwrap();
    assert_eq!(ext.previous_exit, T0 + 12 * H);
    assert_eq!(ext.new_exit, T0 + 13 * H);
    assert_eq!(ext.additional_price, dec("3"));

    let extended = engine.get_booking(booking.id).await.unwrap();
    assert_eq!(extended.expected_exit, Some(T0 + 13 * H));
    assert_eq!(extended.estimated_price, Some(dec("11")));
    assert_eq!(extended.extensions, vec![ext]);
    let claim_end = engine.spot_handle(&spot).unwrap().read().await.claims[0].end;
    assert_eq!(claim_end, Some(T0 + 13 * H));

    for exit in [T0 + 13 * H, T0 + 11 * H] {
        let err = engine.extend(booking.id, exit).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpan));
    }
    let err = engine.extend(booking.id, T0 + 10 * H + 400 * 24 * H).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    // a claim starting at the current exit blocks the added window
    let blocker = claim(T0 + 13 * H, Some(T0 + 14 * H), BookingStatus::Confirmed);
    engine.spot_handle(&spot).unwrap().write().await.insert_claim(blocker.clone());
    let err = engine.extend(booking.id, T0 + 14 * H).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == blocker.booking_id));
    assert_eq!(engine.get_booking(booking.id).await.unwrap().expected_exit, Some(T0 + 13 * H));
}

#[tokio::test]
async fn extend_is_free_under_a_pass() {
    let engine = new_engine("extend_pass.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    engine.put_rule(hourly_rule(facility)).await.unwrap();
    let user = Ulid::new();
    engine.grant_subscription(pass(user, facility, None)).await.unwrap();

    let booking = engine.reserve(user, car(), spot, T0, T0 + H).await.unwrap();
    engine.check_in(booking.id).await.unwrap();
    let ext = engine.extend(booking.id, T0 + 5 * H).await.unwrap();
    assert_eq!(ext.additional_price, Decimal::ZERO);
    assert_eq!(engine.get_booking(booking.id).await.unwrap().status, BookingStatus::Active);
}

#[tokio::test]
async fn only_open_reservations_extend() {
    let engine = new_engine("extend_refused.wal");
    let facility = Ulid::new();
    let a = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
    let b = add_spot(&engine, facility, "A-2", SpotSize::Medium).await;

    let walk_up = engine.drive_in(Ulid::new(), car(), a).await.unwrap();
    let err = engine.extend(walk_up.id, T0 + H).await.unwrap_err();
    assert!(matches!(err, EngineError::NotExtendable(id) if id == walk_up.id));

    let reserved = engine.reserve(Ulid::new(), car(), b, T0, T0 + H).await.unwrap();
    engine.cancel(reserved.id).await.unwrap();
    let err = engine.extend(reserved.id, T0 + 2 * H).await.unwrap_err();
    assert!(matches!(err, EngineError::NotExtendable(_)));
    assert!(matches!(engine.extend(Ulid::new(), T0).await, Err(EngineError::NotFound(_))));
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn catalog_changes() {
    let engine = new_engine("catalog.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;

    let err = engine
        .register_spot(spot, facility, Ulid::new(), "dup", SpotSize::Small, SpotFeatures::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    let err = engine
        .register_spot(Ulid::new(), facility, Ulid::new(), "x".repeat(MAX_LABEL_LEN + 1), SpotSize::Small, SpotFeatures::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let mut rule = hourly_rule(facility);
    engine.put_rule(rule.clone()).await.unwrap();
    rule.priority = 7;
    engine.put_rule(rule.clone()).await.unwrap();
    let rules = engine.rules_for_facility(facility);
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].priority, 7);

    engine.remove_rule(rule.id).await.unwrap();
    assert!(engine.rules_for_facility(facility).is_empty());
    assert!(matches!(engine.remove_rule(rule.id).await, Err(EngineError::NotFound(_))));

    let booking = engine.drive_in(Ulid::new(), car(), spot).await.unwrap();
    let err = engine.retire_spot(spot).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    engine.complete(booking.id).await.unwrap();
    engine.retire_spot(spot).await.unwrap();
    assert!(!engine.get_spot(spot).await.unwrap().active);
}

#[tokio::test]
async fn maintenance_blocks_booking() {
    let engine = new_engine("maintenance.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;

    engine.start_maintenance(spot).await.unwrap();
    assert_eq!(engine.get_spot(spot).await.unwrap().status, SpotStatus::Maintenance);
    assert!(engine.available_spots(facility, VehicleClass::Car).await.unwrap().is_empty());
    let err = engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { status: SpotStatus::Maintenance, .. }));
    assert!(matches!(engine.start_maintenance(spot).await, Err(EngineError::InvalidState { .. })));

    engine.end_maintenance(spot).await.unwrap();
    assert!(matches!(engine.end_maintenance(spot).await, Err(EngineError::InvalidState { .. })));
    let booking = engine.drive_in(Ulid::new(), car(), spot).await.unwrap();
    assert!(matches!(engine.start_maintenance(spot).await, Err(EngineError::InvalidState { .. })));
    engine.complete(booking.id).await.unwrap();
}

#[tokio::test]
async fn retired_spot_can_return() {
    let engine = new_engine("reactivate.wal");
    let facility = Ulid::new();
    let spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;

    assert!(matches!(engine.reactivate_spot(spot).await, Err(EngineError::InvalidState { .. })));
    engine.retire_spot(spot).await.unwrap();
    assert!(matches!(engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.start_maintenance(spot).await, Err(EngineError::NotFound(_))));

    engine.reactivate_spot(spot).await.unwrap();
    let s = engine.get_spot(spot).await.unwrap();
    assert!(s.active);
    assert_eq!(s.status, SpotStatus::Available);
    engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap();
    assert!(matches!(engine.reactivate_spot(Ulid::new()).await, Err(EngineError::NotFound(_))));
}

fn rule_of(facility: Ulid, kind: &str, config: serde_json::Value) -> PricingRule {
    PricingRule::from_json(facility, kind, kind, &config, 0).unwrap()
}

#[tokio::test]
async fn every_rule_kind_prices_a_reservation() {
    let engine = new_engine("rule_kinds.wal");
    let cases = [
        ("FLAT_RATE", json!({"flat_rate": 12.5}), "12.5"),
        ("HOURLY", json!({"base_rate": 5, "after_hours": 1, "hourly_rate": 3}), "8"),
        (
            "SLAB",
            json!({"slabs": [
                {"max_hours": 1, "price": 5},
                {"max_hours": 3, "price": 12},
                {"max_hours": null, "price": 30}
            ]}),
            "12.00",
        ),
        (
            "DYNAMIC",
            json!({"peak_hours": [{"days": ["monday"], "start": "08:00", "end": "18:00", "rate": 8}], "off_peak_rate": 4}),
            "16",
        ),
    ];
    for (kind, config, expected) in cases {
        let facility = Ulid::new();
        engine.put_rule(rule_of(facility, kind, config)).await.unwrap();
        let spot = add_spot(&engine, facility, kind, SpotSize::Medium).await;
        // Monday 09:00 to 11:00 UTC
        let booking = engine
            .reserve(Ulid::new(), car(), spot, T0 + 9 * H, T0 + 11 * H)
            .await
            .unwrap();
        assert_eq!(booking.estimated_price, Some(dec(expected)), "{kind}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_of_one_id() {
    let path = test_wal_path("concurrent_register.wal");
    let engine = Arc::new(Engine::new(path.clone(), EngineConfig::default()).unwrap());
    let facility = Ulid::new();
    let spot = Ulid::new();
    let sub = pass(Ulid::new(), facility, Some(3));

    let mut spot_tasks = Vec::new();
    let mut pass_tasks = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        spot_tasks.push(tokio::spawn(async move {
            eng.register_spot(spot, facility, Ulid::new(), format!("R-{i}"), SpotSize::Medium, SpotFeatures::default())
                .await
        }));
        let eng = engine.clone();
        let sub = sub.clone();
        pass_tasks.push(tokio::spawn(async move { eng.grant_subscription(sub).await }));
    }

    let mut registered = 0;
    for h in spot_tasks {
        match h.await.unwrap() {
            Ok(_) => registered += 1,
            Err(EngineError::AlreadyExists(id)) => assert_eq!(id, spot),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let mut granted = 0;
    for h in pass_tasks {
        match h.await.unwrap() {
            Ok(()) => granted += 1,
            Err(EngineError::AlreadyExists(id)) => assert_eq!(id, sub.id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((registered, granted), (1, 1));

    let reserved = engine.reserve(sub.user_id, car(), spot, T0, T0 + H).await.unwrap();
    assert_eq!(reserved.subscription_id, Some(sub.id));
    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(2));

    let engine2 = Engine::new(path, EngineConfig::default()).unwrap();
    assert_eq!(engine2.list_spots(facility).await.unwrap().len(), 1);
    assert_eq!(engine2.get_subscription(&sub.id).unwrap().entries_remaining, Some(2));
}

#[tokio::test]
async fn spot_listings_and_history() {
    let engine = new_engine("listings.wal");
    let facility = Ulid::new();
    let b = add_spot(&engine, facility, "B-1", SpotSize::Large).await;
    let a = add_spot(&engine, facility, "A-1", SpotSize::Small).await;
    add_spot(&engine, Ulid::new(), "elsewhere", SpotSize::Large).await;

    let labels: Vec<String> = engine
        .list_spots(facility)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.label)
        .collect();
    assert_eq!(labels, vec!["A-1", "B-1"]);

    let for_cars = engine.available_spots(facility, VehicleClass::Car).await.unwrap();
    assert_eq!(for_cars.len(), 1);
    assert_eq!(for_cars[0].id, b);

    let first = engine.drive_in(Ulid::new(), car(), b).await.unwrap();
    engine.complete(first.id).await.unwrap();
    let second = engine.reserve(Ulid::new(), car(), b, T0, T0 + H).await.unwrap();

    let history = engine.bookings_for_spot(b).await.unwrap();
    let ids: Vec<Ulid> = history.iter().map(|bk| bk.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert!(engine.bookings_for_spot(a).await.unwrap().is_empty());
    assert!(engine.available_spots(facility, VehicleClass::Car).await.unwrap().is_empty());
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_one_winner() {
    let engine = Arc::new(new_engine("concurrent_reserve.wal"));
    let spot = add_spot(&engine, Ulid::new(), "HOT-1", SpotSize::Medium).await;

    let n = 50;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            // disjoint intervals: only the spot status can serialize them
            let start = T0 + i as Ms * 2 * H;
            eng.reserve(Ulid::new(), car(), spot, start, start + H).await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::InvalidState { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.bookings.len(), 1);
    assert_eq!(engine.tickets.len(), 1);
    assert_eq!(engine.spot_handle(&spot).unwrap().read().await.claims.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mixed_entries_single_occupant() {
    let engine = Arc::new(new_engine("concurrent_mixed.wal"));
    let spot = add_spot(&engine, Ulid::new(), "HOT-2", SpotSize::Large).await;

    let mut handles = Vec::new();
    for i in 0..40 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                eng.drive_in(Ulid::new(), car(), spot).await
            } else {
                eng.reserve(Ulid::new(), car(), spot, T0, T0 + H).await
            }
        }));
    }
    let winners: Vec<Booking> = collect_winners(handles).await;
    assert_eq!(winners.len(), 1);
    assert_eq!(engine.get_spot(spot).await.unwrap().occupant, Some(winners[0].id));
}

async fn collect_winners(
    handles: Vec<tokio::task::JoinHandle<Result<Booking, EngineError>>>,
) -> Vec<Booking> {
    let mut winners = Vec::new();
    for h in handles {
        if let Ok(b) = h.await.unwrap() {
            winners.push(b);
        }
    }
    winners
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_spots_all_succeed() {
    let engine = Arc::new(new_engine("parallel_spots.wal"));
    let facility = Ulid::new();
    let mut spots = Vec::new();
    for i in 0..20 {
        spots.push(add_spot(&engine, facility, &format!("P-{i:02}"), SpotSize::Medium).await);
    }

    let mut handles = Vec::new();
    for spot in spots {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move { eng.drive_in(Ulid::new(), car(), spot).await }));
    }
    assert_eq!(collect_winners(handles).await.len(), 20);
    assert!(engine.available_spots(facility, VehicleClass::Car).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_pass_is_spent_once() {
    let engine = Arc::new(new_engine("concurrent_pass.wal"));
    let facility = Ulid::new();
    let user = Ulid::new();
    let sub = pass(user, facility, Some(1));
    engine.grant_subscription(sub.clone()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let spot = add_spot(&engine, facility, &format!("S-{i}"), SpotSize::Medium).await;
        let eng = engine.clone();
        handles.push(tokio::spawn(async move { eng.reserve(user, car(), spot, T0, T0 + H).await }));
    }
    let bookings = collect_winners(handles).await;
    assert_eq!(bookings.len(), 10);
    let covered = bookings.iter().filter(|b| b.subscription_id.is_some()).count();
    assert_eq!(covered, 1);
    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(0));
}

#[tokio::test]
async fn spot_lock_wait_is_bounded() {
    let config = EngineConfig {
        lock_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let engine = Engine::new(test_wal_path("lock_timeout_spot.wal"), config).unwrap();
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;

    let handle = engine.spot_handle(&spot).unwrap();
    let held = handle.write().await;
    let err = engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap_err();
    assert!(matches!(err, EngineError::LockTimeout(id) if id == spot));
    drop(held);

    engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap();
}

#[tokio::test]
async fn booking_lock_wait_is_bounded() {
    let config = EngineConfig {
        lock_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let engine = Engine::new(test_wal_path("lock_timeout_booking.wal"), config).unwrap();
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;
    let booking = engine.drive_in(Ulid::new(), car(), spot).await.unwrap();

    let handle = engine.booking_handle(&booking.id).unwrap();
    let held = handle.lock().await;
    let err = engine.complete(booking.id).await.unwrap_err();
    assert!(matches!(err, EngineError::LockTimeout(id) if id == booking.id));
    drop(held);

    assert_eq!(engine.get_spot(spot).await.unwrap().status, SpotStatus::Occupied);
    engine.complete(booking.id).await.unwrap();
}

// ── WAL replay & compaction ──────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_state.wal");
    let facility = Ulid::new();
    let user = Ulid::new();
    let sub = pass(user, facility, Some(3));
    let (reserved, closed, spot_a, spot_b, spot_c);
    {
        let engine = Engine::new(path.clone(), EngineConfig::default()).unwrap();
        spot_a = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
        spot_b = add_spot(&engine, facility, "A-2", SpotSize::Medium).await;
        spot_c = add_spot(&engine, facility, "A-3", SpotSize::Medium).await;
        engine.put_rule(hourly_rule(facility)).await.unwrap();
        engine.grant_subscription(sub.clone()).await.unwrap();

        reserved = engine.reserve(user, car(), spot_a, T0, T0 + 2 * H).await.unwrap();
        closed = engine.drive_in(Ulid::new(), car(), spot_b).await.unwrap();
        engine.complete(closed.id).await.unwrap();
        let cancelled = engine.reserve(user, car(), spot_c, T0, T0 + H).await.unwrap();
        engine.cancel(cancelled.id).await.unwrap();
        assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(1));
    }

    let engine = Engine::new(path, EngineConfig::default()).unwrap();
    let a = engine.get_spot(spot_a).await.unwrap();
    assert_eq!(a.status, SpotStatus::Reserved);
    assert_eq!(a.occupant, Some(reserved.id));
    assert_eq!(engine.spot_handle(&spot_a).unwrap().read().await.claims.len(), 1);
    assert_eq!(engine.get_spot(spot_b).await.unwrap().status, SpotStatus::Available);
    assert_eq!(engine.get_spot(spot_c).await.unwrap().status, SpotStatus::Available);

    let restored = engine.find_by_ticket(&reserved.ticket).await.unwrap().unwrap();
    assert_eq!(restored, reserved);
    let restored_closed = engine.get_booking(closed.id).await.unwrap();
    assert_eq!(restored_closed.status, BookingStatus::Completed);
    assert!(restored_closed.final_price.is_some());

    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(1));
    assert_eq!(engine.rules_for_facility(facility).len(), 1);

    // the restored reservation still blocks its spot
    let err = engine.reserve(Ulid::new(), car(), spot_a, T0 + 5 * H, T0 + 6 * H).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    engine.complete(reserved.id).await.unwrap();
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone(), EngineConfig::default()).unwrap());
    let facility = Ulid::new();

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register_spot(Ulid::new(), facility, Ulid::new(), format!("G-{i}"), SpotSize::Medium, SpotFeatures::default())
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_spots(facility).await.unwrap().len(), n);

    let engine2 = Engine::new(path, EngineConfig::default()).unwrap();
    assert_eq!(engine2.list_spots(facility).await.unwrap().len(), n);
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let facility = Ulid::new();
    let user = Ulid::new();
    let sub = pass(user, facility, Some(5));
    let (open, spot);
    {
        let engine = Engine::new(path.clone(), EngineConfig::default()).unwrap();
        spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
        let churn = add_spot(&engine, facility, "A-2", SpotSize::Medium).await;
        engine.grant_subscription(sub.clone()).await.unwrap();

        for _ in 0..10 {
            let b = engine.drive_in(user, car(), churn).await.unwrap();
            engine.complete(b.id).await.unwrap();
        }
        // the first five drive-ins drain the pass
        open = engine.reserve(Ulid::new(), car(), spot, T0, T0 + H).await.unwrap();

        let size_before = std::fs::metadata(&path).unwrap().len();
        let records = engine.compact_wal().await.unwrap();
        assert_eq!(records, 2 + 1 + 11);
        assert!(std::fs::metadata(&path).unwrap().len() < size_before);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        engine.check_in(open.id).await.unwrap();
        assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(0));
    }

    let engine = Engine::new(path, EngineConfig::default()).unwrap();
    // compaction snapshots counters, replay must not spend them again
    assert_eq!(engine.get_subscription(&sub.id).unwrap().entries_remaining, Some(0));
    let restored = engine.get_booking(open.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Active);
    assert_eq!(engine.get_spot(spot).await.unwrap().status, SpotStatus::Occupied);
    assert_eq!(engine.bookings_for_spot(spot).await.unwrap().len(), 1);
    assert_eq!(engine.bookings.len(), 11);
}

#[tokio::test]
async fn restart_keeps_every_rule_kind_and_what_follows() {
    let path = test_wal_path("restart_rule_kinds.wal");
    let facility = Ulid::new();
    let rules = vec![
        rule_of(facility, "FLAT_RATE", json!({"flat_rate": "7.25"})),
        rule_of(facility, "HOURLY", json!({"base_rate": 5, "after_hours": 1, "hourly_rate": 3})),
        rule_of(facility, "SLAB", json!({"slabs": [{"max_hours": 1, "price": 5}, {"max_hours": null, "price": 30}]})),
        rule_of(facility, "DYNAMIC", json!({"peak_hours": [{"days": ["friday"], "rate": 9.5}], "off_peak_rate": 4})),
        rule_of(facility, "SUBSCRIPTION", json!({})),
    ];
    let (spot, booking);
    {
        let engine = Engine::new(path.clone(), EngineConfig::default()).unwrap();
        for rule in &rules {
            engine.put_rule(rule.clone()).await.unwrap();
        }
        // records after the rules must replay too
        spot = add_spot(&engine, facility, "A-1", SpotSize::Medium).await;
        booking = engine
            .reserve_with_metadata(Ulid::new(), car(), spot, T0, T0 + H, tags(&[("plate", "XY-9")]))
            .await
            .unwrap();
        engine.extend(booking.id, T0 + 2 * H).await.unwrap();
        engine.start_maintenance(add_spot(&engine, facility, "A-2", SpotSize::Medium).await).await.unwrap();
    }

    let engine = Engine::new(path, EngineConfig::default()).unwrap();
    let mut restored = engine.rules_for_facility(facility);
    restored.sort_by_key(|r| r.id);
    let mut expected = rules.clone();
    expected.sort_by_key(|r| r.id);
    assert_eq!(restored, expected);

    let b = engine.get_booking(booking.id).await.unwrap();
    assert_eq!(b.metadata, tags(&[("plate", "XY-9")]));
    assert_eq!(b.expected_exit, Some(T0 + 2 * H));
    assert_eq!(b.extensions.len(), 1);
    assert_eq!(engine.spot_handle(&spot).unwrap().read().await.claims[0].end, Some(T0 + 2 * H));
    let statuses: Vec<SpotStatus> = engine
        .list_spots(facility)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.status)
        .collect();
    assert_eq!(statuses, vec![SpotStatus::Reserved, SpotStatus::Maintenance]);
}

/// Poll `fut` exactly once.
async fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
    std::future::poll_fn(|cx| Poll::Ready(std::pin::Pin::new(&mut *fut).poll(cx))).await
}

#[tokio::test]
async fn reserve_dropped_while_flushing_stays_consistent() {
    let path = test_wal_path("cancelled_reserve.wal");
    let engine = Engine::new(path.clone(), EngineConfig::default()).unwrap();
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;

    // single-threaded runtime: the writer cannot run until this task yields,
    // so the first poll stops while waiting for the flush
    let mut fut = Box::pin(engine.reserve(Ulid::new(), car(), spot, T0, T0 + H));
    assert!(poll_once(&mut fut).await.is_pending());
    drop(fut);

    // status goes through the writer queue behind the record
    assert!(engine.wal_status().await.healthy);
    assert_eq!(engine.bookings.len(), 1);
    let live = engine.get_spot(spot).await.unwrap();
    assert_eq!(live.status, SpotStatus::Reserved);
    let id = live.occupant.unwrap();
    let ticket = engine.get_booking(id).await.unwrap().ticket;
    assert_eq!(engine.find_by_ticket(&ticket).await.unwrap().unwrap().id, id);
    let err = engine.reserve(Ulid::new(), car(), spot, T0 + 2 * H, T0 + 3 * H).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    let restarted = Engine::new(path, EngineConfig::default()).unwrap();
    assert_eq!(restarted.get_spot(spot).await.unwrap().occupant, Some(id));
    assert_eq!(restarted.get_booking(id).await.unwrap().ticket, ticket);
}

#[tokio::test]
async fn reserve_dropped_while_waiting_for_spot_leaves_nothing() {
    let path = test_wal_path("cancelled_wait.wal");
    let engine = Engine::new(path.clone(), EngineConfig::default()).unwrap();
    let spot = add_spot(&engine, Ulid::new(), "A-1", SpotSize::Medium).await;

    let handle = engine.spot_handle(&spot).unwrap();
    let held = handle.write().await;
    let mut fut = Box::pin(engine.reserve(Ulid::new(), car(), spot, T0, T0 + H));
    assert!(poll_once(&mut fut).await.is_pending());
    drop(fut);
    drop(held);

    assert_eq!(engine.wal_status().await.appends_since_compact, 1);
    assert!(engine.bookings.is_empty());
    assert!(engine.tickets.is_empty());
    assert_eq!(engine.get_spot(spot).await.unwrap().status, SpotStatus::Available);
    let restarted = Engine::new(path, EngineConfig::default()).unwrap();
    assert!(restarted.bookings.is_empty());
}

#[tokio::test]
async fn failed_flush_closes_log_until_compaction() {
    let path = test_wal_path("closed_log.wal");
    let mut wal = Wal::<Event>::open(&path).unwrap();
    let mut broken = Some("disk full".to_string());

    let (tx, rx) = oneshot::channel();
    commit_batch(&mut wal, vec![(Event::SpotRetired { id: Ulid::new() }, tx)], &mut broken);
    assert!(rx.await.unwrap().is_err());
    assert_eq!(wal.appends_since_compact(), 0);

    let (tx, rx) = oneshot::channel();
    handle_non_append(&mut wal, WalCommand::Compact { events: Vec::new(), response: tx }, &mut broken);
    rx.await.unwrap().unwrap();
    assert!(broken.is_none());

    let (tx, rx) = oneshot::channel();
    commit_batch(&mut wal, vec![(Event::SpotRetired { id: Ulid::new() }, tx)], &mut broken);
    rx.await.unwrap().unwrap();
    assert_eq!(Wal::<Event>::replay(&path).unwrap().records.len(), 1);
}

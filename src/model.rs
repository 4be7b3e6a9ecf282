use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::lifecycle::BookingStatus;
use crate::pricing::PricingRule;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Catalog types ────────────────────────────────────────────────

/// Physical spot size. Ordering is significant: a spot fits a vehicle iff
/// `spot.size >= vehicle.class.size()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpotSize {
    Small,
    Medium,
    Large,
    #[serde(rename = "XLARGE")]
    XLarge,
}

impl SpotSize {
    pub fn accommodates(self, vehicle: SpotSize) -> bool {
        self >= vehicle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpotSize::Small => "small",
            SpotSize::Medium => "medium",
            SpotSize::Large => "large",
            SpotSize::XLarge => "xlarge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleClass {
    Bicycle,
    Motorcycle,
    Car,
    ElectricCar,
    Suv,
    ElectricSuv,
    Van,
    Truck,
    Bus,
}

impl VehicleClass {
    /// Smallest spot size the vehicle fits in.
    pub fn size(self) -> SpotSize {
        match self {
            VehicleClass::Bicycle | VehicleClass::Motorcycle => SpotSize::Small,
            VehicleClass::Car | VehicleClass::ElectricCar => SpotSize::Medium,
            VehicleClass::Suv | VehicleClass::ElectricSuv | VehicleClass::Van => SpotSize::Large,
            VehicleClass::Truck | VehicleClass::Bus => SpotSize::XLarge,
        }
    }

    pub fn is_electric(self) -> bool {
        matches!(self, VehicleClass::ElectricCar | VehicleClass::ElectricSuv)
    }
}

/// A vehicle already resolved (and ownership-checked) by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub class: VehicleClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpotStatus {
    Available,
    Reserved,
    Occupied,
    /// Out of service for upkeep; not bookable until maintenance ends.
    Maintenance,
}

impl SpotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SpotStatus::Available => "AVAILABLE",
            SpotStatus::Reserved => "RESERVED",
            SpotStatus::Occupied => "OCCUPIED",
            SpotStatus::Maintenance => "MAINTENANCE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotFeatures {
    pub ev_charger: bool,
    pub covered: bool,
    pub accessible: bool,
    pub vip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spot {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub zone_id: Ulid,
    /// Human-facing spot number, e.g. "A-101".
    pub label: String,
    pub size: SpotSize,
    pub features: SpotFeatures,
    pub status: SpotStatus,
    /// Booking currently holding the spot. `Some` iff status is not Available.
    pub occupant: Option<Ulid>,
    pub active: bool,
}

impl Spot {
    pub fn new(
        id: Ulid,
        facility_id: Ulid,
        zone_id: Ulid,
        label: impl Into<String>,
        size: SpotSize,
        features: SpotFeatures,
    ) -> Self {
        Self {
            id,
            facility_id,
            zone_id,
            label: label.into(),
            size,
            features,
            status: SpotStatus::Available,
            occupant: None,
            active: true,
        }
    }

    pub fn is_available(&self) -> bool {
        self.active && self.status == SpotStatus::Available
    }
}

// ── Lock-protected spot state ────────────────────────────────────

/// A non-terminal booking's hold on a spot, kept inside the spot's state so
/// conflict checks never need to lock the booking itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub booking_id: Ulid,
    pub start: Ms,
    /// `None` for drive-ins: open-ended until completion.
    pub end: Option<Ms>,
    pub status: BookingStatus,
}

impl Claim {
    pub fn overlaps(&self, span: &Span) -> bool {
        self.start < span.end && self.end.is_none_or(|end| end > span.start)
    }
}

#[derive(Debug, Clone)]
pub struct SpotState {
    pub spot: Spot,
    /// Non-terminal claims, sorted by `start`.
    pub claims: Vec<Claim>,
}

impl SpotState {
    pub fn new(spot: Spot) -> Self {
        Self {
            spot,
            claims: Vec::new(),
        }
    }

    /// Insert claim maintaining sort order by start.
    pub fn insert_claim(&mut self, claim: Claim) {
        let pos = self
            .claims
            .binary_search_by_key(&claim.start, |c| c.start)
            .unwrap_or_else(|e| e);
        self.claims.insert(pos, claim);
    }

    pub fn remove_claim(&mut self, booking_id: Ulid) -> Option<Claim> {
        let pos = self.claims.iter().position(|c| c.booking_id == booking_id)?;
        Some(self.claims.remove(pos))
    }

    pub fn claim_mut(&mut self, booking_id: Ulid) -> Option<&mut Claim> {
        self.claims.iter_mut().find(|c| c.booking_id == booking_id)
    }

    /// Claims whose interval overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Claim> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.claims.partition_point(|c| c.start < query.end);
        self.claims[..right_bound]
            .iter()
            .filter(move |c| c.overlaps(query))
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingMode {
    Reservation,
    DriveIn,
}

impl BookingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingMode::Reservation => "reservation",
            BookingMode::DriveIn => "drive_in",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub ticket: String,
    pub user_id: Ulid,
    pub vehicle: Vehicle,
    pub spot_id: Ulid,
    pub facility_id: Ulid,
    pub spot_size: SpotSize,
    pub mode: BookingMode,
    pub status: BookingStatus,
    pub entry_time: Ms,
    pub expected_exit: Option<Ms>,
    pub actual_exit: Option<Ms>,
    /// Minutes after `expected_exit` before an exit counts as overstay.
    pub grace_period_minutes: u32,
    pub estimated_price: Option<Decimal>,
    pub final_price: Option<Decimal>,
    /// Pass whose entry paid for this booking, if any.
    pub subscription_id: Option<Ulid>,
    /// Opaque caller data, stored and returned untouched.
    pub metadata: BTreeMap<String, String>,
    /// Granted extensions, oldest first.
    pub extensions: Vec<BookingExtension>,
    pub created_at: Ms,
}

impl Booking {
    /// Whole minutes between entry and actual exit.
    pub fn duration_minutes(&self) -> Option<i64> {
        self.actual_exit
            .map(|exit| (exit - self.entry_time).max(0) / MINUTE_MS)
    }

    pub fn grace_end(&self) -> Option<Ms> {
        self.expected_exit
            .map(|exit| exit + self.grace_period_minutes as Ms * MINUTE_MS)
    }

    pub fn is_overstay(&self) -> bool {
        match (self.grace_end(), self.actual_exit) {
            (Some(grace_end), Some(actual)) => actual > grace_end,
            _ => false,
        }
    }

    pub(crate) fn claim(&self) -> Claim {
        Claim {
            booking_id: self.id,
            start: self.entry_time,
            end: self.expected_exit,
            status: self.status,
        }
    }
}

/// A reservation's expected exit moved later, with the extra charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingExtension {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub previous_exit: Ms,
    pub new_exit: Ms,
    pub additional_price: Decimal,
    pub requested_at: Ms,
}

// ── Subscriptions ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSubscription {
    pub id: Ulid,
    pub user_id: Ulid,
    pub plan_id: Ulid,
    pub facility_id: Ulid,
    pub activated_at: Ms,
    pub expires_at: Option<Ms>,
    /// `None` for unlimited (time-based) passes.
    pub entries_remaining: Option<u32>,
    pub active: bool,
}

impl UserSubscription {
    pub fn is_valid_at(&self, now: Ms) -> bool {
        self.active
            && self.expires_at.is_none_or(|exp| now <= exp)
            && self.entries_remaining.is_none_or(|n| n > 0)
    }

    /// Still covers a booking that already spent one of its entries.
    pub fn covers_at(&self, now: Ms) -> bool {
        self.active && self.expires_at.is_none_or(|exp| now <= exp)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// One record per committed unit of work. A booking event carries every
/// mutation of that unit (booking, spot, subscription counter) so replay is
/// all-or-nothing per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpotRegistered {
        spot: Spot,
    },
    SpotRetired {
        id: Ulid,
    },
    SpotReactivated {
        id: Ulid,
    },
    SpotMaintenanceStarted {
        id: Ulid,
    },
    SpotMaintenanceEnded {
        id: Ulid,
    },
    RulePut {
        rule: PricingRule,
    },
    RuleRemoved {
        id: Ulid,
        facility_id: Ulid,
    },
    SubscriptionGranted {
        subscription: UserSubscription,
    },
    SubscriptionRevoked {
        id: Ulid,
    },
    /// Reservation or drive-in created. `booking.subscription_id` names the
    /// pass whose entry was consumed.
    BookingOpened {
        booking: Booking,
    },
    /// Snapshot form of a booking written by compaction: full current state,
    /// no subscription side effects on replay.
    BookingRestored {
        booking: Booking,
    },
    BookingCheckedIn {
        id: Ulid,
        spot_id: Ulid,
    },
    BookingExtended {
        spot_id: Ulid,
        extension: BookingExtension,
    },
    /// Booking moved to a terminal state and released its spot.
    BookingClosed {
        id: Ulid,
        spot_id: Ulid,
        status: BookingStatus,
        actual_exit: Option<Ms>,
        final_price: Option<Decimal>,
        /// Pass consumed at exit (drive-in or newly activated pass).
        consumed_subscription: Option<Ulid>,
    },
}

impl Event {
    pub fn label(&self) -> &'static str {
        match self {
            Event::SpotRegistered { .. } => "spot_registered",
            Event::SpotRetired { .. } => "spot_retired",
            Event::SpotReactivated { .. } => "spot_reactivated",
            Event::SpotMaintenanceStarted { .. } => "spot_maintenance_started",
            Event::SpotMaintenanceEnded { .. } => "spot_maintenance_ended",
            Event::RulePut { .. } => "rule_put",
            Event::RuleRemoved { .. } => "rule_removed",
            Event::SubscriptionGranted { .. } => "subscription_granted",
            Event::SubscriptionRevoked { .. } => "subscription_revoked",
            Event::BookingOpened { .. } => "booking_opened",
            Event::BookingRestored { .. } => "booking_restored",
            Event::BookingCheckedIn { .. } => "booking_checked_in",
            Event::BookingExtended { .. } => "booking_extended",
            Event::BookingClosed { .. } => "booking_closed",
        }
    }
}

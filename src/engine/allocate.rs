use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::lifecycle::BookingStatus;
use crate::limits::MAX_CLAIMS_PER_SPOT;
use crate::model::*;
use crate::observability;
use crate::pricing::{select_rule, PriceQuote, PricingRule};

use super::conflict::{
    check_accommodates, check_bookable, check_no_conflict, now_ms, validate_metadata, validate_span,
};
use super::{Engine, EngineError};

impl Engine {
    /// Reserve `spot_id` for `[entry_time, expected_exit)`.
    ///
    /// Runs entirely under the spot's write lock: the loser of a race sees the
    /// winner's committed state and fails with `InvalidState` or `Conflict`.
    /// On any error the ticket index and subscription counters are untouched.
    pub async fn reserve(
        &self,
        user_id: Ulid,
        vehicle: Vehicle,
        spot_id: Ulid,
        entry_time: Ms,
        expected_exit: Ms,
    ) -> Result<Booking, EngineError> {
        self.reserve_with_metadata(user_id, vehicle, spot_id, entry_time, expected_exit, BTreeMap::new())
            .await
    }

    /// `reserve`, storing caller `metadata` on the booking.
    pub async fn reserve_with_metadata(
        &self,
        user_id: Ulid,
        vehicle: Vehicle,
        spot_id: Ulid,
        entry_time: Ms,
        expected_exit: Ms,
        metadata: BTreeMap<String, String>,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self
            .reserve_inner(user_id, vehicle, spot_id, entry_time, expected_exit, metadata)
            .await;
        observability::record("reserve", started, &result);
        result
    }

    async fn reserve_inner(
        &self,
        user_id: Ulid,
        vehicle: Vehicle,
        spot_id: Ulid,
        entry_time: Ms,
        expected_exit: Ms,
        metadata: BTreeMap<String, String>,
    ) -> Result<Booking, EngineError> {
        validate_metadata(&metadata)?;
        if expected_exit <= entry_time {
            return Err(EngineError::InvalidSpan);
        }
        let span = Span::new(entry_time, expected_exit);
        validate_span(&span)?;

        let _unit = self.begin_unit(spot_id).await?;
        let mut st = self.lock_spot(spot_id).await?;
        check_bookable(&st.spot)?;
        check_accommodates(&st.spot, vehicle.class)?;
        check_no_conflict(&st, &span)?;
        if st.claims.len() >= MAX_CLAIMS_PER_SPOT {
            return Err(EngineError::LimitExceeded("too many bookings on spot"));
        }

        let id = Ulid::new();
        let ticket = self.claim_ticket(id)?;
        let now = now_ms();
        let facility_id = st.spot.facility_id;
        let entry_claim = self.claim_subscription(user_id, facility_id, now);
        let quote = match &entry_claim {
            Some(claim) => PriceQuote::subscription(claim.id(), entry_time, expected_exit),
            None => {
                self.quote_by_rule(facility_id, vehicle.class, st.spot.size, entry_time, expected_exit, now)
                    .0
            }
        };

        let booking = Booking {
            id,
            ticket: ticket.ticket().to_string(),
            user_id,
            vehicle,
            spot_id,
            facility_id,
            spot_size: st.spot.size,
            mode: BookingMode::Reservation,
            status: BookingStatus::Confirmed,
            entry_time,
            expected_exit: Some(expected_exit),
            actual_exit: None,
            grace_period_minutes: self.config.grace_period_minutes,
            estimated_price: Some(quote.total),
            final_price: None,
            subscription_id: quote.subscription_id(),
            metadata,
            extensions: Vec::new(),
            created_at: now,
        };
        self.persist_opened(&mut st, &booking, ticket, entry_claim).await?;

        info!(
            "reserved spot {} ({}) for {}: ticket {} estimate {}",
            st.spot.label, spot_id, user_id, booking.ticket, quote.total
        );
        Ok(booking)
    }

    /// Immediate entry without a prior reservation. Entry time is now; the
    /// booking is open-ended until completed.
    pub async fn drive_in(&self, user_id: Ulid, vehicle: Vehicle, spot_id: Ulid) -> Result<Booking, EngineError> {
        self.drive_in_with_metadata(user_id, vehicle, spot_id, BTreeMap::new())
            .await
    }

    pub async fn drive_in_with_metadata(
        &self,
        user_id: Ulid,
        vehicle: Vehicle,
        spot_id: Ulid,
        metadata: BTreeMap<String, String>,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.drive_in_inner(user_id, vehicle, spot_id, metadata).await;
        observability::record("drive_in", started, &result);
        result
    }

    async fn drive_in_inner(
        &self,
        user_id: Ulid,
        vehicle: Vehicle,
        spot_id: Ulid,
        metadata: BTreeMap<String, String>,
    ) -> Result<Booking, EngineError> {
        validate_metadata(&metadata)?;
        let _unit = self.begin_unit(spot_id).await?;
        let mut st = self.lock_spot(spot_id).await?;
        check_bookable(&st.spot)?;
        check_accommodates(&st.spot, vehicle.class)?;

        let id = Ulid::new();
        let ticket = self.claim_ticket(id)?;
        let now = now_ms();
        let facility_id = st.spot.facility_id;
        let entry_claim = self.claim_subscription(user_id, facility_id, now);

        let booking = Booking {
            id,
            ticket: ticket.ticket().to_string(),
            user_id,
            vehicle,
            spot_id,
            facility_id,
            spot_size: st.spot.size,
            mode: BookingMode::DriveIn,
            status: BookingStatus::Active,
            entry_time: now,
            expected_exit: None,
            actual_exit: None,
            grace_period_minutes: self.config.grace_period_minutes,
            estimated_price: None,
            final_price: None,
            subscription_id: entry_claim.as_ref().map(|c| c.id()),
            metadata,
            extensions: Vec::new(),
            created_at: now,
        };
        self.persist_opened(&mut st, &booking, ticket, entry_claim).await?;

        info!(
            "drive-in at spot {} ({}) for {}: ticket {}",
            st.spot.label, spot_id, user_id, booking.ticket
        );
        Ok(booking)
    }

    /// Price `[entry, exit)` with the rule selected at `now`, or the fallback
    /// rate when none applies. Returns the rule for follow-up penalties.
    pub(super) fn quote_by_rule(
        &self,
        facility_id: Ulid,
        vehicle_class: VehicleClass,
        spot_size: SpotSize,
        entry: Ms,
        exit: Ms,
        now: Ms,
    ) -> (PriceQuote, Option<PricingRule>) {
        let rule = select_rule(self, facility_id, vehicle_class, spot_size, now);
        match &rule {
            Some(r) => debug!("facility {facility_id}: pricing with rule {} ({})", r.name, r.id),
            None => debug!("facility {facility_id}: no rule applies, using fallback rate"),
        }
        let quote = PriceQuote::from_rule(rule.as_ref(), self.config.fallback_hourly_rate, entry, exit);
        (quote, rule)
    }
}

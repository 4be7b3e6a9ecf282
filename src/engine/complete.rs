use std::time::Instant;

use tracing::info;
use ulid::Ulid;

use crate::lifecycle::{transition, BookingStatus};
use crate::model::*;
use crate::observability;
use crate::pricing::{AppliedPricing, PriceQuote};

use super::claims::EntryClaim;
use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Close a booking at server time: final price over `[entry, now]`,
    /// status Completed, spot released. One WAL record.
    pub async fn complete(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.complete_inner(booking_id).await;
        observability::record("complete", started, &result);
        result
    }

    async fn complete_inner(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let _unit = self.begin_unit(booking_id).await?;
        let mut booking = self.lock_booking(booking_id).await?;
        transition(booking_id, booking.status, BookingStatus::Completed)?;
        let mut st = self.lock_spot(booking.spot_id).await?;

        let now = now_ms();
        let (quote, entry_claim) = self.exit_quote(&booking, now);
        let event = Event::BookingClosed {
            id: booking_id,
            spot_id: booking.spot_id,
            status: BookingStatus::Completed,
            actual_exit: Some(now),
            final_price: Some(quote.total),
            consumed_subscription: entry_claim.as_ref().map(|c| c.id()),
        };
        self.persist_transition(&mut booking, &mut st, &event, entry_claim)
            .await?;

        let applied = match &quote.applied {
            AppliedPricing::Subscription(_) => "subscription",
            AppliedPricing::Rule { .. } => "rule",
            AppliedPricing::Fallback => "fallback",
        };
        metrics::counter!(observability::PRICED_TOTAL, "applied" => applied).increment(1);
        info!(
            "completed booking {} ({}) after {} min: {} + {} penalty via {applied}",
            booking.ticket, booking_id, quote.duration_minutes, quote.base_price, quote.penalties
        );
        Ok(booking.clone())
    }

    /// Price at exit. A pass already recorded on the booking keeps covering it
    /// while active and unexpired; otherwise a pass valid now is spent; otherwise
    /// rule pricing plus any overstay penalty.
    fn exit_quote(&self, booking: &Booking, now: Ms) -> (PriceQuote, Option<EntryClaim<'_>>) {
        if let Some(sid) = booking.subscription_id
            && self
                .subscriptions
                .get(&sid)
                .is_some_and(|s| s.covers_at(now))
        {
            return (PriceQuote::subscription(sid, booking.entry_time, now), None);
        }
        if let Some(claim) = self.claim_subscription(booking.user_id, booking.facility_id, now) {
            let quote = PriceQuote::subscription(claim.id(), booking.entry_time, now);
            return (quote, Some(claim));
        }
        let (quote, rule) = self.quote_by_rule(
            booking.facility_id,
            booking.vehicle.class,
            booking.spot_size,
            booking.entry_time,
            now,
            now,
        );
        let grace_end = match booking.mode {
            BookingMode::Reservation => booking.grace_end(),
            BookingMode::DriveIn => None,
        };
        (quote.with_overstay(rule.as_ref(), grace_end, now), None)
    }

    /// Confirmed → Active; the spot turns Occupied.
    pub async fn check_in(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.check_in_inner(booking_id).await;
        observability::record("check_in", started, &result);
        result
    }

    async fn check_in_inner(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let _unit = self.begin_unit(booking_id).await?;
        let mut booking = self.lock_booking(booking_id).await?;
        transition(booking_id, booking.status, BookingStatus::Active)?;
        let mut st = self.lock_spot(booking.spot_id).await?;

        let event = Event::BookingCheckedIn {
            id: booking_id,
            spot_id: booking.spot_id,
        };
        self.persist_transition(&mut booking, &mut st, &event, None)
            .await?;
        info!("checked in booking {} at spot {}", booking.ticket, st.spot.label);
        Ok(booking.clone())
    }

    /// Pending/Confirmed → Cancelled; the spot is released. Spent
    /// subscription entries are not refunded.
    pub async fn cancel(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.release_unused(booking_id, BookingStatus::Cancelled).await;
        observability::record("cancel", started, &result);
        result
    }

    /// Confirmed → NoShow; the spot is released.
    pub async fn mark_no_show(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.release_unused(booking_id, BookingStatus::NoShow).await;
        observability::record("no_show", started, &result);
        result
    }

    async fn release_unused(&self, booking_id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        let _unit = self.begin_unit(booking_id).await?;
        let mut booking = self.lock_booking(booking_id).await?;
        transition(booking_id, booking.status, to)?;
        let mut st = self.lock_spot(booking.spot_id).await?;

        let event = Event::BookingClosed {
            id: booking_id,
            spot_id: booking.spot_id,
            status: to,
            actual_exit: None,
            final_price: None,
            consumed_subscription: None,
        };
        self.persist_transition(&mut booking, &mut st, &event, None)
            .await?;
        info!(
            "booking {} marked {}, spot {} released",
            booking.ticket,
            to.as_str(),
            st.spot.label
        );
        Ok(booking.clone())
    }
}

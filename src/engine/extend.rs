use std::time::Instant;

use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::lifecycle::BookingStatus;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Push a reservation's expected exit later. The added window must be
    /// free; its price is the rule price of the longer stay minus that of
    /// the current one, or zero under a pass that still covers the booking.
    pub async fn extend(&self, booking_id: Ulid, new_exit: Ms) -> Result<BookingExtension, EngineError> {
        let started = Instant::now();
        let result = self.extend_inner(booking_id, new_exit).await;
        observability::record("extend", started, &result);
        result
    }

    async fn extend_inner(&self, booking_id: Ulid, new_exit: Ms) -> Result<BookingExtension, EngineError> {
        let _unit = self.begin_unit(booking_id).await?;
        let mut booking = self.lock_booking(booking_id).await?;
        let previous_exit = match (booking.mode, booking.status, booking.expected_exit) {
            (BookingMode::Reservation, BookingStatus::Confirmed | BookingStatus::Active, Some(exit)) => exit,
            _ => return Err(EngineError::NotExtendable(booking_id)),
        };
        if new_exit <= previous_exit {
            return Err(EngineError::InvalidSpan);
        }
        validate_span(&Span::new(booking.entry_time, new_exit))?;

        let mut st = self.lock_spot(booking.spot_id).await?;
        check_no_conflict(&st, &Span::new(previous_exit, new_exit))?;

        let now = now_ms();
        let covered = booking
            .subscription_id
            .and_then(|sid| self.subscriptions.get(&sid).map(|s| s.covers_at(now)))
            .unwrap_or(false);
        let additional_price = if covered {
            Decimal::ZERO
        } else {
            let price_until = |exit| {
                self.quote_by_rule(
                    booking.facility_id,
                    booking.vehicle.class,
                    booking.spot_size,
                    booking.entry_time,
                    exit,
                    now,
                )
                .0
                .total
            };
            (price_until(new_exit) - price_until(previous_exit)).max(Decimal::ZERO)
        };

        let extension = BookingExtension {
            id: Ulid::new(),
            booking_id,
            previous_exit,
            new_exit,
            additional_price,
            requested_at: now,
        };
        let event = Event::BookingExtended {
            spot_id: booking.spot_id,
            extension: extension.clone(),
        };
        self.persist_transition(&mut booking, &mut st, &event, None)
            .await?;
        info!(
            "extended booking {} to {new_exit} for {additional_price} more",
            booking.ticket
        );
        Ok(extension)
    }
}

use ulid::Ulid;

use crate::model::*;
use crate::pricing::{check_subscription, PriceQuote};

use super::conflict::now_ms;
use super::{Engine, EngineError, SharedBooking, SharedSpotState};

impl Engine {
    pub async fn get_spot(&self, id: Ulid) -> Result<Spot, EngineError> {
        let st = self.read_spot(id).await?;
        Ok(st.spot.clone())
    }

    /// Spots of a facility, retired ones included, ordered by label.
    pub async fn list_spots(&self, facility_id: Ulid) -> Result<Vec<Spot>, EngineError> {
        let handles: Vec<(Ulid, SharedSpotState)> = self
            .spots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut spots = Vec::new();
        for (id, handle) in handles {
            let st = self.bounded(id, handle.read_owned()).await?;
            if st.spot.facility_id == facility_id {
                spots.push(st.spot.clone());
            }
        }
        spots.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(spots)
    }

    /// Free, active spots in a facility that fit `class`.
    pub async fn available_spots(
        &self,
        facility_id: Ulid,
        class: VehicleClass,
    ) -> Result<Vec<Spot>, EngineError> {
        Ok(self
            .list_spots(facility_id)
            .await?
            .into_iter()
            .filter(|s| s.is_available() && s.size.accommodates(class.size()))
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.lock_booking(id).await?;
        Ok(booking.clone())
    }

    pub async fn find_by_ticket(&self, ticket: &str) -> Result<Option<Booking>, EngineError> {
        let Some(id) = self.tickets.get(ticket).map(|e| *e.value()) else {
            return Ok(None);
        };
        // A claimed ticket whose unit has not committed yet has no booking.
        match self.get_booking(id).await {
            Ok(booking) => Ok(Some(booking)),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every booking ever made on a spot, oldest first.
    pub async fn bookings_for_spot(&self, spot_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.spots.contains_key(&spot_id) {
            return Err(EngineError::NotFound(spot_id));
        }
        let handles: Vec<(Ulid, SharedBooking)> = self
            .spot_bookings
            .get(&spot_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.booking_handle(id).map(|h| (*id, h)))
                    .collect()
            })
            .unwrap_or_default();
        let mut bookings = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            bookings.push(self.bounded(id, handle.lock_owned()).await?.clone());
        }
        Ok(bookings)
    }

    /// Price a stay of `duration_ms` starting now. Read-only: a matching pass
    /// yields a zero quote without spending an entry.
    pub fn estimate(
        &self,
        facility_id: Ulid,
        vehicle_class: VehicleClass,
        spot_size: SpotSize,
        user_id: Option<Ulid>,
        duration_ms: Ms,
    ) -> Result<PriceQuote, EngineError> {
        if duration_ms < 0 {
            return Err(EngineError::InvalidSpan);
        }
        if duration_ms > crate::limits::MAX_SPAN_DURATION_MS {
            return Err(EngineError::LimitExceeded("span too wide"));
        }
        let now = now_ms();
        let exit = now.saturating_add(duration_ms);
        if let Some(sub) = user_id.and_then(|user| check_subscription(self, user, facility_id, now)) {
            return Ok(PriceQuote::subscription(sub.id, now, exit));
        }
        Ok(self
            .quote_by_rule(facility_id, vehicle_class, spot_size, now, exit, now)
            .0)
    }
}

use std::collections::BTreeMap;

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_metadata(metadata: &BTreeMap<String, String>) -> Result<(), EngineError> {
    use crate::limits::*;
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(EngineError::LimitExceeded("too many metadata entries"));
    }
    for (key, value) in metadata {
        if key.len() > MAX_METADATA_KEY_LEN {
            return Err(EngineError::LimitExceeded("metadata key too long"));
        }
        if value.len() > MAX_METADATA_VALUE_LEN {
            return Err(EngineError::LimitExceeded("metadata value too long"));
        }
    }
    Ok(())
}

/// Spot must be active and free before anything is booked on it.
pub(crate) fn check_bookable(spot: &Spot) -> Result<(), EngineError> {
    if !spot.active {
        return Err(EngineError::NotFound(spot.id));
    }
    if spot.status != SpotStatus::Available {
        return Err(EngineError::InvalidState {
            spot_id: spot.id,
            status: spot.status,
        });
    }
    Ok(())
}

pub fn check_accommodates(spot: &Spot, class: VehicleClass) -> Result<(), EngineError> {
    if spot.size.accommodates(class.size()) {
        Ok(())
    } else {
        Err(EngineError::IncompatibleSize {
            spot: spot.size,
            vehicle: class.size(),
        })
    }
}

/// Fails with the first Confirmed or Active claim overlapping `span`.
/// Back-to-back intervals do not overlap.
pub fn check_no_conflict(st: &SpotState, span: &Span) -> Result<(), EngineError> {
    match st.overlapping(span).find(|c| c.status.holds_spot()) {
        Some(claim) => Err(EngineError::Conflict(claim.booking_id)),
        None => Ok(()),
    }
}

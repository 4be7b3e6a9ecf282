//! Booking lifecycle state machine.
//!
//! | From      | To                                       |
//! |-----------|------------------------------------------|
//! | Pending   | Confirmed, Cancelled                     |
//! | Confirmed | Active, Completed, Cancelled, NoShow     |
//! | Active    | Completed                                |
//! | terminal  | nothing                                  |
//!
//! The allocator creates bookings in Confirmed (reservation) or Active
//! (drive-in). Pending exists for payment-gated reservations created by
//! callers outside the engine.

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    /// Statuses that block an overlapping reservation on the same spot.
    pub fn holds_spot(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Active)
    }

    pub fn allowed_transitions(self) -> &'static [BookingStatus] {
        match self {
            BookingStatus::Pending => &[BookingStatus::Confirmed, BookingStatus::Cancelled],
            BookingStatus::Confirmed => &[
                BookingStatus::Active,
                BookingStatus::Completed,
                BookingStatus::Cancelled,
                BookingStatus::NoShow,
            ],
            BookingStatus::Active => &[BookingStatus::Completed],
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow => &[],
        }
    }

    pub fn can_transition_to(self, to: BookingStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Active => "ACTIVE",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::NoShow => "NO_SHOW",
        }
    }
}

/// Validate `from -> to`. Completing an already completed booking reports
/// `AlreadyCompleted` so callers can treat a repeated exit distinctly.
pub fn transition(
    booking_id: ulid::Ulid,
    from: BookingStatus,
    to: BookingStatus,
) -> Result<BookingStatus, EngineError> {
    if from == BookingStatus::Completed && to == BookingStatus::Completed {
        return Err(EngineError::AlreadyCompleted(booking_id));
    }
    if from.can_transition_to(to) {
        Ok(to)
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

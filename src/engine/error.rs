use ulid::Ulid;

use crate::lifecycle::BookingStatus;
use crate::model::{SpotSize, SpotStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Spot or booking absent, or spot inactive.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidState {
        spot_id: Ulid,
        status: SpotStatus,
    },
    IncompatibleSize {
        spot: SpotSize,
        vehicle: SpotSize,
    },
    /// Overlaps the existing booking with this id.
    Conflict(Ulid),
    /// Exclusive lock on this spot or booking not acquired in time.
    LockTimeout(Ulid),
    TicketGenerationExhausted,
    AlreadyCompleted(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    InvalidSpan,
    /// Only open reservations with an expected exit can be extended.
    NotExtendable(Ulid),
    InvalidConfig(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::IncompatibleSize { .. } => "incompatible_size",
            EngineError::Conflict(_) => "conflict",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::TicketGenerationExhausted => "ticket_exhausted",
            EngineError::AlreadyCompleted(_) => "already_completed",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidSpan => "invalid_span",
            EngineError::NotExtendable(_) => "not_extendable",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidState { spot_id, status } => {
                write!(f, "spot {spot_id} is {}, cannot book", status.as_str())
            }
            EngineError::IncompatibleSize { spot, vehicle } => write!(
                f,
                "spot size {} cannot accommodate {} vehicle",
                spot.as_str(),
                vehicle.as_str()
            ),
            EngineError::Conflict(id) => write!(f, "conflicting reservation: {id}"),
            EngineError::LockTimeout(id) => write!(f, "timed out waiting for lock on {id}"),
            EngineError::TicketGenerationExhausted => {
                write!(f, "could not generate a unique ticket number")
            }
            EngineError::AlreadyCompleted(id) => write!(f, "booking already completed: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition {} -> {}", from.as_str(), to.as_str())
            }
            EngineError::InvalidSpan => write!(f, "expected exit must be after entry time"),
            EngineError::NotExtendable(id) => write!(f, "booking {id} cannot be extended"),
            EngineError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

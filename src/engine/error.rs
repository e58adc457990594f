use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Booking, BookingRef, BookingStatus};

/// One occurrence of a repeat request that did not land.
#[derive(Debug, Clone, Serialize)]
pub struct OccurrenceFailure {
    pub date: chrono::NaiveDate,
    pub reason: String,
    /// Set when the occurrence collided with an existing booking.
    pub conflict: Option<BookingRef>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("slot conflicts with booking {}", .booking.id)]
    Conflict { booking: BookingRef },
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("open match is full ({max_players} players)")]
    CapacityExceeded { max_players: u32 },
    #[error("user {0} already joined this match")]
    AlreadyJoined(Ulid),
    #[error("user {0} is not in this match")]
    NotInRoster(Ulid),
    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("{} occurrences created, {} failed", .created.len(), .failures.len())]
    PartialFailure {
        recurrence_id: Ulid,
        created: Vec<Booking>,
        failures: Vec<OccurrenceFailure>,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    /// A multi-row write stopped partway. `applied` rows are committed.
    #[error("{} booking(s) changed before the write stopped: {cause}", .applied.len())]
    Interrupted { applied: Vec<Ulid>, cause: Box<EngineError> },
}

impl EngineError {
    /// Short machine-readable kind, used for error bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::Conflict { .. } => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::NotFound(_) => "not_found",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::AlreadyJoined(_) => "already_joined",
            EngineError::NotInRoster(_) => "not_in_roster",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::PartialFailure { .. } => "partial_failure",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
            EngineError::Interrupted { .. } => "interrupted",
        }
    }
}

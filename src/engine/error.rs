use thiserror::Error;
use ulid::Ulid;

use crate::model::{AppointmentStatus, Ms};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid duration: [{start}, {end}) is empty")]
    Duration { start: Ms, end: Ms },
    #[error("conflict with appointment: {0}")]
    Conflict(Ulid),
    #[error("cannot move appointment from {from} to {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// Lock timeout or storage failure. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("payment error: {0}")]
    Payment(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

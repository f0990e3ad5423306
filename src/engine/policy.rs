use std::fmt;

use crate::model::*;

use super::EngineError;

/// Admission rules for new bookings, configurable per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    pub min_notice_ms: Ms,
    pub max_advance_ms: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            min_notice_ms: HOUR_MS,
            max_advance_ms: 90 * DAY_MS,
        }
    }
}

impl BookingPolicy {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.min_notice_ms < 0 {
            return Err(EngineError::InvalidArgument("min notice must not be negative".into()));
        }
        if self.max_advance_ms < self.min_notice_ms {
            return Err(EngineError::InvalidArgument(
                "max advance must not be shorter than min notice".into(),
            ));
        }
        Ok(())
    }
}

/// Why a booking request was turned away. An outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    TooSoon,
    TooFar,
    OutsideAvailability,
    DoctorInactive,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionReason::TooSoon => "too_soon",
            RejectionReason::TooFar => "too_far",
            RejectionReason::OutsideAvailability => "outside_availability",
            RejectionReason::DoctorInactive => "doctor_inactive",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply the policy rules in order; the first failing rule decides.
/// `free` is the doctor's free intervals on the candidate's local date.
pub fn admit(
    now: Ms,
    candidate: &Span,
    policy: &BookingPolicy,
    free: &[Span],
) -> Result<(), RejectionReason> {
    let lead = candidate.start - now;
    if lead < policy.min_notice_ms {
        return Err(RejectionReason::TooSoon);
    }
    if lead > policy.max_advance_ms {
        return Err(RejectionReason::TooFar);
    }
    // The whole visit must fit one free interval.
    if !free.iter().any(|f| f.contains_span(candidate)) {
        return Err(RejectionReason::OutsideAvailability);
    }
    Ok(())
}

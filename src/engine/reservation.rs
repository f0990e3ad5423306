use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::resolve_free;
use super::conflict::{appointment_span, conflict_in_doctor};
use super::policy::{admit, RejectionReason};
use super::{Engine, EngineError};

/// A patient's request for one appointment.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub idempotency_key: Option<String>,
}

impl BookingRequest {
    pub fn new(doctor_id: Ulid, patient_id: Ulid, service_id: Ulid, start: Ms, duration_minutes: u32) -> Self {
        Self {
            id: Ulid::new(),
            doctor_id,
            patient_id,
            service_id,
            start,
            duration_minutes,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    fn validate(&self) -> Result<Span, EngineError> {
        if self.duration_minutes == 0 || self.duration_minutes > MAX_APPOINTMENT_MINUTES {
            return Err(EngineError::InvalidArgument(format!(
                "duration must be 1..={MAX_APPOINTMENT_MINUTES} minutes, got {}",
                self.duration_minutes
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() {
                return Err(EngineError::InvalidArgument("empty idempotency key".into()));
            }
            if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(EngineError::LimitExceeded("idempotency key too long"));
            }
        }
        appointment_span(self.start, self.duration_minutes)
    }
}

/// Terminal state of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    Committed(Appointment),
    Rejected(RejectionReason),
    Conflicted { appointment_id: Ulid },
}

impl ReservationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReservationOutcome::Committed(_) => "committed",
            ReservationOutcome::Rejected(_) => "rejected",
            ReservationOutcome::Conflicted { .. } => "conflicted",
        }
    }

    pub fn committed(&self) -> Option<&Appointment> {
        match self {
            ReservationOutcome::Committed(a) => Some(a),
            _ => None,
        }
    }
}

impl Engine {
    /// Atomically reserve a slot.
    ///
    /// The doctor's write lock is held from the idempotency lookup through the
    /// commit, so the conflict check always sees every earlier reservation.
    /// Dropping the returned future before the WAL enqueue has no effect;
    /// after it, the commit finishes on its own.
    pub async fn reserve(&self, req: BookingRequest) -> Result<ReservationOutcome, EngineError> {
        let started = Instant::now();
        let result = self.reserve_inner(req).await;
        metrics::histogram!(observability::RESERVATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(o) => o.label(),
            Err(e) if e.is_retryable() => "transient",
            Err(_) => "error",
        };
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn reserve_inner(&self, req: BookingRequest) -> Result<ReservationOutcome, EngineError> {
        let span = req.validate()?;
        let guard = self.lock_doctor(req.doctor_id).await?;

        if let Some(key) = &req.idempotency_key
            && let Some(existing) = guard.idempotency.get(key)
            && let Some(appt) = guard.appointment(*existing) {
                debug!(appointment = %appt.id, key = %key, "idempotent replay of reservation");
                return Ok(ReservationOutcome::Committed(appt.clone()));
            }
        if self.entity_to_doctor.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many appointments on doctor"));
        }

        let now = self.now();
        if let Some(outcome) = self.screen(&guard, &span, now, None) {
            return Ok(outcome);
        }

        let appointment = Appointment {
            id: req.id,
            doctor_id: req.doctor_id,
            patient_id: req.patient_id,
            service_id: req.service_id,
            start: span.start,
            duration_minutes: req.duration_minutes,
            status: AppointmentStatus::Scheduled,
            payment_status: PaymentStatus::Pending,
            amount: guard.consultation_fee,
            payment_reference: None,
            cancellation_reason: None,
            reminder_sent: false,
            idempotency_key: req.idempotency_key,
            created_at: now,
        };
        let event = Event::AppointmentBooked { appointment: appointment.clone() };
        self.commit(guard, event).await?;
        info!(
            appointment = %appointment.id,
            doctor = %appointment.doctor_id,
            start = appointment.start,
            "appointment booked"
        );
        Ok(ReservationOutcome::Committed(appointment))
    }

    /// Doctor-level, policy and conflict checks shared by booking and rescheduling.
    /// `None` means the span may be committed.
    pub(super) fn screen(
        &self,
        doctor: &DoctorState,
        span: &Span,
        now: Ms,
        ignore: Option<Ulid>,
    ) -> Option<ReservationOutcome> {
        if !doctor.active {
            return Some(ReservationOutcome::Rejected(RejectionReason::DoctorInactive));
        }
        let free = doctor
            .local_date(span.start)
            .map(|date| resolve_free(doctor, date))
            .unwrap_or_default();
        if let Err(reason) = admit(now, span, &self.settings.policy, &free) {
            debug!(doctor = %doctor.id, reason = %reason, "booking rejected by policy");
            return Some(ReservationOutcome::Rejected(reason));
        }
        conflict_in_doctor(doctor, span, ignore)
            .map(|appointment_id| ReservationOutcome::Conflicted { appointment_id })
    }
}

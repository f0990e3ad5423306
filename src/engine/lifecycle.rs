use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::payment::{PaymentGateway, PaymentIntent};

use super::conflict::appointment_span;
use super::reservation::ReservationOutcome;
use super::{Engine, EngineError};

fn check_reason(reason: &Option<String>) -> Result<(), EngineError> {
    if let Some(r) = reason
        && r.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
    Ok(())
}

impl Engine {
    /// Move an appointment along the status table. Returns the updated appointment.
    pub async fn update_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        check_reason(&reason)?;
        let guard = self.lock_for_entity(id).await?;
        let current = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition { from: current.status, to: status });
        }
        let from = current.status;
        let doctor_id = guard.id;
        let event = Event::StatusChanged { id, doctor_id, status, reason };
        let guard = self.commit(guard, event).await?;
        info!(appointment = %id, %from, to = %status, "appointment status changed");
        guard.appointment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Cancel an active appointment. Its time range becomes bookable again.
    pub async fn cancel_appointment(&self, id: Ulid, reason: Option<String>) -> Result<Appointment, EngineError> {
        self.update_status(id, AppointmentStatus::Cancelled, reason).await
    }

    /// Move an appointment to a new start, keeping its duration. Subject to the
    /// same admission and conflict rules as a new booking, ignoring itself.
    pub async fn reschedule(&self, id: Ulid, new_start: Ms) -> Result<ReservationOutcome, EngineError> {
        let guard = self.lock_for_entity(id).await?;
        let current = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if !matches!(current.status, AppointmentStatus::Scheduled | AppointmentStatus::Confirmed) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: AppointmentStatus::Scheduled,
            });
        }
        let span = appointment_span(new_start, current.duration_minutes)?;

        if let Some(outcome) = self.screen(&guard, &span, self.now(), Some(id)) {
            return Ok(outcome);
        }
        let event = Event::AppointmentRescheduled { id, doctor_id: guard.id, start: new_start };
        let guard = self.commit(guard, event).await?;
        info!(appointment = %id, start = new_start, "appointment rescheduled");
        let updated = guard.appointment(id).cloned().ok_or(EngineError::NotFound(id))?;
        Ok(ReservationOutcome::Committed(updated))
    }

    // ── Payment status ───────────────────────────────────

    /// Ask the gateway for a payment intent covering the appointment's amount and
    /// record its reference. The gateway is called without holding the doctor lock.
    pub async fn begin_payment(
        &self,
        id: Ulid,
        gateway: &dyn PaymentGateway,
    ) -> Result<PaymentIntent, EngineError> {
        let amount = {
            let guard = self.lock_for_entity(id).await?;
            let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
            if !appt.status.is_active() {
                return Err(EngineError::InvalidArgument(format!(
                    "cannot pay for a {} appointment",
                    appt.status
                )));
            }
            if !matches!(appt.payment_status, PaymentStatus::Pending | PaymentStatus::Failed) {
                return Err(EngineError::InvalidArgument(format!(
                    "payment already {}",
                    appt.payment_status
                )));
            }
            appt.amount
        };
        let intent = gateway
            .create_intent(id, amount)
            .await
            .map_err(|e| EngineError::Payment(e.to_string()))?;
        self.record_payment(id, PaymentStatus::Pending, Some(intent.reference.clone()))
            .await?;
        Ok(intent)
    }

    /// Record a settlement result reported by the payment provider.
    pub async fn record_payment(
        &self,
        id: Ulid,
        status: PaymentStatus,
        reference: Option<String>,
    ) -> Result<Appointment, EngineError> {
        if let Some(r) = &reference
            && r.len() > MAX_PAYMENT_REFERENCE_LEN {
                return Err(EngineError::LimitExceeded("payment reference too long"));
            }
        let guard = self.lock_for_entity(id).await?;
        let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        let allowed = match (appt.payment_status, status) {
            (PaymentStatus::Pending | PaymentStatus::Failed, PaymentStatus::Pending)
            | (PaymentStatus::Pending | PaymentStatus::Failed, PaymentStatus::Completed)
            | (PaymentStatus::Pending, PaymentStatus::Failed) => true,
            (PaymentStatus::Completed, PaymentStatus::Refunded) => appt.status == AppointmentStatus::Cancelled,
            _ => false,
        };
        if !allowed {
            return Err(EngineError::InvalidArgument(format!(
                "payment cannot go from {} to {status}",
                appt.payment_status
            )));
        }
        let event = Event::PaymentUpdated { id, doctor_id: guard.id, status, reference };
        let guard = self.commit(guard, event).await?;
        debug!(appointment = %id, payment = %status, "payment status recorded");
        guard.appointment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Refund a completed payment of a cancelled appointment.
    pub async fn refund_payment(
        &self,
        id: Ulid,
        gateway: &dyn PaymentGateway,
    ) -> Result<Appointment, EngineError> {
        let (reference, amount) = {
            let guard = self.lock_for_entity(id).await?;
            let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
            if appt.status != AppointmentStatus::Cancelled || appt.payment_status != PaymentStatus::Completed {
                return Err(EngineError::InvalidArgument(format!(
                    "refund needs a cancelled appointment with a completed payment, got {} / {}",
                    appt.status, appt.payment_status
                )));
            }
            let reference = appt
                .payment_reference
                .clone()
                .ok_or_else(|| EngineError::InvalidArgument("no payment reference recorded".into()))?;
            (reference, appt.amount)
        };
        gateway
            .refund(&reference, amount)
            .await
            .map_err(|e| EngineError::Payment(e.to_string()))?;
        self.record_payment(id, PaymentStatus::Refunded, None).await
    }

    // ── Status sweeps ────────────────────────────────────

    /// Mark scheduled/confirmed appointments whose start is at least `grace_ms`
    /// in the past as no-shows. Idempotent. Returns the ids marked.
    pub async fn mark_no_shows(&self, now: Ms, grace_ms: Ms) -> Result<Vec<Ulid>, EngineError> {
        let cutoff = now - grace_ms;
        let mut marked = Vec::new();
        let doctor_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();

        for doctor_id in doctor_ids {
            if marked.len() >= MAX_SWEEP_BATCH {
                break;
            }
            let Some(doctor) = self.get_doctor_state(&doctor_id) else { continue };
            // Read-side check first so idle doctors never take the write lock.
            let any_due = {
                let guard = doctor.read().await;
                guard.appointments[..guard.appointments.partition_point(|a| a.start <= cutoff)]
                    .iter()
                    .any(is_no_show_candidate)
            };
            if !any_due {
                continue;
            }

            let mut guard = match self.lock_doctor(doctor_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let due: Vec<Ulid> = guard.appointments[..guard.appointments.partition_point(|a| a.start <= cutoff)]
                .iter()
                .filter(|a| is_no_show_candidate(a))
                .map(|a| a.id)
                .take(MAX_SWEEP_BATCH - marked.len())
                .collect();
            for id in due {
                let event = Event::StatusChanged {
                    id,
                    doctor_id,
                    status: AppointmentStatus::NoShow,
                    reason: None,
                };
                guard = self.commit(guard, event).await?;
                marked.push(id);
            }
        }

        if !marked.is_empty() {
            metrics::counter!(observability::NO_SHOWS_MARKED_TOTAL).increment(marked.len() as u64);
            info!(count = marked.len(), "marked appointments as no-show");
        }
        Ok(marked)
    }

    /// Appointments starting within `(now, now + lead_ms]` that still need a reminder.
    pub async fn due_reminders(&self, now: Ms, lead_ms: Ms) -> Vec<Appointment> {
        let window = Span::new(now + 1, now + lead_ms.max(1) + 1);
        let mut due = Vec::new();
        let doctors: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for doctor in doctors {
            let guard = doctor.read().await;
            due.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| window.contains_instant(a.start))
                    .filter(|a| {
                        matches!(a.status, AppointmentStatus::Scheduled | AppointmentStatus::Confirmed)
                            && !a.reminder_sent
                    })
                    .cloned(),
            );
            if due.len() >= MAX_SWEEP_BATCH {
                due.truncate(MAX_SWEEP_BATCH);
                break;
            }
        }
        due.sort_by_key(|a| a.start);
        due
    }

    /// Record that a reminder went out. A second call is a no-op.
    pub async fn mark_reminder_sent(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_for_entity(id).await?;
        let appt = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if appt.reminder_sent {
            return Ok(());
        }
        if !appt.status.is_active() {
            warn!(appointment = %id, status = %appt.status, "reminder for inactive appointment");
        }
        let event = Event::ReminderSent { id, doctor_id: guard.id };
        self.commit(guard, event).await?;
        metrics::counter!(observability::REMINDERS_SENT_TOTAL).increment(1);
        Ok(())
    }
}

fn is_no_show_candidate(a: &Appointment) -> bool {
    matches!(a.status, AppointmentStatus::Scheduled | AppointmentStatus::Confirmed)
}

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// `[start, start + duration)` for client-supplied values. The start is range
/// checked before the end is computed.
pub(crate) fn appointment_span(start: Ms, duration_minutes: u32) -> Result<Span, EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::try_new(start, start + duration_minutes as Ms * MINUTE_MS)?;
    validate_span(&span)?;
    Ok(span)
}

/// First active appointment overlapping `candidate`, if any.
/// No doctor filtering: callers pass one doctor's appointments.
pub fn find_conflict<'a, I>(candidate: &Span, appointments: I) -> Option<&'a Appointment>
where
    I: IntoIterator<Item = &'a Appointment>,
{
    appointments
        .into_iter()
        .find(|a| a.status.is_active() && a.span().overlaps(candidate))
}

pub fn has_conflict<'a, I>(candidate: &Span, appointments: I) -> bool
where
    I: IntoIterator<Item = &'a Appointment>,
{
    find_conflict(candidate, appointments).is_some()
}

/// Conflict check against a doctor's sorted appointment list, skipping `ignore`
/// (the appointment being moved during a reschedule).
pub(crate) fn conflict_in_doctor(
    doctor: &DoctorState,
    candidate: &Span,
    ignore: Option<ulid::Ulid>,
) -> Option<ulid::Ulid> {
    doctor
        .overlapping(candidate)
        .filter(|a| Some(a.id) != ignore)
        .find(|a| a.status.is_active())
        .map(|a| a.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn appt(start_min: i64, minutes: u32, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            doctor_id: Ulid::nil(),
            patient_id: Ulid::new(),
            service_id: Ulid::new(),
            start: start_min * MINUTE_MS,
            duration_minutes: minutes,
            status,
            payment_status: PaymentStatus::Pending,
            amount: 0,
            payment_reference: None,
            cancellation_reason: None,
            reminder_sent: false,
            idempotency_key: None,
            created_at: 0,
        }
    }

    fn span(start_min: i64, end_min: i64) -> Span {
        Span::new(start_min * MINUTE_MS, end_min * MINUTE_MS)
    }

    #[test]
    fn no_appointments_no_conflict() {
        assert!(!has_conflict(&span(0, 30), &[]));
    }

    #[test]
    fn overlapping_active_conflicts() {
        let existing = vec![appt(600, 45, AppointmentStatus::Scheduled)];
        assert!(has_conflict(&span(620, 650), &existing));
        assert_eq!(find_conflict(&span(620, 650), &existing).map(|a| a.id), Some(existing[0].id));
    }

    #[test]
    fn adjacent_is_not_conflict() {
        let existing = vec![appt(600, 45, AppointmentStatus::Confirmed)];
        assert!(!has_conflict(&span(645, 690), &existing));
        assert!(!has_conflict(&span(555, 600), &existing));
    }

    #[test]
    fn inactive_statuses_ignored() {
        for status in [
            AppointmentStatus::Cancelled,
            AppointmentStatus::Completed,
            AppointmentStatus::NoShow,
        ] {
            let existing = vec![appt(600, 60, status)];
            assert!(!has_conflict(&span(600, 660), &existing), "{status} should not block");
        }
        let in_progress = vec![appt(600, 60, AppointmentStatus::InProgress)];
        assert!(has_conflict(&span(630, 690), &in_progress));
    }

    #[test]
    fn order_independent() {
        let mut existing = vec![
            appt(900, 30, AppointmentStatus::Cancelled),
            appt(600, 30, AppointmentStatus::Scheduled),
            appt(700, 30, AppointmentStatus::Scheduled),
        ];
        let candidate = span(710, 740);
        let forward = has_conflict(&candidate, &existing);
        existing.reverse();
        assert_eq!(forward, has_conflict(&candidate, &existing));
        assert!(forward);
    }

    #[test]
    fn doctor_scan_ignores_moving_appointment() {
        let mut d = DoctorState::new(Ulid::new(), None, chrono_tz::Tz::UTC, 0, true);
        let a = appt(600, 60, AppointmentStatus::Scheduled);
        let id = a.id;
        d.insert_appointment(a);
        assert_eq!(conflict_in_doctor(&d, &span(630, 690), None), Some(id));
        assert_eq!(conflict_in_doctor(&d, &span(630, 690), Some(id)), None);
    }

    #[test]
    fn span_out_of_range_rejected() {
        assert!(validate_span(&Span::new(0, 1000)).is_err());
        let ok = Span::new(MIN_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS + HOUR_MS);
        assert!(validate_span(&ok).is_ok());
    }

    #[test]
    fn appointment_span_checks_start_before_adding() {
        for start in [i64::MAX - 1000, i64::MAX, i64::MIN, MAX_VALID_TIMESTAMP_MS] {
            assert!(matches!(
                appointment_span(start, MAX_APPOINTMENT_MINUTES),
                Err(EngineError::LimitExceeded(_))
            ));
        }
        // In range at the start, past the ceiling at the end.
        assert!(matches!(
            appointment_span(MAX_VALID_TIMESTAMP_MS - MINUTE_MS, 30),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            appointment_span(MIN_VALID_TIMESTAMP_MS, 0),
            Err(EngineError::Duration { .. })
        ));
        let ok = appointment_span(MIN_VALID_TIMESTAMP_MS, 45).unwrap();
        assert_eq!(ok.duration_ms(), 45 * MINUTE_MS);
    }
}

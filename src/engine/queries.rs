use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::resolve_free;
use super::conflict::conflict_in_doctor;
use super::policy::admit;
use super::slots::generate_slots;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_doctor(&self, id: Ulid) -> Result<DoctorInfo, EngineError> {
        let doctor = self.get_doctor_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = doctor.read().await;
        Ok(guard.info())
    }

    pub async fn list_doctors(&self) -> Vec<DoctorInfo> {
        let doctors: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(doctors.len());
        for doctor in doctors {
            out.push(doctor.read().await.info());
        }
        out.sort_by_key(|d| d.id);
        out
    }

    pub async fn get_weekly_hours(&self, doctor_id: Ulid) -> Result<Vec<WeeklyAvailability>, EngineError> {
        let doctor = self
            .get_doctor_state(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = doctor.read().await;
        Ok(guard.weekly_hours())
    }

    pub async fn get_blocks(&self, doctor_id: Ulid) -> Result<Vec<BlockedInterval>, EngineError> {
        let doctor = self
            .get_doctor_state(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = doctor.read().await;
        Ok(guard.blocks.clone())
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let doctor_id = self
            .get_doctor_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let doctor = self
            .get_doctor_state(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = doctor.read().await;
        guard.appointment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// A doctor's appointments in start order, optionally only those starting
    /// on one local date.
    pub async fn list_appointments(
        &self,
        doctor_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let doctor = self
            .get_doctor_state(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = doctor.read().await;
        Ok(guard
            .appointments
            .iter()
            .filter(|a| date.is_none() || guard.local_date(a.start) == date)
            .cloned()
            .collect())
    }

    pub async fn list_patient_appointments(&self, patient_id: Ulid) -> Vec<Appointment> {
        let doctors: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for doctor in doctors {
            let guard = doctor.read().await;
            out.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.patient_id == patient_id)
                    .cloned(),
            );
        }
        out.sort_by_key(|a| (a.start, a.id));
        out
    }

    /// Free intervals of a doctor on a local date, before appointments.
    pub async fn resolve_availability(&self, doctor_id: Ulid, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let doctor = self
            .get_doctor_state(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = doctor.read().await;
        Ok(resolve_free(&guard, date))
    }

    /// Slots a patient could book right now: generated from the free intervals,
    /// minus anything the booking policy would reject or an active appointment
    /// already occupies. Granularity defaults to the duration.
    pub async fn resolve_available_slots(
        &self,
        doctor_id: Ulid,
        date: NaiveDate,
        duration_minutes: i64,
        granularity_minutes: Option<i64>,
    ) -> Result<Vec<Slot>, EngineError> {
        if duration_minutes > MAX_APPOINTMENT_MINUTES as i64 {
            return Err(EngineError::LimitExceeded("slot duration too long"));
        }
        let policy = self.settings.policy;
        let granularity = granularity_minutes.unwrap_or(duration_minutes);
        let doctor = self
            .get_doctor_state(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = doctor.read().await;
        let free = resolve_free(&guard, date);
        let slots = generate_slots(&free, duration_minutes, granularity)?;
        if !guard.active {
            return Ok(Vec::new());
        }

        let now = self.now();
        Ok(slots
            .into_iter()
            .filter(|s| admit(now, s, &policy, &free).is_ok())
            .filter(|s| conflict_in_doctor(&guard, s, None).is_none())
            .take(MAX_SLOTS_PER_QUERY)
            .collect())
    }
}

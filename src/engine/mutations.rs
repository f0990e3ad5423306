use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("doctor name too long"));
        }
    Ok(())
}

fn check_fee(fee: u64) -> Result<(), EngineError> {
    if fee > MAX_CONSULTATION_FEE {
        return Err(EngineError::LimitExceeded("consultation fee too large"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_doctor(
        &self,
        id: Ulid,
        name: Option<String>,
        timezone: &str,
        consultation_fee: u64,
        active: bool,
    ) -> Result<(), EngineError> {
        check_name(&name)?;
        check_fee(consultation_fee)?;
        let tz = parse_timezone(timezone)?;

        let _structure = self.structure.lock().await;
        if self.state.len() >= MAX_DOCTORS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many doctors"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let doctor = Arc::new(RwLock::new(DoctorState::new(id, name.clone(), tz, consultation_fee, active)));
        let guard = doctor
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::Transient("new doctor state already locked".into()))?;
        let event = Event::DoctorCreated {
            id,
            name,
            timezone: tz.name().to_string(),
            consultation_fee,
            active,
        };
        // Visible (but write-locked) from the moment the WAL accepts the record;
        // the commit task removes it again if the write fails.
        let rx = self.commit_log.enqueue(&event).await?;
        self.state.insert(id, doctor);
        self.commit_log.finish(rx, guard, event).await?;
        info!(doctor = %id, timezone = %tz.name(), "doctor created");
        Ok(())
    }

    pub async fn update_doctor(
        &self,
        id: Ulid,
        name: Option<String>,
        consultation_fee: u64,
        active: bool,
    ) -> Result<(), EngineError> {
        check_name(&name)?;
        check_fee(consultation_fee)?;
        let guard = self.lock_doctor(id).await?;
        let event = Event::DoctorUpdated { id, name, consultation_fee, active };
        self.commit(guard, event).await?;
        Ok(())
    }

    /// Replace the doctor's whole weekly schedule.
    pub async fn set_weekly_hours(
        &self,
        doctor_id: Ulid,
        hours: Vec<WeeklyAvailability>,
    ) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for h in &hours {
            h.validate()?;
            if !seen.insert(h.weekday) {
                return Err(EngineError::InvalidArgument(format!(
                    "duplicate weekly entry for {}",
                    h.weekday
                )));
            }
        }
        let guard = self.lock_doctor(doctor_id).await?;
        let event = Event::WeeklyHoursSet { doctor_id, hours };
        self.commit(guard, event).await?;
        Ok(())
    }

    pub async fn add_block(&self, doctor_id: Ulid, block: BlockedInterval) -> Result<(), EngineError> {
        block.validate()?;
        if let Some(r) = &block.reason
            && r.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("reason too long"));
            }
        let guard = self.lock_doctor(doctor_id).await?;
        if self.entity_to_doctor.contains_key(&block.id) {
            return Err(EngineError::AlreadyExists(block.id));
        }
        if guard.blocks.len() >= MAX_BLOCKS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many blocked intervals on doctor"));
        }
        let event = Event::BlockAdded { doctor_id, block };
        self.commit(guard, event).await?;
        Ok(())
    }

    pub async fn remove_block(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let guard = self.lock_for_entity(id).await?;
        if !guard.blocks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let doctor_id = guard.id;
        let event = Event::BlockRemoved { id, doctor_id };
        self.commit(guard, event).await?;
        Ok(doctor_id)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Every doctor is read-locked for the duration, so no commit can land in the
    /// old file after its snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _structure = self.structure.lock().await;
        let doctors: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(doctors.len());
        for doctor in doctors {
            guards.push(doctor.read_owned().await);
        }

        let mut events = Vec::new();
        for d in &guards {
            events.push(Event::DoctorCreated {
                id: d.id,
                name: d.name.clone(),
                timezone: d.timezone.name().to_string(),
                consultation_fee: d.consultation_fee,
                active: d.active,
            });
            let hours = d.weekly_hours();
            if !hours.is_empty() {
                events.push(Event::WeeklyHoursSet { doctor_id: d.id, hours });
            }
            for block in &d.blocks {
                events.push(Event::BlockAdded { doctor_id: d.id, block: block.clone() });
            }
            for appointment in &d.appointments {
                events.push(Event::AppointmentBooked { appointment: appointment.clone() });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transient(format!("WAL compaction failed: {e}")))?;
        info!(events = count, doctors = guards.len(), "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

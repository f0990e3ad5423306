mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod policy;
mod queries;
mod reservation;
mod slots;

pub use availability::{merge_overlapping, resolve_free, subtract_intervals};
pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;
pub use policy::{admit, BookingPolicy, RejectionReason};
pub use reservation::{BookingRequest, ReservationOutcome};
pub use slots::generate_slots;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDoctorState = Arc<RwLock<DoctorState>>;
pub type DoctorMap = Arc<DashMap<Ulid, SharedDoctorState>>;

/// Engine tunables. Everything time-based is configurable.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: BookingPolicy,
    /// Upper bound on waiting for a doctor's lock or WAL queue space.
    pub commit_timeout: Duration,
    pub no_show_grace_ms: Ms,
    pub reminder_lead_ms: Ms,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: BookingPolicy::default(),
            commit_timeout: Duration::from_secs(5),
            no_show_grace_ms: 30 * MINUTE_MS,
            reminder_lead_ms: DAY_MS,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Waits for one Append, drains whatever else is already queued, then does a
/// single fsync for the batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    debug!("WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so stale buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

// ── Commit path ──────────────────────────────────────────

/// WAL handle plus everything needed to apply a committed event.
/// Cloned into the detached task that finishes each commit.
#[derive(Clone)]
pub(super) struct CommitLog {
    wal_tx: mpsc::Sender<WalCommand>,
    doctors: DoctorMap,
    index: Arc<DashMap<Ulid, Ulid>>,
    notify: Arc<NotifyHub>,
    timeout: Duration,
}

impl CommitLog {
    /// Hand the event to the WAL writer. Dropping the future before this
    /// returns leaves no trace.
    async fn enqueue(&self, event: &Event) -> Result<oneshot::Receiver<io::Result<()>>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send_timeout(
                WalCommand::Append {
                    event: event.clone(),
                    response: tx,
                },
                self.timeout,
            )
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    EngineError::Transient("WAL queue full".into())
                }
                mpsc::error::SendTimeoutError::Closed(_) => {
                    EngineError::Transient("WAL writer shut down".into())
                }
            })?;
        Ok(rx)
    }

    /// Wait for durability, then apply and notify, on a detached task that owns
    /// the doctor's write guard. The guard comes back to the caller on success.
    async fn finish(
        &self,
        rx: oneshot::Receiver<io::Result<()>>,
        mut guard: OwnedRwLockWriteGuard<DoctorState>,
        event: Event,
    ) -> Result<OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        let log = self.clone();
        let task = tokio::spawn(async move {
            let durable = match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(EngineError::Transient(format!("WAL write failed: {e}"))),
                Err(_) => Err(EngineError::Transient("WAL writer dropped response".into())),
            };
            match durable {
                Ok(()) => {
                    apply_event(&mut guard, &event, &log.index);
                    log.notify.send(&event);
                    Ok(guard)
                }
                Err(e) => {
                    if let Event::DoctorCreated { id, .. } = &event {
                        log.doctors.remove(id);
                    }
                    Err(e)
                }
            }
        });
        task.await
            .map_err(|e| EngineError::Transient(format!("commit task failed: {e}")))?
    }

    /// WAL-append + apply + notify under an already-held write guard.
    pub(super) async fn commit(
        &self,
        guard: OwnedRwLockWriteGuard<DoctorState>,
        event: Event,
    ) -> Result<OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        let rx = self.enqueue(&event).await?;
        self.finish(rx, guard, event).await
    }
}

pub struct Engine {
    pub state: DoctorMap,
    pub notify: Arc<NotifyHub>,
    pub settings: EngineSettings,
    pub(super) commit_log: CommitLog,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: appointment/block id → doctor id.
    pub(super) entity_to_doctor: Arc<DashMap<Ulid, Ulid>>,
    /// Serializes doctor creation against compaction snapshots.
    pub(super) structure: Mutex<()>,
    clock: Arc<dyn Clock>,
}

/// Apply an event to a DoctorState. Caller holds the write lock.
fn apply_event(doctor: &mut DoctorState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        // Doctor state is constructed at the map level.
        Event::DoctorCreated { .. } => {}
        Event::DoctorUpdated { name, consultation_fee, active, .. } => {
            doctor.name = name.clone();
            doctor.consultation_fee = *consultation_fee;
            doctor.active = *active;
        }
        Event::WeeklyHoursSet { hours, .. } => doctor.set_weekly(hours),
        Event::BlockAdded { doctor_id, block } => {
            index.insert(block.id, *doctor_id);
            doctor.insert_block(block.clone());
        }
        Event::BlockRemoved { id, .. } => {
            doctor.remove_block(*id);
            index.remove(id);
        }
        Event::AppointmentBooked { appointment } => {
            index.insert(appointment.id, appointment.doctor_id);
            doctor.insert_appointment(appointment.clone());
        }
        Event::AppointmentRescheduled { id, start, .. } => {
            if let Some(mut appt) = doctor.remove_appointment(*id) {
                appt.start = *start;
                appt.reminder_sent = false;
                doctor.insert_appointment(appt);
            }
        }
        Event::StatusChanged { id, status, reason, .. } => {
            if let Some(appt) = doctor.appointment_mut(*id) {
                appt.status = *status;
                if *status == AppointmentStatus::Cancelled {
                    appt.cancellation_reason = reason.clone();
                }
            }
        }
        Event::PaymentUpdated { id, status, reference, .. } => {
            if let Some(appt) = doctor.appointment_mut(*id) {
                appt.payment_status = *status;
                if reference.is_some() {
                    appt.payment_reference = reference.clone();
                }
            }
        }
        Event::ReminderSent { id, .. } => {
            if let Some(appt) = doctor.appointment_mut(*id) {
                appt.reminder_sent = true;
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, settings: EngineSettings) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let state: DoctorMap = Arc::new(DashMap::new());
        let entity_to_doctor = Arc::new(DashMap::new());
        let commit_log = CommitLog {
            wal_tx: wal_tx.clone(),
            doctors: state.clone(),
            index: entity_to_doctor.clone(),
            notify: notify.clone(),
            timeout: settings.commit_timeout,
        };
        let engine = Self {
            state,
            notify,
            settings,
            commit_log,
            wal_tx,
            entity_to_doctor,
            structure: Mutex::new(()),
            clock,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds. Never use
        // blocking_write here: this may run inside an async context (lazy tenant creation).
        for event in &events {
            match event {
                Event::DoctorCreated { id, name, timezone, consultation_fee, active } => {
                    let tz = parse_timezone(timezone).unwrap_or_else(|e| {
                        warn!(doctor = %id, error = %e, "replay: falling back to UTC");
                        chrono_tz::Tz::UTC
                    });
                    let doctor = DoctorState::new(*id, name.clone(), tz, *consultation_fee, *active);
                    engine.state.insert(*id, Arc::new(RwLock::new(doctor)));
                }
                other => {
                    let doctor_id = other.doctor_id();
                    let Some(entry) = engine.state.get(&doctor_id).map(|e| e.value().clone()) else {
                        warn!(doctor = %doctor_id, kind = other.kind(), "replay: event for unknown doctor");
                        continue;
                    };
                    if let Ok(mut guard) = entry.try_write() {
                        apply_event(&mut guard, other, &engine.entity_to_doctor);
                    }
                }
            }
        }
        debug!(events = events.len(), doctors = engine.state.len(), "engine replayed WAL");

        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn get_doctor_state(&self, id: &Ulid) -> Option<SharedDoctorState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_doctor_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_doctor.get(entity_id).map(|e| *e.value())
    }

    /// Acquire a doctor's write lock, bounded by the commit timeout.
    pub(super) async fn lock_doctor(
        &self,
        doctor_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        let doctor = self
            .get_doctor_state(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        tokio::time::timeout(self.settings.commit_timeout, doctor.write_owned())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::Transient(format!("timed out waiting for doctor {doctor_id}"))
            })
    }

    /// Lookup entity → doctor, acquire the doctor's write lock.
    pub(super) async fn lock_for_entity(
        &self,
        entity_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        let doctor_id = self
            .get_doctor_for_entity(&entity_id)
            .ok_or(EngineError::NotFound(entity_id))?;
        self.lock_doctor(doctor_id).await
    }

    pub(super) async fn commit(
        &self,
        guard: OwnedRwLockWriteGuard<DoctorState>,
        event: Event,
    ) -> Result<OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        self.commit_log.commit(guard, event).await
    }
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Offset, TimeDelta, TimeZone, Weekday};
use chrono::LocalResult;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds, UTC. The only absolute time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

/// A bookable slot. Never persisted.
pub type Slot = Span;

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for request data. Zero-length and inverted spans are rejected.
    pub fn try_new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::Duration { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Span { start, end })
    }

    /// Remove `other` from `self`: zero, one, or two pieces, in order.
    pub fn subtract(&self, other: &Span) -> Vec<Span> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(2);
        if self.start < other.start {
            pieces.push(Span::new(self.start, other.start));
        }
        if other.end < self.end {
            pieces.push(Span::new(other.end, self.end));
        }
        pieces
    }
}

// ── Calendar ─────────────────────────────────────────────────────

/// Wall-clock time of day at minute resolution. `24:00` is allowed as a closing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(24 * 60);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if (hour < 24 && minute < 60) || (hour == 24 && minute == 0) {
            Some(TimeOfDay(hour * 60 + minute))
        } else {
            None
        }
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = EngineError;

    /// Parses `HH:MM` (seconds, if present, must be zero).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || EngineError::InvalidArgument(format!("bad time of day: {s:?}"));
        let mut parts = s.trim().split(':');
        let hour: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let minute: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        if let Some(sec) = parts.next()
            && sec.parse::<u16>().ok() != Some(0) {
                return Err(bad());
            }
        if parts.next().is_some() {
            return Err(bad());
        }
        TimeOfDay::from_hm(hour, minute).ok_or_else(bad)
    }
}

pub fn parse_weekday(s: &str) -> Result<Weekday, EngineError> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| EngineError::InvalidArgument(format!("bad weekday: {s:?}")))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| EngineError::InvalidArgument(format!("bad date {s:?}: {e}")))
}

pub fn parse_timezone(s: &str) -> Result<Tz, EngineError> {
    s.trim()
        .parse::<Tz>()
        .map_err(|_| EngineError::InvalidArgument(format!("unknown timezone: {s:?}")))
}

/// Resolve a local wall-clock instant to Unix ms. Ambiguous times (DST fall-back)
/// take the earlier instant; nonexistent times (DST spring-forward gap) use the
/// offset in effect just before the gap.
pub fn local_to_ms(tz: &Tz, local: NaiveDateTime) -> Ms {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            let offset = tz.offset_from_utc_datetime(&local).fix();
            let shift = TimeDelta::seconds(offset.local_minus_utc() as i64);
            (local - shift).and_utc().timestamp_millis()
        }
    }
}

/// Unix ms of a time of day on a local date. `24:00` maps to the next local midnight.
pub fn local_time_to_ms(tz: &Tz, date: NaiveDate, time: TimeOfDay) -> Ms {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    let local = midnight + TimeDelta::minutes(time.minutes() as i64);
    local_to_ms(tz, local)
}

/// Local calendar date of an instant.
pub fn local_date(tz: &Tz, at: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(at).map(|dt| dt.with_timezone(tz).date_naive())
}

// ── Doctor profile ───────────────────────────────────────────────

/// Recurring opening hours for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAvailability {
    pub weekday: Weekday,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub is_available: bool,
}

impl WeeklyAvailability {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.is_available && self.start >= self.end {
            return Err(EngineError::InvalidArgument(format!(
                "{}: start {} must be before end {}",
                self.weekday, self.start, self.end
            )));
        }
        Ok(())
    }
}

/// A one-off exception carved out of a single local date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedInterval {
    pub id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub reason: Option<String>,
}

impl BlockedInterval {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.start >= self.end {
            return Err(EngineError::InvalidArgument(format!(
                "blocked interval start {} must be before end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    /// Active appointments occupy their time range.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Scheduled | AppointmentStatus::Confirmed | AppointmentStatus::InProgress
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Scheduled, Confirmed | InProgress | Cancelled | NoShow)
                | (Confirmed, InProgress | Cancelled | NoShow)
                | (InProgress, Completed | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in-progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no-show",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "scheduled" => Ok(AppointmentStatus::Scheduled),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "in-progress" => Ok(AppointmentStatus::InProgress),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            "no-show" => Ok(AppointmentStatus::NoShow),
            _ => Err(EngineError::InvalidArgument(format!("unknown status: {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
    /// Minor currency units, fixed at booking time.
    pub amount: u64,
    pub payment_reference: Option<String>,
    pub cancellation_reason: Option<String>,
    pub reminder_sent: bool,
    pub idempotency_key: Option<String>,
    pub created_at: Ms,
}

impl Appointment {
    pub fn end(&self) -> Ms {
        self.start + self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }
}

/// Everything the engine knows about one doctor. Guarded by a per-doctor lock.
#[derive(Debug, Clone)]
pub struct DoctorState {
    pub id: Ulid,
    pub name: Option<String>,
    pub timezone: Tz,
    pub consultation_fee: u64,
    pub active: bool,
    /// Indexed by `Weekday::num_days_from_monday()`.
    pub weekly: [Option<WeeklyAvailability>; 7],
    /// Sorted by `(date, start)`.
    pub blocks: Vec<BlockedInterval>,
    /// Sorted by `start`. Includes inactive (cancelled, completed, ...) appointments.
    pub appointments: Vec<Appointment>,
    /// Idempotency key → appointment id.
    pub idempotency: HashMap<String, Ulid>,
}

impl DoctorState {
    pub fn new(id: Ulid, name: Option<String>, timezone: Tz, consultation_fee: u64, active: bool) -> Self {
        Self {
            id,
            name,
            timezone,
            consultation_fee,
            active,
            weekly: [None; 7],
            blocks: Vec::new(),
            appointments: Vec::new(),
            idempotency: HashMap::new(),
        }
    }

    pub fn weekly_for(&self, weekday: Weekday) -> Option<&WeeklyAvailability> {
        self.weekly[weekday.num_days_from_monday() as usize].as_ref()
    }

    /// Replace the whole week. Days missing from `hours` become unavailable.
    pub fn set_weekly(&mut self, hours: &[WeeklyAvailability]) {
        self.weekly = [None; 7];
        for h in hours {
            self.weekly[h.weekday.num_days_from_monday() as usize] = Some(*h);
        }
    }

    pub fn weekly_hours(&self) -> Vec<WeeklyAvailability> {
        self.weekly.iter().flatten().copied().collect()
    }

    pub fn insert_block(&mut self, block: BlockedInterval) {
        let key = (block.date, block.start);
        let pos = self.blocks.partition_point(|b| (b.date, b.start) <= key);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<BlockedInterval> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    /// Blocked intervals on exactly `date`.
    pub fn blocks_on(&self, date: NaiveDate) -> &[BlockedInterval] {
        let lo = self.blocks.partition_point(|b| b.date < date);
        let hi = self.blocks.partition_point(|b| b.date <= date);
        &self.blocks[lo..hi]
    }

    /// Insert appointment maintaining sort order by start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        if let Some(key) = &appointment.idempotency_key {
            self.idempotency.insert(key.clone(), appointment.id);
        }
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose range overlaps the query window, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.end() > query.start)
    }

    pub fn local_date(&self, at: Ms) -> Option<NaiveDate> {
        local_date(&self.timezone, at)
    }

    pub fn info(&self) -> DoctorInfo {
        DoctorInfo {
            id: self.id,
            name: self.name.clone(),
            timezone: self.timezone.name().to_string(),
            consultation_fee: self.consultation_fee,
            active: self.active,
        }
    }
}

/// WAL record format. Flat, no nesting beyond model structs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DoctorCreated {
        id: Ulid,
        name: Option<String>,
        timezone: String,
        consultation_fee: u64,
        active: bool,
    },
    DoctorUpdated {
        id: Ulid,
        name: Option<String>,
        consultation_fee: u64,
        active: bool,
    },
    WeeklyHoursSet {
        doctor_id: Ulid,
        hours: Vec<WeeklyAvailability>,
    },
    BlockAdded {
        doctor_id: Ulid,
        block: BlockedInterval,
    },
    BlockRemoved {
        id: Ulid,
        doctor_id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        doctor_id: Ulid,
        start: Ms,
    },
    StatusChanged {
        id: Ulid,
        doctor_id: Ulid,
        status: AppointmentStatus,
        reason: Option<String>,
    },
    PaymentUpdated {
        id: Ulid,
        doctor_id: Ulid,
        status: PaymentStatus,
        reference: Option<String>,
    },
    ReminderSent {
        id: Ulid,
        doctor_id: Ulid,
    },
}

impl Event {
    pub fn doctor_id(&self) -> Ulid {
        match self {
            Event::DoctorCreated { id, .. } | Event::DoctorUpdated { id, .. } => *id,
            Event::WeeklyHoursSet { doctor_id, .. }
            | Event::BlockAdded { doctor_id, .. }
            | Event::BlockRemoved { doctor_id, .. }
            | Event::AppointmentRescheduled { doctor_id, .. }
            | Event::StatusChanged { doctor_id, .. }
            | Event::PaymentUpdated { doctor_id, .. }
            | Event::ReminderSent { doctor_id, .. } => *doctor_id,
            Event::AppointmentBooked { appointment } => appointment.doctor_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::DoctorCreated { .. } => "doctor_created",
            Event::DoctorUpdated { .. } => "doctor_updated",
            Event::WeeklyHoursSet { .. } => "weekly_hours_set",
            Event::BlockAdded { .. } => "block_added",
            Event::BlockRemoved { .. } => "block_removed",
            Event::AppointmentBooked { .. } => "appointment_booked",
            Event::AppointmentRescheduled { .. } => "appointment_rescheduled",
            Event::StatusChanged { .. } => "status_changed",
            Event::PaymentUpdated { .. } => "payment_updated",
            Event::ReminderSent { .. } => "reminder_sent",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub timezone: String,
    pub consultation_fee: u64,
    pub active: bool,
}

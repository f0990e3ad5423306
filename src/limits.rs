//! Hard caps on tenant-controlled input. Anything a client can grow is bounded here.

use crate::model::{Ms, DAY_MS};

// Tenancy
pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// Doctors
pub const MAX_DOCTORS_PER_TENANT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_BLOCKS_PER_DOCTOR: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_DOCTOR: usize = 200_000;
pub const MAX_CONSULTATION_FEE: u64 = 100_000_000;

// Appointments
pub const MAX_APPOINTMENT_MINUTES: u32 = 8 * 60;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_PAYMENT_REFERENCE_LEN: usize = 256;

// Timestamps accepted from clients: 2000-01-01 .. 2100-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

// Queries
pub const MAX_SLOTS_PER_QUERY: usize = 1440;
/// Slot length and step are each at most one day.
pub const MAX_SLOT_MINUTES: i64 = 24 * 60;
pub const MAX_ADVANCE_WINDOW_MS: Ms = 730 * DAY_MS;

// Wire
pub const MAX_SQL_LEN: usize = 64 * 1024;
pub const MAX_ROWS_PER_INSERT: usize = 1000;

// Background work per sweep
pub const MAX_SWEEP_BATCH: usize = 10_000;

use crate::model::{DAY_MS, Ms};

pub const MAX_TENANTS: usize = 128;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_TASKS_PER_TENANT: usize = 100_000;
pub const MAX_SLOTS_PER_TASK: usize = 1_000;
pub const MAX_SLOT_CAPACITY: u32 = 10_000;
/// Terminal bookings stay on the slot until the retention sweep purges them.
pub const MAX_BOOKINGS_PER_SLOT: usize = 100_000;

pub const MAX_REMARK_LEN: usize = 500;

pub const MAX_CANCEL_DEADLINE_MS: Ms = 30 * DAY_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Hard ceiling on optimistic retries, whatever the configuration says.
pub const MAX_RESERVE_ATTEMPTS: u32 = 32;

//! Hard limits. Requests beyond these fail with `LimitExceeded`.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SERVICES: usize = 1024;
pub const MAX_SERVICES_PER_BOOKING: usize = 16;
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2048;

pub const MAX_APPOINTMENTS_PER_TENANT: usize = 500_000;

/// Alternatives scan: at most this many days ahead, returning at most this many days.
pub const MAX_SCAN_DAYS: u32 = 14;
pub const MAX_SUGGESTED_DAYS: usize = 3;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

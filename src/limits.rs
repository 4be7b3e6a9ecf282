use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single reservation may not exceed 366 days.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_SPOTS: usize = 100_000;
pub const MAX_CLAIMS_PER_SPOT: usize = 10_000;
pub const MAX_RULES_PER_FACILITY: usize = 1_000;
pub const MAX_SLAB_TIERS: usize = 64;
pub const MAX_PEAK_WINDOWS: usize = 64;

pub const MAX_LABEL_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TICKET_PREFIX_LEN: usize = 16;

pub const MAX_METADATA_ENTRIES: usize = 32;
pub const MAX_METADATA_KEY_LEN: usize = 64;
pub const MAX_METADATA_VALUE_LEN: usize = 1024;

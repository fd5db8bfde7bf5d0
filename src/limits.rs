use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Buffers are bounded so a widened span stays inside the valid range.
pub const MAX_BUFFER_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_HIERARCHY_DEPTH: usize = 32;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_UNITS_PER_BOOKING: usize = 16;
pub const MAX_SPACES_PER_UNIT: usize = 64;
pub const MAX_RESOURCES_PER_UNIT: usize = 64;

pub const MAX_WAL_ENTRY_BYTES: usize = 1 << 20;

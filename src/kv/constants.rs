//! On-disk format and sizing constants.
//!
//! The store keeps its data region in a pair of mirrored files (`.kva` /
//! `.kvb`) or a single committed image (`.kvc`). All multi-byte fields are
//! little-endian. Byte 0 of every image holds the data size, byte 4 the
//! rolling checksum, and records start at [`DATA_START`].

// ── Header layout ───────────────────────────────────────────────────

/// Offset of the `dataSize` field (i32). `-1` marks a mutation in progress.
pub const DATA_SIZE_OFFSET: usize = 0;
/// Offset of the rolling checksum field (u64).
pub const CHECKSUM_OFFSET: usize = 4;
/// First byte of the record region.
pub const DATA_START: usize = 12;

// ── Type tags ───────────────────────────────────────────────────────

/// Tombstone flag on the type byte.
pub const DELETE_MASK: u8 = 0x80;
/// Sidecar-value flag on the type byte: the record body holds a file name.
pub const EXTERNAL_MASK: u8 = 0x40;
/// Low six bits of the type byte carry the value type.
pub const TYPE_MASK: u8 = 0x3F;

// ── Sizing ──────────────────────────────────────────────────────────

/// Allocation granularity and minimum file capacity.
pub const PAGE_SIZE: usize = 4096;
/// Capacity doubles up to this limit, then grows linearly by this step.
pub const DOUBLE_LIMIT: usize = 4 * PAGE_SIZE;
/// Hard ceiling on a store's data region.
pub const DATA_SIZE_LIMIT: usize = 1 << 29;
/// Reclaimable slack beyond which the files are truncated after GC.
pub const TRUNCATE_THRESHOLD: usize = 4 * DOUBLE_LIMIT;

/// Longest permitted key, in encoded bytes (the key length field is one byte).
pub const KEY_LIMIT: usize = 255;
/// Longest permitted encoder tag, in characters.
pub const TAG_LIMIT: usize = 50;

// ── Sidecar values ──────────────────────────────────────────────────

/// Length of a sidecar file name (ASCII), and of the record body that
/// references it.
pub const NAME_SIZE: usize = 32;
/// Default inline-value ceiling; payloads at or above it spill to a sidecar
/// file. Configurable within [`INTERNAL_LIMIT_MIN`, `INTERNAL_LIMIT_MAX`].
pub const INTERNAL_LIMIT_DEFAULT: usize = 8192;
/// Lower bound for the configurable inline limit.
pub const INTERNAL_LIMIT_MIN: usize = 2048;
/// Upper bound for the configurable inline limit (the value length field is
/// an unsigned 16-bit integer).
pub const INTERNAL_LIMIT_MAX: usize = 65535;

// ── Garbage collection ──────────────────────────────────────────────

/// Invalid-segment count that forces a collection (doubled once the data
/// region reaches 16 KiB).
pub const GC_SEGMENTS_THRESHOLD: usize = 80;

/// Tombstoned-byte volume that, doubled, forces a collection. Scales with
/// the size of the data region.
pub fn bytes_threshold(data_end: usize) -> usize {
    if data_end <= 16 * 1024 {
        4096
    } else if data_end <= 64 * 1024 {
        8192
    } else {
        16 * 1024
    }
}

/// Capacity schedule: a page for tiny stores, doubling up to
/// [`DOUBLE_LIMIT`], then linear growth. Returns `None` when `required`
/// exceeds [`DATA_SIZE_LIMIT`].
pub fn new_capacity(current: usize, required: usize) -> Option<usize> {
    if required > DATA_SIZE_LIMIT {
        return None;
    }
    if required <= PAGE_SIZE {
        return Some(PAGE_SIZE);
    }
    let mut capacity = current.max(PAGE_SIZE);
    while capacity < required {
        if capacity < DOUBLE_LIMIT {
            capacity <<= 1;
        } else {
            capacity += DOUBLE_LIMIT;
        }
    }
    Some(capacity.min(DATA_SIZE_LIMIT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_capacity_small_requests_get_one_page() {
        assert_eq!(new_capacity(0, 0), Some(PAGE_SIZE));
        assert_eq!(new_capacity(PAGE_SIZE, 100), Some(PAGE_SIZE));
        assert_eq!(new_capacity(PAGE_SIZE, PAGE_SIZE), Some(PAGE_SIZE));
    }

    #[test]
    fn test_new_capacity_doubles_then_grows_linearly() {
        assert_eq!(new_capacity(PAGE_SIZE, PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
        assert_eq!(new_capacity(2 * PAGE_SIZE, 3 * PAGE_SIZE), Some(4 * PAGE_SIZE));
        // At the doubling limit, growth switches to fixed steps.
        assert_eq!(
            new_capacity(DOUBLE_LIMIT, DOUBLE_LIMIT + 1),
            Some(2 * DOUBLE_LIMIT)
        );
        assert_eq!(
            new_capacity(2 * DOUBLE_LIMIT, 2 * DOUBLE_LIMIT + 1),
            Some(3 * DOUBLE_LIMIT)
        );
    }

    #[test]
    fn test_new_capacity_monotone() {
        let mut cap = PAGE_SIZE;
        for want in (0..200_000).step_by(7001) {
            let next = new_capacity(cap, want.max(cap)).unwrap();
            assert!(next >= cap);
            cap = next;
        }
    }

    #[test]
    fn test_new_capacity_rejects_oversize() {
        assert_eq!(new_capacity(PAGE_SIZE, DATA_SIZE_LIMIT + 1), None);
    }

    #[test]
    fn test_bytes_threshold_tiers() {
        assert_eq!(bytes_threshold(0), 4096);
        assert_eq!(bytes_threshold(16 * 1024), 4096);
        assert_eq!(bytes_threshold(16 * 1024 + 1), 8192);
        assert_eq!(bytes_threshold(64 * 1024), 8192);
        assert_eq!(bytes_threshold(64 * 1024 + 1), 16 * 1024);
    }
}

//! Garbage accounting and in-place compaction.
//!
//! Tombstoned records accumulate as disjoint `[start, end)` segments. When
//! the engine decides to collect, the segments are sorted and coalesced,
//! every live gap between them is shifted left over the holes, and a
//! `(source, shift)` table is kept so the container index can be repaired by
//! binary search instead of a re-parse.

use std::collections::HashMap;

use crate::kv::buffer::Buffer;
use crate::kv::container::Container;

/// One tombstoned byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    pub start: usize,
    pub end: usize,
}

/// Disjoint tombstoned ranges plus their byte total.
pub(crate) struct InvalidSegments {
    segments: Vec<Segment>,
    bytes: usize,
}

impl InvalidSegments {
    pub fn new() -> Self {
        InvalidSegments { segments: Vec::new(), bytes: 0 }
    }

    pub fn add(&mut self, start: usize, end: usize) {
        debug_assert!(start < end);
        self.segments.push(Segment { start, end });
        self.bytes += end - start;
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.bytes = 0;
    }

    /// Drain the set as a sorted list with touching neighbors coalesced.
    pub fn take_merged(&mut self) -> Vec<Segment> {
        let mut segments = std::mem::take(&mut self.segments);
        self.bytes = 0;
        segments.sort_by_key(|s| s.start);
        let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
        for seg in segments {
            match merged.last_mut() {
                Some(last) if last.end == seg.start => last.end = seg.end,
                _ => merged.push(seg),
            }
        }
        merged
    }
}

/// Result of one in-place compaction: the moved range and the shift table
/// for offset repair.
pub(crate) struct Compaction {
    pub gc_start: usize,
    pub new_data_end: usize,
    pub reclaimed: usize,
    /// `(source_offset, shift)` per coalesced hole: live bytes that started
    /// at `source_offset` or later (up to the next entry) moved left by
    /// `shift`.
    src_to_shift: Vec<(usize, usize)>,
}

impl Compaction {
    /// Shift every live gap between the merged segments leftward over the
    /// holes. `segments` must be sorted, coalesced, non-empty, and lie
    /// entirely below `data_end`.
    pub fn run(buffer: &mut Buffer, segments: &[Segment], data_end: usize) -> Compaction {
        let gc_start = segments[0].start;
        let mut src_to_shift = Vec::with_capacity(segments.len());
        let mut shift = 0usize;
        let mut dst = gc_start;
        for (i, seg) in segments.iter().enumerate() {
            shift += seg.end - seg.start;
            let live_end = segments.get(i + 1).map_or(data_end, |next| next.start);
            src_to_shift.push((seg.end, shift));
            buffer.copy_within(seg.end..live_end, dst);
            dst += live_end - seg.end;
        }
        Compaction { gc_start, new_data_end: dst, reclaimed: shift, src_to_shift }
    }

    /// Shift applied to a live offset that was above `gc_start` before the
    /// compaction.
    fn shift_for(&self, offset: usize) -> usize {
        let i = match self.src_to_shift.binary_search_by(|&(src, _)| src.cmp(&offset)) {
            Ok(i) => i,
            Err(0) => return 0,
            Err(i) => i - 1,
        };
        self.src_to_shift[i].1
    }

    /// Repair every container whose record sat above the compaction start.
    pub fn repair(&self, index: &mut HashMap<String, Container>) {
        for container in index.values_mut() {
            if container.offset > self.gc_start {
                let shift = self.shift_for(container.offset);
                container.offset -= shift;
                container.start -= shift;
            }
        }
    }
}

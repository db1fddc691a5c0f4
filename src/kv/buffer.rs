//! Growable little-endian byte buffer with a rolling checksum.
//!
//! [`Buffer`] backs the in-memory image of a store: a flat byte array with a
//! cursor for sequential record encoding/decoding, absolute accessors for
//! header patching, and the position-weighted XOR checksum used to validate
//! the data region.
//!
//! The checksum treats the buffer as little-endian `u64` words: each byte at
//! absolute offset `o` contributes `(b as u64) << ((o & 7) * 8)`, and all
//! contributions are XORed. Identical bytes at different word positions
//! therefore contribute differently, and a patch at any offset can be folded
//! into an existing checksum without rescanning the region.

use byteorder::{ByteOrder, LittleEndian};

use crate::KvError;

/// Flat byte array with a cursor. The backing storage is always fully
/// allocated to the store capacity; `capacity()` is the allocation, not a
/// fill level.
pub(crate) struct Buffer {
    hb: Vec<u8>,
    position: usize,
}

impl Buffer {
    /// Allocate a zero-filled buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer { hb: vec![0u8; capacity], position: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.hb.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Grow (zero-filled) or shrink the backing storage.
    pub fn resize(&mut self, capacity: usize) {
        self.hb.resize(capacity, 0);
        if self.position > capacity {
            self.position = capacity;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.hb
    }

    // ── Cursor access ───────────────────────────────────────────────

    pub fn put_u8(&mut self, v: u8) {
        self.hb[self.position] = v;
        self.position += 1;
    }

    pub fn get_u8(&mut self) -> u8 {
        let v = self.hb[self.position];
        self.position += 1;
        v
    }

    pub fn put_u16(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.hb[self.position..], v);
        self.position += 2;
    }

    pub fn get_u16(&mut self) -> u16 {
        let v = LittleEndian::read_u16(&self.hb[self.position..]);
        self.position += 2;
        v
    }

    pub fn get_i32(&mut self) -> i32 {
        let v = LittleEndian::read_i32(&self.hb[self.position..]);
        self.position += 4;
        v
    }

    pub fn get_i64(&mut self) -> i64 {
        let v = LittleEndian::read_i64(&self.hb[self.position..]);
        self.position += 8;
        v
    }

    pub fn get_f32(&mut self) -> f32 {
        let v = LittleEndian::read_f32(&self.hb[self.position..]);
        self.position += 4;
        v
    }

    pub fn get_f64(&mut self) -> f64 {
        let v = LittleEndian::read_f64(&self.hb[self.position..]);
        self.position += 8;
        v
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.hb[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    pub fn get_bytes(&mut self, len: usize) -> Vec<u8> {
        let v = self.hb[self.position..self.position + len].to_vec();
        self.position += len;
        v
    }

    /// Read `len` bytes at the cursor as UTF-8.
    pub fn get_str(&mut self, len: usize) -> Result<String, KvError> {
        let raw = self.get_bytes(len);
        String::from_utf8(raw)
            .map_err(|e| KvError::Parse(format!("Invalid UTF-8 in record: {}", e)))
    }

    // ── Absolute access ─────────────────────────────────────────────

    pub fn read_u8_at(&self, offset: usize) -> u8 {
        self.hb[offset]
    }

    pub fn write_u8_at(&mut self, offset: usize, v: u8) {
        self.hb[offset] = v;
    }

    pub fn write_i32_at(&mut self, offset: usize, v: i32) {
        LittleEndian::write_i32(&mut self.hb[offset..], v);
    }

    pub fn write_i64_at(&mut self, offset: usize, v: i64) {
        LittleEndian::write_i64(&mut self.hb[offset..], v);
    }

    pub fn write_u64_at(&mut self, offset: usize, v: u64) {
        LittleEndian::write_u64(&mut self.hb[offset..], v);
    }

    pub fn write_bytes_at(&mut self, offset: usize, bytes: &[u8]) {
        self.hb[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Move `src` over `dst` within the buffer (ranges may overlap).
    pub fn copy_within(&mut self, src: std::ops::Range<usize>, dst: usize) {
        self.hb.copy_within(src, dst);
    }

    // ── Checksum ────────────────────────────────────────────────────

    /// Position-weighted XOR checksum over `[offset, offset + len)`.
    ///
    /// The main loop XORs whole aligned words; unaligned head and tail bytes
    /// are folded in individually at their word positions, which keeps the
    /// result identical to the per-byte definition.
    pub fn checksum(&self, offset: usize, len: usize) -> u64 {
        checksum_of(&self.hb[..offset + len], offset, len)
    }
}

/// Checksum of `data[offset .. offset + len)` with byte positions taken from
/// the absolute offsets within `data`.
pub(crate) fn checksum_of(data: &[u8], offset: usize, len: usize) -> u64 {
    let end = offset + len;
    let mut pos = offset;
    let mut sum = 0u64;
    while pos < end && pos & 7 != 0 {
        sum ^= (data[pos] as u64) << ((pos & 7) * 8);
        pos += 1;
    }
    while pos + 8 <= end {
        sum ^= LittleEndian::read_u64(&data[pos..]);
        pos += 8;
    }
    while pos < end {
        sum ^= (data[pos] as u64) << ((pos & 7) * 8);
        pos += 1;
    }
    sum
}

/// Fold a word-sized XOR diff at `offset` into a running checksum.
///
/// Rotation (rather than a shift) keeps the bits that cross a word boundary:
/// they wrap to the low byte positions of the following word, which is
/// exactly where the XOR-of-words total expects them.
pub(crate) fn shift_checksum(sum: u64, offset: usize) -> u64 {
    sum.rotate_left(((offset & 7) * 8) as u32)
}

//! Mirrored memory-mapped file pair.
//!
//! Non-blocking stores keep two redundant copies of the image, `<name>.kva`
//! and `<name>.kvb`, both mapped read-write. Every mutation is applied to A
//! under an in-progress marker (`dataSize = -1`) and then to B, so that at
//! any instant at least one file carries a complete, checksummed image. The
//! opener prefers A and falls back to B.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{MmapMut, MmapOptions};

use crate::kv::constants::{CHECKSUM_OFFSET, DATA_SIZE_OFFSET, DATA_START, PAGE_SIZE};
use crate::KvError;

/// Path of mirror copy A.
pub(crate) fn a_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.kva", name))
}

/// Path of mirror copy B.
pub(crate) fn b_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.kvb", name))
}

/// Path of the committed single-file image.
pub(crate) fn c_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.kvc", name))
}

/// Path of a pending single-file commit.
pub(crate) fn tmp_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.tmp", name))
}

/// The open, mapped A/B pair. Both maps always span the same capacity.
pub(crate) struct MirrorFiles {
    a_file: File,
    b_file: File,
    a: MmapMut,
    b: MmapMut,
    capacity: usize,
}

impl MirrorFiles {
    /// Open (creating if absent) and map both copies, sized to at least one
    /// page and to the larger of the two existing files.
    pub fn open(dir: &Path, name: &str) -> Result<Self, KvError> {
        let a_file = open_rw(&a_path(dir, name))?;
        let b_file = open_rw(&b_path(dir, name))?;
        let a_len = file_len(&a_file)?;
        let b_len = file_len(&b_file)?;
        let capacity = a_len.max(b_len).max(PAGE_SIZE);
        if a_len != capacity {
            set_len(&a_file, capacity)?;
        }
        if b_len != capacity {
            set_len(&b_file, capacity)?;
        }
        let a = map(&a_file, capacity)?;
        let b = map(&b_file, capacity)?;
        Ok(MirrorFiles { a_file, b_file, a, b, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn a(&self) -> &[u8] {
        &self.a
    }

    pub fn b(&self) -> &[u8] {
        &self.b
    }

    /// Extend both files and remap.
    pub fn grow(&mut self, new_capacity: usize) -> Result<(), KvError> {
        set_len(&self.a_file, new_capacity)?;
        set_len(&self.b_file, new_capacity)?;
        self.a = map(&self.a_file, new_capacity)?;
        self.b = map(&self.b_file, new_capacity)?;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Shrink both files and remap. The new maps cover only the retained
    /// prefix, so they are swapped in before the files are cut.
    pub fn truncate(&mut self, new_capacity: usize) -> Result<(), KvError> {
        self.a = map(&self.a_file, new_capacity)?;
        self.b = map(&self.b_file, new_capacity)?;
        self.capacity = new_capacity;
        set_len(&self.a_file, new_capacity)?;
        set_len(&self.b_file, new_capacity)?;
        Ok(())
    }

    /// msync both copies.
    pub fn flush(&self) -> Result<(), KvError> {
        self.a
            .flush()
            .map_err(|e| KvError::Io(format!("Cannot flush mirror A: {}", e)))?;
        self.b
            .flush()
            .map_err(|e| KvError::Io(format!("Cannot flush mirror B: {}", e)))
    }

    /// Mirror a patch of at most one word of data: new checksum, then the
    /// value bytes, applied to A and then B.
    ///
    /// With at most eight changed data bytes the rolling checksum detects
    /// any torn write on its own, so the in-progress marker is skipped.
    pub fn patch_small(&mut self, checksum: u64, offset: usize, bytes: &[u8]) {
        debug_assert!(bytes.len() <= 8);
        LittleEndian::write_u64(&mut self.a[CHECKSUM_OFFSET..], checksum);
        self.a[offset..offset + bytes.len()].copy_from_slice(bytes);
        LittleEndian::write_u64(&mut self.b[CHECKSUM_OFFSET..], checksum);
        self.b[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Mirror a record-level update: an optional contiguous byte range from
    /// `src`, an optional tombstone byte, the new checksum, and the new data
    /// size.
    ///
    /// A is written under the `-1` marker and restored last; B is written
    /// with its size first, after A is complete. Between any two steps one
    /// of the files holds a fully consistent image.
    pub fn apply_update(
        &mut self,
        src: &[u8],
        range: Option<(usize, usize)>,
        tombstone: Option<(usize, u8)>,
        checksum: u64,
        data_size: i32,
    ) {
        LittleEndian::write_i32(&mut self.a[DATA_SIZE_OFFSET..], -1);
        apply_one(&mut self.a, src, range, tombstone, checksum);
        LittleEndian::write_i32(&mut self.a[DATA_SIZE_OFFSET..], data_size);

        LittleEndian::write_i32(&mut self.b[DATA_SIZE_OFFSET..], data_size);
        apply_one(&mut self.b, src, range, tombstone, checksum);
    }

    /// Overwrite both copies with the image prefix `src[..len]` (header
    /// included). Used when materializing a committed single-file image and
    /// when repairing a stale mirror.
    pub fn write_full(&mut self, src: &[u8], len: usize) {
        self.a[..len].copy_from_slice(&src[..len]);
        self.b[..len].copy_from_slice(&src[..len]);
    }

    /// Copy `[0, len)` of A over B.
    pub fn repair_b_from_a(&mut self, len: usize) {
        let (src, dst) = (&self.a[..len], &mut self.b);
        dst[..len].copy_from_slice(src);
    }

    /// Copy `[0, len)` of B over A.
    pub fn repair_a_from_b(&mut self, len: usize) {
        let (src, dst) = (&self.b[..len], &mut self.a);
        dst[..len].copy_from_slice(src);
    }

    /// Zero both headers, leaving empty images.
    pub fn reset(&mut self) {
        self.a[..DATA_START].fill(0);
        self.b[..DATA_START].fill(0);
    }
}

fn apply_one(
    map: &mut MmapMut,
    src: &[u8],
    range: Option<(usize, usize)>,
    tombstone: Option<(usize, u8)>,
    checksum: u64,
) {
    LittleEndian::write_u64(&mut map[CHECKSUM_OFFSET..], checksum);
    if let Some((offset, byte)) = tombstone {
        map[offset] = byte;
    }
    if let Some((start, end)) = range {
        map[start..end].copy_from_slice(&src[start..end]);
    }
}

fn open_rw(path: &Path) -> Result<File, KvError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| KvError::Io(format!("Cannot open {}: {}", path.display(), e)))
}

fn file_len(file: &File) -> Result<usize, KvError> {
    Ok(file
        .metadata()
        .map_err(|e| KvError::Io(format!("Cannot stat mirror file: {}", e)))?
        .len() as usize)
}

fn set_len(file: &File, len: usize) -> Result<(), KvError> {
    file.set_len(len as u64)
        .map_err(|e| KvError::Io(format!("Cannot resize mirror file to {}: {}", len, e)))
}

fn map(file: &File, len: usize) -> Result<MmapMut, KvError> {
    // Safety: the pair is owned by a single store and mutated only under
    // its lock; external processes touching the files are out of contract.
    unsafe { MmapOptions::new().len(len).map_mut(file) }
        .map_err(|e| KvError::Io(format!("Cannot map mirror file: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::constants::DATA_START;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_page_sized_pair() {
        let dir = TempDir::new().unwrap();
        let files = MirrorFiles::open(dir.path(), "store").unwrap();
        assert_eq!(files.capacity(), PAGE_SIZE);
        assert_eq!(std::fs::metadata(a_path(dir.path(), "store")).unwrap().len(), PAGE_SIZE as u64);
        assert_eq!(std::fs::metadata(b_path(dir.path(), "store")).unwrap().len(), PAGE_SIZE as u64);
    }

    #[test]
    fn test_apply_update_mirrors_and_restores_marker() {
        let dir = TempDir::new().unwrap();
        let mut files = MirrorFiles::open(dir.path(), "s").unwrap();

        let mut src = vec![0u8; PAGE_SIZE];
        for (i, b) in src.iter_mut().enumerate().take(64) {
            *b = i as u8;
        }
        files.apply_update(&src, Some((DATA_START, 40)), None, 0xDEAD_BEEF, 28);
        files.flush().unwrap();

        for path in [a_path(dir.path(), "s"), b_path(dir.path(), "s")] {
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(LittleEndian::read_i32(&bytes[..4]), 28);
            assert_eq!(LittleEndian::read_u64(&bytes[4..12]), 0xDEAD_BEEF);
            assert_eq!(&bytes[DATA_START..40], &src[DATA_START..40]);
        }
    }

    #[test]
    fn test_patch_small_updates_both_copies() {
        let dir = TempDir::new().unwrap();
        let mut files = MirrorFiles::open(dir.path(), "s").unwrap();
        files.patch_small(7, 20, &42i32.to_le_bytes());

        assert_eq!(LittleEndian::read_u64(&files.a()[4..12]), 7);
        assert_eq!(LittleEndian::read_i32(&files.a()[20..24]), 42);
        assert_eq!(LittleEndian::read_i32(&files.b()[20..24]), 42);
    }

    #[test]
    fn test_grow_preserves_content() {
        let dir = TempDir::new().unwrap();
        let mut files = MirrorFiles::open(dir.path(), "s").unwrap();
        files.patch_small(1, DATA_START, b"abc");
        files.grow(2 * PAGE_SIZE).unwrap();
        assert_eq!(files.capacity(), 2 * PAGE_SIZE);
        assert_eq!(&files.a()[DATA_START..DATA_START + 3], b"abc");
        assert_eq!(&files.b()[DATA_START..DATA_START + 3], b"abc");
    }

    #[test]
    fn test_truncate_shrinks_files() {
        let dir = TempDir::new().unwrap();
        let mut files = MirrorFiles::open(dir.path(), "s").unwrap();
        files.grow(8 * PAGE_SIZE).unwrap();
        files.truncate(PAGE_SIZE).unwrap();
        assert_eq!(files.capacity(), PAGE_SIZE);
        assert_eq!(std::fs::metadata(a_path(dir.path(), "s")).unwrap().len(), PAGE_SIZE as u64);
    }

    #[test]
    fn test_repair_copies_between_mirrors() {
        let dir = TempDir::new().unwrap();
        let mut files = MirrorFiles::open(dir.path(), "s").unwrap();
        files.a[DATA_START] = 9;
        files.repair_b_from_a(DATA_START + 1);
        assert_eq!(files.b()[DATA_START], 9);

        files.b[DATA_START + 1] = 7;
        files.repair_a_from_b(DATA_START + 2);
        assert_eq!(files.a()[DATA_START + 1], 7);
    }

    #[test]
    fn test_reopen_keeps_capacity() {
        let dir = TempDir::new().unwrap();
        {
            let mut files = MirrorFiles::open(dir.path(), "s").unwrap();
            files.grow(4 * PAGE_SIZE).unwrap();
        }
        let files = MirrorFiles::open(dir.path(), "s").unwrap();
        assert_eq!(files.capacity(), 4 * PAGE_SIZE);
    }
}

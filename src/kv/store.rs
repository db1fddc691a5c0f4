//! The persistent key-value engine.
//!
//! A [`Store`] is a typed map from string keys to primitives, strings, byte
//! arrays, and encoded objects, backed by one data region that is mirrored
//! into mapped files A/B (non-blocking mode) or committed wholesale to a
//! single image (blocking modes). All public operations serialize on one
//! store-level lock; mutations patch the in-memory buffer, fold the change
//! into the rolling checksum, and mirror the patch before returning.
//!
//! Fixed-size values with an existing record are updated in place.
//! Variable-size updates always append a fresh record and tombstone the old
//! one, so live record offsets never move outside garbage collection.

use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::config::Context;
use crate::kv::buffer::{shift_checksum, Buffer};
use crate::kv::constants::*;
use crate::kv::container::{Container, ObjectValue, Payload, VarPayload};
use crate::kv::encoder::{Encoder, EncoderMap, StringSetEncoder};
use crate::kv::external::{self, BigValue};
use crate::kv::gc::{Compaction, InvalidSegments};
use crate::kv::mapped::{self, MirrorFiles};
use crate::kv::record::{self, DataType};
use crate::util::executor::{JobKind, LimitExecutor, TagExecutor};
use crate::KvError;

/// Commit strategy. Selected at open; a store only ever leaves
/// `NonBlocking` by degradation, and never returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritingMode {
    /// Every mutation is mirrored synchronously into the mapped A/B pair.
    NonBlocking,
    /// Mutations stay in memory; a coalescing background task commits the
    /// full image.
    AsyncBlocking,
    /// Mutations stay in memory; every mutation commits the full image
    /// before returning.
    SyncBlocking,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct Status {
    pub keys: usize,
    pub data_size: usize,
    pub invalid_bytes: usize,
    pub invalid_segments: usize,
    pub capacity: usize,
    pub mode: WritingMode,
}

/// An open store. Build one with [`Store::builder`].
pub struct Store {
    pub(crate) name: String,
    pub(crate) dir: PathBuf,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) context: Arc<Context>,
    pub(crate) encoders: EncoderMap,
    pub(crate) apply: LimitExecutor,
    pub(crate) external_io: TagExecutor,
    pub(crate) self_ref: OnceLock<Weak<Store>>,
}

/// Lock-guarded engine state.
pub(crate) struct Inner {
    pub buffer: Buffer,
    /// Absolute end of the record region (`DATA_START + dataSize`).
    pub data_end: usize,
    pub checksum: u64,
    pub index: HashMap<String, Container>,
    pub invalids: InvalidSegments,
    pub mode: WritingMode,
    pub files: Option<MirrorFiles>,
    pub auto_commit: bool,
    /// Sidecar payloads by file name.
    pub external_cache: HashMap<String, Arc<Vec<u8>>>,
    /// Decoded sidecar values by key.
    pub big_cache: HashMap<String, BigValue>,
    /// Sidecar deletions deferred until the next successful commit
    /// (blocking modes only).
    pub pending_deletes: Vec<String>,
}

impl Inner {
    pub(crate) fn new(mode: WritingMode) -> Self {
        Inner {
            buffer: Buffer::with_capacity(PAGE_SIZE),
            data_end: DATA_START,
            checksum: 0,
            index: HashMap::new(),
            invalids: InvalidSegments::new(),
            mode,
            files: None,
            auto_commit: true,
            external_cache: HashMap::new(),
            big_cache: HashMap::new(),
            pending_deletes: Vec::new(),
        }
    }

    fn reset_memory(&mut self, capacity: usize) {
        self.buffer = Buffer::with_capacity(capacity);
        self.data_end = DATA_START;
        self.checksum = 0;
        self.index.clear();
        self.invalids.clear();
        self.external_cache.clear();
        self.big_cache.clear();
        self.pending_deletes.clear();
    }

    fn data_size(&self) -> usize {
        self.data_end - DATA_START
    }

    /// Write the current size and checksum into the in-memory header bytes.
    pub(crate) fn store_header(&mut self) {
        let size = self.data_size() as i32;
        self.buffer.write_i32_at(DATA_SIZE_OFFSET, size);
        self.buffer.write_u64_at(CHECKSUM_OFFSET, self.checksum);
    }
}

// ── Construction and loading ────────────────────────────────────────

impl Store {
    /// Start building a store rooted at `dir` with the given name.
    pub fn builder(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
    ) -> crate::kv::builder::StoreBuilder {
        crate::kv::builder::StoreBuilder::new(dir.into(), name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn arc(&self) -> Option<Arc<Store>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    pub(crate) fn log_info(&self, message: &str) {
        if let Some(logger) = self.context.logger() {
            logger.info(&self.name, message);
        }
    }

    pub(crate) fn log_warning(&self, error: &KvError) {
        if let Some(logger) = self.context.logger() {
            logger.warning(&self.name, error);
        }
    }

    pub(crate) fn log_error(&self, error: &KvError) {
        if let Some(logger) = self.context.logger() {
            logger.error(&self.name, error);
        }
    }

    /// Parse persisted state into `inner`. Runs once, on the loader task,
    /// under the store lock. Never fails: corrupt images fall back to the
    /// mirror, then to an empty store.
    pub(crate) fn load_data(&self, inner: &mut Inner) {
        match inner.mode {
            WritingMode::NonBlocking => self.load_non_blocking(inner),
            _ => self.load_blocking(inner),
        }
    }

    fn load_non_blocking(&self, inner: &mut Inner) {
        let c = mapped::c_path(&self.dir, &self.name);
        let tmp = mapped::tmp_path(&self.dir, &self.name);

        // A committed single-file image (left by a blocking-mode run, or by
        // a degraded session) supersedes the pair.
        if c.exists() || tmp.exists() {
            if self.try_load_file(inner, &c) || self.try_load_file(inner, &tmp) {
                match MirrorFiles::open(&self.dir, &self.name) {
                    Ok(mut files) => {
                        if files.capacity() < inner.buffer.capacity() {
                            if let Err(e) = files.grow(inner.buffer.capacity()) {
                                self.log_error(&e);
                                self.degrade(inner);
                                return;
                            }
                        } else if files.capacity() > inner.buffer.capacity() {
                            inner.buffer.resize(files.capacity());
                        }
                        inner.store_header();
                        files.write_full(inner.buffer.as_slice(), inner.data_end);
                        inner.files = Some(files);
                        let _ = fs::remove_file(&c);
                        let _ = fs::remove_file(&tmp);
                        self.log_info("Materialized committed image into mirror pair");
                    }
                    Err(e) => {
                        self.log_error(&e);
                        self.degrade(inner);
                    }
                }
                return;
            }
        }

        self.load_from_pair(inner);
        if inner.mode == WritingMode::NonBlocking {
            let _ = fs::remove_file(&c);
            let _ = fs::remove_file(&tmp);
        }
    }

    fn load_from_pair(&self, inner: &mut Inner) {
        let mut files = match MirrorFiles::open(&self.dir, &self.name) {
            Ok(files) => files,
            Err(e) => {
                self.log_error(&e);
                self.recover_without_mmap(inner);
                return;
            }
        };

        let capacity = files.capacity();
        match self.install_image(inner, files.a(), capacity) {
            Ok(()) => {
                // A is authoritative; refresh B if its header disagrees.
                let b_size = LittleEndian::read_i32(&files.b()[DATA_SIZE_OFFSET..]);
                let b_sum = LittleEndian::read_u64(&files.b()[CHECKSUM_OFFSET..]);
                if b_size != inner.data_size() as i32 || b_sum != inner.checksum {
                    files.repair_b_from_a(inner.data_end);
                }
                inner.files = Some(files);
            }
            Err(a_err) => {
                self.log_warning(&a_err);
                match self.install_image(inner, files.b(), capacity) {
                    Ok(()) => {
                        files.repair_a_from_b(inner.data_end);
                        inner.files = Some(files);
                        self.log_info("Recovered from mirror B");
                    }
                    Err(b_err) => {
                        self.log_error(&b_err);
                        self.log_error(&KvError::Parse(
                            "Both mirror copies are corrupt, resetting store".to_string(),
                        ));
                        inner.reset_memory(capacity);
                        files.reset();
                        inner.files = Some(files);
                    }
                }
            }
        }
    }

    /// Mapping failed outright: fall back to plain reads of the pair and
    /// continue without mmap ownership.
    fn recover_without_mmap(&self, inner: &mut Inner) {
        inner.files = None;
        inner.mode = WritingMode::AsyncBlocking;
        for path in [
            mapped::a_path(&self.dir, &self.name),
            mapped::b_path(&self.dir, &self.name),
        ] {
            if self.try_load_file(inner, &path) {
                return;
            }
        }
        inner.reset_memory(PAGE_SIZE);
    }

    fn load_blocking(&self, inner: &mut Inner) {
        let c = mapped::c_path(&self.dir, &self.name);
        let tmp = mapped::tmp_path(&self.dir, &self.name);
        if self.try_load_file(inner, &c) || self.try_load_file(inner, &tmp) {
            return;
        }

        // The store may have last run in non-blocking mode; migrate the
        // freshest mirror copy into a committed image and drop the pair.
        let a = mapped::a_path(&self.dir, &self.name);
        let b = mapped::b_path(&self.dir, &self.name);
        if self.try_load_file(inner, &a) || self.try_load_file(inner, &b) {
            if self.write_to_c(inner).is_ok() {
                let _ = fs::remove_file(&a);
                let _ = fs::remove_file(&b);
            }
            return;
        }

        inner.reset_memory(PAGE_SIZE);
    }

    fn try_load_file(&self, inner: &mut Inner, path: &std::path::Path) -> bool {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let capacity = match new_capacity(PAGE_SIZE, bytes.len().max(PAGE_SIZE)) {
            Some(capacity) => capacity,
            None => return false,
        };
        match self.install_image(inner, &bytes, capacity) {
            Ok(()) => true,
            Err(e) => {
                self.log_warning(&e);
                false
            }
        }
    }

    /// Validate one image (header bounds, checksum, record tiling) and make
    /// it the in-memory state. On failure `inner` keeps an empty region.
    fn install_image(
        &self,
        inner: &mut Inner,
        image: &[u8],
        capacity: usize,
    ) -> Result<(), KvError> {
        if image.len() < DATA_START {
            return Err(KvError::Parse(format!(
                "Image of {} bytes is shorter than the header",
                image.len()
            )));
        }
        let size = LittleEndian::read_i32(&image[DATA_SIZE_OFFSET..]);
        if size < 0 {
            return Err(KvError::Parse(format!("Interrupted image (size {})", size)));
        }
        let data_size = size as usize;
        if DATA_START + data_size > image.len() || DATA_START + data_size > capacity {
            return Err(KvError::Parse(format!(
                "Declared size {} exceeds image of {} bytes",
                data_size,
                image.len()
            )));
        }
        let stored_sum = LittleEndian::read_u64(&image[CHECKSUM_OFFSET..]);

        let mut buffer = Buffer::with_capacity(capacity);
        buffer.write_bytes_at(0, &image[..DATA_START + data_size]);
        let computed = buffer.checksum(DATA_START, data_size);
        if computed != stored_sum {
            return Err(KvError::Parse(format!(
                "Checksum mismatch: stored {:#018x}, computed {:#018x}",
                stored_sum, computed
            )));
        }

        let parsed = record::parse_data(&mut buffer, DATA_START + data_size, &self.encoders)?;
        for warning in &parsed.warnings {
            self.log_warning(&KvError::Encoder(warning.clone()));
        }

        inner.buffer = buffer;
        inner.data_end = DATA_START + data_size;
        inner.checksum = stored_sum;
        inner.index = parsed.index;
        inner.invalids = parsed.invalids;
        inner.external_cache.clear();
        inner.big_cache.clear();
        Ok(())
    }

    /// Drop mmap ownership and continue with the in-memory buffer only.
    /// The next commit persists the image as a single file.
    fn degrade(&self, inner: &mut Inner) {
        inner.files = None;
        inner.mode = WritingMode::AsyncBlocking;
        self.log_info("Continuing in async-blocking mode without memory mapping");
        self.submit_async_commit();
    }
}

// ── Reads ───────────────────────────────────────────────────────────

impl Store {
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().index.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    pub fn status(&self) -> Status {
        let inner = self.inner.lock();
        Status {
            keys: inner.index.len(),
            data_size: inner.data_size(),
            invalid_bytes: inner.invalids.bytes(),
            invalid_segments: inner.invalids.len(),
            capacity: inner.buffer.capacity(),
            mode: inner.mode,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.inner.lock().index.get(key)?.payload {
            Payload::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.inner.lock().index.get(key)?.payload {
            Payload::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f32> {
        match self.inner.lock().index.get(key)?.payload {
            Payload::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.inner.lock().index.get(key)?.payload {
            Payload::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.inner.lock().index.get(key)?.payload {
            Payload::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let file = {
            match &inner.index.get(key)?.payload {
                Payload::String(VarPayload::Inline { value, .. }) => return Some(value.clone()),
                Payload::String(VarPayload::External { file }) => file.clone(),
                _ => return None,
            }
        };
        let bytes = self.load_external_bytes(inner, key, &file)?;
        match std::str::from_utf8(&bytes) {
            Ok(s) => Some(s.to_string()),
            Err(e) => {
                self.log_warning(&KvError::Parse(format!(
                    "Sidecar {} holds invalid UTF-8: {}",
                    file, e
                )));
                None
            }
        }
    }

    pub fn get_array(&self, key: &str) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let file = {
            match &inner.index.get(key)?.payload {
                Payload::Array(VarPayload::Inline { value, .. }) => return Some(value.clone()),
                Payload::Array(VarPayload::External { file }) => file.clone(),
                _ => return None,
            }
        };
        self.load_external_bytes(inner, key, &file)
            .map(|bytes| (*bytes).clone())
    }

    /// Look up an object stored under `key` and downcast it to `T`. Returns
    /// `None` when the key is absent, holds a different value type, or was
    /// encoded as a different Rust type.
    pub fn get_object<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let file = {
            match &inner.index.get(key)?.payload {
                Payload::Object(VarPayload::Inline { value, .. }) => {
                    return value.value.clone().downcast::<T>().ok();
                }
                Payload::Object(VarPayload::External { file }) => file.clone(),
                _ => return None,
            }
        };
        if let Some(BigValue::Object { value }) = inner.big_cache.get(key) {
            return value.clone().downcast::<T>().ok();
        }
        let bytes = self.load_external_bytes(inner, key, &file)?;
        match self.decode_object_body(&bytes) {
            Ok(value) => {
                inner
                    .big_cache
                    .insert(key.to_string(), BigValue::Object { value: value.clone() });
                value.downcast::<T>().ok()
            }
            Err(e) => {
                self.log_warning(&e);
                None
            }
        }
    }

    pub fn get_string_set(&self, key: &str) -> Option<Arc<HashSet<String>>> {
        self.get_object::<HashSet<String>>(key)
    }

    fn load_external_bytes(
        &self,
        inner: &mut Inner,
        key: &str,
        file: &str,
    ) -> Option<Arc<Vec<u8>>> {
        if let Some(BigValue::Bytes(bytes)) = inner.big_cache.get(key) {
            return Some(bytes.clone());
        }
        if let Some(bytes) = inner.external_cache.get(file) {
            let bytes = bytes.clone();
            inner
                .big_cache
                .insert(key.to_string(), BigValue::Bytes(bytes.clone()));
            return Some(bytes);
        }
        match external::read_sidecar(&external::sidecar_dir(&self.dir, &self.name), file) {
            Ok(bytes) => {
                let bytes = Arc::new(bytes);
                inner.external_cache.insert(file.to_string(), bytes.clone());
                inner
                    .big_cache
                    .insert(key.to_string(), BigValue::Bytes(bytes.clone()));
                Some(bytes)
            }
            Err(e) => {
                self.log_warning(&e);
                None
            }
        }
    }

    fn decode_object_body(&self, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, KvError> {
        if bytes.is_empty() {
            return Err(KvError::Parse("Empty object payload".to_string()));
        }
        let tag_len = bytes[0] as usize;
        if 1 + tag_len > bytes.len() {
            return Err(KvError::Parse("Object tag overruns payload".to_string()));
        }
        let tag = std::str::from_utf8(&bytes[1..1 + tag_len])
            .map_err(|e| KvError::Parse(format!("Invalid UTF-8 in object tag: {}", e)))?;
        let encoder = self.encoders.get(tag).ok_or_else(|| {
            KvError::Encoder(format!("No encoder registered for tag '{}'", tag))
        })?;
        encoder.decode_value(&bytes[1 + tag_len..])
    }
}

// ── Writes ──────────────────────────────────────────────────────────

impl Store {
    fn check_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::Argument("Key is empty".to_string()));
        }
        if key.len() > KEY_LIMIT {
            return Err(KvError::Argument(format!(
                "Key of {} bytes exceeds the {}-byte limit",
                key.len(),
                KEY_LIMIT
            )));
        }
        Ok(())
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<(), KvError> {
        Self::check_key(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(c) = inner.index.get_mut(key) {
            if let Payload::Bool(old) = &mut c.payload {
                if *old == value {
                    return Ok(());
                }
                let offset = c.offset;
                *old = value;
                inner.buffer.write_u8_at(offset, value as u8);
                // Old and new differ in exactly the low bit of that byte.
                self.patch_fixed(inner, offset, 1, &[value as u8]);
                return Ok(());
            }
        }
        self.append_record(inner, key, DataType::Bool, 0, &[value as u8], Payload::Bool(value))
    }

    pub fn put_int(&self, key: &str, value: i32) -> Result<(), KvError> {
        Self::check_key(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(c) = inner.index.get_mut(key) {
            if let Payload::Int(old) = &mut c.payload {
                if *old == value {
                    return Ok(());
                }
                let diff = (*old ^ value) as u32 as u64;
                let offset = c.offset;
                *old = value;
                inner.buffer.write_i32_at(offset, value);
                self.patch_fixed(inner, offset, diff, &value.to_le_bytes());
                return Ok(());
            }
        }
        self.append_record(inner, key, DataType::Int, 0, &value.to_le_bytes(), Payload::Int(value))
    }

    pub fn put_float(&self, key: &str, value: f32) -> Result<(), KvError> {
        Self::check_key(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(c) = inner.index.get_mut(key) {
            if let Payload::Float(old) = &mut c.payload {
                let diff = (old.to_bits() ^ value.to_bits()) as u64;
                if diff == 0 {
                    return Ok(());
                }
                let offset = c.offset;
                *old = value;
                inner.buffer.write_bytes_at(offset, &value.to_bits().to_le_bytes());
                self.patch_fixed(inner, offset, diff, &value.to_bits().to_le_bytes());
                return Ok(());
            }
        }
        self.append_record(
            inner,
            key,
            DataType::Float,
            0,
            &value.to_bits().to_le_bytes(),
            Payload::Float(value),
        )
    }

    pub fn put_long(&self, key: &str, value: i64) -> Result<(), KvError> {
        Self::check_key(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(c) = inner.index.get_mut(key) {
            if let Payload::Long(old) = &mut c.payload {
                if *old == value {
                    return Ok(());
                }
                let diff = (*old ^ value) as u64;
                let offset = c.offset;
                *old = value;
                inner.buffer.write_i64_at(offset, value);
                self.patch_fixed(inner, offset, diff, &value.to_le_bytes());
                return Ok(());
            }
        }
        self.append_record(inner, key, DataType::Long, 0, &value.to_le_bytes(), Payload::Long(value))
    }

    pub fn put_double(&self, key: &str, value: f64) -> Result<(), KvError> {
        Self::check_key(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(c) = inner.index.get_mut(key) {
            if let Payload::Double(old) = &mut c.payload {
                let diff = old.to_bits() ^ value.to_bits();
                if diff == 0 {
                    return Ok(());
                }
                let offset = c.offset;
                *old = value;
                inner.buffer.write_bytes_at(offset, &value.to_bits().to_le_bytes());
                self.patch_fixed(inner, offset, diff, &value.to_bits().to_le_bytes());
                return Ok(());
            }
        }
        self.append_record(
            inner,
            key,
            DataType::Double,
            0,
            &value.to_bits().to_le_bytes(),
            Payload::Double(value),
        )
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<(), KvError> {
        Self::check_key(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let bytes = value.as_bytes();
        let inline = bytes.len() < self.context.internal_limit();

        if let Some(c) = inner.index.get(key) {
            if let Payload::String(VarPayload::Inline { value: old, value_len }) = &c.payload {
                if old == value {
                    return Ok(());
                }
                if inline && bytes.len() == *value_len {
                    // Same-length overwrite keeps the record in place.
                    let offset = c.offset;
                    self.overwrite_in_place(inner, offset, bytes);
                    if let Some(c) = inner.index.get_mut(key) {
                        if let Payload::String(VarPayload::Inline { value: slot, .. }) =
                            &mut c.payload
                        {
                            *slot = value.to_string();
                        }
                    }
                    self.handle_change(inner);
                    return Ok(());
                }
            }
        }

        if inline {
            self.append_record(
                inner,
                key,
                DataType::String,
                0,
                bytes,
                Payload::String(VarPayload::Inline {
                    value: value.to_string(),
                    value_len: bytes.len(),
                }),
            )
        } else {
            self.put_external_value(inner, key, DataType::String, bytes.to_vec())
        }
    }

    pub fn put_array(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        Self::check_key(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let inline = value.len() < self.context.internal_limit();

        if let Some(c) = inner.index.get(key) {
            if let Payload::Array(VarPayload::Inline { value: old, value_len }) = &c.payload {
                if old.as_slice() == value {
                    return Ok(());
                }
                if inline && value.len() == *value_len {
                    let offset = c.offset;
                    self.overwrite_in_place(inner, offset, value);
                    if let Some(c) = inner.index.get_mut(key) {
                        if let Payload::Array(VarPayload::Inline { value: slot, .. }) =
                            &mut c.payload
                        {
                            *slot = value.to_vec();
                        }
                    }
                    self.handle_change(inner);
                    return Ok(());
                }
            }
        }

        if inline {
            self.append_record(
                inner,
                key,
                DataType::Array,
                0,
                value,
                Payload::Array(VarPayload::Inline {
                    value: value.to_vec(),
                    value_len: value.len(),
                }),
            )
        } else {
            self.put_external_value(inner, key, DataType::Array, value.to_vec())
        }
    }

    /// Store `value` under `key` through `encoder`. The encoder's tag is
    /// written with the record; registering the encoder with the builder is
    /// required for the value to decode on a later open.
    pub fn put_object<E: Encoder>(
        &self,
        key: &str,
        value: E::Value,
        encoder: &E,
    ) -> Result<(), KvError> {
        Self::check_key(key)?;
        let tag = encoder.tag();
        if tag.is_empty() || tag.len() > TAG_LIMIT {
            return Err(KvError::Argument(format!(
                "Encoder tag must be 1..={} characters",
                TAG_LIMIT
            )));
        }
        let encoded = match encoder.encode(&value) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.log_warning(&e);
                return Err(e);
            }
        };
        let mut body = Vec::with_capacity(1 + tag.len() + encoded.len());
        body.push(tag.len() as u8);
        body.extend_from_slice(tag.as_bytes());
        body.extend_from_slice(&encoded);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !self.encoders.contains_key(tag) {
            self.log_warning(&KvError::Encoder(format!(
                "Encoder '{}' is not registered with this store; the value will not survive a reopen",
                tag
            )));
        }

        let value_arc: Arc<dyn Any + Send + Sync> = Arc::new(value);
        if body.len() < self.context.internal_limit() {
            let value_len = body.len();
            self.append_record(
                inner,
                key,
                DataType::Object,
                0,
                &body,
                Payload::Object(VarPayload::Inline {
                    value: ObjectValue { tag: tag.to_string(), value: value_arc },
                    value_len,
                }),
            )
        } else {
            let file = external::random_file_name();
            self.append_record(
                inner,
                key,
                DataType::Object,
                EXTERNAL_MASK,
                file.as_bytes(),
                Payload::Object(VarPayload::External { file: file.clone() }),
            )?;
            inner
                .big_cache
                .insert(key.to_string(), BigValue::Object { value: value_arc });
            let payload = Arc::new(body);
            inner.external_cache.insert(file.clone(), payload.clone());
            self.schedule_sidecar_write(key, file, payload);
            Ok(())
        }
    }

    pub fn put_string_set(&self, key: &str, value: HashSet<String>) -> Result<(), KvError> {
        self.put_object(key, value, &StringSetEncoder)
    }

    /// Drop `key`. The record is tombstoned in place; its bytes are
    /// reclaimed by the next collection.
    pub fn remove(&self, key: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.index.contains_key(key) {
            return;
        }
        if let Some((start, byte)) = self.tombstone_existing(inner, key) {
            inner.index.remove(key);
            if inner.mode == WritingMode::NonBlocking {
                if let Some(files) = inner.files.as_mut() {
                    files.patch_small(inner.checksum, start, &[byte]);
                }
            }
        }
        self.check_gc_state(inner);
        self.handle_change(inner);
    }

    /// Reset the store to empty: data region, mirror files, sidecar
    /// directory, caches.
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.reset_memory(PAGE_SIZE);
        match inner.mode {
            WritingMode::NonBlocking => {
                let mut ok = true;
                if let Some(files) = inner.files.as_mut() {
                    if files.capacity() != PAGE_SIZE {
                        if let Err(e) = files.truncate(PAGE_SIZE) {
                            self.log_error(&e);
                            ok = false;
                        }
                    }
                    if ok {
                        files.reset();
                    }
                }
                if !ok {
                    self.degrade(inner);
                }
            }
            _ => {
                // Any leftover mirror pair would otherwise resurrect the old
                // state on a reopen that happens before the next commit.
                let _ = fs::remove_file(mapped::c_path(&self.dir, &self.name));
                let _ = fs::remove_file(mapped::tmp_path(&self.dir, &self.name));
                let _ = fs::remove_file(mapped::a_path(&self.dir, &self.name));
                let _ = fs::remove_file(mapped::b_path(&self.dir, &self.name));
            }
        }
        let dir = external::sidecar_dir(&self.dir, &self.name);
        self.context.pool().execute(move || {
            let _ = external::delete_all_sidecars(&dir);
        });
        self.log_info("Store cleared");
    }

    /// Re-enable auto-commit and persist the current state. In non-blocking
    /// mode this flushes the mapped pair; in blocking modes it writes the
    /// committed image (synchronously or through the apply executor).
    pub fn commit(&self) -> Result<(), KvError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.auto_commit = true;
        match inner.mode {
            WritingMode::NonBlocking => match inner.files.as_ref() {
                Some(files) => files.flush(),
                None => Ok(()),
            },
            WritingMode::SyncBlocking => self.write_to_c(inner),
            WritingMode::AsyncBlocking => {
                self.submit_async_commit();
                Ok(())
            }
        }
    }

    /// Suspend per-mutation commits (blocking modes) until the next
    /// explicit [`commit`](Store::commit). Useful for batching.
    pub fn disable_auto_commit(&self) {
        self.inner.lock().auto_commit = false;
    }

    /// Force the persisted image up to date: msync the pair, or write the
    /// committed file synchronously.
    pub fn flush(&self) -> Result<(), KvError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.mode {
            WritingMode::NonBlocking => match inner.files.as_ref() {
                Some(files) => files.flush(),
                None => Ok(()),
            },
            _ => self.write_to_c(inner),
        }
    }
}

// ── Mutation internals ──────────────────────────────────────────────

impl Store {
    /// Mirror an in-place fixed-size value update: fold the XOR diff into
    /// the checksum and patch both copies (no in-progress marker needed for
    /// at most one word of data).
    fn patch_fixed(&self, inner: &mut Inner, offset: usize, diff: u64, bytes: &[u8]) {
        inner.checksum ^= shift_checksum(diff, offset);
        if inner.mode == WritingMode::NonBlocking {
            if let Some(files) = inner.files.as_mut() {
                files.patch_small(inner.checksum, offset, bytes);
            }
        }
        self.handle_change(inner);
    }

    /// Same-length in-place overwrite of a variable value body.
    fn overwrite_in_place(&self, inner: &mut Inner, offset: usize, bytes: &[u8]) {
        let old_sum = inner.buffer.checksum(offset, bytes.len());
        inner.buffer.write_bytes_at(offset, bytes);
        let new_sum = inner.buffer.checksum(offset, bytes.len());
        inner.checksum ^= old_sum ^ new_sum;
        let data_size = inner.data_size() as i32;
        if inner.mode == WritingMode::NonBlocking {
            if let Some(files) = inner.files.as_mut() {
                files.apply_update(
                    inner.buffer.as_slice(),
                    Some((offset, offset + bytes.len())),
                    None,
                    inner.checksum,
                    data_size,
                );
            }
        }
    }

    /// Append a record for `key`, tombstoning any predecessor. This is the
    /// only write path that moves `data_end`.
    fn append_record(
        &self,
        inner: &mut Inner,
        key: &str,
        data_type: DataType,
        flags: u8,
        value: &[u8],
        payload: Payload,
    ) -> Result<(), KvError> {
        let key_bytes = key.as_bytes();
        let update_size = record::record_size(key_bytes.len(), data_type, value.len());
        self.ensure_size(inner, update_size)?;

        let removed = self.tombstone_existing(inner, key);
        let update_start = inner.data_end;
        let offset =
            record::write_record(&mut inner.buffer, update_start, data_type, flags, key_bytes, value);
        inner.data_end = update_start + update_size;
        inner.checksum ^= inner.buffer.checksum(update_start, update_size);
        inner
            .index
            .insert(key.to_string(), Container { start: update_start, offset, payload });

        let data_size = inner.data_size() as i32;
        if inner.mode == WritingMode::NonBlocking {
            if let Some(files) = inner.files.as_mut() {
                files.apply_update(
                    inner.buffer.as_slice(),
                    Some((update_start, update_start + update_size)),
                    removed,
                    inner.checksum,
                    data_size,
                );
            }
        }

        self.check_gc_state(inner);
        self.handle_change(inner);
        Ok(())
    }

    /// Tombstone the record currently indexed under `key`, accounting its
    /// span as invalid and detaching any sidecar file. Only `DELETE_MASK`
    /// is OR'd in; the type and external bits stay intact so parsers can
    /// still compute the skip length.
    fn tombstone_existing(&self, inner: &mut Inner, key: &str) -> Option<(usize, u8)> {
        let (start, end, sidecar) = {
            let c = inner.index.get(key)?;
            (c.start, c.end(), c.payload.external_file().map(str::to_string))
        };
        let old_byte = inner.buffer.read_u8_at(start);
        let new_byte = old_byte | DELETE_MASK;
        inner.buffer.write_u8_at(start, new_byte);
        inner.checksum ^= ((old_byte ^ new_byte) as u64) << ((start & 7) * 8);
        inner.invalids.add(start, end);
        inner.big_cache.remove(key);
        if let Some(file) = sidecar {
            inner.external_cache.remove(&file);
            self.schedule_sidecar_delete(inner, key, file);
        }
        Some((start, new_byte))
    }

    /// Spill a string or byte-array payload to a sidecar file and append a
    /// reference record. The caches serve reads until the write lands.
    fn put_external_value(
        &self,
        inner: &mut Inner,
        key: &str,
        data_type: DataType,
        bytes: Vec<u8>,
    ) -> Result<(), KvError> {
        let file = external::random_file_name();
        let payload = match data_type {
            DataType::String => Payload::String(VarPayload::External { file: file.clone() }),
            _ => Payload::Array(VarPayload::External { file: file.clone() }),
        };
        self.append_record(inner, key, data_type, EXTERNAL_MASK, file.as_bytes(), payload)?;
        let bytes = Arc::new(bytes);
        inner
            .big_cache
            .insert(key.to_string(), BigValue::Bytes(bytes.clone()));
        inner.external_cache.insert(file.clone(), bytes.clone());
        self.schedule_sidecar_write(key, file, bytes);
        Ok(())
    }

    fn schedule_sidecar_write(&self, key: &str, file: String, bytes: Arc<Vec<u8>>) {
        let dir = external::sidecar_dir(&self.dir, &self.name);
        let context = Arc::clone(&self.context);
        let name = self.name.clone();
        self.external_io.execute(key, JobKind::Coalescing, move || {
            if let Err(e) = external::write_sidecar(&dir, &file, &bytes) {
                if let Some(logger) = context.logger() {
                    logger.error(&name, &e);
                }
            }
        });
    }

    fn schedule_sidecar_delete(&self, inner: &mut Inner, key: &str, file: String) {
        if inner.mode == WritingMode::NonBlocking {
            let dir = external::sidecar_dir(&self.dir, &self.name);
            let context = Arc::clone(&self.context);
            let name = self.name.clone();
            self.external_io.execute(key, JobKind::Ordered, move || {
                if let Err(e) = external::delete_sidecar(&dir, &file) {
                    if let Some(logger) = context.logger() {
                        logger.warning(&name, &e);
                    }
                }
            });
        } else {
            inner.pending_deletes.push(file);
        }
    }

    /// Make room for `allocate` more bytes: collect garbage when enough
    /// slack exists, grow otherwise.
    fn ensure_size(&self, inner: &mut Inner, allocate: usize) -> Result<(), KvError> {
        if inner.data_end + allocate < inner.buffer.capacity() {
            return Ok(());
        }
        if inner.invalids.bytes() > allocate
            && inner.invalids.bytes() > bytes_threshold(inner.data_end)
        {
            self.collect_garbage(inner, allocate);
            if inner.data_end + allocate < inner.buffer.capacity() {
                return Ok(());
            }
        }
        self.grow(inner, allocate)
    }

    fn grow(&self, inner: &mut Inner, allocate: usize) -> Result<(), KvError> {
        let required = inner.data_end + allocate;
        let new_cap = new_capacity(inner.buffer.capacity(), required).ok_or_else(|| {
            KvError::Argument(format!(
                "Write of {} bytes would exceed the {}-byte data limit",
                allocate, DATA_SIZE_LIMIT
            ))
        })?;
        if new_cap > inner.buffer.capacity() {
            inner.buffer.resize(new_cap);
            if inner.mode == WritingMode::NonBlocking {
                let grown = match inner.files.as_mut() {
                    Some(files) if files.capacity() < new_cap => files.grow(new_cap),
                    _ => Ok(()),
                };
                if let Err(e) = grown {
                    self.log_error(&e);
                    self.degrade(inner);
                }
            }
        }
        Ok(())
    }

    /// Collect when tombstoned volume or segment count crosses the
    /// size-scaled thresholds.
    fn check_gc_state(&self, inner: &mut Inner) {
        let segment_limit = if inner.data_end < 16 * 1024 {
            GC_SEGMENTS_THRESHOLD
        } else {
            GC_SEGMENTS_THRESHOLD * 2
        };
        if inner.invalids.bytes() >= 2 * bytes_threshold(inner.data_end)
            || inner.invalids.len() >= segment_limit
        {
            self.collect_garbage(inner, 0);
        }
    }

    /// Coalesce tombstoned ranges, shift live records left, repair the
    /// index, and persist the moved region. Optionally truncates the
    /// reserve afterwards.
    pub(crate) fn collect_garbage(&self, inner: &mut Inner, allocate: usize) {
        if inner.invalids.is_empty() {
            return;
        }
        let old_data_end = inner.data_end;
        let segments = inner.invalids.take_merged();
        let gc_start = segments[0].start;
        let reclaimable: usize = segments.iter().map(|s| s.end - s.start).sum();
        let new_data_end = old_data_end - reclaimable;
        let new_data_size = new_data_end - DATA_START;

        // Folding out the old range and in the new one costs two partial
        // scans; fall back to one full scan when that is cheaper.
        let compacted_range = old_data_end - gc_start;
        let updated_range = new_data_end - gc_start;
        let recompute_full = new_data_size < compacted_range + updated_range;
        let old_part = if recompute_full {
            0
        } else {
            inner.buffer.checksum(gc_start, compacted_range)
        };

        let plan = Compaction::run(&mut inner.buffer, &segments, old_data_end);
        inner.data_end = new_data_end;
        inner.checksum = if recompute_full {
            inner.buffer.checksum(DATA_START, new_data_size)
        } else {
            inner.checksum ^ old_part ^ inner.buffer.checksum(gc_start, updated_range)
        };
        plan.repair(&mut inner.index);

        if inner.mode == WritingMode::NonBlocking {
            if let Some(files) = inner.files.as_mut() {
                files.apply_update(
                    inner.buffer.as_slice(),
                    Some((gc_start, new_data_end)),
                    None,
                    inner.checksum,
                    new_data_size as i32,
                );
            }
        }
        self.log_info(&format!(
            "Collected {} bytes across {} segments",
            reclaimable,
            segments.len()
        ));

        self.maybe_truncate(inner, allocate);
    }

    fn maybe_truncate(&self, inner: &mut Inner, allocate: usize) {
        let capacity = inner.buffer.capacity();
        let expected_end = inner.data_end + allocate;
        if capacity.saturating_sub(expected_end) <= TRUNCATE_THRESHOLD {
            return;
        }
        let new_cap = match new_capacity(PAGE_SIZE, expected_end + PAGE_SIZE) {
            Some(cap) if cap < capacity => cap,
            _ => return,
        };
        inner.buffer.resize(new_cap);
        if inner.mode == WritingMode::NonBlocking {
            if let Some(files) = inner.files.as_mut() {
                if let Err(e) = files.truncate(new_cap) {
                    self.log_error(&e);
                    self.degrade(inner);
                    return;
                }
            }
        }
        self.log_info(&format!("Truncated reserve to {} bytes", new_cap));
    }

    /// Post-mutation hook for the blocking modes: schedule or perform the
    /// full-image commit when auto-commit is on.
    fn handle_change(&self, inner: &mut Inner) {
        match inner.mode {
            WritingMode::NonBlocking => {}
            WritingMode::SyncBlocking => {
                if inner.auto_commit {
                    let _ = self.write_to_c(inner);
                }
            }
            WritingMode::AsyncBlocking => {
                if inner.auto_commit {
                    self.submit_async_commit();
                }
            }
        }
    }

    fn submit_async_commit(&self) {
        if let Some(store) = self.arc() {
            self.apply.execute(move || {
                let mut guard = store.inner.lock();
                let _ = store.write_to_c(&mut guard);
            });
        }
    }
}

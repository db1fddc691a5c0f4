//! Sidecar files for oversized values.
//!
//! Payloads at or above the configured inline limit are written to
//! `<path>/<name>/<file>`, where `<file>` is a random ASCII identifier of
//! fixed length. The record in the data region stores only the file name,
//! flagged external. Writes and deletions are scheduled through a per-key
//! serial executor by the store; this module owns the filesystem side and
//! the cache value types.

use std::any::Any;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::kv::constants::NAME_SIZE;
use crate::KvError;

/// Directory holding a store's sidecar files.
pub(crate) fn sidecar_dir(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// Random ASCII identifier used as a sidecar file name and record body.
pub(crate) fn random_file_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SIZE)
        .map(char::from)
        .collect()
}

/// Write one sidecar payload, creating the directory on first use and
/// syncing before returning.
pub(crate) fn write_sidecar(dir: &Path, file: &str, bytes: &[u8]) -> Result<(), KvError> {
    fs::create_dir_all(dir)
        .map_err(|e| KvError::Io(format!("Cannot create {}: {}", dir.display(), e)))?;
    let path = dir.join(file);
    let mut out = fs::File::create(&path)
        .map_err(|e| KvError::Io(format!("Cannot create {}: {}", path.display(), e)))?;
    out.write_all(bytes)
        .map_err(|e| KvError::Io(format!("Cannot write {}: {}", path.display(), e)))?;
    out.sync_all()
        .map_err(|e| KvError::Io(format!("Cannot sync {}: {}", path.display(), e)))
}

pub(crate) fn read_sidecar(dir: &Path, file: &str) -> Result<Vec<u8>, KvError> {
    let path = dir.join(file);
    fs::read(&path).map_err(|e| KvError::Io(format!("Cannot read {}: {}", path.display(), e)))
}

/// Delete one sidecar file; a missing file is not an error (a queued write
/// for it may have been coalesced away).
pub(crate) fn delete_sidecar(dir: &Path, file: &str) -> Result<(), KvError> {
    let path = dir.join(file);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KvError::Io(format!("Cannot delete {}: {}", path.display(), e))),
    }
}

/// Remove the whole sidecar directory (store reset).
pub(crate) fn delete_all_sidecars(dir: &Path) -> Result<(), KvError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KvError::Io(format!("Cannot delete {}: {}", dir.display(), e))),
    }
}

/// Cached value for a key whose payload lives in a sidecar file.
#[derive(Clone)]
pub(crate) enum BigValue {
    Bytes(Arc<Vec<u8>>),
    Object { value: Arc<dyn Any + Send + Sync> },
}

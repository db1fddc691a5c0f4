//! Full-image commit path for the blocking modes.
//!
//! The whole in-memory image (`[0, data_end)`, header included) is written
//! to `<name>.tmp`, synced, and renamed over `<name>.kvc`. The rename is the
//! commit point: a crash before it leaves the previous image intact, a crash
//! after it leaves the new one. Sidecar deletions accumulated since the last
//! commit are flushed only once the rename succeeds.

use std::fs;
use std::io::Write;

use crate::kv::external;
use crate::kv::mapped;
use crate::kv::store::{Inner, Store};
use crate::KvError;

impl Store {
    /// Write the committed single-file image. Failures are logged and
    /// returned; the in-memory state is untouched either way, so the next
    /// commit retries.
    pub(crate) fn write_to_c(&self, inner: &mut Inner) -> Result<(), KvError> {
        inner.store_header();
        let tmp = mapped::tmp_path(&self.dir, &self.name);
        let target = mapped::c_path(&self.dir, &self.name);

        let written = (|| -> Result<(), KvError> {
            let mut out = fs::File::create(&tmp)
                .map_err(|e| KvError::Io(format!("Cannot create {}: {}", tmp.display(), e)))?;
            out.write_all(&inner.buffer.as_slice()[..inner.data_end])
                .map_err(|e| KvError::Io(format!("Cannot write {}: {}", tmp.display(), e)))?;
            out.sync_all()
                .map_err(|e| KvError::Io(format!("Cannot sync {}: {}", tmp.display(), e)))?;
            drop(out);
            fs::rename(&tmp, &target).map_err(|e| {
                KvError::Io(format!(
                    "Cannot rename {} to {}: {}",
                    tmp.display(),
                    target.display(),
                    e
                ))
            })
        })();

        match written {
            Ok(()) => {
                self.clear_deleted_files(inner);
                Ok(())
            }
            Err(e) => {
                self.log_error(&e);
                Err(e)
            }
        }
    }

    /// Delete sidecar files whose records were dropped before this commit.
    fn clear_deleted_files(&self, inner: &mut Inner) {
        if inner.pending_deletes.is_empty() {
            return;
        }
        let dir = external::sidecar_dir(&self.dir, &self.name);
        for file in std::mem::take(&mut inner.pending_deletes) {
            if let Err(e) = external::delete_sidecar(&dir, &file) {
                self.log_warning(&e);
            }
        }
    }
}

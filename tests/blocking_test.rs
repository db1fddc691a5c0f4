//! Blocking-mode tests: rename-commit semantics, auto-commit control, the
//! coalescing async committer, and migration between modes.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use mirrorkv::{Store, WritingMode};
use tempfile::TempDir;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Data size declared by a committed image, or `None` when it is absent.
fn committed_size(dir: &Path, name: &str) -> Option<usize> {
    let bytes = fs::read(dir.join(format!("{}.kvc", name))).ok()?;
    let size = i32::from_le_bytes(bytes[0..4].try_into().ok()?);
    (size >= 0).then_some(size as usize)
}

#[test]
fn test_sync_blocking_commits_every_mutation() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "sync").blocking().build().unwrap();
    assert_eq!(store.status().mode, WritingMode::SyncBlocking);

    store.put_int("a", 1).unwrap();
    // The committed image is already on disk, no flush needed.
    assert_eq!(committed_size(dir.path(), "sync"), Some(2 + 1 + 4));

    store.put_string("b", "bee").unwrap();
    let expected = store.status().data_size;
    assert_eq!(committed_size(dir.path(), "sync"), Some(expected));

    drop(store);
    let store = Store::builder(dir.path(), "sync").blocking().build().unwrap();
    assert_eq!(store.get_int("a"), Some(1));
    assert_eq!(store.get_string("b").as_deref(), Some("bee"));
}

#[test]
fn test_disable_auto_commit_batches_until_commit() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "batch").blocking().build().unwrap();

    store.disable_auto_commit();
    store.put_int("a", 1).unwrap();
    store.put_int("b", 2).unwrap();
    assert_eq!(committed_size(dir.path(), "batch"), None);

    store.commit().unwrap();
    assert_eq!(committed_size(dir.path(), "batch"), Some(store.status().data_size));

    // commit() re-enables auto-commit.
    store.put_int("c", 3).unwrap();
    assert_eq!(committed_size(dir.path(), "batch"), Some(store.status().data_size));
}

#[test]
fn test_async_blocking_coalesces_commits() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "async").async_blocking().build().unwrap();
    assert_eq!(store.status().mode, WritingMode::AsyncBlocking);

    for i in 0..50 {
        store.put_int(&format!("key{:02}", i), i).unwrap();
    }
    let expected = store.status().data_size;
    assert!(
        wait_until(|| committed_size(dir.path(), "async") == Some(expected)),
        "background committer should catch up to the final image"
    );

    drop(store);
    std::thread::sleep(Duration::from_millis(100));
    let store = Store::builder(dir.path(), "async").async_blocking().build().unwrap();
    for i in 0..50 {
        assert_eq!(store.get_int(&format!("key{:02}", i)), Some(i));
    }
}

#[test]
fn test_removals_and_tombstones_survive_commit() {
    init_logs();
    let dir = TempDir::new().unwrap();
    {
        let store = Store::builder(dir.path(), "tomb").blocking().build().unwrap();
        store.put_int("keep", 1).unwrap();
        store.put_int("drop", 2).unwrap();
        store.remove("drop");
    }

    let store = Store::builder(dir.path(), "tomb").blocking().build().unwrap();
    assert_eq!(store.get_int("keep"), Some(1));
    assert_eq!(store.get_int("drop"), None);
    // The committed image still carries the tombstone.
    assert_eq!(store.status().invalid_bytes, 2 + 4 + 4);
}

#[test]
fn test_blocking_open_migrates_mirror_pair() {
    init_logs();
    let dir = TempDir::new().unwrap();
    {
        let store = Store::builder(dir.path(), "mig").build().unwrap();
        store.put_int("a", 10).unwrap();
        store.put_string("b", "carried").unwrap();
    }
    assert!(dir.path().join("mig.kva").exists());

    let store = Store::builder(dir.path(), "mig").blocking().build().unwrap();
    assert_eq!(store.get_int("a"), Some(10));
    assert_eq!(store.get_string("b").as_deref(), Some("carried"));

    // The pair was converted into a committed image.
    assert!(dir.path().join("mig.kvc").exists());
    assert!(!dir.path().join("mig.kva").exists());
    assert!(!dir.path().join("mig.kvb").exists());
}

#[test]
fn test_nonblocking_open_materializes_committed_image() {
    init_logs();
    let dir = TempDir::new().unwrap();
    {
        let store = Store::builder(dir.path(), "mat").blocking().build().unwrap();
        store.put_int("a", 10).unwrap();
        store.put_string("b", "moved").unwrap();
    }
    assert!(dir.path().join("mat.kvc").exists());

    let store = Store::builder(dir.path(), "mat").build().unwrap();
    assert_eq!(store.status().mode, WritingMode::NonBlocking);
    assert_eq!(store.get_int("a"), Some(10));
    assert_eq!(store.get_string("b").as_deref(), Some("moved"));

    // The image moved into the pair and the single-file artifacts are gone.
    assert!(!dir.path().join("mat.kvc").exists());
    assert!(dir.path().join("mat.kva").exists());
    assert!(dir.path().join("mat.kvb").exists());

    // And the pair round-trips again.
    store.put_int("c", 30).unwrap();
    drop(store);
    let store = Store::builder(dir.path(), "mat").build().unwrap();
    assert_eq!(store.get_int("c"), Some(30));
}

#[test]
fn test_pending_tmp_image_is_recovered() {
    init_logs();
    let dir = TempDir::new().unwrap();
    {
        let store = Store::builder(dir.path(), "tmprec").blocking().build().unwrap();
        store.put_int("v", 77).unwrap();
    }
    // Simulate a crash between writing .tmp and renaming it: the committed
    // image is gone and only the pending file remains.
    fs::rename(
        dir.path().join("tmprec.kvc"),
        dir.path().join("tmprec.tmp"),
    )
    .unwrap();

    let store = Store::builder(dir.path(), "tmprec").blocking().build().unwrap();
    assert_eq!(store.get_int("v"), Some(77));
}

#[test]
fn test_blocking_external_files_are_deleted_after_commit() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "extb").blocking().build().unwrap();

    store.put_array("k", &vec![4u8; 12 * 1024]).unwrap();
    assert!(wait_until(|| {
        fs::read_dir(dir.path().join("extb"))
            .map(|entries| entries.count() == 1)
            .unwrap_or(false)
    }));

    // The overwrite tombstones the external record; the deferred deletion
    // runs with the auto-commit that follows.
    store.put_array("k", &[1, 2, 3]).unwrap();
    assert!(wait_until(|| {
        fs::read_dir(dir.path().join("extb"))
            .map(|entries| entries.count() == 0)
            .unwrap_or(false)
    }));
    assert_eq!(store.get_array("k"), Some(vec![1, 2, 3]));
}

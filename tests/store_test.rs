//! End-to-end tests for the typed store API: round trips, update paths,
//! reopen behavior, and the instance registry.

use std::collections::HashSet;
use std::sync::Arc;

use mirrorkv::{Store, WritingMode};
use tempfile::TempDir;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_round_trip_all_primitives() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "prims").build().unwrap();

    store.put_bool("b", true).unwrap();
    store.put_int("i", -42).unwrap();
    store.put_float("f", 2.5).unwrap();
    store.put_long("l", i64::MAX).unwrap();
    store.put_double("d", -0.125).unwrap();
    store.put_string("s", "héllo").unwrap();
    store.put_array("a", &[1, 2, 3, 255]).unwrap();

    assert_eq!(store.get_bool("b"), Some(true));
    assert_eq!(store.get_int("i"), Some(-42));
    assert_eq!(store.get_float("f"), Some(2.5));
    assert_eq!(store.get_long("l"), Some(i64::MAX));
    assert_eq!(store.get_double("d"), Some(-0.125));
    assert_eq!(store.get_string("s").as_deref(), Some("héllo"));
    assert_eq!(store.get_array("a"), Some(vec![1, 2, 3, 255]));

    // Wrong-type lookups miss instead of erroring.
    assert_eq!(store.get_int("s"), None);
    assert_eq!(store.get_string("i"), None);
    assert_eq!(store.get_bool("missing"), None);
}

#[test]
fn test_values_survive_reopen() {
    init_logs();
    let dir = TempDir::new().unwrap();
    {
        let store = Store::builder(dir.path(), "reopen").build().unwrap();
        store.put_int("a", 1).unwrap();
        store.put_int("b", 2).unwrap();
        store.put_int("a", 3).unwrap();
        // The second write of "a" patches the record in place.
        let status = store.status();
        assert_eq!(status.invalid_bytes, 0);
        assert_eq!(status.keys, 2);
    }

    let store = Store::builder(dir.path(), "reopen").build().unwrap();
    assert_eq!(store.get_int("a"), Some(3));
    assert_eq!(store.get_int("b"), Some(2));
    assert_eq!(store.status().invalid_bytes, 0);
}

#[test]
fn test_string_rewrite_appends_when_length_changes() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "strlen").build().unwrap();

    store.put_string("k", "x").unwrap();
    let before = store.status();
    store.put_string("k", "yy").unwrap();
    let after = store.status();

    assert_eq!(store.get_string("k").as_deref(), Some("yy"));
    // Old record: type + keyLen + "k" + valueLen(2) + "x".
    assert_eq!(after.invalid_bytes, 2 + 1 + 2 + 1);
    assert!(after.data_size > before.data_size);
}

#[test]
fn test_string_same_length_overwrites_in_place() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "strfast").build().unwrap();

    store.put_string("k", "a").unwrap();
    let before = store.status();
    store.put_string("k", "b").unwrap();
    let after = store.status();

    assert_eq!(store.get_string("k").as_deref(), Some("b"));
    assert_eq!(after.invalid_bytes, 0);
    assert_eq!(after.data_size, before.data_size);

    // The in-place write must reach the persisted image too.
    drop(store);
    let store = Store::builder(dir.path(), "strfast").build().unwrap();
    assert_eq!(store.get_string("k").as_deref(), Some("b"));
}

#[test]
fn test_array_same_length_overwrites_in_place() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "arrfast").build().unwrap();

    store.put_array("k", &[1, 2, 3]).unwrap();
    let before = store.status();
    store.put_array("k", &[9, 8, 7]).unwrap();
    let after = store.status();

    assert_eq!(store.get_array("k"), Some(vec![9, 8, 7]));
    assert_eq!(after.invalid_bytes, 0);
    assert_eq!(after.data_size, before.data_size);
}

#[test]
fn test_same_value_put_is_a_no_op() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "noop").build().unwrap();

    store.put_int("i", 5).unwrap();
    store.put_string("s", "same").unwrap();
    store.put_array("a", &[4, 4]).unwrap();
    let before = store.status();

    store.put_int("i", 5).unwrap();
    store.put_string("s", "same").unwrap();
    store.put_array("a", &[4, 4]).unwrap();
    let after = store.status();

    assert_eq!(before.data_size, after.data_size);
    assert_eq!(after.invalid_bytes, 0);
}

#[test]
fn test_type_change_tombstones_old_record() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "retype").build().unwrap();

    store.put_int("k", 7).unwrap();
    store.put_string("k", "now a string").unwrap();

    assert_eq!(store.get_int("k"), None);
    assert_eq!(store.get_string("k").as_deref(), Some("now a string"));
    // Old int record: type + keyLen + "k" + 4 value bytes.
    assert_eq!(store.status().invalid_bytes, 2 + 1 + 4);
    assert_eq!(store.status().keys, 1);

    drop(store);
    let store = Store::builder(dir.path(), "retype").build().unwrap();
    assert_eq!(store.get_string("k").as_deref(), Some("now a string"));
}

#[test]
fn test_remove_drops_key_and_accounts_bytes() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "rm").build().unwrap();

    store.put_long("gone", 1).unwrap();
    store.put_long("kept", 2).unwrap();
    store.remove("gone");

    assert_eq!(store.get_long("gone"), None);
    assert!(!store.contains("gone"));
    assert_eq!(store.get_long("kept"), Some(2));
    assert_eq!(store.status().invalid_bytes, 2 + 4 + 8);

    // Removing a missing key changes nothing.
    let before = store.status();
    store.remove("gone");
    assert_eq!(store.status().invalid_bytes, before.invalid_bytes);

    drop(store);
    let store = Store::builder(dir.path(), "rm").build().unwrap();
    assert_eq!(store.get_long("gone"), None);
    assert_eq!(store.get_long("kept"), Some(2));
}

#[test]
fn test_key_validation() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "keys").build().unwrap();

    assert!(store.put_int("", 1).is_err());
    assert!(store.put_int(&"k".repeat(256), 1).is_err());
    assert!(store.put_int(&"k".repeat(255), 1).is_ok());
    // Failed puts leave no state behind.
    assert_eq!(store.len(), 1);
}

#[test]
fn test_keys_len_and_status() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "meta").build().unwrap();

    assert!(store.is_empty());
    store.put_int("one", 1).unwrap();
    store.put_int("two", 2).unwrap();

    let mut keys = store.keys();
    keys.sort();
    assert_eq!(keys, vec!["one".to_string(), "two".to_string()]);
    assert_eq!(store.len(), 2);

    let status = store.status();
    assert_eq!(status.keys, 2);
    assert_eq!(status.mode, WritingMode::NonBlocking);
    // Two int records with three-byte keys.
    assert_eq!(status.data_size, 2 * (2 + 3 + 4));
}

#[test]
fn test_string_set_round_trip() {
    init_logs();
    let dir = TempDir::new().unwrap();
    {
        let store = Store::builder(dir.path(), "sets").build().unwrap();
        let mut set = HashSet::new();
        set.insert("alpha".to_string());
        set.insert("beta".to_string());
        store.put_string_set("tags", set.clone()).unwrap();
        assert_eq!(*store.get_string_set("tags").unwrap(), set);
    }

    // The built-in encoder is always registered, so sets decode on reopen.
    let store = Store::builder(dir.path(), "sets").build().unwrap();
    let got = store.get_string_set("tags").unwrap();
    assert_eq!(got.len(), 2);
    assert!(got.contains("alpha") && got.contains("beta"));
}

#[test]
fn test_clear_empties_store_and_files() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "wipe").build().unwrap();
    for i in 0..50 {
        store.put_string(&format!("key{}", i), &"v".repeat(100)).unwrap();
    }
    store.clear();

    assert!(store.is_empty());
    assert_eq!(store.status().data_size, 0);
    store.put_int("fresh", 1).unwrap();
    assert_eq!(store.get_int("fresh"), Some(1));

    drop(store);
    let store = Store::builder(dir.path(), "wipe").build().unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.get_int("fresh"), Some(1));
}

#[test]
fn test_parallel_writers_and_readers() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let store = Store::builder(dir.path(), "par").build().unwrap();

    let mut handles = Vec::new();
    for t in 0..8 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            for i in 0..50 {
                let key = format!("t{}-{}", t, i);
                store.put_int(&key, t * 1000 + i).unwrap();
                assert_eq!(store.get_int(&key), Some(t * 1000 + i));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.len(), 8 * 50);
    for t in 0..8 {
        for i in 0..50 {
            assert_eq!(store.get_int(&format!("t{}-{}", t, i)), Some(t * 1000 + i));
        }
    }
}

#[test]
fn test_concurrent_builds_share_one_instance() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || Store::builder(path, "single").build().unwrap())
        })
        .collect();
    let stores: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for other in &stores[1..] {
        assert!(Arc::ptr_eq(&stores[0], other));
    }
}

#[test]
fn test_reads_wait_for_initial_parse() {
    init_logs();
    let dir = TempDir::new().unwrap();
    {
        let store = Store::builder(dir.path(), "loadrace").build().unwrap();
        for i in 0..2000 {
            store.put_string(&format!("key{}", i), &format!("value{}", i)).unwrap();
        }
    }

    // Immediately after build the loader may still be parsing; the lock
    // must make this read see the full image.
    let store = Store::builder(dir.path(), "loadrace").build().unwrap();
    assert_eq!(store.get_string("key1999").as_deref(), Some("value1999"));
    assert_eq!(store.len(), 2000);
}

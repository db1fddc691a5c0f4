//! Embedded, crash-consistent key-value store.
//!
//! `mirrorkv` keeps a typed map from string keys to primitives, strings,
//! byte arrays, and encoded objects in a single binary region, persisted as
//! a pair of mirrored memory-mapped files. Mutations patch the region in
//! place (fixed-size values) or append and tombstone (variable-size
//! values), maintain a position-weighted rolling checksum incrementally,
//! and mirror every change so that one of the two files is always a
//! complete, verifiable image. Tombstoned bytes are reclaimed by an
//! in-place compacting garbage collector.
//!
//! # Quick example
//!
//! ```no_run
//! use mirrorkv::Store;
//!
//! let store = Store::builder("/var/lib/myapp", "settings").build().unwrap();
//! store.put_int("launch_count", 3).unwrap();
//! store.put_string("user", "ada").unwrap();
//! assert_eq!(store.get_int("launch_count"), Some(3));
//! assert_eq!(store.get_string("user").as_deref(), Some("ada"));
//! ```
//!
//! # Key entry points
//!
//! | Type / Trait | Purpose |
//! |--------------|---------|
//! | [`Store`] | Typed get/put/remove, commit control, statistics |
//! | [`StoreBuilder`](kv::builder::StoreBuilder) | Open or reuse a store; writing mode, encoders, context |
//! | [`Context`](config::Context) | Injectable thread pool, logger, inline-value limit |
//! | [`Encoder`](kv::encoder::Encoder) | Typed object codec with a stable tag |
//! | [`Logger`](config::Logger) | Optional log sink (defaults to the `log` facade) |
//!
//! # Modes
//!
//! A store opens in non-blocking mode by default: every mutation is
//! mirrored synchronously into the mapped A/B pair and no explicit commit
//! is needed. The blocking modes
//! ([`blocking`](kv::builder::StoreBuilder::blocking) /
//! [`async_blocking`](kv::builder::StoreBuilder::async_blocking)) keep the
//! image in memory and write it wholesale to a committed file, either on
//! every mutation or through a coalescing background task. If memory
//! mapping fails at runtime the store degrades to async-blocking by itself
//! and keeps serving.
//!
//! Oversized values (at or above the configured inline limit) are spilled
//! to sidecar files under `<dir>/<name>/` and referenced from the record by
//! file name; sidecar writes and deletions for one key are serialized so
//! last-write-wins always holds.

pub mod config;
pub mod kv;
pub mod util;

use thiserror::Error;

pub use config::{Context, Logger};
pub use kv::builder::StoreBuilder;
pub use kv::encoder::{Encoder, StringSetEncoder};
pub use kv::store::{Status, Store, WritingMode};

/// Errors returned by store operations.
#[derive(Error, Debug)]
pub enum KvError {
    /// An I/O error occurred (open, map, resize, write, or rename failure).
    #[error("I/O error: {0}")]
    Io(String),

    /// A persisted image failed validation (bad header, checksum mismatch,
    /// or malformed records).
    #[error("Parse error: {0}")]
    Parse(String),

    /// An invalid argument was supplied (empty key, oversized key or value,
    /// bad encoder tag, bad store name).
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// An object encoder rejected a value or payload.
    #[error("Encoder error: {0}")]
    Encoder(String),
}

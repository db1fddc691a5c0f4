//! The key-value engine.
//!
//! This module contains the on-disk format and the machinery around it: the
//! byte buffer and rolling checksum, the record codec and region parser,
//! the in-memory container index, the mirrored mapped-file pair, the
//! mutation engine, the compacting garbage collector, the blocking-mode
//! commit writer, and sidecar storage for oversized values.
//!
//! Start with [`store::Store::builder`] to open a store.

pub mod blocking;
pub mod buffer;
pub mod builder;
pub mod constants;
pub mod container;
pub mod encoder;
pub mod external;
pub mod gc;
pub mod mapped;
pub mod record;
pub mod store;

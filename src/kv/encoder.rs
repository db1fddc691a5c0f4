//! Typed object codecs.
//!
//! An [`Encoder`] converts one value type to and from bytes and advertises a
//! tag that is written into every record it produces. Encoders registered
//! with the builder are consulted by the parser (by tag) to rebuild objects
//! on open; [`StringSetEncoder`] is built in and always registered.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::KvError;

/// Total codec between a value type and a byte array.
///
/// The tag must be non-empty, at most 50 characters, and unique within a
/// store. Records written through an encoder can only be decoded on a later
/// open if an encoder with the same tag is registered then.
pub trait Encoder: Send + Sync + 'static {
    /// The value type this encoder handles.
    type Value: Send + Sync + 'static;

    /// Stable identifier written into each record.
    fn tag(&self) -> &str;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, KvError>;

    fn decode(&self, data: &[u8]) -> Result<Self::Value, KvError>;
}

/// Object-safe view of an [`Encoder`], used by the parse-time registry.
pub(crate) trait ErasedEncoder: Send + Sync {
    fn tag(&self) -> &str;
    fn decode_value(&self, data: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, KvError>;
}

pub(crate) struct Erased<E>(pub E);

impl<E: Encoder> ErasedEncoder for Erased<E> {
    fn tag(&self) -> &str {
        self.0.tag()
    }

    fn decode_value(&self, data: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, KvError> {
        Ok(Arc::new(self.0.decode(data)?))
    }
}

/// Registered encoders, keyed by tag.
pub(crate) type EncoderMap = HashMap<String, Arc<dyn ErasedEncoder>>;

/// Built-in codec for sets of strings.
///
/// Layout: for each element, an i32 little-endian byte length followed by
/// the UTF-8 bytes, concatenated in iteration order.
pub struct StringSetEncoder;

/// Tag of the built-in string-set encoder.
pub const STRING_SET_TAG: &str = "StringSet";

impl Encoder for StringSetEncoder {
    type Value = HashSet<String>;

    fn tag(&self) -> &str {
        STRING_SET_TAG
    }

    fn encode(&self, value: &HashSet<String>) -> Result<Vec<u8>, KvError> {
        let mut out = Vec::with_capacity(value.iter().map(|s| 4 + s.len()).sum());
        for s in value {
            let mut len = [0u8; 4];
            LittleEndian::write_i32(&mut len, s.len() as i32);
            out.extend_from_slice(&len);
            out.extend_from_slice(s.as_bytes());
        }
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<HashSet<String>, KvError> {
        let mut set = HashSet::new();
        let mut pos = 0usize;
        while pos < data.len() {
            if pos + 4 > data.len() {
                return Err(KvError::Parse(
                    "Truncated length prefix in string set".to_string(),
                ));
            }
            let len = LittleEndian::read_i32(&data[pos..]);
            pos += 4;
            if len < 0 || pos + len as usize > data.len() {
                return Err(KvError::Parse(format!(
                    "Bad string length {} in string set",
                    len
                )));
            }
            let s = std::str::from_utf8(&data[pos..pos + len as usize])
                .map_err(|e| KvError::Parse(format!("Invalid UTF-8 in string set: {}", e)))?;
            set.insert(s.to_string());
            pos += len as usize;
        }
        Ok(set)
    }
}

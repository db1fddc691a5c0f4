//! Record codec and data-region parser.
//!
//! Each record is `type` (1 byte, with flag bits), `keyLen` (1 byte), the
//! UTF-8 key, and a value body. Fixed primitives store their raw bytes;
//! variable types prefix the body with an unsigned 16-bit length. Object
//! bodies are `tagLen` (1 byte) + tag + encoded payload. External records
//! store a sidecar file name in place of the payload.
//!
//! [`parse_data`] walks a full region, rebuilding the live-key index and the
//! invalid-segment list from tombstones, and rejects any region whose
//! records do not tile it exactly.

use std::collections::HashMap;

use crate::kv::buffer::Buffer;
use crate::kv::constants::*;
use crate::kv::container::{Container, ObjectValue, Payload, VarPayload};
use crate::kv::encoder::EncoderMap;
use crate::kv::gc::InvalidSegments;
use crate::KvError;

/// Value type carried in the low six bits of a record's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataType {
    Bool = 1,
    Int = 2,
    Float = 3,
    Long = 4,
    Double = 5,
    String = 6,
    Array = 7,
    Object = 8,
}

impl DataType {
    /// Decode the low six bits of a type byte; `None` for out-of-range values.
    pub fn from_u8(val: u8) -> Option<Self> {
        match val & TYPE_MASK {
            1 => Some(DataType::Bool),
            2 => Some(DataType::Int),
            3 => Some(DataType::Float),
            4 => Some(DataType::Long),
            5 => Some(DataType::Double),
            6 => Some(DataType::String),
            7 => Some(DataType::Array),
            8 => Some(DataType::Object),
            _ => None,
        }
    }

    /// Whether the value body has a type-determined size (no length prefix).
    pub fn is_fixed(self) -> bool {
        (self as u8) <= DataType::Double as u8
    }

    /// Body size of a fixed primitive.
    pub fn fixed_size(self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::Int | DataType::Float => 4,
            DataType::Long | DataType::Double => 8,
            DataType::String | DataType::Array | DataType::Object => 0,
        }
    }
}

/// Total encoded size of a record.
pub(crate) fn record_size(key_len: usize, data_type: DataType, value_len: usize) -> usize {
    let body = if data_type.is_fixed() {
        data_type.fixed_size()
    } else {
        2 + value_len
    };
    2 + key_len + body
}

/// Encode one record at `start`. Returns the offset of the value body.
///
/// `flags` is OR'd into the type byte; `value` is the raw body (for external
/// records, the sidecar file name bytes).
pub(crate) fn write_record(
    buffer: &mut Buffer,
    start: usize,
    data_type: DataType,
    flags: u8,
    key: &[u8],
    value: &[u8],
) -> usize {
    buffer.set_position(start);
    buffer.put_u8(data_type as u8 | flags);
    buffer.put_u8(key.len() as u8);
    buffer.put_bytes(key);
    if !data_type.is_fixed() {
        buffer.put_u16(value.len() as u16);
    }
    let offset = buffer.position();
    buffer.put_bytes(value);
    offset
}

/// Result of parsing a data region.
pub(crate) struct ParsedData {
    pub index: HashMap<String, Container>,
    pub invalids: InvalidSegments,
    /// Records skipped without failing the parse (e.g. missing encoder).
    pub warnings: Vec<String>,
}

/// Walk the region `[DATA_START, data_end)` and rebuild the in-memory state.
///
/// Tombstoned records are accumulated as invalid segments. Object records
/// whose encoder is unknown or fails to decode are reported in `warnings`
/// and left out of the index; their bytes stay in the region. Any structural
/// inconsistency (bad type byte, record overrunning `data_end`, region not
/// exactly tiled) fails the parse and the caller treats the image as
/// corrupt.
pub(crate) fn parse_data(
    buffer: &mut Buffer,
    data_end: usize,
    encoders: &EncoderMap,
) -> Result<ParsedData, KvError> {
    let mut index = HashMap::new();
    let mut invalids = InvalidSegments::new();
    let mut warnings = Vec::new();

    buffer.set_position(DATA_START);
    while buffer.position() < data_end {
        let start = buffer.position();
        if start + 2 > data_end {
            return Err(KvError::Parse(format!(
                "Record header at {} overruns data end {}",
                start, data_end
            )));
        }
        let type_byte = buffer.get_u8();
        let data_type = DataType::from_u8(type_byte).ok_or_else(|| {
            KvError::Parse(format!(
                "Bad type byte 0x{:02X} at offset {}",
                type_byte, start
            ))
        })?;
        let key_len = buffer.get_u8() as usize;
        let external = type_byte & EXTERNAL_MASK != 0;

        if start + 2 + key_len > data_end {
            return Err(KvError::Parse(format!(
                "Key at {} overruns data end {}",
                start, data_end
            )));
        }

        if type_byte & DELETE_MASK != 0 {
            let end = skip_record(buffer, start, key_len, data_type, data_end)?;
            invalids.add(start, end);
            continue;
        }

        let key = buffer.get_str(key_len)?;
        if data_type.is_fixed() {
            let offset = buffer.position();
            let end = offset + data_type.fixed_size();
            if end > data_end {
                return Err(KvError::Parse(format!(
                    "Value at {} overruns data end {}",
                    offset, data_end
                )));
            }
            let payload = match data_type {
                DataType::Bool => Payload::Bool(buffer.get_u8() != 0),
                DataType::Int => Payload::Int(buffer.get_i32()),
                DataType::Float => Payload::Float(buffer.get_f32()),
                DataType::Long => Payload::Long(buffer.get_i64()),
                DataType::Double => Payload::Double(buffer.get_f64()),
                _ => unreachable!(),
            };
            index.insert(key, Container { start, offset, payload });
            continue;
        }

        // Variable-length record.
        if buffer.position() + 2 > data_end {
            return Err(KvError::Parse(format!(
                "Length prefix at {} overruns data end {}",
                buffer.position(),
                data_end
            )));
        }
        let value_len = buffer.get_u16() as usize;
        let offset = buffer.position();
        let end = offset + value_len;
        if end > data_end {
            return Err(KvError::Parse(format!(
                "Value at {} overruns data end {}",
                offset, data_end
            )));
        }

        if external {
            if value_len != NAME_SIZE {
                return Err(KvError::Parse(format!(
                    "External record at {} has body length {}, expected {}",
                    start, value_len, NAME_SIZE
                )));
            }
            let file = buffer.get_str(NAME_SIZE)?;
            let payload = match data_type {
                DataType::String => Payload::String(VarPayload::External { file }),
                DataType::Array => Payload::Array(VarPayload::External { file }),
                DataType::Object => Payload::Object(VarPayload::External { file }),
                _ => unreachable!(),
            };
            index.insert(key, Container { start, offset, payload });
            continue;
        }

        match data_type {
            DataType::String => {
                let value = buffer.get_str(value_len)?;
                index.insert(
                    key,
                    Container {
                        start,
                        offset,
                        payload: Payload::String(VarPayload::Inline { value, value_len }),
                    },
                );
            }
            DataType::Array => {
                let value = buffer.get_bytes(value_len);
                index.insert(
                    key,
                    Container {
                        start,
                        offset,
                        payload: Payload::Array(VarPayload::Inline { value, value_len }),
                    },
                );
            }
            DataType::Object => {
                if value_len == 0 {
                    return Err(KvError::Parse(format!(
                        "Empty object body at offset {}",
                        offset
                    )));
                }
                let tag_len = buffer.get_u8() as usize;
                if 1 + tag_len > value_len {
                    return Err(KvError::Parse(format!(
                        "Object tag at {} overruns its body",
                        offset
                    )));
                }
                let tag = buffer.get_str(tag_len)?;
                let encoded = buffer.get_bytes(value_len - 1 - tag_len);
                match encoders.get(&tag) {
                    Some(encoder) => match encoder.decode_value(&encoded) {
                        Ok(value) => {
                            index.insert(
                                key,
                                Container {
                                    start,
                                    offset,
                                    payload: Payload::Object(VarPayload::Inline {
                                        value: ObjectValue { tag, value },
                                        value_len,
                                    }),
                                },
                            );
                        }
                        Err(e) => {
                            warnings.push(format!(
                                "Dropping '{}': decode with encoder '{}' failed: {}",
                                key, tag, e
                            ));
                        }
                    },
                    None => {
                        warnings.push(format!(
                            "Dropping '{}': no encoder registered for tag '{}'",
                            key, tag
                        ));
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    if buffer.position() != data_end {
        return Err(KvError::Parse(format!(
            "Records end at {} but data region ends at {}",
            buffer.position(),
            data_end
        )));
    }

    Ok(ParsedData { index, invalids, warnings })
}

/// Advance past a tombstoned record, returning its end offset.
fn skip_record(
    buffer: &mut Buffer,
    start: usize,
    key_len: usize,
    data_type: DataType,
    data_end: usize,
) -> Result<usize, KvError> {
    let body_start = start + 2 + key_len;
    let end = if data_type.is_fixed() {
        body_start + data_type.fixed_size()
    } else {
        if body_start + 2 > data_end {
            return Err(KvError::Parse(format!(
                "Tombstone at {} overruns data end {}",
                start, data_end
            )));
        }
        buffer.set_position(body_start);
        let value_len = buffer.get_u16() as usize;
        body_start + 2 + value_len
    };
    if end > data_end {
        return Err(KvError::Parse(format!(
            "Tombstone at {} overruns data end {}",
            start, data_end
        )));
    }
    buffer.set_position(end);
    Ok(end)
}

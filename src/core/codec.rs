//! Purpose: Encode and decode single typed cells in the length-prefixed spool format.
//! Exports: `write_cell`, `read_cell`, `normalize_cell`, `NULL_LENGTH`, `MAX_CELL_LEN`.
//! Role: Leaf codec under the spool file; knows nothing about files or offsets.
//! Invariants: A cell is `[i32 little-endian length][payload]`; NULL is length -1 with no payload.
//! Invariants: The payload layout is chosen by the column's declared type, never by the value.
//! Invariants: Untyped columns prefix each payload with a storage-class tag so values keep their class.
//! Invariants: NULL never reaches a type-specific payload encoder.
use std::io::{self, Read, Write};

use crate::core::column::DataType;
use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

pub const NULL_LENGTH: i32 = -1;
pub const MAX_CELL_LEN: usize = 1 << 30;
const LENGTH_PREFIX: u64 = 4;

/// Physical payload layout for a declared type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Wire {
    Bool,
    I16,
    I32,
    I64,
    F64,
    Utf8,
    Json,
    Raw,
    /// Untyped columns: a storage-class tag byte, then that class's payload.
    Variant,
}

impl Wire {
    fn for_type(data_type: &DataType) -> Self {
        match data_type {
            DataType::Bool => Wire::Bool,
            DataType::SmallInt => Wire::I16,
            DataType::Int => Wire::I32,
            DataType::BigInt | DataType::Oid => Wire::I64,
            DataType::Real | DataType::Double => Wire::F64,
            DataType::Json | DataType::Jsonb => Wire::Json,
            DataType::Bytes => Wire::Raw,
            DataType::Unknown => Wire::Variant,
            _ => Wire::Utf8,
        }
    }
}

const TAG_INTEGER: u8 = 0;
const TAG_REAL: u8 = 1;
const TAG_TEXT: u8 = 2;
const TAG_BLOB: u8 = 3;

/// Converts `value` to the form a column of `data_type` stores and reads back.
///
/// `read_cell(write_cell(v))` always equals `normalize_cell(v)`, so in-memory rows
/// normalized here compare equal to spooled rows.
pub fn normalize_cell(value: Value, data_type: &DataType) -> Result<Value, Error> {
    let mismatch = |value: &Value| {
        Error::new(ErrorKind::Codec).with_message(format!(
            "cannot store {value:?} in a {} column",
            data_type.name()
        ))
    };
    let out_of_range = |value: &Value| {
        Error::new(ErrorKind::Codec).with_message(format!(
            "value {} out of range for {}",
            value.display(),
            data_type.name()
        ))
    };
    let integer = |value: &Value| value.as_i64().ok_or_else(|| mismatch(value));

    if value.is_null() {
        return Ok(Value::Null);
    }
    let normalized = match Wire::for_type(data_type) {
        Wire::Bool => match value {
            Value::Bool(flag) => Value::Bool(flag),
            other => Value::Bool(integer(&other)? != 0),
        },
        Wire::I16 => Value::SmallInt(
            i16::try_from(integer(&value)?).map_err(|_| out_of_range(&value))?,
        ),
        Wire::I32 => {
            Value::Int(i32::try_from(integer(&value)?).map_err(|_| out_of_range(&value))?)
        }
        Wire::I64 => Value::BigInt(integer(&value)?),
        Wire::F64 => Value::Double(value.as_f64().ok_or_else(|| mismatch(&value))?),
        Wire::Utf8 => match value {
            Value::Text(text) => Value::Text(text),
            other => Value::Text(other.display()),
        },
        Wire::Json => match value {
            Value::Json(json) => Value::Json(json),
            Value::Text(text) => match serde_json::from_str(&text) {
                Ok(json) => Value::Json(json),
                Err(_) => Value::Text(text),
            },
            other => Value::Json(other.to_json()),
        },
        Wire::Raw => match value {
            Value::Bytes(bytes) => Value::Bytes(bytes),
            other => return Err(mismatch(&other)),
        },
        Wire::Variant => match value {
            Value::Bool(_) | Value::SmallInt(_) | Value::Int(_) => Value::BigInt(integer(&value)?),
            Value::Json(json) => Value::Text(json.to_string()),
            other => other,
        },
    };
    Ok(normalized)
}

/// Writes one cell and returns the number of bytes written, prefix included.
pub fn write_cell<W: Write>(
    writer: &mut W,
    value: &Value,
    data_type: &DataType,
) -> Result<u64, Error> {
    if value.is_null() {
        writer
            .write_all(&NULL_LENGTH.to_le_bytes())
            .map_err(codec_io)?;
        return Ok(LENGTH_PREFIX);
    }

    let normalized = normalize_cell(value.clone(), data_type)?;
    let payload = encode_payload(&normalized, Wire::for_type(data_type))?;
    if payload.len() > MAX_CELL_LEN {
        return Err(Error::new(ErrorKind::Codec).with_message("cell payload exceeds max length"));
    }
    let len = payload.len() as i32;
    writer.write_all(&len.to_le_bytes()).map_err(codec_io)?;
    writer.write_all(&payload).map_err(codec_io)?;
    Ok(LENGTH_PREFIX + payload.len() as u64)
}

/// Reads one cell and returns the value plus the number of bytes consumed.
pub fn read_cell<R: Read>(reader: &mut R, data_type: &DataType) -> Result<(Value, u64), Error> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).map_err(codec_io)?;
    let len = i32::from_le_bytes(prefix);
    if len == NULL_LENGTH {
        return Ok((Value::Null, LENGTH_PREFIX));
    }
    if len < 0 || len as usize > MAX_CELL_LEN {
        return Err(
            Error::new(ErrorKind::Codec).with_message(format!("invalid cell length {len}"))
        );
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(codec_io)?;
    let value = decode_payload(&payload, Wire::for_type(data_type))?;
    Ok((value, LENGTH_PREFIX + len as u64))
}

/// Encodes an already normalized value.
fn encode_payload(value: &Value, wire: Wire) -> Result<Vec<u8>, Error> {
    let body = match value {
        Value::Null => Vec::new(),
        Value::Bool(flag) => vec![u8::from(*flag)],
        Value::SmallInt(int) => int.to_le_bytes().to_vec(),
        Value::Int(int) => int.to_le_bytes().to_vec(),
        Value::BigInt(int) => int.to_le_bytes().to_vec(),
        Value::Double(real) => real.to_le_bytes().to_vec(),
        Value::Text(text) => text.as_bytes().to_vec(),
        Value::Bytes(bytes) => bytes.clone(),
        Value::Json(json) => serde_json::to_vec(json).map_err(|err| {
            Error::new(ErrorKind::Codec)
                .with_message("json encode failed")
                .with_source(err)
        })?,
    };
    if wire != Wire::Variant {
        return Ok(body);
    }
    let tag = match value {
        Value::BigInt(_) => TAG_INTEGER,
        Value::Double(_) => TAG_REAL,
        Value::Bytes(_) => TAG_BLOB,
        _ => TAG_TEXT,
    };
    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(tag);
    payload.extend_from_slice(&body);
    Ok(payload)
}

fn decode_payload(payload: &[u8], wire: Wire) -> Result<Value, Error> {
    let value = match wire {
        Wire::Bool => Value::Bool(fixed::<1>(payload)?[0] != 0),
        Wire::I16 => Value::SmallInt(i16::from_le_bytes(fixed(payload)?)),
        Wire::I32 => Value::Int(i32::from_le_bytes(fixed(payload)?)),
        Wire::I64 => Value::BigInt(i64::from_le_bytes(fixed(payload)?)),
        Wire::F64 => Value::Double(f64::from_le_bytes(fixed(payload)?)),
        Wire::Utf8 => Value::Text(utf8(payload)?),
        Wire::Json => match serde_json::from_slice(payload) {
            Ok(json) => Value::Json(json),
            Err(_) => Value::Text(utf8(payload)?),
        },
        Wire::Raw => Value::Bytes(payload.to_vec()),
        Wire::Variant => match payload.split_first() {
            Some((&TAG_INTEGER, body)) => Value::BigInt(i64::from_le_bytes(fixed(body)?)),
            Some((&TAG_REAL, body)) => Value::Double(f64::from_le_bytes(fixed(body)?)),
            Some((&TAG_TEXT, body)) => Value::Text(utf8(body)?),
            Some((&TAG_BLOB, body)) => Value::Bytes(body.to_vec()),
            Some((tag, _)) => {
                return Err(Error::new(ErrorKind::Codec)
                    .with_message(format!("unknown storage-class tag {tag}")));
            }
            None => {
                return Err(
                    Error::new(ErrorKind::Codec).with_message("untyped cell is missing its tag")
                );
            }
        },
    };
    Ok(value)
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N], Error> {
    payload.try_into().map_err(|_| {
        Error::new(ErrorKind::Codec).with_message(format!(
            "expected {N}-byte payload, found {} bytes",
            payload.len()
        ))
    })
}

fn utf8(payload: &[u8]) -> Result<String, Error> {
    String::from_utf8(payload.to_vec()).map_err(|err| {
        Error::new(ErrorKind::Codec)
            .with_message("cell payload is not valid utf-8")
            .with_source(err)
    })
}

fn codec_io(err: io::Error) -> Error {
    let message = if err.kind() == io::ErrorKind::UnexpectedEof {
        "truncated cell"
    } else {
        "spool i/o failed"
    };
    Error::new(ErrorKind::Codec)
        .with_message(message)
        .with_source(err)
}

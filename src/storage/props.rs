//! Property block codec.
//!
//! A property block is one `(key, encoded value)` pair inside a property record. Values
//! are encoded as a type tag followed by a type-specific payload using LEB128 varints
//! (zig-zag for signed integers). The same encoding doubles as the exact-match key for
//! property indexes.

use crate::types::{PropId, Result, StorageError};

use super::types::{PropArray, PropValueOwned, Property};

pub const TYPE_BOOL: u8 = 1;
pub const TYPE_INT: u8 = 2;
pub const TYPE_FLOAT: u8 = 3;
pub const TYPE_STR: u8 = 4;
pub const TYPE_BYTES: u8 = 5;
pub const TYPE_ARRAY: u8 = 6;

/// One encoded property inside a property record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyBlock {
    pub key: PropId,
    pub payload: Vec<u8>,
}

impl PropertyBlock {
    pub fn encode(property: &Property) -> Self {
        let mut payload = Vec::with_capacity(16);
        encode_value(&property.value, &mut payload);
        Self {
            key: property.key,
            payload,
        }
    }

    /// Decodes the block back into a typed property.
    pub fn decode(&self) -> Result<Property> {
        let mut cursor = 0usize;
        let value = decode_value(&self.payload, &mut cursor)?;
        if cursor != self.payload.len() {
            return Err(corrupt("trailing bytes after property value"));
        }
        Ok(Property {
            key: self.key,
            value,
        })
    }
}

/// Exact-match key for `value`, used by property indexes.
pub fn value_key(value: &PropValueOwned) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    encode_value(value, &mut out);
    out
}

pub fn encode_value(value: &PropValueOwned, out: &mut Vec<u8>) {
    match value {
        PropValueOwned::Bool(v) => {
            out.push(TYPE_BOOL);
            out.push(u8::from(*v));
        }
        PropValueOwned::Int(v) => {
            out.push(TYPE_INT);
            write_var_i64(*v, out);
        }
        PropValueOwned::Float(v) => {
            out.push(TYPE_FLOAT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        PropValueOwned::Str(s) => {
            out.push(TYPE_STR);
            write_bytes(s.as_bytes(), out);
        }
        PropValueOwned::Bytes(b) => {
            out.push(TYPE_BYTES);
            write_bytes(b, out);
        }
        PropValueOwned::Array(array) => {
            out.push(TYPE_ARRAY);
            encode_array(array, out);
        }
    }
}

fn encode_array(array: &PropArray, out: &mut Vec<u8>) {
    match array {
        PropArray::Bool(items) => {
            out.push(TYPE_BOOL);
            write_var_u64(items.len() as u64, out);
            out.extend(items.iter().map(|v| u8::from(*v)));
        }
        PropArray::Int(items) => {
            out.push(TYPE_INT);
            write_var_u64(items.len() as u64, out);
            for v in items {
                write_var_i64(*v, out);
            }
        }
        PropArray::Float(items) => {
            out.push(TYPE_FLOAT);
            write_var_u64(items.len() as u64, out);
            for v in items {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        PropArray::Str(items) => {
            out.push(TYPE_STR);
            write_var_u64(items.len() as u64, out);
            for s in items {
                write_bytes(s.as_bytes(), out);
            }
        }
    }
}

pub fn decode_value(buf: &[u8], cursor: &mut usize) -> Result<PropValueOwned> {
    let tag = read_u8(buf, cursor, "property type tag missing")?;
    let value = match tag {
        TYPE_BOOL => PropValueOwned::Bool(read_bool(buf, cursor)?),
        TYPE_INT => PropValueOwned::Int(read_var_i64(buf, cursor)?),
        TYPE_FLOAT => PropValueOwned::Float(read_f64(buf, cursor)?),
        TYPE_STR => PropValueOwned::Str(read_string(buf, cursor)?),
        TYPE_BYTES => PropValueOwned::Bytes(read_bytes(buf, cursor)?.to_vec()),
        TYPE_ARRAY => PropValueOwned::Array(decode_array(buf, cursor)?),
        _ => return Err(corrupt("unknown property type tag")),
    };
    Ok(value)
}

fn decode_array(buf: &[u8], cursor: &mut usize) -> Result<PropArray> {
    let elem = read_u8(buf, cursor, "array element tag missing")?;
    let len = read_var_u64(buf, cursor)? as usize;
    if len > buf.len().saturating_sub(*cursor) {
        return Err(corrupt("array length exceeds payload"));
    }
    let array = match elem {
        TYPE_BOOL => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_bool(buf, cursor)?);
            }
            PropArray::Bool(items)
        }
        TYPE_INT => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_var_i64(buf, cursor)?);
            }
            PropArray::Int(items)
        }
        TYPE_FLOAT => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_f64(buf, cursor)?);
            }
            PropArray::Float(items)
        }
        TYPE_STR => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_string(buf, cursor)?);
            }
            PropArray::Str(items)
        }
        _ => return Err(corrupt("unknown array element tag")),
    };
    Ok(array)
}

fn corrupt(msg: &'static str) -> crate::types::KernelError {
    StorageError::Corruption(msg).into()
}

fn read_u8(buf: &[u8], cursor: &mut usize, msg: &'static str) -> Result<u8> {
    let byte = *buf.get(*cursor).ok_or_else(|| corrupt(msg))?;
    *cursor += 1;
    Ok(byte)
}

fn read_bool(buf: &[u8], cursor: &mut usize) -> Result<bool> {
    match read_u8(buf, cursor, "bool payload truncated")? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(corrupt("bool payload invalid")),
    }
}

fn read_f64(buf: &[u8], cursor: &mut usize) -> Result<f64> {
    if *cursor + 8 > buf.len() {
        return Err(corrupt("float payload truncated"));
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[*cursor..*cursor + 8]);
    *cursor += 8;
    Ok(f64::from_le_bytes(arr))
}

fn read_bytes<'a>(buf: &'a [u8], cursor: &mut usize) -> Result<&'a [u8]> {
    let len = read_var_u64(buf, cursor)? as usize;
    if len > buf.len().saturating_sub(*cursor) {
        return Err(corrupt("inline bytes truncated"));
    }
    let data = &buf[*cursor..*cursor + len];
    *cursor += len;
    Ok(data)
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String> {
    let bytes = read_bytes(buf, cursor)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| corrupt("stored string not utf8"))
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    write_var_u64(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn write_var_u64(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        } else {
            out.push(byte | 0x80);
        }
    }
}

fn write_var_i64(v: i64, out: &mut Vec<u8>) {
    let zigzag = ((v << 1) ^ (v >> 63)) as u64;
    write_var_u64(zigzag, out);
}

fn read_var_u64(buf: &[u8], cursor: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for _ in 0..10 {
        let byte = read_u8(buf, cursor, "varint truncated")?;
        result |= ((byte & 0x7f) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(result);
        }
        shift += 7;
    }
    Err(corrupt("varint too long"))
}

fn read_var_i64(buf: &[u8], cursor: &mut usize) -> Result<i64> {
    let raw = read_var_u64(buf, cursor)?;
    Ok(((raw >> 1) as i64) ^ (-((raw & 1) as i64)))
}

//! Marshalling of values at a running byte offset.
//!
//! The encoder appends to a `Vec<u8>` whose length *is* the absolute offset
//! within the message; the decoder threads a cursor over the full message
//! bytes. Alignment is always computed against that absolute offset, never
//! reset per container.

use thiserror::Error;

use crate::names;
use crate::wire::signature::SignatureError;
use crate::wire::{Endian, Type, Value};

/// Arrays are capped at 2^26 bytes on the wire.
pub const MAX_ARRAY_LEN: u32 = 1 << 26;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodeError {
    #[error("type mismatch: expected `{expected}`, got `{found}`")]
    TypeMismatch { expected: String, found: String },
    #[error("expected {expected} body values, got {found}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("array of {0} bytes exceeds the maximum array length")]
    ArrayTooLong(usize),
    #[error("invalid signature: {0}")]
    Signature(#[from] SignatureError),
    #[error("message is missing required header field `{0}`")]
    MissingRequiredField(&'static str),
    #[error("message serial must not be zero")]
    SerialZero,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("insufficient data")]
    InsufficientData,
    #[error("boolean wire value {0} is neither 0 nor 1")]
    InvalidBoolean(u32),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string is missing its NUL terminator")]
    MissingNul,
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("invalid object path `{0}`")]
    InvalidObjectPath(String),
    #[error("array of {0} bytes exceeds the maximum array length")]
    ArrayTooLong(u32),
    #[error("array contents overran the declared length")]
    ArrayLengthMismatch,
    #[error("unknown endianness marker {0:#x}")]
    InvalidEndianness(u8),
    #[error("unknown message type {0}")]
    InvalidMessageType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),
    #[error("message of {0} bytes exceeds the maximum message size")]
    MessageTooLarge(usize),
    #[error("message serial must not be zero")]
    SerialZero,
    #[error("malformed header field with code {0}")]
    InvalidHeaderField(u8),
    #[error("message is missing required header field `{0}`")]
    MissingRequiredField(&'static str),
    #[error("body has a signature but trailing bytes remain")]
    TrailingBodyBytes,
    #[error("non-empty body without a signature header field")]
    MissingSignature,
}

pub(crate) fn padding_for(offset: usize, alignment: usize) -> usize {
    offset.wrapping_neg() & (alignment - 1)
}

/// Appends zero padding so that `buf.len()` is aligned.
pub(crate) fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    let padding = padding_for(buf.len(), alignment);
    buf.resize(buf.len() + padding, 0);
}

fn align_cursor(buf: &[u8], cursor: &mut usize, alignment: usize) -> Result<(), DecodeError> {
    let aligned = *cursor + padding_for(*cursor, alignment);
    if aligned > buf.len() {
        return Err(DecodeError::InsufficientData);
    }
    *cursor = aligned;
    Ok(())
}

fn take<'a>(buf: &'a [u8], cursor: &mut usize, n: usize) -> Result<&'a [u8], DecodeError> {
    if buf.len() - *cursor < n {
        return Err(DecodeError::InsufficientData);
    }
    let bytes = &buf[*cursor..*cursor + n];
    *cursor += n;
    Ok(bytes)
}

/// Encodes one value, padding to its natural alignment first.
pub fn encode_value(buf: &mut Vec<u8>, endian: Endian, value: &Value) -> Result<(), EncodeError> {
    match value {
        Value::Byte(v) => buf.push(*v),
        Value::Bool(v) => encode_u32(buf, endian, *v as u32),
        Value::Int16(v) => {
            pad_to(buf, 2);
            let mut raw = [0; 2];
            endian.write_u16(&mut raw, *v as u16);
            buf.extend_from_slice(&raw);
        }
        Value::Uint16(v) => {
            pad_to(buf, 2);
            let mut raw = [0; 2];
            endian.write_u16(&mut raw, *v);
            buf.extend_from_slice(&raw);
        }
        Value::Int32(v) => encode_u32(buf, endian, *v as u32),
        Value::Uint32(v) | Value::UnixFd(v) => encode_u32(buf, endian, *v),
        Value::Int64(v) => encode_u64(buf, endian, *v as u64),
        Value::Uint64(v) => encode_u64(buf, endian, *v),
        Value::Double(v) => encode_u64(buf, endian, v.to_bits()),
        Value::String(s) | Value::ObjectPath(s) => {
            encode_u32(buf, endian, s.len() as u32);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        Value::Signature(s) => {
            buf.push(s.len() as u8);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        Value::Array(elem_ty, elems) => {
            pad_to(buf, 4);
            let len_pos = buf.len();
            buf.extend_from_slice(&[0; 4]);
            // Padding to the element alignment is not part of the length.
            pad_to(buf, elem_ty.alignment());
            let start = buf.len();
            for elem in elems {
                if !elem.matches_type(elem_ty) {
                    return Err(EncodeError::TypeMismatch {
                        expected: elem_ty.signature(),
                        found: elem.type_of().signature(),
                    });
                }
                encode_value(buf, endian, elem)?;
            }
            let len = buf.len() - start;
            if len > MAX_ARRAY_LEN as usize {
                return Err(EncodeError::ArrayTooLong(len));
            }
            endian.write_u32(&mut buf[len_pos..len_pos + 4], len as u32);
        }
        Value::Struct(fields) => {
            pad_to(buf, 8);
            for field in fields {
                encode_value(buf, endian, field)?;
            }
        }
        Value::DictEntry(key, val) => {
            pad_to(buf, 8);
            encode_value(buf, endian, key)?;
            encode_value(buf, endian, val)?;
        }
        Value::Variant(inner) => {
            let signature = inner.type_of().signature();
            encode_value(buf, endian, &Value::Signature(signature))?;
            encode_value(buf, endian, inner)?;
        }
    }
    Ok(())
}

fn encode_u32(buf: &mut Vec<u8>, endian: Endian, v: u32) {
    pad_to(buf, 4);
    let mut raw = [0; 4];
    endian.write_u32(&mut raw, v);
    buf.extend_from_slice(&raw);
}

fn encode_u64(buf: &mut Vec<u8>, endian: Endian, v: u64) {
    pad_to(buf, 8);
    let mut raw = [0; 8];
    endian.write_u64(&mut raw, v);
    buf.extend_from_slice(&raw);
}

/// Encodes a value sequence against a declared type sequence.
pub fn encode_values(
    buf: &mut Vec<u8>,
    endian: Endian,
    types: &[Type],
    values: &[Value],
) -> Result<(), EncodeError> {
    if types.len() != values.len() {
        return Err(EncodeError::ArityMismatch {
            expected: types.len(),
            found: values.len(),
        });
    }
    for (ty, value) in types.iter().zip(values) {
        if !value.matches_type(ty) {
            return Err(EncodeError::TypeMismatch {
                expected: ty.signature(),
                found: value.type_of().signature(),
            });
        }
        encode_value(buf, endian, value)?;
    }
    Ok(())
}

/// Decodes one value of the given type, consuming alignment padding first.
pub fn decode_value(
    buf: &[u8],
    cursor: &mut usize,
    endian: Endian,
    ty: &Type,
) -> Result<Value, DecodeError> {
    match ty {
        Type::Byte => Ok(Value::Byte(take(buf, cursor, 1)?[0])),
        Type::Bool => match decode_u32(buf, cursor, endian)? {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(DecodeError::InvalidBoolean(other)),
        },
        Type::Int16 => {
            align_cursor(buf, cursor, 2)?;
            Ok(Value::Int16(endian.read_u16(take(buf, cursor, 2)?) as i16))
        }
        Type::Uint16 => {
            align_cursor(buf, cursor, 2)?;
            Ok(Value::Uint16(endian.read_u16(take(buf, cursor, 2)?)))
        }
        Type::Int32 => Ok(Value::Int32(decode_u32(buf, cursor, endian)? as i32)),
        Type::Uint32 => Ok(Value::Uint32(decode_u32(buf, cursor, endian)?)),
        Type::UnixFd => Ok(Value::UnixFd(decode_u32(buf, cursor, endian)?)),
        Type::Int64 => Ok(Value::Int64(decode_u64(buf, cursor, endian)? as i64)),
        Type::Uint64 => Ok(Value::Uint64(decode_u64(buf, cursor, endian)?)),
        Type::Double => Ok(Value::Double(f64::from_bits(decode_u64(
            buf, cursor, endian,
        )?))),
        Type::String => Ok(Value::String(decode_string(buf, cursor, endian)?)),
        Type::ObjectPath => {
            let path = decode_string(buf, cursor, endian)?;
            if !names::is_valid_object_path(&path) {
                return Err(DecodeError::InvalidObjectPath(path));
            }
            Ok(Value::ObjectPath(path))
        }
        Type::Signature => {
            let signature = decode_signature(buf, cursor)?;
            Type::parse_types(&signature)?;
            Ok(Value::Signature(signature))
        }
        Type::Array(elem_ty) => {
            let len = decode_u32(buf, cursor, endian)?;
            if len > MAX_ARRAY_LEN {
                return Err(DecodeError::ArrayTooLong(len));
            }
            align_cursor(buf, cursor, elem_ty.alignment())?;
            let start = *cursor;
            let end = start + len as usize;
            if end > buf.len() {
                return Err(DecodeError::InsufficientData);
            }
            let mut elems = Vec::new();
            while *cursor < end {
                elems.push(decode_value(buf, cursor, endian, elem_ty)?);
            }
            if *cursor != end {
                return Err(DecodeError::ArrayLengthMismatch);
            }
            Ok(Value::Array((**elem_ty).clone(), elems))
        }
        Type::Struct(fields) => {
            align_cursor(buf, cursor, 8)?;
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                values.push(decode_value(buf, cursor, endian, field)?);
            }
            Ok(Value::Struct(values))
        }
        Type::DictEntry(key_ty, val_ty) => {
            align_cursor(buf, cursor, 8)?;
            let key = decode_value(buf, cursor, endian, key_ty)?;
            let val = decode_value(buf, cursor, endian, val_ty)?;
            Ok(Value::DictEntry(Box::new(key), Box::new(val)))
        }
        Type::Variant => {
            let signature = decode_signature(buf, cursor)?;
            let inner_ty = Type::parse(&signature)?;
            let inner = decode_value(buf, cursor, endian, &inner_ty)?;
            Ok(Value::Variant(Box::new(inner)))
        }
    }
}

/// Decodes a value sequence for a body signature.
pub fn decode_values(
    buf: &[u8],
    cursor: &mut usize,
    endian: Endian,
    types: &[Type],
) -> Result<Vec<Value>, DecodeError> {
    let mut values = Vec::with_capacity(types.len());
    for ty in types {
        values.push(decode_value(buf, cursor, endian, ty)?);
    }
    Ok(values)
}

fn decode_u32(buf: &[u8], cursor: &mut usize, endian: Endian) -> Result<u32, DecodeError> {
    align_cursor(buf, cursor, 4)?;
    Ok(endian.read_u32(take(buf, cursor, 4)?))
}

fn decode_u64(buf: &[u8], cursor: &mut usize, endian: Endian) -> Result<u64, DecodeError> {
    align_cursor(buf, cursor, 8)?;
    Ok(endian.read_u64(take(buf, cursor, 8)?))
}

fn decode_string(buf: &[u8], cursor: &mut usize, endian: Endian) -> Result<String, DecodeError> {
    let len = decode_u32(buf, cursor, endian)? as usize;
    let bytes = take(buf, cursor, len)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_string();
    if take(buf, cursor, 1)?[0] != 0 {
        return Err(DecodeError::MissingNul);
    }
    Ok(s)
}

fn decode_signature(buf: &[u8], cursor: &mut usize) -> Result<String, DecodeError> {
    let len = take(buf, cursor, 1)?[0] as usize;
    let bytes = take(buf, cursor, len)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_string();
    if take(buf, cursor, 1)?[0] != 0 {
        return Err(DecodeError::MissingNul);
    }
    Ok(s)
}

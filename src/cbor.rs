//! Canonical codec for the CTAP2 CBOR subset.
//!
//! Encoding always produces the canonical form (definite lengths, shortest
//! integer heads, map entries sorted by the byte order of their encoded
//! keys). Decoding comes in two flavours: `decode` is lenient about entry
//! order because deployed authenticators emit non-canonical maps, while
//! `decode_strict` is used for security-critical objects (attestation,
//! client data) and rejects anything that does not re-encode to the same
//! bytes.

use ciborium::value::Integer;
pub use ciborium::Value;
use std::io::Cursor;

use crate::error::CborError;

/// Maps and arrays may nest at most this deep. CTAP2 structures never
/// exceed four levels.
const MAX_DEPTH: usize = 4;

/// Encode a value in canonical CTAP2 form.
pub fn encode(value: &Value) -> Result<Vec<u8>, CborError> {
    let canonical = canonicalize(value, 1)?;
    encode_raw(&canonical)
}

/// Decode a single value from the front of `data`, returning the value and
/// the number of bytes consumed. Accepts non-canonical entry order.
pub fn decode(data: &[u8]) -> Result<(Value, usize), CborError> {
    let mut cursor = Cursor::new(data);
    let value: Value = ciborium::from_reader(&mut cursor).map_err(|e| match e {
        ciborium::de::Error::Io(_) => CborError::Truncated,
        ciborium::de::Error::RecursionLimitExceeded => CborError::DepthExceeded,
        _ => CborError::BadType,
    })?;
    validate(&value, 1)?;
    Ok((value, cursor.position() as usize))
}

/// Decode a complete buffer, additionally rejecting trailing bytes and any
/// deviation from the canonical encoding.
pub fn decode_strict(data: &[u8]) -> Result<Value, CborError> {
    let (value, consumed) = decode(data)?;
    if consumed != data.len() {
        return Err(CborError::NonCanonical);
    }
    if encode(&value)? != data {
        return Err(CborError::NonCanonical);
    }
    Ok(value)
}

fn encode_raw(value: &Value) -> Result<Vec<u8>, CborError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|_| CborError::BadType)?;
    Ok(buf)
}

/// Checks a decoded value against the CTAP2 subset: integer domain
/// -2^63..2^64-1, no floats or tags, bounded container nesting, no
/// duplicate map keys. Only arrays and maps count toward the depth.
fn validate(value: &Value, depth: usize) -> Result<(), CborError> {
    if depth > MAX_DEPTH && matches!(value, Value::Array(_) | Value::Map(_)) {
        return Err(CborError::DepthExceeded);
    }
    match value {
        Value::Integer(i) => {
            let v: i128 = (*i).into();
            if v < i64::MIN as i128 || v > u64::MAX as i128 {
                return Err(CborError::BadType);
            }
            Ok(())
        }
        Value::Bytes(_) | Value::Text(_) | Value::Bool(_) | Value::Null => Ok(()),
        Value::Array(items) => {
            for item in items {
                validate(item, depth + 1)?;
            }
            Ok(())
        }
        Value::Map(entries) => {
            let mut encoded_keys = Vec::with_capacity(entries.len());
            for (key, val) in entries {
                validate(key, depth + 1)?;
                validate(val, depth + 1)?;
                encoded_keys.push(encode_raw(key)?);
            }
            encoded_keys.sort();
            if encoded_keys.windows(2).any(|w| w[0] == w[1]) {
                return Err(CborError::DuplicateKey);
            }
            Ok(())
        }
        _ => Err(CborError::BadType),
    }
}

/// Returns a copy of `value` with every map sorted into canonical key
/// order, validating the subset along the way.
fn canonicalize(value: &Value, depth: usize) -> Result<Value, CborError> {
    if depth > MAX_DEPTH && matches!(value, Value::Array(_) | Value::Map(_)) {
        return Err(CborError::DepthExceeded);
    }
    match value {
        Value::Integer(i) => {
            let v: i128 = (*i).into();
            if v < i64::MIN as i128 || v > u64::MAX as i128 {
                return Err(CborError::BadType);
            }
            Ok(value.clone())
        }
        Value::Bytes(_) | Value::Text(_) | Value::Bool(_) | Value::Null => Ok(value.clone()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(canonicalize(item, depth + 1)?);
            }
            Ok(Value::Array(out))
        }
        Value::Map(entries) => {
            let mut keyed = Vec::with_capacity(entries.len());
            for (key, val) in entries {
                let key = canonicalize(key, depth + 1)?;
                let val = canonicalize(val, depth + 1)?;
                keyed.push((encode_raw(&key)?, key, val));
            }
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            if keyed.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(CborError::DuplicateKey);
            }
            Ok(Value::Map(
                keyed.into_iter().map(|(_, k, v)| (k, v)).collect(),
            ))
        }
        _ => Err(CborError::BadType),
    }
}

/// Shorthand for an integer map key or value.
pub fn int(v: i64) -> Value {
    Value::Integer(Integer::from(v))
}

/// Looks up an integer-keyed entry in a decoded map.
pub fn map_get(map: &[(Value, Value)], key: i64) -> Option<&Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == key as i128 => Some(v),
        _ => None,
    })
}

/// Looks up a text-keyed entry in a decoded map.
pub fn map_get_text<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Text(t) if t == key => Some(v),
        _ => None,
    })
}

/// Parse CBOR value to string safely
pub fn cbor_to_string(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        Value::Bytes(b) => hex::encode(b),
        _ => String::new(),
    }
}

/// Parse CBOR value to u64
pub fn cbor_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => u64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

/// Parse CBOR value to u32
pub fn cbor_to_u32(value: &Value) -> Option<u32> {
    cbor_to_u64(value).and_then(|v| u32::try_from(v).ok())
}

/// Parse CBOR value to u8
pub fn cbor_to_u8(value: &Value) -> Option<u8> {
    cbor_to_u64(value).and_then(|v| u8::try_from(v).ok())
}

/// Parse CBOR value to i64
pub fn cbor_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => i64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

/// Parse CBOR value to bool
pub fn cbor_to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

/// Parse CBOR value to a byte string
pub fn cbor_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Bytes(b) => Some(b.clone()),
        _ => None,
    }
}

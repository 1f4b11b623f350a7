//! Order-preserving key encodings.
//!
//! Every encoding starts with a one-byte type tag followed by a payload whose
//! byte-lexicographic order matches the natural order of the value. Values of
//! different types sort by tag, so keys of one type should not be mixed with
//! keys of another in the same keyspace unless that grouping is wanted.

use chrono::{DateTime, TimeZone, Utc};

use super::EncodingError;
use crate::error::Result;

// Order matters: these determine cross-type ordering
const TYPE_BOOLEAN: u8 = 0x01;
const TYPE_INTEGER: u8 = 0x02;
const TYPE_FLOAT: u8 = 0x03;
const TYPE_STRING: u8 = 0x04;
const TYPE_BYTES: u8 = 0x05;
const TYPE_DATE: u8 = 0x06;
const TYPE_UNSIGNED: u8 = 0x07;

const SIGN_BIT: u64 = 1u64 << 63;

/// Encoding for values used as row keys or index keys.
///
/// For any two values `a < b` of the same type, `a.encode() < b.encode()`
/// under byte-lexicographic comparison, and `decode(encode(v)) == v`.
pub trait Lexicode {
    /// Encode the key to bytes while preserving sort order
    fn encode(&self) -> Vec<u8>;

    /// Decode bytes back to the original key type
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

fn check_tag(bytes: &[u8], tag: u8, name: &str) -> Result<()> {
    match bytes.first() {
        None => Err(EncodingError::TruncatedData.into()),
        Some(t) if *t == tag => Ok(()),
        Some(_) => Err(EncodingError::InvalidFormat(format!("Not a {} type", name)).into()),
    }
}

fn fixed_payload<'a>(bytes: &'a [u8], tag: u8, name: &str) -> Result<&'a [u8; 8]> {
    check_tag(bytes, tag, name)?;
    bytes[1..].try_into().map_err(|_| {
        EncodingError::InvalidFormat(format!("{} must be 9 bytes total", name)).into()
    })
}

/// Encode a boolean with order preservation
pub fn encode_boolean(b: bool) -> Vec<u8> {
    vec![TYPE_BOOLEAN, if b { 0x01 } else { 0x00 }]
}

/// Decode a boolean from bytes
pub fn decode_boolean(bytes: &[u8]) -> Result<bool> {
    check_tag(bytes, TYPE_BOOLEAN, "boolean")?;

    if bytes.len() != 2 {
        return Err(
            EncodingError::InvalidFormat("Boolean must be 2 bytes total".to_string()).into(),
        );
    }

    match bytes[1] {
        0x00 => Ok(false),
        0x01 => Ok(true),
        _ => Err(EncodingError::InvalidFormat("Invalid boolean value".to_string()).into()),
    }
}

fn encode_signed(tag: u8, i: i64) -> Vec<u8> {
    // Flip the sign bit so negative numbers sort before positive
    let unsigned = (i as u64) ^ SIGN_BIT;
    let mut result = Vec::with_capacity(9);
    result.push(tag);
    result.extend_from_slice(&unsigned.to_be_bytes());
    result
}

fn decode_signed(bytes: &[u8], tag: u8, name: &str) -> Result<i64> {
    let payload = fixed_payload(bytes, tag, name)?;
    Ok((u64::from_be_bytes(*payload) ^ SIGN_BIT) as i64)
}

/// Encode an integer with order preservation
pub fn encode_integer(i: i64) -> Vec<u8> {
    encode_signed(TYPE_INTEGER, i)
}

/// Decode an integer from bytes
pub fn decode_integer(bytes: &[u8]) -> Result<i64> {
    decode_signed(bytes, TYPE_INTEGER, "integer")
}

pub fn encode_unsigned(u: u64) -> Vec<u8> {
    let mut result = Vec::with_capacity(9);
    result.push(TYPE_UNSIGNED);
    result.extend_from_slice(&u.to_be_bytes());
    result
}

pub fn decode_unsigned(bytes: &[u8]) -> Result<u64> {
    let payload = fixed_payload(bytes, TYPE_UNSIGNED, "unsigned")?;
    Ok(u64::from_be_bytes(*payload))
}

/// Encode a float with order preservation.
///
/// Negative values have all bits flipped, positive values only the sign bit,
/// so `-0.0` sorts immediately before `0.0`.
pub fn encode_float(f: f64) -> Vec<u8> {
    let bits = f.to_bits();
    let ordered_bits = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    };

    let mut result = Vec::with_capacity(9);
    result.push(TYPE_FLOAT);
    result.extend_from_slice(&ordered_bits.to_be_bytes());
    result
}

/// Decode a float from bytes
pub fn decode_float(bytes: &[u8]) -> Result<f64> {
    let payload = fixed_payload(bytes, TYPE_FLOAT, "float")?;
    let ordered_bits = u64::from_be_bytes(*payload);

    let original_bits = if ordered_bits & SIGN_BIT != 0 {
        ordered_bits & !SIGN_BIT
    } else {
        !ordered_bits
    };

    Ok(f64::from_bits(original_bits))
}

/// Encode a timestamp as sign-flipped epoch seconds followed by the
/// sub-second nanoseconds, both big-endian. Leap-second nanos (>= 1e9) sort
/// after the rest of their second.
pub fn encode_date(date: &DateTime<Utc>) -> Vec<u8> {
    let seconds = (date.timestamp() as u64) ^ SIGN_BIT;
    let mut result = Vec::with_capacity(13);
    result.push(TYPE_DATE);
    result.extend_from_slice(&seconds.to_be_bytes());
    result.extend_from_slice(&date.timestamp_subsec_nanos().to_be_bytes());
    result
}

pub fn decode_date(bytes: &[u8]) -> Result<DateTime<Utc>> {
    check_tag(bytes, TYPE_DATE, "date")?;
    if bytes.len() != 13 {
        return Err(EncodingError::InvalidFormat("Date must be 13 bytes total".to_string()).into());
    }
    let (seconds, nanos) = bytes[1..].split_at(8);
    let seconds = <[u8; 8]>::try_from(seconds)
        .map(|b| (u64::from_be_bytes(b) ^ SIGN_BIT) as i64)
        .map_err(|_| EncodingError::TruncatedData)?;
    let nanos = <[u8; 4]>::try_from(nanos)
        .map(u32::from_be_bytes)
        .map_err(|_| EncodingError::TruncatedData)?;
    Utc.timestamp_opt(seconds, nanos).single().ok_or_else(|| {
        EncodingError::OutOfRange(format!("{}s {}ns is not a valid date", seconds, nanos)).into()
    })
}

// Null bytes are escaped as 0x00 0xFF and the payload ends with 0x00 0x00,
// so a shorter payload always sorts before any extension of it.
fn escape_into(result: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        if byte == 0x00 {
            result.extend_from_slice(&[0x00, 0xFF]);
        } else {
            result.push(byte);
        }
    }
    result.extend_from_slice(&[0x00, 0x00]);
}

fn unescape(encoded: &[u8]) -> Result<Vec<u8>> {
    let mut result = Vec::with_capacity(encoded.len());
    let mut i = 0;

    while i < encoded.len() {
        if encoded[i] != 0x00 {
            result.push(encoded[i]);
            i += 1;
            continue;
        }
        match encoded.get(i + 1) {
            Some(0xFF) => {
                result.push(0x00);
                i += 2;
            }
            Some(0x00) => {
                if i + 2 != encoded.len() {
                    return Err(EncodingError::InvalidFormat(
                        "Trailing bytes after terminator".to_string(),
                    )
                    .into());
                }
                return Ok(result);
            }
            Some(_) => {
                return Err(
                    EncodingError::InvalidFormat("Invalid null byte escape".to_string()).into(),
                )
            }
            None => return Err(EncodingError::TruncatedData.into()),
        }
    }

    Err(EncodingError::TruncatedData.into())
}

/// Encode a string with order preservation
pub fn encode_string(s: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(s.len() + 3);
    result.push(TYPE_STRING);
    escape_into(&mut result, s.as_bytes());
    result
}

/// Decode a string from bytes
pub fn decode_string(bytes: &[u8]) -> Result<String> {
    check_tag(bytes, TYPE_STRING, "string")?;
    let raw = unescape(&bytes[1..])?;
    String::from_utf8(raw).map_err(|_| EncodingError::InvalidUtf8.into())
}

/// Encode raw bytes with order preservation
pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(bytes.len() + 3);
    result.push(TYPE_BYTES);
    escape_into(&mut result, bytes);
    result
}

/// Decode raw bytes from encoded form
pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    check_tag(bytes, TYPE_BYTES, "bytes")?;
    unescape(&bytes[1..])
}

impl Lexicode for bool {
    fn encode(&self) -> Vec<u8> {
        encode_boolean(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_boolean(bytes)
    }
}

impl Lexicode for i64 {
    fn encode(&self) -> Vec<u8> {
        encode_integer(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_integer(bytes)
    }
}

// i32 shares the integer encoding so 32 and 64 bit keys interleave correctly.
impl Lexicode for i32 {
    fn encode(&self) -> Vec<u8> {
        encode_integer(i64::from(*self))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let wide = decode_integer(bytes)?;
        i32::try_from(wide)
            .map_err(|_| EncodingError::OutOfRange(format!("{} does not fit in i32", wide)).into())
    }
}

impl Lexicode for u64 {
    fn encode(&self) -> Vec<u8> {
        encode_unsigned(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_unsigned(bytes)
    }
}

impl Lexicode for f64 {
    fn encode(&self) -> Vec<u8> {
        encode_float(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_float(bytes)
    }
}

impl Lexicode for String {
    fn encode(&self) -> Vec<u8> {
        encode_string(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_string(bytes)
    }
}

impl Lexicode for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        encode_bytes(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_bytes(bytes)
    }
}

impl Lexicode for DateTime<Utc> {
    fn encode(&self) -> Vec<u8> {
        encode_date(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_date(bytes)
    }
}

//! Record format
//!
//! A record is a varint header length, one varint serial type per field,
//! then the field bodies back to back. Integers use the narrowest
//! big-endian width that holds them (0 and 1 take no body at all), reals
//! are 8-byte IEEE, text and blobs encode their length in the serial type.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Value;

// ============================================================================
// Varints
// ============================================================================

/// Read a varint, returning the value and bytes consumed
pub fn get_varint(data: &[u8]) -> (u64, usize) {
    let mut value = 0u64;
    for (i, &byte) in data.iter().enumerate().take(9) {
        if i == 8 {
            return ((value << 8) | byte as u64, 9);
        }
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return (value, i + 1);
        }
    }
    (value, data.len().min(9))
}

/// Append a varint, returning the number of bytes written
pub fn put_varint(buf: &mut Vec<u8>, value: u64) -> usize {
    if value > 0x00ff_ffff_ffff_ffff {
        // nine bytes: eight 7-bit groups of the high 56 bits, then a full low byte
        let high = value >> 8;
        for i in (0..8).rev() {
            buf.push(((high >> (7 * i)) & 0x7f) as u8 | 0x80);
        }
        buf.push((value & 0xff) as u8);
        return 9;
    }
    let mut groups = Vec::with_capacity(8);
    let mut v = value;
    loop {
        groups.push((v & 0x7f) as u8);
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    let n = groups.len();
    for (i, g) in groups.iter().rev().enumerate() {
        buf.push(if i + 1 < n { g | 0x80 } else { *g });
    }
    n
}

pub fn varint_len(value: u64) -> usize {
    let mut buf = Vec::with_capacity(9);
    put_varint(&mut buf, value)
}

// ============================================================================
// Serial Types
// ============================================================================

/// Serial type code for a value
pub fn serial_type(v: &Value) -> u64 {
    match v {
        Value::Null => 0,
        Value::Integer(0) => 8,
        Value::Integer(1) => 9,
        Value::Integer(i) => {
            let i = *i;
            if (-128..=127).contains(&i) {
                1
            } else if (-32768..=32767).contains(&i) {
                2
            } else if (-8_388_608..=8_388_607).contains(&i) {
                3
            } else if (-2_147_483_648..=2_147_483_647).contains(&i) {
                4
            } else if (-140_737_488_355_328..=140_737_488_355_327).contains(&i) {
                5
            } else {
                6
            }
        }
        Value::Real(_) => 7,
        Value::Blob(b) => 12 + 2 * b.len() as u64,
        Value::Text(s) => 13 + 2 * s.len() as u64,
    }
}

/// Body size in bytes of a serial type
pub fn serial_type_len(code: u64) -> usize {
    match code {
        0 | 8 | 9 | 10 | 11 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4 => 4,
        5 => 6,
        6 | 7 => 8,
        n => ((n - 12) / 2) as usize,
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode values as a record
pub fn make_record(values: &[Value]) -> Vec<u8> {
    let types: Vec<u64> = values.iter().map(serial_type).collect();
    let mut header = Vec::with_capacity(values.len() + 1);
    for t in &types {
        put_varint(&mut header, *t);
    }
    let mut header_len = header.len() + 1;
    if varint_len(header_len as u64) > 1 {
        header_len = header.len() + varint_len((header.len() + 2) as u64);
    }
    let body_len: usize = types.iter().map(|t| serial_type_len(*t)).sum();
    let mut record = Vec::with_capacity(header_len + body_len);
    put_varint(&mut record, header_len as u64);
    record.extend_from_slice(&header);
    for (v, t) in values.iter().zip(types) {
        write_body(v, t, &mut record);
    }
    record
}

fn write_body(v: &Value, code: u64, buf: &mut Vec<u8>) {
    match v {
        Value::Integer(i) => {
            let width = serial_type_len(code);
            let bytes = i.to_be_bytes();
            buf.extend_from_slice(&bytes[8 - width..]);
        }
        Value::Real(f) => buf.extend_from_slice(&f.to_be_bytes()),
        Value::Text(s) => buf.extend_from_slice(s.as_bytes()),
        Value::Blob(b) => buf.extend_from_slice(b),
        Value::Null => {}
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn corrupt(detail: &str) -> Error {
    Error::with_message(ErrorCode::Corrupt, format!("malformed record: {}", detail))
}

/// Decode every field of a record
pub fn decode_record(data: &[u8]) -> Result<Vec<Value>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let (header_len, mut pos) = get_varint(data);
    let header_len = header_len as usize;
    if header_len > data.len() || header_len < pos {
        return Err(corrupt("header length"));
    }
    let mut types = Vec::new();
    while pos < header_len {
        let (t, n) = get_varint(&data[pos..]);
        if n == 0 {
            return Err(corrupt("truncated header"));
        }
        types.push(t);
        pos += n;
    }
    let mut body = header_len;
    let mut values = Vec::with_capacity(types.len());
    for t in types {
        let len = serial_type_len(t);
        if body + len > data.len() {
            return Err(corrupt("truncated body"));
        }
        values.push(read_body(t, &data[body..body + len])?);
        body += len;
    }
    Ok(values)
}

fn read_body(code: u64, bytes: &[u8]) -> Result<Value> {
    Ok(match code {
        0 | 10 | 11 => Value::Null,
        8 => Value::Integer(0),
        9 => Value::Integer(1),
        1..=6 => {
            let mut acc: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
            for b in bytes {
                acc = (acc << 8) | *b as i64;
            }
            Value::Integer(acc)
        }
        7 => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| corrupt("real width"))?;
            Value::Real(f64::from_be_bytes(arr))
        }
        n if n % 2 == 0 => Value::Blob(bytes.to_vec()),
        _ => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    })
}

/// Number of fields in a record without decoding the bodies
pub fn record_field_count(data: &[u8]) -> usize {
    if data.is_empty() {
        return 0;
    }
    let (header_len, mut pos) = get_varint(data);
    let mut count = 0;
    while pos < header_len as usize && pos < data.len() {
        let (_, n) = get_varint(&data[pos..]);
        if n == 0 {
            break;
        }
        pos += n;
        count += 1;
    }
    count
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 0x7f, 0x80, 0x3fff, 0x4000, 1 << 35, u64::MAX] {
            let mut buf = Vec::new();
            let n = put_varint(&mut buf, v);
            assert_eq!(buf.len(), n);
            assert_eq!(get_varint(&buf), (v, n));
        }
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(serial_type(&Value::Integer(0)), 8);
        assert_eq!(serial_type(&Value::Integer(1)), 9);
        assert_eq!(serial_type(&Value::Integer(-1)), 1);
        assert_eq!(serial_type(&Value::Integer(300)), 2);
        assert_eq!(serial_type(&Value::Integer(1 << 40)), 5);
        assert_eq!(serial_type(&Value::Integer(i64::MIN)), 6);
    }

    #[test]
    fn test_mixed_record() {
        let values = vec![
            Value::Null,
            Value::Integer(-70000),
            Value::Real(2.5),
            Value::Text("hello".into()),
            Value::Blob(vec![1, 2, 3]),
        ];
        let rec = make_record(&values);
        assert_eq!(record_field_count(&rec), 5);
        assert_eq!(decode_record(&rec).unwrap(), values);
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let rec = make_record(&[Value::Text("abcdef".into())]);
        let err = decode_record(&rec[..rec.len() - 2]).unwrap_err();
        assert_eq!(err.code, ErrorCode::Corrupt);
    }
}

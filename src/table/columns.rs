//! Column map serialization and numeric text handling.
//!
//! A table record's value is its column map flattened into length-prefixed
//! name/value pairs. Numeric conditions parse column text the permissive
//! way: a leading decimal number counts, anything else reads as zero.

use std::collections::BTreeMap;
use std::convert::TryInto;

use crate::error::{Result, TansuError};

/// Serializes a column map: `[nlen u32][vlen u32][name][value]` per column.
pub fn encode_columns(cols: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in cols {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

pub fn decode_columns(data: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut cols = BTreeMap::new();
    let mut at = 0;
    while at < data.len() {
        if at + 8 > data.len() {
            return Err(TansuError::Corruption("column header truncated".into()));
        }
        let nlen = u32::from_le_bytes(data[at..at + 4].try_into().map_err(truncated)?) as usize;
        let vlen =
            u32::from_le_bytes(data[at + 4..at + 8].try_into().map_err(truncated)?) as usize;
        at += 8;
        if at + nlen + vlen > data.len() {
            return Err(TansuError::Corruption("column body truncated".into()));
        }
        let name = String::from_utf8(data[at..at + nlen].to_vec())
            .map_err(|_| TansuError::Corruption("column name is not utf-8".into()))?;
        let value = String::from_utf8(data[at + nlen..at + nlen + vlen].to_vec())
            .map_err(|_| TansuError::Corruption("column value is not utf-8".into()))?;
        cols.insert(name, value);
        at += nlen + vlen;
    }
    Ok(cols)
}

fn truncated<E>(_: E) -> TansuError {
    TansuError::Corruption("column field truncated".into())
}

/// Parses the leading decimal number of a string; non-numeric text is zero.
pub fn atof(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut seen_digit = false;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        seen_digit = true;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            seen_digit = true;
        }
    }
    if !seen_digit {
        return 0.0;
    }
    trimmed[..end].parse().unwrap_or(0.0)
}

/// Like [`atof`] but truncating toward zero.
pub fn atoi(text: &str) -> i64 {
    atof(text) as i64
}

/// Encodes a number so that bytewise lexical order matches numeric order:
/// the f64 bits, sign-flipped, big-endian.
pub fn encode_decimal(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let flipped = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    flipped.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_round_trip() {
        let mut cols = BTreeMap::new();
        cols.insert("name".to_string(), "ada".to_string());
        cols.insert("age".to_string(), "36".to_string());
        cols.insert("empty".to_string(), String::new());
        let bytes = encode_columns(&cols);
        assert_eq!(decode_columns(&bytes).expect("decode"), cols);
    }

    #[test]
    fn empty_map_round_trip() {
        let cols = BTreeMap::new();
        assert_eq!(decode_columns(&encode_columns(&cols)).expect("decode"), cols);
    }

    #[test]
    fn atof_is_permissive() {
        assert_eq!(atof("42"), 42.0);
        assert_eq!(atof("  -3.5kg"), -3.5);
        assert_eq!(atof("abc"), 0.0);
        assert_eq!(atof(""), 0.0);
        assert_eq!(atoi("7.9"), 7);
        assert_eq!(atoi("-7.9"), -7);
    }

    #[test]
    fn decimal_encoding_orders_numerically() {
        let values = [-1000.0, -1.5, -0.0, 0.0, 0.25, 3.0, 1e9];
        let encoded: Vec<[u8; 8]> = values.iter().map(|v| encode_decimal(*v)).collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}

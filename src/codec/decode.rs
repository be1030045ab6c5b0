//! Base decoding of text-format cells.
//!
//! Booleans, integers, floats and bytea become native values, arrays of known
//! element types are split into nested lists, and everything else stays text.
//! Richer types (JSON, dates) are left to the parser registry.

use crate::codec::array::parse_array;
use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};
use crate::value::Value;

/// Decode one non-NULL cell of type `type_oid`.
pub fn decode_text(type_oid: Oid, text: &str) -> Result<Value> {
    match oid::array_element(type_oid) {
        Some(element) => parse_array(text, &|s: &str| decode_scalar(element, s)),
        None => decode_scalar(type_oid, text),
    }
}

/// Decode raw cell bytes; the server sends text results as UTF-8.
pub fn decode_bytes(type_oid: Oid, bytes: &[u8]) -> Result<Value> {
    let text = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Decode(format!("invalid UTF-8 in column of type {type_oid}: {e}")))?;
    decode_text(type_oid, text)
}

fn decode_scalar(type_oid: Oid, text: &str) -> Result<Value> {
    match type_oid {
        oid::BOOL => match text {
            "t" | "true" => Ok(Value::Bool(true)),
            "f" | "false" => Ok(Value::Bool(false)),
            _ => Err(Error::Decode(format!("invalid boolean: {text:?}"))),
        },
        oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => text
            .parse()
            .map(Value::Int)
            .map_err(|e| Error::Decode(format!("invalid integer {text:?}: {e}"))),
        oid::FLOAT4 | oid::FLOAT8 => text
            .parse()
            .map(Value::Float)
            .map_err(|e| Error::Decode(format!("invalid float {text:?}: {e}"))),
        oid::BYTEA => decode_bytea(text).map(Value::Bytes),
        _ => Ok(Value::Text(text.to_string())),
    }
}

/// Decode bytea text in either `hex` (`\x0a0b`) or legacy `escape` output format.
pub fn decode_bytea(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    if let Some(hex) = bytes.strip_prefix(b"\\x") {
        if hex.len() % 2 != 0 {
            return Err(Error::Decode("odd-length bytea hex".into()));
        }
        return hex
            .chunks_exact(2)
            .map(|pair| match (hex_value(pair[0]), hex_value(pair[1])) {
                (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
                _ => Err(Error::Decode(format!("invalid bytea hex: {text}"))),
            })
            .collect();
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while let Some(&b) = bytes.get(i) {
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        match bytes.get(i + 1..i + 4) {
            Some([b'\\', ..]) => {
                out.push(b'\\');
                i += 2;
            }
            Some(&[x, y, z]) if is_octal(x) && is_octal(y) && is_octal(z) => {
                out.push(((x - b'0') << 6) | ((y - b'0') << 3) | (z - b'0'));
                i += 4;
            }
            _ if bytes.get(i + 1) == Some(&b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            _ => return Err(Error::Decode(format!("invalid bytea escape: {text}"))),
        }
    }
    Ok(out)
}

fn is_octal(b: u8) -> bool {
    (b'0'..=b'7').contains(&b)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars() {
        assert_eq!(decode_text(oid::BOOL, "t").ok(), Some(Value::Bool(true)));
        assert_eq!(decode_text(oid::INT4, "-42").ok(), Some(Value::Int(-42)));
        assert_eq!(
            decode_text(oid::INT8, "9007199254740993").ok(),
            Some(Value::Int(9_007_199_254_740_993))
        );
        assert_eq!(decode_text(oid::FLOAT8, "1.5").ok(), Some(Value::Float(1.5)));
        assert_eq!(
            decode_text(oid::NUMERIC, "12345678901234567890.5").ok(),
            Some(Value::from("12345678901234567890.5"))
        );
        assert!(decode_text(oid::INT4, "x").is_err());
    }

    #[test]
    fn bytea_formats() {
        assert_eq!(decode_bytea("\\x000102ff").ok(), Some(vec![0, 1, 2, 255]));
        assert_eq!(decode_bytea("a\\\\b\\001").ok(), Some(b"a\\b\x01".to_vec()));
        assert!(decode_bytea("\\x0").is_err());
    }

    #[test]
    fn arrays_decode_elements() {
        assert_eq!(
            decode_text(oid::INT4_ARRAY, "{{1,2},{NULL,4}}").ok(),
            Some(Value::from(vec![vec![Some(1), Some(2)], vec![None, Some(4)]]))
        );
        assert_eq!(
            decode_text(oid::BYTEA_ARRAY, r#"{"\\x00ff",NULL}"#).ok(),
            Some(Value::Array(vec![Value::Bytes(vec![0, 255]), Value::Null]))
        );
    }

    #[test]
    fn text_that_looks_like_an_array_stays_text() {
        assert_eq!(
            decode_text(oid::VARCHAR, "{a,b}").ok(),
            Some(Value::from("{a,b}"))
        );
    }
}

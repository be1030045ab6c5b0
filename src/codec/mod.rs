//! Conversion between application values and PostgreSQL text representations.
//!
//! # Structure
//!
//! - this module: encoding (`to_sql`, `sql_array`, `escape_literal`)
//! - `array`: array literal grammar
//! - `date`: timestamp encoding and parsing, including BC years and infinities
//! - `decode`: base decoding of text cells by type OID
//! - `registry`: per-OID parser registry
//! - `convert`: applies decoding and the registry to whole results

pub mod array;
pub mod convert;
pub mod date;
pub mod decode;
pub mod registry;

pub use array::parse_array;
pub use convert::{Column, QueryResult, ResultConverter, Row};
pub use date::{encode_timestamp, parse_timestamp};
pub use decode::decode_text;
pub use registry::{Parser, ParserRegistry};

use crate::error::{Error, Result};
use crate::value::Value;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Render a value as the text of a query parameter.
///
/// Returns `None` for SQL NULL. Bytes become a `\x` hex literal, timestamps an
/// ISO-8601 string (or the `BC` form for years at or before zero), JSON documents
/// their serialized text and arrays an array literal.
pub fn to_sql(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(v) => Some(v.to_string()),
        Value::Int(v) => Some(v.to_string()),
        Value::Float(v) => Some(float_to_sql(*v)),
        Value::Text(v) => Some(v.clone()),
        Value::Bytes(v) => Some(bytea_hex(v)),
        Value::Json(v) => Some(v.to_string()),
        Value::Timestamp(v) => Some(encode_timestamp(v)),
        Value::Array(items) => {
            let mut out = String::new();
            write_array(&mut out, items);
            Some(out)
        }
    }
}

/// Render a list of parameters, one optional text per value.
pub fn params_to_sql(params: &[Value]) -> Vec<Option<String>> {
    params.iter().map(to_sql).collect()
}

/// Render a (possibly nested) list as a PostgreSQL array literal.
///
/// ```
/// use zero_pq::{Value, codec::sql_array};
///
/// let v = Value::from(vec![vec![1, 2], vec![3, 4]]);
/// assert_eq!(sql_array(&v).unwrap(), "{{1,2},{3,4}}");
/// ```
pub fn sql_array(value: &Value) -> Result<String> {
    match value {
        Value::Array(items) => {
            let mut out = String::new();
            write_array(&mut out, items);
            Ok(out)
        }
        _ => Err(Error::InvalidUsage("argument must be an array".into())),
    }
}

fn write_array(out: &mut String, items: &[Value]) {
    out.push('{');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Value::Array(nested) => write_array(out, nested),
            other => match to_sql(other) {
                None => out.push_str("NULL"),
                Some(text) => write_array_element(out, &text),
            },
        }
    }
    out.push('}');
}

fn write_array_element(out: &mut String, text: &str) {
    let needs_quotes = text.is_empty()
        || text.eq_ignore_ascii_case("null")
        || text
            .chars()
            .any(|c| matches!(c, ',' | '"' | '{' | '}' | '\\') || c.is_whitespace());

    if !needs_quotes {
        out.push_str(text);
        return;
    }

    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

fn float_to_sql(v: f64) -> String {
    if v.is_nan() {
        "NaN".into()
    } else if v.is_infinite() {
        if v.is_sign_positive() {
            "Infinity".into()
        } else {
            "-Infinity".into()
        }
    } else {
        v.to_string()
    }
}

/// Hex-format bytea literal: `\x` followed by two lowercase digits per byte.
pub fn bytea_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(2 + data.len() * 2);
    out.push_str("\\x");
    for &b in data {
        out.push(char::from(HEX_DIGITS[usize::from(b >> 4)]));
        out.push(char::from(HEX_DIGITS[usize::from(b & 0x0f)]));
    }
    out
}

/// Quote text as a string literal, the way `PQescapeLiteral` does.
///
/// Single quotes and backslashes are doubled. When a backslash is present the
/// literal is written in the ` E'...'` form so it is read the same regardless of
/// `standard_conforming_strings`.
pub fn escape_literal(text: &str) -> String {
    let has_backslash = text.contains('\\');
    let mut out = String::with_capacity(text.len() + 4);
    if has_backslash {
        out.push_str(" E");
    }
    out.push('\'');
    for c in text.chars() {
        if c == '\'' || c == '\\' {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

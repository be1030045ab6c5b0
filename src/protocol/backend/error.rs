//! ErrorResponse and NoticeResponse.

use crate::error::{ErrorField, ErrorFields, Result};
use crate::protocol::codec::{read_cstr, read_u8};

/// Parse the `(tag, text)*` field list shared by errors and notices.
fn parse_fields(payload: &[u8]) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    let mut data = payload;

    loop {
        let (tag, rest) = read_u8(data)?;
        if tag == 0 {
            break;
        }
        let (value, rest) = read_cstr(rest)?;
        data = rest;

        let text = Some(value.to_string());
        match tag {
            b'S' => fields.severity = text,
            b'V' => fields.severity_non_localized = text,
            b'C' => fields.code = text,
            b'M' => fields.message = text,
            b'D' => fields.detail = text,
            b'H' => fields.hint = text,
            b'P' => fields.position = value.parse().ok(),
            b'p' => fields.internal_position = value.parse().ok(),
            b'q' => fields.internal_query = text,
            b'W' => fields.where_ = text,
            b's' => fields.schema = text,
            b't' => fields.table = text,
            b'c' => fields.column = text,
            b'd' => fields.data_type = text,
            b'n' => fields.constraint = text,
            b'F' => fields.file = text,
            b'L' => fields.line = value.parse().ok(),
            b'R' => fields.routine = text,
            other => tracing::debug!("ignoring unknown error field {:?}", char::from(other)),
        }
    }

    Ok(fields)
}

#[derive(Debug, Clone)]
pub struct ErrorResponse(pub ErrorFields);

impl ErrorResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        parse_fields(payload).map(Self)
    }
}

#[derive(Debug, Clone)]
pub struct NoticeResponse(pub ErrorFields);

impl NoticeResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        parse_fields(payload).map(Self)
    }

    pub fn severity(&self) -> Option<String> {
        self.0
            .field(ErrorField::Severity)
            .or_else(|| self.0.severity_non_localized.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_by_tag() {
        let payload = b"SERROR\0C23505\0Mduplicate key\0P12\0Zfuture\0\0";
        let parsed = ErrorResponse::parse(payload).map(|e| e.0).unwrap_or_default();
        assert_eq!(parsed.code.as_deref(), Some("23505"));
        assert_eq!(parsed.message.as_deref(), Some("duplicate key"));
        assert_eq!(parsed.position, Some(12));
        assert_eq!(parsed.field(ErrorField::Severity).as_deref(), Some("ERROR"));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        assert!(ErrorResponse::parse(b"SERROR").is_err());
    }
}

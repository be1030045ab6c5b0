//! CopyInResponse / CopyOutResponse.

use crate::error::Result;
use crate::protocol::codec::{read_u8, read_u16};
use crate::protocol::types::FormatCode;

/// Body shared by CopyInResponse, CopyOutResponse and CopyBothResponse.
#[derive(Debug, Clone)]
pub struct CopyResponse {
    pub format: FormatCode,
    pub column_formats: Vec<FormatCode>,
}

impl CopyResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (format, rest) = read_u8(payload)?;
        let (count, mut rest) = read_u16(rest)?;
        let mut column_formats = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (code, tail) = read_u16(rest)?;
            column_formats.push(FormatCode::from_u16(code));
            rest = tail;
        }
        Ok(Self {
            format: FormatCode::from_u16(u16::from(format)),
            column_formats,
        })
    }

    pub fn is_binary(&self) -> bool {
        self.format == FormatCode::Binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_copy_with_two_columns() {
        let parsed = CopyResponse::parse(&[0, 0, 2, 0, 0, 0, 0]);
        let parsed = parsed.ok();
        assert_eq!(parsed.as_ref().map(CopyResponse::is_binary), Some(false));
        assert_eq!(parsed.map(|r| r.column_formats.len()), Some(2));
    }
}

//! Extended query protocol.
//!
//! Parameters are always sent in text format and results are requested in text
//! format, so the server does all type coercion.

use crate::error::Result;
use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::FormatCode;

/// Parse: create statement `name` (empty for the unnamed statement) with inferred
/// parameter types.
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(0);
    msg.finish()
}

/// Bind `params` to `statement` into `portal`. `None` is SQL NULL.
pub fn write_bind(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    params: &[Option<String>],
) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr(portal);
    msg.write_cstr(statement);

    // one format code applies to every parameter
    msg.write_i16(1);
    msg.write_i16(FormatCode::Text as i16);

    msg.write_count(params.len())?;
    for param in params {
        match param {
            None => msg.write_i32(-1),
            Some(text) => {
                let len = i32::try_from(text.len()).map_err(|_| {
                    crate::error::Error::InvalidUsage("parameter exceeds 2 GiB".into())
                })?;
                msg.write_i32(len);
                msg.write_bytes(text.as_bytes());
            }
        }
    }

    msg.write_i16(1);
    msg.write_i16(FormatCode::Text as i16);
    msg.finish()
}

/// Describe the portal so a RowDescription precedes its rows.
pub fn write_describe_portal(buf: &mut Vec<u8>, portal: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr(portal);
    msg.finish()
}

/// Execute `portal` to completion.
pub fn write_execute(buf: &mut Vec<u8>, portal: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_i32(0);
    msg.finish()
}

/// Sync closes the implicit transaction and makes the server answer with
/// ReadyForQuery, also after an error.
pub fn write_sync(buf: &mut Vec<u8>) -> Result<()> {
    MessageBuilder::new(buf, super::msg_type::SYNC).finish()
}

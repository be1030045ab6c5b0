//! Simple query protocol.

use crate::error::Result;
use crate::protocol::codec::MessageBuilder;

/// Query message; `query` may hold several `;`-separated statements.
pub fn write_query(buf: &mut Vec<u8>, query: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::QUERY);
    msg.write_cstr(query);
    msg.finish()
}

//! COPY IN messages.

use crate::error::Result;
use crate::protocol::codec::MessageBuilder;

pub fn write_copy_data(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::COPY_DATA);
    msg.write_bytes(data);
    msg.finish()
}

pub fn write_copy_done(buf: &mut Vec<u8>) -> Result<()> {
    MessageBuilder::new(buf, super::msg_type::COPY_DONE).finish()
}

/// CopyFail; the server aborts the COPY with `reason` as the error message.
pub fn write_copy_fail(buf: &mut Vec<u8>, reason: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::COPY_FAIL);
    msg.write_cstr(reason);
    msg.finish()
}

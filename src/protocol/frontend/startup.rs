//! Session start and end.

use crate::error::Result;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::codec::MessageBuilder;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 0x0003_0000;

/// SSLRequest code.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// CancelRequest code.
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// SSLRequest; the server answers with one byte, `S` or `N`.
pub fn write_ssl_request(buf: &mut Vec<u8>) -> Result<()> {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(SSL_REQUEST_CODE);
    msg.finish()
}

/// StartupMessage carrying `(name, value)` session parameters; `user` is required.
pub fn write_startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) -> Result<()> {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(PROTOCOL_VERSION);
    for (name, value) in params {
        msg.write_cstr(name);
        msg.write_cstr(value);
    }
    msg.write_u8(0);
    msg.finish()
}

/// CancelRequest, sent on a fresh connection to interrupt another session.
pub fn write_cancel_request(buf: &mut Vec<u8>, key: &BackendKeyData) -> Result<()> {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(CANCEL_REQUEST_CODE);
    msg.write_bytes(&key.process_id.to_be_bytes());
    msg.write_bytes(&key.secret_key.to_be_bytes());
    msg.finish()
}

pub fn write_terminate(buf: &mut Vec<u8>) -> Result<()> {
    MessageBuilder::new(buf, super::msg_type::TERMINATE).finish()
}

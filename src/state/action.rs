//! I/O requests produced by the state machines.

use crate::buffer_set::BufferSet;
use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::{NoticeResponse, ParameterStatus, RawMessage, msg_type};
use crate::protocol::codec::{read_cstr, read_u32};
use crate::protocol::types::TransactionStatus;

/// What the driver must do before calling `step` again.
#[derive(Debug)]
pub enum Action {
    /// Write `write_buffer`, then read a single byte (SSL negotiation).
    WriteAndReadByte,
    /// Read one message into the buffer set.
    ReadMessage,
    /// Write `write_buffer`, then read one message.
    WriteAndReadMessage,
    /// Upgrade the stream to TLS.
    TlsHandshake,
    /// Deal with an out-of-band message, then read the next one.
    HandleAsyncMessageAndReadMessage(AsyncMessage),
    /// The exchange is complete and the connection is idle again.
    Finished,
}

/// Messages the server may send at any time.
#[derive(Debug, Clone)]
pub enum AsyncMessage {
    Notice(ErrorFields),
    ParameterChanged { name: String, value: String },
    Notification { channel: String, payload: String },
}

impl AsyncMessage {
    pub fn parse(msg: &RawMessage<'_>) -> Result<Self> {
        match msg.type_byte {
            msg_type::NOTICE_RESPONSE => Ok(Self::Notice(NoticeResponse::parse(msg.payload)?.0)),
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(msg.payload)?;
                Ok(Self::ParameterChanged {
                    name: param.name.to_string(),
                    value: param.value.to_string(),
                })
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let (_pid, rest) = read_u32(msg.payload)?;
                let (channel, rest) = read_cstr(rest)?;
                let (payload, _) = read_cstr(rest)?;
                Ok(Self::Notification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
            }
            other => Err(Error::Protocol(format!(
                "not an asynchronous message: {:?}",
                char::from(other)
            ))),
        }
    }
}

/// A sans-I/O protocol exchange.
pub trait StateMachine {
    /// Advance with the message currently in `buffer_set` (if any was requested).
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action>;

    /// Status from the last ReadyForQuery read.
    fn transaction_status(&self) -> TransactionStatus;

    /// Deliver the byte read for [`Action::WriteAndReadByte`].
    fn set_ssl_response(&mut self, byte: u8) {
        let _ = byte;
    }
}

/// Shared prologue of every machine: async messages are surfaced, anything else
/// is handed back to the caller.
pub(crate) fn async_message(buffer_set: &BufferSet) -> Result<Option<Action>> {
    if RawMessage::is_async_type(buffer_set.type_byte) {
        let msg = RawMessage::new(buffer_set.type_byte, &buffer_set.read_buffer);
        return Ok(Some(Action::HandleAsyncMessageAndReadMessage(
            AsyncMessage::parse(&msg)?,
        )));
    }
    Ok(None)
}

pub(crate) fn unexpected(context: &str, type_byte: u8) -> Error {
    Error::Protocol(format!(
        "unexpected message {:?} {context}",
        char::from(type_byte)
    ))
}

//! Server → client messages.
//!
//! Messages are parsed lazily from a [`RawMessage`] by whichever state machine
//! expects them.

pub mod auth;
pub mod copy;
pub mod error;
pub mod query;

pub use auth::{AuthenticationMessage, BackendKeyData, ParameterStatus, ReadyForQuery};
pub use copy::CopyResponse;
pub use error::{ErrorResponse, NoticeResponse};
pub use query::{CommandComplete, DataRow, RowDescription};

/// Backend message type bytes.
pub mod msg_type {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const NO_DATA: u8 = b'n';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';
}

/// One framed backend message: type byte plus payload (length already stripped).
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a> {
    pub type_byte: u8,
    pub payload: &'a [u8],
}

impl<'a> RawMessage<'a> {
    pub fn new(type_byte: u8, payload: &'a [u8]) -> Self {
        Self { type_byte, payload }
    }

    /// Messages the server may send at any point, outside the request/response flow.
    pub fn is_async_type(type_byte: u8) -> bool {
        matches!(
            type_byte,
            msg_type::NOTICE_RESPONSE | msg_type::NOTIFICATION_RESPONSE | msg_type::PARAMETER_STATUS
        )
    }
}

//! PostgreSQL frontend/backend protocol, version 3.
//!
//! `frontend` encodes client messages into a byte buffer, `backend` parses server
//! messages out of one, and `codec` holds the primitives both sides share. Nothing
//! here performs I/O.

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

pub use types::{FormatCode, Oid, TransactionStatus};

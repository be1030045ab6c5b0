//! Sans-I/O state machines for the PostgreSQL protocol.
//!
//! A machine never touches the socket. It writes outgoing messages into the
//! [`BufferSet`](crate::buffer_set::BufferSet) and returns an [`Action`] telling
//! the driver what to do before the next `step`.

pub mod action;
pub mod connection;
pub mod copy;
pub mod extended;
pub mod response;
pub mod simple_query;

pub use action::{Action, AsyncMessage, StateMachine};
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use copy::{
    CopyDirection, CopyInEndStateMachine, CopyInInterruption, CopyOutStateMachine,
    CopyStartStateMachine,
};
pub use extended::ExtendedQueryStateMachine;
pub use simple_query::SimpleQueryStateMachine;

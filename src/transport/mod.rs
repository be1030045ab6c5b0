//! The connection capability the facade is built on.
//!
//! A [`Transport`] runs one command at a time and is never shared: the facade's
//! command queue hands it to exactly one operation at a time. [`PgTransport`] speaks
//! the PostgreSQL wire protocol; tests substitute scripted implementations.

use std::future::Future;

use bytes::Bytes;

use crate::codec::Column;
use crate::error::{ErrorField, ErrorFields, Result};

pub mod pg;
pub mod stream;

pub use pg::PgTransport;

/// Raw cells of one row; `None` is SQL NULL.
pub type RawRow = Vec<Option<Bytes>>;

/// Result of a command before value conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// A row-returning statement.
    Rows { columns: Vec<Column>, rows: Vec<RawRow> },
    /// Anything else, with the row count when the command tag carries one.
    Command { rows_affected: Option<u64> },
}

/// Capability contract of a single database connection.
///
/// Methods take `&mut self`, so calls cannot overlap. A method that fails with
/// [`Error::Server`](crate::Error::Server) leaves the connection usable; other
/// errors usually mean it is broken.
pub trait Transport: Send + Sized + 'static {
    /// What [`connect`](Self::connect) needs, e.g. [`Opts`](crate::Opts).
    type Config: Send + 'static;

    fn connect(config: Self::Config) -> impl Future<Output = Result<Self>> + Send;

    /// Run `command`; with `params` it goes through the extended protocol.
    fn execute(
        &mut self,
        command: &str,
        params: Option<&[Option<String>]>,
    ) -> impl Future<Output = Result<RawResult>> + Send;

    fn prepare(&mut self, name: &str, command: &str) -> impl Future<Output = Result<()>> + Send;

    fn execute_prepared(
        &mut self,
        name: &str,
        params: &[Option<String>],
    ) -> impl Future<Output = Result<RawResult>> + Send;

    /// Send a `COPY ... FROM STDIN` and wait until the server accepts data.
    fn start_copy_in(
        &mut self,
        command: &str,
        params: Option<&[Option<String>]>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Hand one chunk to the server; resolves when the transport can take the next.
    fn send_copy_chunk(&mut self, chunk: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Finish COPY IN, or abort it with `error` as the reason.
    ///
    /// Returns the row count reported by the server.
    fn end_copy_in(
        &mut self,
        error: Option<&str>,
    ) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Send a `COPY ... TO STDOUT` and wait until the server starts sending data.
    fn start_copy_out(&mut self, command: &str) -> impl Future<Output = Result<()>> + Send;

    /// Next chunk of COPY OUT data; `None` once the copy is complete.
    fn next_copy_chunk(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    /// Stop a COPY OUT early and bring the connection back to idle.
    fn cancel_copy_out(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Fields of the last server error seen on this connection.
    fn last_error(&self) -> Option<&ErrorFields>;

    fn last_error_field(&self, field: ErrorField) -> Option<String> {
        self.last_error().and_then(|fields| fields.field(field))
    }

    /// Idle and able to take a command.
    fn is_ready(&self) -> bool;

    /// Terminate the session and release the socket.
    fn close(self) -> impl Future<Output = ()> + Send;
}

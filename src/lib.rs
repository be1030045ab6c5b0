//! An ordered, single-connection PostgreSQL driver layer.
//!
//! # Features
//!
//! - **Strict ordering**: operations on a [`Connection`] run one at a time, in
//!   submission order, even when callers never await them
//! - **COPY streaming**: [`CopyInSink`] and [`CopyOutStream`] bridge bulk transfers to
//!   `futures` sinks and streams with one-chunk backpressure
//! - **Value conversion**: results are decoded into [`Value`]s and passed through a
//!   per-OID [`ParserRegistry`] (JSON, dates with BC years and infinities, arrays)
//! - **Sans-I/O protocol**: the wire protocol lives in state machines driven by
//!   [`PgTransport`]; any other [`Transport`] can stand in for it
//!
//! # Example
//!
//! ```no_run
//! use zero_pq::{Connection, Value};
//!
//! # async fn demo() -> zero_pq::Result<()> {
//! let conn = Connection::open("host=/var/run/postgresql dbname=app").await?;
//!
//! let mut sink = conn.copy_from_stream("COPY t (a, b) FROM STDIN", None)?;
//! sink.write("1\tone\n").await?;
//! sink.write("2\ttwo\n").await?;
//! assert_eq!(sink.finish().await?, 2);
//!
//! let result = conn.exec_params("SELECT b FROM t WHERE a = $1", &[Value::from(2)])?.await?;
//! assert_eq!(result.rows()[0].get("b").and_then(Value::as_str), Some("two"));
//!
//! conn.finish();
//! # Ok(())
//! # }
//! ```

pub mod buffer_set;
pub mod codec;
pub mod conn;
pub mod copy;
pub mod error;
pub mod handler;
pub mod opts;
pub mod protocol;
mod queue;
pub mod request;
pub mod state;
pub mod transport;
pub mod value;

pub use codec::{Column, ParserRegistry, QueryResult, Row, escape_literal, sql_array, to_sql};
pub use conn::Connection;
pub use copy::{CopyInSink, CopyOutStream};
pub use error::{Error, ErrorField, ErrorFields, Result};
pub use opts::{ConnectionOptions, Opts, SslMode};
pub use protocol::types::{Oid, TransactionStatus};
pub use request::{ErrorObserver, Request, TracingObserver};
pub use transport::{PgTransport, RawResult, RawRow, Transport};
pub use value::{Timestamp, Value};

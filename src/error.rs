//! Error types for zero-pq.

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// Result type for zero-pq operations.
pub type Result<T> = core::result::Result<T, Error>;

/// SQLSTATE reported for operations on a finished connection.
pub const CONNECTION_CLOSED_SQLSTATE: &str = "08003";

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Position in internal query
    pub internal_position: Option<u32>,
    /// Failed internal command text
    pub internal_query: Option<String>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Look up a field by its wire tag (`b'C'` for SQLSTATE and so on).
    pub fn get(&self, tag: u8) -> Option<String> {
        let text = |v: &Option<String>| v.clone();
        let number = |v: &Option<u32>| v.map(|n| n.to_string());
        match tag {
            b'S' => text(&self.severity),
            b'V' => text(&self.severity_non_localized),
            b'C' => text(&self.code),
            b'M' => text(&self.message),
            b'D' => text(&self.detail),
            b'H' => text(&self.hint),
            b'P' => number(&self.position),
            b'p' => number(&self.internal_position),
            b'q' => text(&self.internal_query),
            b'W' => text(&self.where_),
            b's' => text(&self.schema),
            b't' => text(&self.table),
            b'c' => text(&self.column),
            b'd' => text(&self.data_type),
            b'n' => text(&self.constraint),
            b'F' => text(&self.file),
            b'L' => number(&self.line),
            b'R' => text(&self.routine),
            _ => None,
        }
    }

    /// Look up a field by its symbolic name.
    pub fn field(&self, field: ErrorField) -> Option<String> {
        self.get(field.tag())
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Symbolic names of the structured error fields.
///
/// Each name maps to the one-byte tag used in ErrorResponse messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorField {
    Severity,
    SqlState,
    MessagePrimary,
    MessageDetail,
    MessageHint,
    StatementPosition,
    InternalPosition,
    InternalQuery,
    Context,
    SchemaName,
    TableName,
    ColumnName,
    DatatypeName,
    ConstraintName,
    SourceFile,
    SourceLine,
    SourceFunction,
}

impl ErrorField {
    /// All fields, in protocol documentation order.
    pub const ALL: [ErrorField; 17] = [
        ErrorField::Severity,
        ErrorField::SqlState,
        ErrorField::MessagePrimary,
        ErrorField::MessageDetail,
        ErrorField::MessageHint,
        ErrorField::StatementPosition,
        ErrorField::InternalPosition,
        ErrorField::InternalQuery,
        ErrorField::Context,
        ErrorField::SchemaName,
        ErrorField::TableName,
        ErrorField::ColumnName,
        ErrorField::DatatypeName,
        ErrorField::ConstraintName,
        ErrorField::SourceFile,
        ErrorField::SourceLine,
        ErrorField::SourceFunction,
    ];

    /// Wire tag of this field.
    pub const fn tag(self) -> u8 {
        match self {
            ErrorField::Severity => b'S',
            ErrorField::SqlState => b'C',
            ErrorField::MessagePrimary => b'M',
            ErrorField::MessageDetail => b'D',
            ErrorField::MessageHint => b'H',
            ErrorField::StatementPosition => b'P',
            ErrorField::InternalPosition => b'p',
            ErrorField::InternalQuery => b'q',
            ErrorField::Context => b'W',
            ErrorField::SchemaName => b's',
            ErrorField::TableName => b't',
            ErrorField::ColumnName => b'c',
            ErrorField::DatatypeName => b'd',
            ErrorField::ConstraintName => b'n',
            ErrorField::SourceFile => b'F',
            ErrorField::SourceLine => b'L',
            ErrorField::SourceFunction => b'R',
        }
    }

    /// Symbolic name, e.g. `SQLSTATE` or `MESSAGE_PRIMARY`.
    pub const fn name(self) -> &'static str {
        match self {
            ErrorField::Severity => "SEVERITY",
            ErrorField::SqlState => "SQLSTATE",
            ErrorField::MessagePrimary => "MESSAGE_PRIMARY",
            ErrorField::MessageDetail => "MESSAGE_DETAIL",
            ErrorField::MessageHint => "MESSAGE_HINT",
            ErrorField::StatementPosition => "STATEMENT_POSITION",
            ErrorField::InternalPosition => "INTERNAL_POSITION",
            ErrorField::InternalQuery => "INTERNAL_QUERY",
            ErrorField::Context => "CONTEXT",
            ErrorField::SchemaName => "SCHEMA_NAME",
            ErrorField::TableName => "TABLE_NAME",
            ErrorField::ColumnName => "COLUMN_NAME",
            ErrorField::DatatypeName => "DATATYPE_NAME",
            ErrorField::ConstraintName => "CONSTRAINT_NAME",
            ErrorField::SourceFile => "SOURCE_FILE",
            ErrorField::SourceLine => "SOURCE_LINE",
            ErrorField::SourceFunction => "SOURCE_FUNCTION",
        }
    }
}

impl FromStr for ErrorField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ErrorField::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| Error::InvalidUsage(format!("unknown error field: {}", s)))
    }
}

/// Error type for zero-pq.
///
/// Cloneable so that a single failure can be handed to a blocked COPY producer,
/// the COPY stream and the operation's completion.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Server error response
    #[error("PostgreSQL error: {0}")]
    Server(ErrorFields),

    /// The connection was finished or lost; queued work is failed with this
    #[error("connection is closed")]
    Closed,

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(String),

    /// Caller violated an API contract
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A wire value could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The server answered with a different kind of result than requested
    #[error("{0}")]
    UnexpectedResult(String),

    /// A COPY FROM STDIN session was aborted or failed
    #[error("COPY aborted: {0}")]
    CopyAborted(String),

    /// A completion callback panicked
    #[error("callback panicked: {0}")]
    CallbackPanic(String),
}

impl Error {
    /// Returns true if the error indicates the connection cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::Closed => true,
            Error::Server(fields) => {
                // FATAL and PANIC errors indicate connection is broken
                matches!(fields.severity.as_deref(), Some("FATAL") | Some("PANIC"))
            }
            _ => false,
        }
    }

    /// Get the SQLSTATE code, if one is known.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            Error::Closed => Some(CONNECTION_CLOSED_SQLSTATE),
            _ => None,
        }
    }

    /// Server error fields, if this is a server error.
    pub fn fields(&self) -> Option<&ErrorFields> {
        match self {
            Error::Server(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

#[cfg(feature = "tls")]
impl From<native_tls::Error> for Error {
    fn from(err: native_tls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_has_fixed_sqlstate() {
        let err = Error::Closed;
        assert_eq!(err.sqlstate(), Some("08003"));
        assert_eq!(err.to_string(), "connection is closed");
    }

    #[test]
    fn field_names_round_trip() {
        for field in ErrorField::ALL {
            assert_eq!(field.name().parse::<ErrorField>().ok(), Some(field));
        }
        assert!("NOT_A_FIELD".parse::<ErrorField>().is_err());
    }

    #[test]
    fn lookup_by_tag() {
        let fields = ErrorFields {
            code: Some("42P01".into()),
            position: Some(15),
            ..Default::default()
        };
        assert_eq!(fields.field(ErrorField::SqlState).as_deref(), Some("42P01"));
        assert_eq!(fields.get(b'P').as_deref(), Some("15"));
        assert_eq!(fields.field(ErrorField::MessageHint), None);
    }
}

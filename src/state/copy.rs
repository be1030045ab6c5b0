//! COPY sub-protocol: entering copy mode, ending COPY IN, reading COPY OUT.

use bytes::Bytes;

use crate::buffer_set::BufferSet;
use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::{
    CommandComplete, CopyResponse, ErrorResponse, RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::{
    write_bind, write_copy_done, write_copy_fail, write_execute, write_parse, write_query,
    write_sync,
};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, AsyncMessage, StateMachine, async_message, unexpected};

/// Reason sent in CopyFail when a COPY turns out to run the other way.
const WRONG_DIRECTION: &str = "COPY direction does not match the request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    In,
    Out,
}

impl CopyDirection {
    fn mismatch(self) -> Error {
        match self {
            CopyDirection::In => Error::UnexpectedResult("not a COPY_IN result".into()),
            CopyDirection::Out => Error::UnexpectedResult("not a COPY_OUT result".into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPhase {
    Waiting,
    DiscardingCopy,
    Draining,
}

/// Sends a COPY statement and stops as soon as the server enters copy mode.
///
/// Without parameters the statement goes out as a simple Query; with parameters
/// it is Parse + Bind + Execute + Sync on the unnamed statement. Any other outcome
/// is read through to ReadyForQuery and reported as an error.
pub struct CopyStartStateMachine<'a> {
    request: Option<(&'a str, Option<&'a [Option<String>]>)>,
    direction: CopyDirection,
    extended: bool,
    phase: StartPhase,
    error: Option<Error>,
    transaction_status: TransactionStatus,
}

impl<'a> CopyStartStateMachine<'a> {
    pub fn new(
        direction: CopyDirection,
        command: &'a str,
        params: Option<&'a [Option<String>]>,
    ) -> Self {
        Self {
            request: Some((command, params)),
            direction,
            extended: params.is_some(),
            phase: StartPhase::Waiting,
            error: None,
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Whether the COPY was started through the extended protocol.
    pub fn extended(&self) -> bool {
        self.extended
    }

    fn wrong_copy(&mut self) {
        let direction = self.direction;
        self.error.get_or_insert_with(|| direction.mismatch());
    }
}

impl StateMachine for CopyStartStateMachine<'_> {
    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if let Some((command, params)) = self.request.take() {
            let buf = &mut buffer_set.write_buffer;
            match params {
                None => write_query(buf, command)?,
                Some(params) => {
                    write_parse(buf, "", command)?;
                    write_bind(buf, "", "", params)?;
                    write_execute(buf, "")?;
                    write_sync(buf)?;
                }
            }
            return Ok(Action::WriteAndReadMessage);
        }
        if let Some(action) = async_message(buffer_set)? {
            return Ok(action);
        }

        let payload = buffer_set.read_buffer.as_slice();
        match (self.phase, buffer_set.type_byte) {
            (StartPhase::Waiting, msg_type::COPY_IN_RESPONSE)
                if self.direction == CopyDirection::In =>
            {
                entered(payload)
            }
            (StartPhase::Waiting, msg_type::COPY_OUT_RESPONSE)
                if self.direction == CopyDirection::Out =>
            {
                entered(payload)
            }
            (_, msg_type::COPY_IN_RESPONSE) => {
                self.wrong_copy();
                self.phase = StartPhase::Draining;
                write_copy_fail(&mut buffer_set.write_buffer, WRONG_DIRECTION)?;
                if self.extended {
                    write_sync(&mut buffer_set.write_buffer)?;
                }
                Ok(Action::WriteAndReadMessage)
            }
            (_, msg_type::COPY_OUT_RESPONSE) => {
                self.wrong_copy();
                self.phase = StartPhase::DiscardingCopy;
                Ok(Action::ReadMessage)
            }
            (StartPhase::DiscardingCopy, msg_type::COPY_DATA) => Ok(Action::ReadMessage),
            (StartPhase::DiscardingCopy, msg_type::COPY_DONE) => {
                self.phase = StartPhase::Draining;
                Ok(Action::ReadMessage)
            }
            (_, msg_type::ERROR_RESPONSE) => {
                let fields = ErrorResponse::parse(payload)?.0;
                self.error.get_or_insert(Error::Server(fields));
                self.phase = StartPhase::Draining;
                Ok(Action::ReadMessage)
            }
            (_, msg_type::READY_FOR_QUERY) => {
                self.transaction_status = ReadyForQuery::parse(payload)?.status;
                Err(self.error.take().unwrap_or_else(|| self.direction.mismatch()))
            }
            (
                StartPhase::Waiting | StartPhase::Draining,
                msg_type::PARSE_COMPLETE
                | msg_type::BIND_COMPLETE
                | msg_type::NO_DATA
                | msg_type::ROW_DESCRIPTION
                | msg_type::DATA_ROW
                | msg_type::COMMAND_COMPLETE
                | msg_type::EMPTY_QUERY_RESPONSE,
            ) => {
                // not a COPY: keep reading until the server is ready again
                Ok(Action::ReadMessage)
            }
            (phase, type_byte) => Err(unexpected(
                &format!("while starting COPY ({phase:?})"),
                type_byte,
            )),
        }
    }
}

fn entered(payload: &[u8]) -> Result<Action> {
    let response = CopyResponse::parse(payload)?;
    tracing::trace!(
        binary = response.is_binary(),
        columns = response.column_formats.len(),
        "entered copy mode"
    );
    Ok(Action::Finished)
}

/// A message that arrived while COPY IN data was still being sent.
#[derive(Debug)]
pub enum CopyInInterruption {
    Async(AsyncMessage),
    /// The server gave up on the copy.
    Failed(ErrorFields),
}

impl CopyInInterruption {
    /// Apart from notices and parameter changes, the server only speaks during
    /// COPY IN to report that the copy failed.
    pub fn parse(buffer_set: &BufferSet) -> Result<Self> {
        let type_byte = buffer_set.type_byte;
        let payload = buffer_set.read_buffer.as_slice();
        if RawMessage::is_async_type(type_byte) {
            return Ok(Self::Async(AsyncMessage::parse(&RawMessage::new(
                type_byte, payload,
            ))?));
        }
        match type_byte {
            msg_type::ERROR_RESPONSE => Ok(Self::Failed(ErrorResponse::parse(payload)?.0)),
            other => Err(unexpected("during COPY IN", other)),
        }
    }
}

/// Ends COPY IN with CopyDone, or CopyFail when `reason` is given.
pub struct CopyInEndStateMachine<'a> {
    reason: Option<Option<&'a str>>,
    /// The server already failed the copy; only wait for ReadyForQuery.
    resync: bool,
    extended: bool,
    rows_affected: Option<u64>,
    error: Option<ErrorFields>,
    transaction_status: TransactionStatus,
}

impl<'a> CopyInEndStateMachine<'a> {
    pub fn new(reason: Option<&'a str>, extended: bool) -> Self {
        Self {
            reason: Some(reason),
            resync: false,
            extended,
            rows_affected: None,
            error: None,
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Bring the connection back to idle after the server failed the copy with `error`.
    ///
    /// A simple-protocol COPY is followed by ReadyForQuery on its own; the extended
    /// protocol needs a Sync first.
    pub fn after_error(error: ErrorFields, extended: bool) -> Self {
        Self {
            reason: None,
            resync: true,
            extended,
            rows_affected: None,
            error: Some(error),
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Row count from the `COPY n` tag.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }
}

impl StateMachine for CopyInEndStateMachine<'_> {
    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if let Some(reason) = self.reason.take() {
            let buf = &mut buffer_set.write_buffer;
            match reason {
                None => write_copy_done(buf)?,
                Some(reason) => write_copy_fail(buf, reason)?,
            }
            if self.extended {
                write_sync(buf)?;
            }
            return Ok(Action::WriteAndReadMessage);
        }
        if std::mem::take(&mut self.resync) {
            if self.extended {
                write_sync(&mut buffer_set.write_buffer)?;
                return Ok(Action::WriteAndReadMessage);
            }
            return Ok(Action::ReadMessage);
        }
        if let Some(action) = async_message(buffer_set)? {
            return Ok(action);
        }

        let payload = buffer_set.read_buffer.as_slice();
        match buffer_set.type_byte {
            msg_type::COMMAND_COMPLETE => {
                self.rows_affected = CommandComplete::parse(payload)?.rows_affected();
                Ok(Action::ReadMessage)
            }
            msg_type::ERROR_RESPONSE => {
                let fields = ErrorResponse::parse(payload)?.0;
                self.error.get_or_insert(fields);
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.status;
                match self.error.take() {
                    Some(fields) => Err(Error::Server(fields)),
                    None => Ok(Action::Finished),
                }
            }
            other => Err(unexpected("after COPY IN", other)),
        }
    }
}

/// Reads COPY OUT data one CopyData message at a time.
///
/// Each driven run stops with [`Action::Finished`] after one chunk (available
/// through [`take_chunk`](Self::take_chunk)) or once ReadyForQuery ends the COPY.
/// The machine lives across runs; the next run starts by reading.
#[derive(Debug, Default)]
pub struct CopyOutStateMachine {
    chunk: Option<Bytes>,
    read_next: bool,
    draining: bool,
    done: bool,
    error: Option<ErrorFields>,
    transaction_status: TransactionStatus,
}

impl CopyOutStateMachine {
    /// A machine for a COPY whose CopyOutResponse has just been read.
    pub fn new() -> Self {
        Self {
            read_next: true,
            ..Self::default()
        }
    }

    pub fn take_chunk(&mut self) -> Option<Bytes> {
        self.chunk.take()
    }

    /// ReadyForQuery has been read; the connection is idle again.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Discard the remaining data instead of stopping at each chunk.
    pub fn drain(&mut self) {
        self.draining = true;
        self.chunk = None;
    }
}

impl StateMachine for CopyOutStateMachine {
    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if self.done {
            return Ok(Action::Finished);
        }
        if std::mem::take(&mut self.read_next) {
            return Ok(Action::ReadMessage);
        }
        if let Some(action) = async_message(buffer_set)? {
            return Ok(action);
        }

        let payload = buffer_set.read_buffer.as_slice();
        match buffer_set.type_byte {
            msg_type::COPY_DATA if self.draining => Ok(Action::ReadMessage),
            msg_type::COPY_DATA => {
                self.chunk = Some(Bytes::copy_from_slice(payload));
                self.read_next = true;
                Ok(Action::Finished)
            }
            msg_type::COPY_DONE | msg_type::COMMAND_COMPLETE => Ok(Action::ReadMessage),
            msg_type::ERROR_RESPONSE => {
                let fields = ErrorResponse::parse(payload)?.0;
                self.error.get_or_insert(fields);
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.status;
                self.done = true;
                match self.error.take() {
                    Some(fields) => Err(Error::Server(fields)),
                    None => Ok(Action::Finished),
                }
            }
            other => Err(unexpected("during COPY OUT", other)),
        }
    }
}

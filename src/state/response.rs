//! Reading a query response up to ReadyForQuery.

use crate::buffer_set::BufferSet;
use crate::error::{Error, ErrorFields, Result};
use crate::handler::ResultHandler;
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, ReadyForQuery, RowDescription, msg_type,
};
use crate::protocol::frontend::{write_copy_fail, write_sync};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, async_message, unexpected};

/// CopyFail reason sent when a plain query turns out to be `COPY ... FROM STDIN`.
pub const COPY_IN_REFUSED: &str = "COPY FROM STDIN is only supported through copy_from_stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Results,
    Rows,
    DiscardingCopy,
    WaitingReady,
}

/// Feeds result messages to a handler.
///
/// An ErrorResponse is remembered and returned once ReadyForQuery has been read,
/// so the connection is always back in sync when the error surfaces.
pub struct ResponseReader<'a, H> {
    handler: &'a mut H,
    phase: Phase,
    extended: bool,
    error: Option<ErrorFields>,
    transaction_status: TransactionStatus,
}

impl<'a, H: ResultHandler> ResponseReader<'a, H> {
    /// `extended` selects the extended-protocol recovery (an extra Sync after CopyFail).
    pub fn new(handler: &'a mut H, extended: bool) -> Self {
        Self {
            handler,
            phase: Phase::Results,
            extended,
            error: None,
            transaction_status: TransactionStatus::Idle,
        }
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn read(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if let Some(action) = async_message(buffer_set)? {
            return Ok(action);
        }
        let payload = buffer_set.read_buffer.as_slice();

        match buffer_set.type_byte {
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(payload)?;
                // the first error aborts the request; later ones are follow-ups
                self.error.get_or_insert(error.0);
                self.phase = Phase::WaitingReady;
                return Ok(Action::ReadMessage);
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.status;
                return match self.error.take() {
                    Some(fields) => Err(Error::Server(fields)),
                    None => Ok(Action::Finished),
                };
            }
            msg_type::PARSE_COMPLETE
            | msg_type::BIND_COMPLETE
            | msg_type::NO_DATA
            | msg_type::PORTAL_SUSPENDED => return Ok(Action::ReadMessage),
            _ => {}
        }

        match (self.phase, buffer_set.type_byte) {
            (Phase::Results, msg_type::ROW_DESCRIPTION) => {
                self.handler.result_start(RowDescription::parse(payload)?)?;
                self.phase = Phase::Rows;
            }
            (Phase::Rows, msg_type::DATA_ROW) => {
                self.handler.row(DataRow::parse(payload)?)?;
            }
            (Phase::Results | Phase::Rows, msg_type::COMMAND_COMPLETE) => {
                self.handler.result_end(CommandComplete::parse(payload)?)?;
                self.phase = Phase::Results;
            }
            (Phase::Results, msg_type::EMPTY_QUERY_RESPONSE) => self.handler.empty_query()?,
            (Phase::Results, msg_type::COPY_IN_RESPONSE) => {
                write_copy_fail(&mut buffer_set.write_buffer, COPY_IN_REFUSED)?;
                if self.extended {
                    // Sync sent before the COPY started is ignored in copy-in mode
                    write_sync(&mut buffer_set.write_buffer)?;
                }
                return Ok(Action::WriteAndReadMessage);
            }
            (Phase::Results, msg_type::COPY_OUT_RESPONSE) => {
                tracing::debug!("discarding COPY OUT data of a plain query");
                self.phase = Phase::DiscardingCopy;
            }
            (Phase::DiscardingCopy, msg_type::COPY_DATA) => {}
            (Phase::DiscardingCopy, msg_type::COPY_DONE) => self.phase = Phase::Results,
            (phase, type_byte) => {
                return Err(unexpected(&format!("in phase {phase:?}"), type_byte));
            }
        }
        Ok(Action::ReadMessage)
    }
}

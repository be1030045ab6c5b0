//! Extended query protocol with text parameters.

use crate::buffer_set::BufferSet;
use crate::error::Result;
use crate::handler::ResultHandler;
use crate::protocol::frontend::{
    write_bind, write_describe_portal, write_execute, write_parse, write_sync,
};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, StateMachine};
use super::response::ResponseReader;

#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    /// Parse into the unnamed statement, then run it.
    ExecuteOnce {
        query: &'a str,
        params: &'a [Option<String>],
    },
    Prepare {
        name: &'a str,
        query: &'a str,
    },
    ExecutePrepared {
        name: &'a str,
        params: &'a [Option<String>],
    },
}

/// One Sync-terminated extended-protocol exchange.
pub struct ExtendedQueryStateMachine<'a, H> {
    request: Option<Request<'a>>,
    reader: ResponseReader<'a, H>,
}

impl<'a, H: ResultHandler> ExtendedQueryStateMachine<'a, H> {
    fn new(handler: &'a mut H, request: Request<'a>) -> Self {
        Self {
            request: Some(request),
            reader: ResponseReader::new(handler, true),
        }
    }

    /// Parse + Bind + Describe + Execute + Sync on the unnamed statement.
    pub fn execute(handler: &'a mut H, query: &'a str, params: &'a [Option<String>]) -> Self {
        Self::new(handler, Request::ExecuteOnce { query, params })
    }

    /// Parse + Sync into statement `name`.
    pub fn prepare(handler: &'a mut H, name: &'a str, query: &'a str) -> Self {
        Self::new(handler, Request::Prepare { name, query })
    }

    /// Bind + Describe + Execute + Sync on statement `name`.
    pub fn execute_prepared(
        handler: &'a mut H,
        name: &'a str,
        params: &'a [Option<String>],
    ) -> Self {
        Self::new(handler, Request::ExecutePrepared { name, params })
    }
}

fn write_portal_run(buf: &mut Vec<u8>, statement: &str, params: &[Option<String>]) -> Result<()> {
    write_bind(buf, "", statement, params)?;
    write_describe_portal(buf, "")?;
    write_execute(buf, "")
}

impl<H: ResultHandler> StateMachine for ExtendedQueryStateMachine<'_, H> {
    fn transaction_status(&self) -> TransactionStatus {
        self.reader.transaction_status()
    }

    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let Some(request) = self.request.take() else {
            return self.reader.read(buffer_set);
        };
        let buf = &mut buffer_set.write_buffer;
        match request {
            Request::ExecuteOnce { query, params } => {
                write_parse(buf, "", query)?;
                write_portal_run(buf, "", params)?;
            }
            Request::Prepare { name, query } => write_parse(buf, name, query)?,
            Request::ExecutePrepared { name, params } => write_portal_run(buf, name, params)?,
        }
        write_sync(buf)?;
        Ok(Action::WriteAndReadMessage)
    }
}

//! [`Transport`] over the PostgreSQL wire protocol.

use bytes::Bytes;

use crate::buffer_set::BufferSet;
use crate::error::{Error, ErrorFields, Result};
use crate::handler::CollectHandler;
use crate::opts::{Opts, SslMode};
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::{write_cancel_request, write_copy_data, write_terminate};
use crate::protocol::types::TransactionStatus;
use crate::state::{
    Action, AsyncMessage, ConnectionStateMachine, CopyDirection, CopyInEndStateMachine,
    CopyInInterruption, CopyOutStateMachine, CopyStartStateMachine, ExtendedQueryStateMachine,
    SimpleQueryStateMachine, StateMachine,
};

use super::stream::Stream;
use super::{RawResult, Transport};

enum CopyState {
    Idle,
    In { extended: bool },
    Out(CopyOutStateMachine),
}

/// A PostgreSQL session over TCP, TLS or a Unix socket.
pub struct PgTransport {
    stream: Stream,
    buffer_set: BufferSet,
    opts: Opts,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    copy: CopyState,
    last_error: Option<ErrorFields>,
    is_broken: bool,
}

/// Drive a query-phase state machine to completion.
async fn drive<S: StateMachine>(
    stream: &mut Stream,
    buffer_set: &mut BufferSet,
    server_params: &mut Vec<(String, String)>,
    state_machine: &mut S,
) -> Result<()> {
    loop {
        match state_machine.step(buffer_set)? {
            Action::ReadMessage => stream.read_message(buffer_set).await?,
            Action::WriteAndReadMessage => {
                stream.send(buffer_set).await?;
                stream.read_message(buffer_set).await?;
            }
            Action::WriteAndReadByte | Action::TlsHandshake => {
                return Err(Error::Protocol(
                    "Unexpected startup action in query state machine".into(),
                ));
            }
            Action::HandleAsyncMessageAndReadMessage(message) => {
                handle_async_message(server_params, message);
                stream.read_message(buffer_set).await?;
            }
            Action::Finished => return Ok(()),
        }
    }
}

fn handle_async_message(server_params: &mut Vec<(String, String)>, message: AsyncMessage) {
    match message {
        AsyncMessage::Notice(fields) => tracing::debug!(notice = %fields, "server notice"),
        AsyncMessage::ParameterChanged { name, value } => {
            tracing::debug!(%name, %value, "server parameter changed");
            match server_params.iter_mut().find(|(n, _)| *n == name) {
                Some(param) => param.1 = value,
                None => server_params.push((name, value)),
            }
        }
        AsyncMessage::Notification { channel, payload } => {
            tracing::debug!(%channel, %payload, "notification without listener");
        }
    }
}

impl PgTransport {
    /// Backend key for CancelRequest, when the server sent one.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Backend process id, or 0 when unknown.
    pub fn connection_id(&self) -> u32 {
        self.backend_key.map_or(0, |k| k.process_id)
    }

    /// Parameters reported by the server (`server_version`, `TimeZone`, ...).
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_broken {
            return Err(Error::Closed);
        }
        match self.copy {
            CopyState::Idle => Ok(()),
            CopyState::In { .. } => Err(Error::InvalidUsage("COPY IN in progress".into())),
            CopyState::Out(_) => Err(Error::InvalidUsage("COPY OUT in progress".into())),
        }
    }

    /// Run `state_machine` and keep the session bookkeeping in step with the outcome.
    async fn run<S: StateMachine>(&mut self, state_machine: &mut S) -> Result<()> {
        let result = drive(
            &mut self.stream,
            &mut self.buffer_set,
            &mut self.server_params,
            state_machine,
        )
        .await;
        self.buffer_set.write_buffer.clear();
        self.settle(&result, state_machine.transaction_status());
        result
    }

    fn settle(&mut self, result: &Result<()>, status: TransactionStatus) {
        match result {
            Ok(()) | Err(Error::UnexpectedResult(_)) => self.transaction_status = status,
            Err(e @ Error::Server(fields)) => {
                self.last_error = Some(fields.clone());
                self.transaction_status = status;
                self.is_broken |= e.is_connection_broken();
            }
            // raised while encoding, before anything was sent
            Err(Error::InvalidUsage(_)) => {}
            Err(_) => self.is_broken = true,
        }
    }

    /// Read what the server already sent during COPY IN, without waiting for more.
    ///
    /// Returns the error that ended the copy, if there was one.
    async fn copy_in_failure(&mut self) -> Result<Option<ErrorFields>> {
        while self.stream.has_pending_input()? {
            self.stream.read_message(&mut self.buffer_set).await?;
            match CopyInInterruption::parse(&self.buffer_set)? {
                CopyInInterruption::Async(message) => {
                    handle_async_message(&mut self.server_params, message);
                }
                CopyInInterruption::Failed(fields) => return Ok(Some(fields)),
            }
        }
        Ok(None)
    }

    /// Send CancelRequest on a separate connection. The server closes it without replying.
    async fn send_cancel_request(opts: &Opts, key: Option<BackendKeyData>) -> Result<()> {
        let Some(key) = key else {
            return Err(Error::Unsupported("server sent no BackendKeyData".into()));
        };
        let mut stream = Stream::connect(opts).await?;
        let mut buffer_set = BufferSet::new();
        write_cancel_request(&mut buffer_set.write_buffer, &key)?;
        stream.send(&mut buffer_set).await?;
        let mut rest = [0_u8; 1];
        // EOF is the only answer
        let _ = stream.read_exact(&mut rest).await;
        Ok(())
    }
}

impl Transport for PgTransport {
    type Config = Opts;

    async fn connect(mut opts: Opts) -> Result<Self> {
        let mut stream = Stream::connect(&opts).await?;
        if stream.is_unix() || (cfg!(not(feature = "tls")) && opts.ssl_mode == SslMode::Prefer) {
            opts.ssl_mode = SslMode::Disable;
        }

        let mut buffer_set = BufferSet::new();
        let mut server_params = Vec::new();
        let (backend_key, transaction_status) = {
            let mut state_machine = ConnectionStateMachine::new(&opts);
            loop {
                match state_machine.step(&mut buffer_set)? {
                    Action::WriteAndReadByte => {
                        stream.send(&mut buffer_set).await?;
                        let byte = stream.read_u8().await?;
                        state_machine.set_ssl_response(byte);
                    }
                    Action::ReadMessage => stream.read_message(&mut buffer_set).await?,
                    Action::WriteAndReadMessage => {
                        stream.send(&mut buffer_set).await?;
                        stream.read_message(&mut buffer_set).await?;
                    }
                    Action::TlsHandshake => {
                        #[cfg(feature = "tls")]
                        {
                            stream = stream.upgrade_to_tls(&opts.host).await?;
                        }
                        #[cfg(not(feature = "tls"))]
                        {
                            return Err(Error::Unsupported(
                                "TLS requested but the tls feature is not enabled".into(),
                            ));
                        }
                    }
                    Action::HandleAsyncMessageAndReadMessage(message) => {
                        handle_async_message(&mut server_params, message);
                        stream.read_message(&mut buffer_set).await?;
                    }
                    Action::Finished => break,
                }
            }
            (state_machine.backend_key(), state_machine.transaction_status())
        };
        buffer_set.write_buffer.clear();

        tracing::debug!(
            pid = backend_key.map_or(0, |k| k.process_id),
            host = %opts.host,
            "connected"
        );
        Ok(Self {
            stream,
            buffer_set,
            opts,
            backend_key,
            server_params,
            transaction_status,
            copy: CopyState::Idle,
            last_error: None,
            is_broken: false,
        })
    }

    async fn execute(
        &mut self,
        command: &str,
        params: Option<&[Option<String>]>,
    ) -> Result<RawResult> {
        self.ensure_idle()?;
        let mut handler = CollectHandler::new();
        match params {
            None => {
                self.run(&mut SimpleQueryStateMachine::new(&mut handler, command))
                    .await?;
            }
            Some(params) => {
                let mut state_machine =
                    ExtendedQueryStateMachine::execute(&mut handler, command, params);
                self.run(&mut state_machine).await?;
            }
        }
        Ok(handler.into_result())
    }

    async fn prepare(&mut self, name: &str, command: &str) -> Result<()> {
        self.ensure_idle()?;
        let mut handler = CollectHandler::new();
        self.run(&mut ExtendedQueryStateMachine::prepare(&mut handler, name, command))
            .await
    }

    async fn execute_prepared(
        &mut self,
        name: &str,
        params: &[Option<String>],
    ) -> Result<RawResult> {
        self.ensure_idle()?;
        let mut handler = CollectHandler::new();
        {
            let mut state_machine =
                ExtendedQueryStateMachine::execute_prepared(&mut handler, name, params);
            self.run(&mut state_machine).await?;
        }
        Ok(handler.into_result())
    }

    async fn start_copy_in(
        &mut self,
        command: &str,
        params: Option<&[Option<String>]>,
    ) -> Result<()> {
        self.ensure_idle()?;
        let mut state_machine = CopyStartStateMachine::new(CopyDirection::In, command, params);
        self.run(&mut state_machine).await?;
        self.copy = CopyState::In {
            extended: state_machine.extended(),
        };
        tracing::debug!(extended = state_machine.extended(), "COPY IN started");
        Ok(())
    }

    async fn send_copy_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let CopyState::In { extended } = self.copy else {
            return Err(Error::InvalidUsage("no COPY IN in progress".into()));
        };
        let sent = async {
            write_copy_data(&mut self.buffer_set.write_buffer, chunk)?;
            self.stream.send(&mut self.buffer_set).await?;
            self.copy_in_failure().await
        }
        .await;
        match sent {
            Ok(None) => Ok(()),
            Ok(Some(fields)) => {
                tracing::debug!(error = %fields, "server failed COPY IN");
                self.copy = CopyState::Idle;
                let mut state_machine =
                    CopyInEndStateMachine::after_error(fields.clone(), extended);
                self.run(&mut state_machine).await?;
                Err(Error::Server(fields))
            }
            Err(e) => {
                self.buffer_set.write_buffer.clear();
                self.is_broken = true;
                Err(e)
            }
        }
    }

    async fn end_copy_in(&mut self, error: Option<&str>) -> Result<Option<u64>> {
        let CopyState::In { extended } = self.copy else {
            return Err(Error::InvalidUsage("no COPY IN in progress".into()));
        };
        self.copy = CopyState::Idle;
        let mut state_machine = CopyInEndStateMachine::new(error, extended);
        self.run(&mut state_machine).await?;
        tracing::debug!(rows = ?state_machine.rows_affected(), "COPY IN finished");
        Ok(state_machine.rows_affected())
    }

    async fn start_copy_out(&mut self, command: &str) -> Result<()> {
        self.ensure_idle()?;
        let mut state_machine = CopyStartStateMachine::new(CopyDirection::Out, command, None);
        self.run(&mut state_machine).await?;
        self.copy = CopyState::Out(CopyOutStateMachine::new());
        tracing::debug!("COPY OUT started");
        Ok(())
    }

    async fn next_copy_chunk(&mut self) -> Result<Option<Bytes>> {
        let CopyState::Out(state_machine) = &mut self.copy else {
            return Ok(None);
        };
        let result = drive(
            &mut self.stream,
            &mut self.buffer_set,
            &mut self.server_params,
            state_machine,
        )
        .await;
        let chunk = state_machine.take_chunk();
        let done = state_machine.is_done();
        let status = state_machine.transaction_status();
        if done || result.is_err() {
            self.copy = CopyState::Idle;
        }
        self.settle(&result, status);
        result?;
        Ok(chunk)
    }

    async fn cancel_copy_out(&mut self) -> Result<()> {
        let CopyState::Out(state_machine) = &mut self.copy else {
            return Ok(());
        };
        if state_machine.is_done() {
            self.copy = CopyState::Idle;
            return Ok(());
        }
        state_machine.drain();

        tracing::warn!("draining cancelled COPY OUT");
        if let Err(e) = Self::send_cancel_request(&self.opts, self.backend_key).await {
            tracing::debug!(error = %e, "CancelRequest failed; reading COPY OUT to the end");
        }

        let CopyState::Out(state_machine) = &mut self.copy else {
            return Ok(());
        };
        let result = drive(
            &mut self.stream,
            &mut self.buffer_set,
            &mut self.server_params,
            state_machine,
        )
        .await;
        let status = state_machine.transaction_status();
        self.copy = CopyState::Idle;
        match result {
            // the query_canceled error we asked for
            Err(Error::Server(_)) | Ok(()) => {
                self.transaction_status = status;
                Ok(())
            }
            Err(e) => {
                self.is_broken = true;
                Err(e)
            }
        }
    }

    fn last_error(&self) -> Option<&ErrorFields> {
        self.last_error.as_ref()
    }

    fn is_ready(&self) -> bool {
        !self.is_broken && matches!(self.copy, CopyState::Idle)
    }

    async fn close(mut self) {
        self.buffer_set.write_buffer.clear();
        if write_terminate(&mut self.buffer_set.write_buffer).is_ok()
            && self.stream.send(&mut self.buffer_set).await.is_ok()
        {
            let _ = self.stream.shutdown().await;
        }
        tracing::debug!(pid = self.connection_id(), "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    use super::*;

    fn frame(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut msg = vec![type_byte];
        let len = u32::try_from(payload.len() + 4).unwrap_or(u32::MAX);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.extend_from_slice(payload);
        msg
    }

    /// A session that has just entered COPY IN.
    fn copying(client: UnixStream, extended: bool) -> PgTransport {
        PgTransport {
            stream: Stream::unix(client),
            buffer_set: BufferSet::new(),
            opts: Opts::default(),
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            copy: CopyState::In { extended },
            last_error: None,
            is_broken: false,
        }
    }

    #[tokio::test]
    async fn copy_in_failure_ends_the_next_send() {
        let Ok((client, mut server)) = UnixStream::pair() else {
            return;
        };
        let mut transport = copying(client, false);
        assert!(transport.send_copy_chunk(b"1\n").await.is_ok());

        // the server rejects the row and leaves copy mode
        let mut reply = frame(b'N', b"SWARNING\0C01000\0Mfirst\0\0");
        reply.extend(frame(b'E', b"SERROR\0C22P02\0Minvalid input syntax\0\0"));
        reply.extend(frame(b'Z', b"I"));
        assert!(server.write_all(&reply).await.is_ok());

        let mut sent = Ok(());
        for _ in 0..100 {
            sent = transport.send_copy_chunk(b"x\n").await;
            if sent.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let err = sent.err();
        assert_eq!(err.as_ref().and_then(Error::sqlstate), Some("22P02"));
        assert!(transport.is_ready());
        assert_eq!(
            transport.last_error().and_then(|f| f.code.as_deref()),
            Some("22P02")
        );

        // only CopyData went out; nothing is owed to the server
        drop(transport);
        let mut written = Vec::new();
        assert!(server.read_to_end(&mut written).await.is_ok());
        assert_eq!(written.first(), Some(&b'd'));
        assert!(!written.contains(&b'c'));
    }

    #[tokio::test]
    async fn extended_copy_in_failure_syncs() {
        let Ok((client, mut server)) = UnixStream::pair() else {
            return;
        };
        let mut transport = copying(client, true);
        let error = frame(b'E', b"SERROR\0C22P04\0Mbad copy file format\0\0");
        assert!(server.write_all(&error).await.is_ok());

        let peer = tokio::spawn(async move {
            // CopyData messages, then the Sync that ends the failed copy
            let mut seen = Vec::new();
            let mut byte = [0_u8; 1];
            while server.read_exact(&mut byte).await.is_ok() {
                let [b] = byte;
                seen.push(b);
                if seen.ends_with(&[b'S', 0, 0, 0, 4]) {
                    let _ = server.write_all(&frame(b'Z', b"E")).await;
                    break;
                }
            }
            seen
        });

        let mut sent = Ok(());
        for _ in 0..100 {
            sent = transport.send_copy_chunk(b"1\n").await;
            if sent.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sent.err().as_ref().and_then(Error::sqlstate), Some("22P04"));
        assert!(transport.is_ready());
        assert_eq!(transport.transaction_status(), TransactionStatus::Failed);
        assert!(peer.await.is_ok_and(|seen| seen.ends_with(&[b'S', 0, 0, 0, 4])));
    }
}

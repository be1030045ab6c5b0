//! Scripted in-memory transport for driving `Connection` without a server.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;

use zero_pq::{
    Column, Connection, ConnectionOptions, Error, ErrorFields, RawResult, Result, Transport,
};

#[derive(Default)]
struct State {
    log: Vec<String>,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, ErrorFields>,
    results: HashMap<String, RawResult>,
    copy_out: HashMap<String, Vec<Bytes>>,
    copy_in: Vec<u8>,
    fail_chunk: Option<usize>,
    chunk_acks: Option<Arc<Semaphore>>,
    connect_error: Option<Error>,
    connect_delay: Option<Duration>,
}

/// Script and recorder shared between a test and its transport.
#[derive(Clone, Default)]
pub struct Mock {
    state: Arc<Mutex<State>>,
}

impl Mock {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Events recorded by the transport, in order.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    fn record(&self, event: String) {
        self.lock().log.push(event);
    }

    pub fn delay(&self, command: &str, delay: Duration) -> &Self {
        self.lock().delays.insert(command.into(), delay);
        self
    }

    pub fn fail(&self, command: &str, code: &str, message: &str) -> &Self {
        self.lock()
            .failures
            .insert(command.into(), server_error(code, message));
        self
    }

    pub fn result(&self, command: &str, result: RawResult) -> &Self {
        self.lock().results.insert(command.into(), result);
        self
    }

    pub fn copy_out(&self, command: &str, chunks: &[&str]) -> &Self {
        let chunks = chunks
            .iter()
            .map(|c| Bytes::copy_from_slice(c.as_bytes()))
            .collect();
        self.lock().copy_out.insert(command.into(), chunks);
        self
    }

    /// Make the `n`th chunk (0-based) of the next COPY IN fail.
    pub fn fail_chunk(&self, n: usize) -> &Self {
        self.lock().fail_chunk = Some(n);
        self
    }

    /// Hold every COPY IN chunk until a permit is added to the returned semaphore.
    pub fn gate_chunks(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().chunk_acks = Some(Arc::clone(&gate));
        gate
    }

    pub fn refuse_connect(&self, error: Error) -> &Self {
        self.lock().connect_error = Some(error);
        self
    }

    pub fn connect_delay(&self, delay: Duration) -> &Self {
        self.lock().connect_delay = Some(delay);
        self
    }

    /// Everything received through COPY IN so far.
    pub fn copied_in(&self) -> Vec<u8> {
        self.lock().copy_in.clone()
    }

    pub fn connection(&self) -> Connection<MockTransport> {
        Connection::new(self.clone(), ConnectionOptions::default())
    }

    pub fn connection_with(&self, options: ConnectionOptions) -> Connection<MockTransport> {
        Connection::new(self.clone(), options)
    }
}

pub fn server_error(code: &str, message: &str) -> ErrorFields {
    ErrorFields {
        severity: Some("ERROR".into()),
        code: Some(code.into()),
        message: Some(message.into()),
        ..Default::default()
    }
}

pub fn rows(columns: &[(&str, u32)], rows: &[&[Option<&str>]]) -> RawResult {
    RawResult::Rows {
        columns: columns
            .iter()
            .map(|(name, oid)| Column::new(*name, *oid))
            .collect(),
        rows: rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| cell.map(|c| Bytes::copy_from_slice(c.as_bytes())))
                    .collect()
            })
            .collect(),
    }
}

enum Copy {
    Idle,
    In { chunks: usize },
    Out(VecDeque<Bytes>),
}

pub struct MockTransport {
    mock: Mock,
    copy: Copy,
    last_error: Option<ErrorFields>,
}

impl MockTransport {
    async fn pause(&self, command: &str) {
        let delay = self.mock.lock().delays.get(command).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn outcome(&mut self, command: &str) -> Result<RawResult> {
        let (failure, result) = {
            let state = self.mock.lock();
            (
                state.failures.get(command).cloned(),
                state.results.get(command).cloned(),
            )
        };
        if let Some(fields) = failure {
            self.last_error = Some(fields.clone());
            return Err(Error::Server(fields));
        }
        Ok(result.unwrap_or(RawResult::Command {
            rows_affected: command.starts_with("INSERT").then_some(1),
        }))
    }
}

fn describe(params: &[Option<String>]) -> String {
    params
        .iter()
        .map(|p| p.as_deref().unwrap_or("NULL"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Transport for MockTransport {
    type Config = Mock;

    async fn connect(mock: Mock) -> Result<Self> {
        let (delay, error) = {
            let state = mock.lock();
            (state.connect_delay, state.connect_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(error);
        }
        mock.record("connect".into());
        Ok(Self {
            mock,
            copy: Copy::Idle,
            last_error: None,
        })
    }

    async fn execute(
        &mut self,
        command: &str,
        params: Option<&[Option<String>]>,
    ) -> Result<RawResult> {
        match params {
            Some(params) => self
                .mock
                .record(format!("start {command} [{}]", describe(params))),
            None => self.mock.record(format!("start {command}")),
        }
        self.pause(command).await;
        self.mock.record(format!("end {command}"));
        self.outcome(command)
    }

    async fn prepare(&mut self, name: &str, command: &str) -> Result<()> {
        self.mock.record(format!("prepare {name} {command}"));
        self.outcome(command).map(|_| ())
    }

    async fn execute_prepared(
        &mut self,
        name: &str,
        params: &[Option<String>],
    ) -> Result<RawResult> {
        self.mock
            .record(format!("execute {name} [{}]", describe(params)));
        self.outcome(name)
    }

    async fn start_copy_in(
        &mut self,
        command: &str,
        _params: Option<&[Option<String>]>,
    ) -> Result<()> {
        if !command.starts_with("COPY") {
            return Err(Error::UnexpectedResult("not a COPY_IN result".into()));
        }
        self.mock.record(format!("copy in {command}"));
        self.copy = Copy::In { chunks: 0 };
        Ok(())
    }

    async fn send_copy_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let Copy::In { chunks } = &mut self.copy else {
            return Err(Error::InvalidUsage("no COPY IN in progress".into()));
        };
        let index = *chunks;
        *chunks += 1;

        let (gate, fail_at) = {
            let state = self.mock.lock();
            (state.chunk_acks.clone(), state.fail_chunk)
        };
        if let Some(gate) = gate {
            gate.acquire().await.map_err(|_| Error::Closed)?.forget();
        }
        if fail_at == Some(index) {
            let fields = server_error("22P04", "bad copy file format");
            self.last_error = Some(fields);
            return Err(Error::Protocol("chunk rejected".into()));
        }
        self.mock.lock().copy_in.extend_from_slice(chunk);
        self.mock
            .record(format!("chunk {}", String::from_utf8_lossy(chunk).trim_end()));
        Ok(())
    }

    async fn end_copy_in(&mut self, error: Option<&str>) -> Result<Option<u64>> {
        self.copy = Copy::Idle;
        match error {
            Some(reason) => {
                self.mock.record(format!("copy fail {reason}"));
                let fields = server_error("57014", &format!("COPY from stdin failed: {reason}"));
                self.last_error = Some(fields.clone());
                Err(Error::Server(fields))
            }
            None => {
                self.mock.record("copy done".into());
                let lines = self
                    .mock
                    .copied_in()
                    .iter()
                    .filter(|b| **b == b'\n')
                    .count();
                Ok(Some(lines as u64))
            }
        }
    }

    async fn start_copy_out(&mut self, command: &str) -> Result<()> {
        let chunks = self.mock.lock().copy_out.get(command).cloned();
        let Some(chunks) = chunks else {
            return Err(Error::UnexpectedResult("not a COPY_OUT result".into()));
        };
        self.mock.record(format!("copy out {command}"));
        self.copy = Copy::Out(chunks.into());
        Ok(())
    }

    async fn next_copy_chunk(&mut self) -> Result<Option<Bytes>> {
        let Copy::Out(chunks) = &mut self.copy else {
            return Ok(None);
        };
        let chunk = chunks.pop_front();
        if chunk.is_none() {
            self.copy = Copy::Idle;
        }
        tokio::task::yield_now().await;
        Ok(chunk)
    }

    async fn cancel_copy_out(&mut self) -> Result<()> {
        if matches!(self.copy, Copy::Out(_)) {
            self.mock.record("cancel copy out".into());
        }
        self.copy = Copy::Idle;
        Ok(())
    }

    fn last_error(&self) -> Option<&ErrorFields> {
        self.last_error.as_ref()
    }

    fn is_ready(&self) -> bool {
        matches!(self.copy, Copy::Idle)
    }

    async fn close(self) {
        self.mock.record("close".into());
    }
}

//! COPY FROM STDIN: a backpressured [`Sink`] in front of the transport.
//!
//! The producer and the queued copy operation share a [`CopyInBridge`]. The
//! producer may hold at most one chunk in the bridge; it is released only after the
//! transport has taken it, so the producer never runs more than one chunk ahead of
//! the connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::task::AtomicWaker;
use futures::{Sink, SinkExt};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::transport::Transport;

/// Abort reason used when the connection is finished during a copy.
pub(crate) const CONNECTION_CLOSED: &str = "connection closed";
const SINK_DROPPED: &str = "copy sink dropped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Buffering,
    Sending,
    Finishing,
    Aborting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkSlot {
    Empty,
    Holding(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum End {
    Finish,
    Abort(String),
}

/// What the sending side should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Send(Bytes),
    Finish,
    Abort(String),
    /// Nothing to do until the producer acts.
    Wait,
    /// The session is over.
    Stop,
}

/// Single-slot flow control between a COPY producer and the connection.
#[derive(Debug)]
pub(crate) struct CopyInBridge {
    phase: Phase,
    slot: ChunkSlot,
    end: Option<End>,
    /// Failure seen by the producer on its next call.
    error: Option<Error>,
    rows: Option<u64>,
}

impl Default for CopyInBridge {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            slot: ChunkSlot::Empty,
            end: None,
            error: None,
            rows: None,
        }
    }
}

impl CopyInBridge {
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// `Ok(true)` when a chunk can be offered, `Ok(false)` while the slot is taken.
    pub(crate) fn accepts(&self) -> Result<bool> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if self.end.is_some() || self.phase != Phase::Idle {
            return match self.phase {
                Phase::Buffering | Phase::Sending if self.end.is_none() => Ok(false),
                _ => Err(Error::InvalidUsage("COPY input already finished".into())),
            };
        }
        Ok(true)
    }

    pub(crate) fn offer(&mut self, chunk: Bytes) -> Result<()> {
        if !self.accepts()? {
            return Err(Error::InvalidUsage(
                "COPY chunk offered before the previous one was taken".into(),
            ));
        }
        if !chunk.is_empty() {
            self.slot = ChunkSlot::Holding(chunk);
            self.phase = Phase::Buffering;
        }
        Ok(())
    }

    /// Whether every offered chunk has been taken by the connection.
    pub(crate) fn is_flushed(&self) -> bool {
        self.slot == ChunkSlot::Empty
    }

    pub(crate) fn next_command(&mut self) -> Command {
        match self.phase {
            Phase::Buffering => {
                let ChunkSlot::Holding(chunk) = &self.slot else {
                    self.phase = Phase::Idle;
                    return self.next_command();
                };
                let chunk = chunk.clone();
                self.phase = Phase::Sending;
                Command::Send(chunk)
            }
            Phase::Idle => match self.end.take() {
                Some(End::Finish) => {
                    self.phase = Phase::Finishing;
                    Command::Finish
                }
                Some(End::Abort(reason)) => {
                    self.phase = Phase::Aborting;
                    Command::Abort(reason)
                }
                None => Command::Wait,
            },
            Phase::Sending | Phase::Finishing | Phase::Aborting => Command::Wait,
            Phase::Closed => Command::Stop,
        }
    }

    /// The connection answered the outstanding send.
    pub(crate) fn send_done(&mut self, result: Result<()>) {
        match result {
            Ok(()) if self.phase == Phase::Sending => {
                self.slot = ChunkSlot::Empty;
                self.phase = Phase::Idle;
            }
            Ok(()) => {}
            Err(e) => self.fail(e),
        }
    }

    /// End of input. Deferred until the buffered chunk has been sent.
    pub(crate) fn finish(&mut self) {
        if self.end.is_none()
            && matches!(self.phase, Phase::Idle | Phase::Buffering | Phase::Sending)
        {
            self.end = Some(End::Finish);
        }
    }

    /// Cancel the copy with `reason`.
    ///
    /// A chunk that was not handed to the connection yet is discarded; one that is
    /// being sent is allowed to complete first. Has no effect once the end of the
    /// copy has been issued.
    pub(crate) fn abort(&mut self, reason: &str) -> bool {
        match self.phase {
            Phase::Finishing | Phase::Aborting | Phase::Closed => return false,
            Phase::Buffering => {
                self.slot = ChunkSlot::Empty;
                self.phase = Phase::Idle;
            }
            Phase::Idle | Phase::Sending => {}
        }
        if matches!(self.end, Some(End::Abort(_))) {
            return false;
        }
        self.end = Some(End::Abort(reason.to_string()));
        self.error = Some(Error::CopyAborted(reason.to_string()));
        true
    }

    pub(crate) fn complete(&mut self, rows: u64) {
        self.phase = Phase::Closed;
        self.slot = ChunkSlot::Empty;
        self.rows = Some(rows);
    }

    /// Terminal failure. The first one wins.
    pub(crate) fn fail(&mut self, error: Error) {
        self.phase = Phase::Closed;
        self.slot = ChunkSlot::Empty;
        self.end = None;
        self.error.get_or_insert(error);
    }

    fn terminal_error(&self) -> Error {
        self.error.clone().unwrap_or(Error::Closed)
    }
}

/// Bridge state shared by the sink and the queued copy operation.
#[derive(Default)]
pub(crate) struct Shared {
    bridge: Mutex<CopyInBridge>,
    producer: AtomicWaker,
    sender: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CopyInBridge> {
        self.bridge.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the bridge and wake both sides.
    fn update<R>(&self, f: impl FnOnce(&mut CopyInBridge) -> R) -> R {
        let result = f(&mut *self.lock());
        self.sender.notify_one();
        self.producer.wake();
        result
    }

    async fn next_command(&self) -> Command {
        loop {
            let command = self.lock().next_command();
            if command != Command::Wait {
                return command;
            }
            self.sender.notified().await;
        }
    }

    pub(crate) fn abort(&self, reason: &str) {
        if self.update(|bridge| bridge.abort(reason)) {
            tracing::debug!(%reason, "COPY IN abort requested");
        }
    }
}

/// The operation's end of the bridge.
///
/// Dropping it before the copy has ended, including when the queued operation
/// never got to run, fails the bridge so a waiting producer is released.
pub(crate) struct Session(Arc<Shared>);

impl Session {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self(shared)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.0
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.0.update(|bridge| {
            if bridge.phase() != Phase::Closed {
                bridge.fail(Error::CopyAborted(CONNECTION_CLOSED.into()));
            }
        });
    }
}

/// Run a COPY FROM STDIN session on `transport`, feeding it from the bridge.
pub(crate) async fn pump<T: Transport>(
    transport: &mut T,
    command: &str,
    params: Option<&[Option<String>]>,
    session: &Session,
) -> Result<u64> {
    let shared = session.shared();
    if let Err(e) = transport.start_copy_in(command, params).await {
        shared.update(|bridge| bridge.fail(e.clone()));
        return Err(e);
    }
    loop {
        match shared.next_command().await {
            Command::Send(chunk) => {
                let result = transport.send_copy_chunk(&chunk).await;
                shared.update(|bridge| bridge.send_done(result.clone()));
                result?;
            }
            Command::Finish => {
                let result = transport.end_copy_in(None).await;
                shared.update(|bridge| match &result {
                    Ok(rows) => bridge.complete(rows.unwrap_or(0)),
                    Err(e) => bridge.fail(e.clone()),
                });
                return result.map(|rows| rows.unwrap_or(0));
            }
            Command::Abort(reason) => {
                let result = transport.end_copy_in(Some(&reason)).await;
                shared.update(|bridge| bridge.fail(Error::CopyAborted(reason.clone())));
                return Err(result.err().unwrap_or(Error::CopyAborted(reason)));
            }
            Command::Wait => {}
            Command::Stop => return Err(shared.lock().terminal_error()),
        }
    }
}

/// Write side of `COPY ... FROM STDIN`.
///
/// Obtained from [`Connection::copy_from_stream`](crate::Connection::copy_from_stream).
/// Implements [`Sink<Bytes>`]: `poll_ready` stays pending while the previous chunk
/// is still on its way to the server. Dropping the sink before
/// [`finish`](Self::finish) aborts the copy.
pub struct CopyInSink {
    shared: Arc<Shared>,
    completion: Request<u64>,
    closing: bool,
    result: Option<Result<u64>>,
}

impl CopyInSink {
    pub(crate) fn new(shared: Arc<Shared>, completion: Request<u64>) -> Self {
        Self {
            shared,
            completion,
            closing: false,
            result: None,
        }
    }

    /// Hand `chunk` to the copy.
    ///
    /// Resolves once the chunk is buffered, which is after the previous chunk was
    /// accepted by the connection.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        self.feed(chunk.into()).await
    }

    /// End the input and wait for the server to confirm the copy.
    ///
    /// Returns the number of rows copied.
    pub async fn finish(mut self) -> Result<u64> {
        self.close().await?;
        self.rows_affected().ok_or(Error::Closed)
    }

    /// Cancel the copy; the server discards everything sent so far.
    pub async fn abort(mut self, reason: &str) -> Result<()> {
        self.shared.abort(reason);
        self.closing = true;
        match futures::future::poll_fn(|cx| self.poll_completion(cx)).await {
            Ok(_) | Err(Error::Server(_) | Error::CopyAborted(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Rows copied, once the copy has completed.
    pub fn rows_affected(&self) -> Option<u64> {
        self.shared.lock().rows
    }

    fn poll_completion(&mut self, cx: &mut Context<'_>) -> Poll<Result<u64>> {
        if let Some(result) = &self.result {
            return Poll::Ready(result.clone());
        }
        let result = std::task::ready!(Pin::new(&mut self.completion).poll(cx));
        self.result = Some(result.clone());
        Poll::Ready(result)
    }
}

impl Sink<Bytes> for CopyInSink {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.shared.producer.register(cx.waker());
        match self.shared.lock().accepts() {
            Ok(true) => Poll::Ready(Ok(())),
            Ok(false) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<()> {
        self.shared.update(|bridge| bridge.offer(item))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.shared.producer.register(cx.waker());
        let bridge = self.shared.lock();
        if bridge.phase() == Phase::Closed {
            return match &bridge.error {
                Some(e) => Poll::Ready(Err(e.clone())),
                None => Poll::Ready(Ok(())),
            };
        }
        if let Some(e) = &bridge.error {
            return Poll::Ready(Err(e.clone()));
        }
        if bridge.is_flushed() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if !self.closing {
            self.closing = true;
            self.shared.update(CopyInBridge::finish);
        }
        self.poll_completion(cx).map(|result| result.map(|_| ()))
    }
}

impl Drop for CopyInSink {
    fn drop(&mut self) {
        if !self.closing {
            self.shared.abort(SINK_DROPPED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &'static str) -> Bytes {
        Bytes::from_static(data.as_bytes())
    }

    #[test]
    fn second_chunk_waits_for_first_ack() {
        let mut bridge = CopyInBridge::default();
        assert!(matches!(bridge.accepts(), Ok(true)));
        assert!(bridge.offer(chunk("1\n")).is_ok());
        assert!(matches!(bridge.accepts(), Ok(false)));
        assert!(bridge.offer(chunk("2\n")).is_err());

        assert_eq!(bridge.next_command(), Command::Send(chunk("1\n")));
        assert!(matches!(bridge.accepts(), Ok(false)));
        assert_eq!(bridge.next_command(), Command::Wait);

        bridge.send_done(Ok(()));
        assert!(matches!(bridge.accepts(), Ok(true)));
        assert!(bridge.offer(chunk("2\n")).is_ok());
        assert_eq!(bridge.next_command(), Command::Send(chunk("2\n")));
    }

    #[test]
    fn finish_is_deferred_until_send_completes() {
        let mut bridge = CopyInBridge::default();
        assert!(bridge.offer(chunk("a\n")).is_ok());
        assert_eq!(bridge.next_command(), Command::Send(chunk("a\n")));
        bridge.finish();
        assert_eq!(bridge.next_command(), Command::Wait);
        bridge.send_done(Ok(()));
        assert_eq!(bridge.next_command(), Command::Finish);
        bridge.complete(1);
        assert_eq!(bridge.next_command(), Command::Stop);
        assert_eq!(bridge.rows, Some(1));
    }

    #[test]
    fn finish_when_idle_is_immediate() {
        let mut bridge = CopyInBridge::default();
        bridge.finish();
        assert_eq!(bridge.next_command(), Command::Finish);
        assert_eq!(bridge.phase(), Phase::Finishing);
    }

    #[test]
    fn abort_during_send_waits_for_ack() {
        let mut bridge = CopyInBridge::default();
        assert!(bridge.offer(chunk("x\n")).is_ok());
        assert_eq!(bridge.next_command(), Command::Send(chunk("x\n")));
        assert!(bridge.abort("stop"));
        assert!(matches!(bridge.accepts(), Err(Error::CopyAborted(r)) if r == "stop"));
        assert_eq!(bridge.next_command(), Command::Wait);

        bridge.send_done(Ok(()));
        assert_eq!(bridge.next_command(), Command::Abort("stop".into()));
        assert!(!bridge.abort("again"));
    }

    #[test]
    fn abort_discards_unsent_chunk() {
        let mut bridge = CopyInBridge::default();
        assert!(bridge.offer(chunk("x\n")).is_ok());
        assert!(bridge.abort("changed my mind"));
        assert_eq!(bridge.next_command(), Command::Abort("changed my mind".into()));
    }

    #[test]
    fn abort_replaces_pending_finish() {
        let mut bridge = CopyInBridge::default();
        assert!(bridge.offer(chunk("x\n")).is_ok());
        assert_eq!(bridge.next_command(), Command::Send(chunk("x\n")));
        bridge.finish();
        assert!(bridge.abort("late"));
        bridge.send_done(Ok(()));
        assert_eq!(bridge.next_command(), Command::Abort("late".into()));
    }

    #[test]
    fn failure_reaches_waiting_producer() {
        let mut bridge = CopyInBridge::default();
        assert!(bridge.offer(chunk("x\n")).is_ok());
        assert_eq!(bridge.next_command(), Command::Send(chunk("x\n")));
        bridge.send_done(Err(Error::Closed));
        assert!(matches!(bridge.accepts(), Err(Error::Closed)));
        assert!(bridge.is_flushed());
        assert_eq!(bridge.next_command(), Command::Stop);

        bridge.fail(Error::Protocol("later".into()));
        assert!(matches!(bridge.terminal_error(), Error::Closed));
    }

    #[test]
    fn empty_chunks_are_skipped() {
        let mut bridge = CopyInBridge::default();
        assert!(bridge.offer(Bytes::new()).is_ok());
        assert_eq!(bridge.phase(), Phase::Idle);
        assert_eq!(bridge.next_command(), Command::Wait);
    }
}

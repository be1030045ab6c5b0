//! COPY TO STDOUT: a pull-driven [`Stream`] of data chunks.
//!
//! The queued copy operation fetches a chunk from the transport only when the
//! consumer asks for one, so at most one fetch is in flight and a slow consumer
//! stops the transfer instead of buffering it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::request::Request;
use crate::transport::Transport;

type Reply = oneshot::Sender<Result<Option<Bytes>>>;

/// Demand channel between a [`CopyOutStream`] and the operation serving it.
pub(crate) fn channel() -> (mpsc::Sender<Reply>, mpsc::Receiver<Reply>) {
    mpsc::channel(1)
}

/// Run a COPY TO STDOUT session on `transport`, answering one fetch per demand.
///
/// When the stream goes away mid-transfer the copy is cancelled and the connection
/// is brought back to idle.
pub(crate) async fn serve<T: Transport>(
    transport: &mut T,
    command: &str,
    mut demand: mpsc::Receiver<Reply>,
) -> Result<()> {
    transport.start_copy_out(command).await?;
    loop {
        let Some(reply) = demand.recv().await else {
            tracing::debug!("COPY OUT stream dropped");
            return transport.cancel_copy_out().await;
        };
        match transport.next_copy_chunk().await? {
            Some(chunk) => {
                if reply.send(Ok(Some(chunk))).is_err() {
                    return transport.cancel_copy_out().await;
                }
            }
            None => {
                let _ = reply.send(Ok(None));
                return Ok(());
            }
        }
    }
}

/// Read side of `COPY ... TO STDOUT`.
///
/// Obtained from [`Connection::copy_to_stream`](crate::Connection::copy_to_stream).
/// Yields the server's data in order and ends after the last chunk; a failure is
/// reported once as the final item. Also readable through [`AsyncRead`].
///
/// Dropping the stream before the end cancels the copy on the server.
pub struct CopyOutStream {
    demand: mpsc::Sender<Reply>,
    pending: Option<oneshot::Receiver<Result<Option<Bytes>>>>,
    completion: Request<()>,
    buffered: Bytes,
    ending: bool,
    done: bool,
}

impl CopyOutStream {
    pub(crate) fn new(demand: mpsc::Sender<Reply>, completion: Request<()>) -> Self {
        Self {
            demand,
            pending: None,
            completion,
            buffered: Bytes::new(),
            ending: false,
            done: false,
        }
    }

    /// Up to `max` bytes of the copy, or `None` at the end.
    ///
    /// `max` must be at least 1.
    pub async fn read(&mut self, max: usize) -> Result<Option<Bytes>> {
        if max == 0 {
            return Err(Error::InvalidUsage("read size must be at least 1".into()));
        }
        if self.buffered.is_empty() {
            match futures::future::poll_fn(|cx| self.poll_chunk(cx)).await {
                Some(Ok(chunk)) => self.buffered = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
        let take = max.min(self.buffered.len());
        Ok(Some(self.buffered.split_to(take)))
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            if let Some(pending) = &mut self.pending {
                let reply = ready!(Pin::new(pending).poll(cx));
                self.pending = None;
                match reply {
                    Ok(Ok(Some(chunk))) if !chunk.is_empty() => {
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    Ok(Ok(Some(_))) => {}
                    // end of data, or the operation stopped; its result decides
                    Ok(Ok(None) | Err(_)) | Err(_) => self.ending = true,
                }
            }
            if self.ending {
                let result = ready!(Pin::new(&mut self.completion).poll(cx));
                self.done = true;
                return Poll::Ready(result.err().map(Err));
            }
            let (tx, rx) = oneshot::channel();
            match self.demand.try_send(tx) {
                Ok(()) => self.pending = Some(rx),
                Err(_) => self.ending = true,
            }
        }
    }
}

impl Stream for CopyOutStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.buffered.is_empty() {
            return Poll::Ready(Some(Ok(std::mem::take(&mut self.buffered))));
        }
        self.poll_chunk(cx)
    }
}

impl futures::stream::FusedStream for CopyOutStream {
    fn is_terminated(&self) -> bool {
        self.done && self.buffered.is_empty()
    }
}

impl AsyncRead for CopyOutStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buffered.is_empty() {
            match ready!(self.poll_chunk(cx)) {
                Some(Ok(chunk)) => self.buffered = chunk,
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
        let take = buf.remaining().min(self.buffered.len());
        buf.put_slice(&self.buffered.split_to(take));
        Poll::Ready(Ok(()))
    }
}

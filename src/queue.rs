//! Strict FIFO access to a single resource.
//!
//! Every operation on a connection first takes a [`Ticket`] (synchronously, so a
//! closed queue rejects it on the spot) and then waits for its [`Turn`]. A turn
//! owns the resource; dropping it hands the resource to the next ticket in
//! submission order, whether the operation succeeded or not.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, watch};

use crate::error::{Error, Result};

struct State<T> {
    /// The resource while nobody holds a turn.
    idle: Option<T>,
    busy: bool,
    closed: bool,
    waiters: VecDeque<oneshot::Sender<Turn<T>>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    closed: watch::Sender<bool>,
    release: fn(T),
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct CommandQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CommandQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> CommandQueue<T> {
    /// A queue whose first turn is already taken, without a resource yet.
    ///
    /// The returned turn is expected to [`install`](Turn::install) the resource.
    /// `release` disposes of the resource once the queue is closed.
    pub(crate) fn new(release: fn(T)) -> (Self, Turn<T>) {
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                idle: None,
                busy: true,
                closed: false,
                waiters: VecDeque::new(),
            }),
            closed,
            release,
        });
        let turn = Turn::new(None, Arc::clone(&inner));
        (Self { inner }, turn)
    }

    /// Reserve the next place in line.
    pub(crate) fn enqueue(&self) -> Result<Ticket<T>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.busy {
            state.waiters.push_back(tx);
            tracing::trace!(waiting = state.waiters.len(), "operation queued");
        } else {
            state.busy = true;
            let resource = state.idle.take();
            if let Err(mut turn) = tx.send(Turn::new(resource, Arc::clone(&self.inner))) {
                // rx is alive until the end of this function
                state.idle = turn.disarm();
                state.busy = false;
            }
        }
        Ok(Ticket { rx })
    }

    /// Close the queue: fail every waiting ticket and release the idle resource.
    ///
    /// A resource held by a running turn is released when that turn ends.
    /// Returns `false` if the queue was already closed.
    pub(crate) fn close(&self) -> bool {
        let (waiters, idle) = {
            let mut state = self.inner.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            (std::mem::take(&mut state.waiters), state.idle.take())
        };
        tracing::trace!(failed = waiters.len(), "queue closed");
        drop(waiters);
        if let Some(resource) = idle {
            (self.inner.release)(resource);
        }
        self.inner.closed.send_replace(true);
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Resolves once the queue is closed.
    pub(crate) fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.closed.subscribe();
        async move {
            // the sender lives as long as the queue; an error means it is gone
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }
}

/// A reserved place in line.
pub(crate) struct Ticket<T> {
    rx: oneshot::Receiver<Turn<T>>,
}

impl<T> Ticket<T> {
    /// Wait until every earlier ticket has finished its turn.
    pub(crate) async fn turn(self) -> Result<Turn<T>> {
        self.rx.await.map_err(|_| Error::Closed)
    }
}

/// Exclusive use of the resource. Dropping it advances the queue.
pub(crate) struct Turn<T> {
    resource: Option<T>,
    inner: Option<Arc<Inner<T>>>,
}

impl<T> Turn<T> {
    fn new(resource: Option<T>, inner: Arc<Inner<T>>) -> Self {
        Self {
            resource,
            inner: Some(inner),
        }
    }

    /// Detach from the queue without advancing it.
    fn disarm(&mut self) -> Option<T> {
        self.inner = None;
        self.resource.take()
    }

    pub(crate) fn install(&mut self, resource: T) {
        self.resource = Some(resource);
    }

    #[cfg(test)]
    fn get(&self) -> Option<&T> {
        self.resource.as_ref()
    }

    /// The resource; `Closed` when there is none (connect failed or it was released).
    pub(crate) fn get_mut(&mut self) -> Result<&mut T> {
        self.resource.as_mut().ok_or(Error::Closed)
    }
}

impl<T> Drop for Turn<T> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let mut resource = self.resource.take();

        let mut state = inner.lock();
        if state.closed {
            state.busy = false;
            drop(state);
            if let Some(resource) = resource {
                (inner.release)(resource);
            }
            return;
        }
        while let Some(tx) = state.waiters.pop_front() {
            match tx.send(Turn::new(resource, Arc::clone(&inner))) {
                Ok(()) => {
                    tracing::trace!(waiting = state.waiters.len(), "queue advanced");
                    return;
                }
                // the ticket was dropped; try the next one
                Err(mut turn) => resource = turn.disarm(),
            }
        }
        state.idle = resource;
        state.busy = false;
    }
}

//! Completion of a queued operation.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Receives failures that have no caller left to return to, such as a panicking
/// completion callback.
pub trait ErrorObserver: Send + Sync {
    fn callback_failed(&self, error: &Error);
}

/// Reports to `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ErrorObserver for TracingObserver {
    fn callback_failed(&self, error: &Error) {
        tracing::error!(%error, "completion callback failed");
    }
}

impl<F> ErrorObserver for F
where
    F: Fn(&Error) + Send + Sync,
{
    fn callback_failed(&self, error: &Error) {
        self(error);
    }
}

/// The eventual result of a queued operation.
///
/// The operation runs whether or not the request is awaited; dropping the request
/// only discards the result.
#[must_use = "the result of the operation is lost unless the request is awaited"]
pub struct Request<R> {
    rx: oneshot::Receiver<Result<R>>,
    observer: Arc<dyn ErrorObserver>,
}

impl<R> Request<R> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<R>>, observer: Arc<dyn ErrorObserver>) -> Self {
        Self { rx, observer }
    }
}

impl<R: Send + 'static> Request<R> {
    /// Deliver the result to `callback` instead of awaiting it.
    ///
    /// A panic in `callback` is caught and handed to the connection's
    /// [`ErrorObserver`].
    pub fn on_complete<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<R>) + Send + 'static,
    {
        let observer = Arc::clone(&self.observer);
        tokio::spawn(async move {
            let result = self.await;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(result))) {
                observer.callback_failed(&Error::CallbackPanic(panic_message(payload.as_ref())));
            }
        })
    }
}

impl<R> Future for Request<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Closed)))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

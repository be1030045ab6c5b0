//! The connection facade.
//!
//! A [`Connection`] owns one [`Transport`] through a [`CommandQueue`]: every
//! operation takes its place in line when it is submitted and runs, on the tokio
//! runtime, only after everything submitted before it has completed. A COPY session
//! holds its place for the whole transfer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{oneshot, watch};

use crate::codec::{self, ParserRegistry, QueryResult, ResultConverter};
use crate::copy::copy_in::{self, CONNECTION_CLOSED};
use crate::copy::copy_out;
use crate::copy::{CopyInSink, CopyOutStream};
use crate::error::{Error, ErrorField, ErrorFields, Result};
use crate::opts::{ConnectionOptions, Opts};
use crate::queue::{CommandQueue, Ticket};
use crate::request::Request;
use crate::transport::{PgTransport, Transport};
use crate::value::Value;

#[derive(Debug, Clone)]
enum Phase {
    Connecting,
    Ready,
    Failed(Error),
    Closed,
}

fn lock<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Disposal of a transport that is no longer reachable through the queue.
fn release<T: Transport>(transport: T) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(transport.close());
        }
        Err(_) => drop(transport),
    }
}

struct Shared<T: Transport> {
    queue: CommandQueue<T>,
    phase: watch::Sender<Phase>,
    options: ConnectionOptions,
    /// Error fields of the latest completed operation.
    last_error: Mutex<Option<ErrorFields>>,
    /// No operation holds the transport and the transport can take a command.
    idle: AtomicBool,
    /// The running COPY FROM STDIN session, if any.
    copy_abort: Mutex<Option<Arc<copy_in::Shared>>>,
}

impl<T: Transport> Shared<T> {
    async fn run<R, F>(&self, ticket: Ticket<T>, op: F, done: oneshot::Sender<Result<R>>)
    where
        F: for<'t> FnOnce(&'t mut T) -> BoxFuture<'t, Result<R>>,
    {
        let mut turn = match ticket.turn().await {
            Ok(turn) => turn,
            Err(e) => {
                let _ = done.send(Err(e));
                return;
            }
        };
        let transport = match turn.get_mut() {
            Ok(transport) => transport,
            Err(e) => {
                let _ = done.send(Err(e));
                return;
            }
        };

        self.idle.store(false, Ordering::Release);
        let seen = transport.last_error().cloned();
        let result = tokio::select! {
            biased;
            () = self.queue.closed() => Err(Error::Closed),
            result = op(&mut *transport) => result,
        };
        let fresh = transport
            .last_error()
            .filter(|fields| seen.as_ref() != Some(*fields))
            .cloned();
        let has_code =
            fresh.is_some() && transport.last_error_field(ErrorField::SqlState).is_some();
        self.idle.store(transport.is_ready(), Ordering::Release);

        let result = result.map_err(|e| self.classify(e, fresh.clone(), has_code));
        *lock(&self.last_error) = match (&result, fresh) {
            (Ok(_), _) => None,
            (Err(Error::Server(fields)), _) => Some(fields.clone()),
            (Err(_), fresh) => fresh,
        };
        if let Err(e) = &result
            && e.is_connection_broken()
            && self.shut_down()
        {
            tracing::debug!(error = %e, "connection lost");
        }

        let _ = done.send(result);
        drop(turn);
    }

    /// Pass through errors that carry a code, report `Closed` on a finished
    /// connection, and otherwise take the code from the server's latest error.
    fn classify(&self, error: Error, fresh: Option<ErrorFields>, has_code: bool) -> Error {
        if error.sqlstate().is_some() {
            return error;
        }
        if self.queue.is_closed() {
            return Error::Closed;
        }
        match fresh {
            Some(fields) if has_code => Error::Server(fields),
            _ => error,
        }
    }

    /// Close the queue and mark the connection closed. Returns `false` if it already was.
    fn shut_down(&self) -> bool {
        self.idle.store(false, Ordering::Release);
        let closed = self.queue.close();
        self.phase.send_if_modified(|phase| {
            let changed = !matches!(phase, Phase::Closed | Phase::Failed(_));
            if changed {
                *phase = Phase::Closed;
            }
            changed
        });
        closed
    }
}

impl<T: Transport> Drop for Shared<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Clears the abort hook when the copy session that installed it ends.
struct AbortHook<'a> {
    slot: &'a Mutex<Option<Arc<copy_in::Shared>>>,
    bridge: &'a Arc<copy_in::Shared>,
}

impl<'a> AbortHook<'a> {
    fn install(
        slot: &'a Mutex<Option<Arc<copy_in::Shared>>>,
        bridge: &'a Arc<copy_in::Shared>,
    ) -> Self {
        *lock(slot) = Some(Arc::clone(bridge));
        Self { slot, bridge }
    }
}

impl Drop for AbortHook<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().is_some_and(|b| Arc::ptr_eq(b, self.bridge)) {
            *slot = None;
        }
    }
}

/// Handle to a database connection that runs operations strictly one at a time,
/// in submission order.
///
/// Cloning is cheap; clones share the connection and its queue. Operations return
/// `Err(Error::Closed)` immediately once the connection is finished, and otherwise
/// a [`Request`] that resolves when the operation completes. Work runs on the
/// tokio runtime whether or not the request is awaited, so every constructor and
/// operation must be called from within a runtime.
///
/// ```no_run
/// use zero_pq::{Connection, Value};
///
/// # async fn demo() -> zero_pq::Result<()> {
/// let conn = Connection::open("postgres://postgres@localhost/app").await?;
/// let inserted = conn.exec_params(
///     "INSERT INTO t (a, b) VALUES ($1, $2)",
///     &[Value::from(1), Value::from("one")],
/// )?;
/// let rows = conn.exec("SELECT a, b FROM t")?;
/// assert_eq!(inserted.await?.rows_affected(), Some(1));
/// println!("{:?}", rows.await?.rows());
/// conn.finish();
/// # Ok(())
/// # }
/// ```
pub struct Connection<T: Transport = PgTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Connection<PgTransport> {
    /// Connect to a PostgreSQL server and wait until the session is ready.
    ///
    /// Accepts [`Opts`], a URL or a keyword/value connection string.
    pub async fn open<O>(opts: O) -> Result<Self>
    where
        O: TryInto<Opts>,
        Error: From<O::Error>,
    {
        Self::connect(opts.try_into()?).await
    }
}

impl<T: Transport> Connection<T> {
    /// Start connecting in the background.
    ///
    /// Connecting is the first queued operation, so work submitted right away runs
    /// once the connection is up. If connecting fails, that work fails with
    /// [`Error::Closed`] and [`ready`](Self::ready) reports the cause.
    pub fn new(config: T::Config, options: ConnectionOptions) -> Self {
        let (queue, mut turn) = CommandQueue::new(release::<T>);
        let (phase, _) = watch::channel(Phase::Connecting);
        let shared = Arc::new(Shared {
            queue,
            phase,
            options,
            last_error: Mutex::new(None),
            idle: AtomicBool::new(false),
            copy_abort: Mutex::new(None),
        });

        let task = Arc::clone(&shared);
        tokio::spawn(async move {
            let connected = tokio::select! {
                biased;
                () = task.queue.closed() => Err(Error::Closed),
                result = T::connect(config) => result,
            };
            match connected {
                Ok(transport) => {
                    task.idle.store(transport.is_ready(), Ordering::Release);
                    turn.install(transport);
                    task.phase.send_if_modified(|phase| {
                        let connecting = matches!(phase, Phase::Connecting);
                        if connecting {
                            *phase = Phase::Ready;
                        }
                        connecting
                    });
                }
                Err(e) => {
                    tracing::debug!(error = %e, "connect failed");
                    if let Error::Server(fields) = &e {
                        *lock(&task.last_error) = Some(fields.clone());
                    }
                    task.phase.send_if_modified(|phase| {
                        let connecting = matches!(phase, Phase::Connecting);
                        if connecting {
                            *phase = Phase::Failed(e);
                        }
                        connecting
                    });
                    task.queue.close();
                }
            }
            drop(turn);
        });

        Self { shared }
    }

    /// Connect with default [`ConnectionOptions`] and wait until ready.
    pub async fn connect(config: T::Config) -> Result<Self> {
        Self::connect_with(config, ConnectionOptions::default()).await
    }

    pub async fn connect_with(config: T::Config, options: ConnectionOptions) -> Result<Self> {
        let conn = Self::new(config, options);
        conn.ready().await?;
        Ok(conn)
    }

    /// Wait for the outcome of connecting.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.shared.phase.subscribe();
        let phase = rx
            .wait_for(|phase| !matches!(phase, Phase::Connecting))
            .await
            .map_err(|_closed| Error::Closed)?
            .clone();
        match phase {
            Phase::Ready => Ok(()),
            Phase::Failed(e) => Err(e),
            Phase::Connecting | Phase::Closed => Err(Error::Closed),
        }
    }

    /// Connected, with no operation running; a COPY session counts as running.
    pub fn is_ready(&self) -> bool {
        !self.shared.queue.is_closed()
            && matches!(*self.shared.phase.borrow(), Phase::Ready)
            && self.shared.idle.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Close the connection.
    ///
    /// A running COPY FROM STDIN is aborted, every queued operation fails with
    /// [`Error::Closed`] and the session is terminated. Calling it again does
    /// nothing.
    pub fn finish(&self) {
        let copy = lock(&self.shared.copy_abort).take();
        if let Some(bridge) = copy {
            bridge.abort(CONNECTION_CLOSED);
        }
        if self.shared.shut_down() {
            tracing::debug!("connection finished");
        }
    }

    /// The parser registry used for results of this connection.
    pub fn registry(&self) -> &ParserRegistry {
        &self.shared.options.registry
    }

    /// Quote `value` as a string literal.
    pub fn escape_literal(&self, value: impl ToString) -> String {
        codec::escape_literal(&value.to_string())
    }

    /// A field of the error reported by the latest completed operation.
    ///
    /// `None` once a later operation has succeeded.
    ///
    /// Symbolic names such as `"SQLSTATE"` parse into [`ErrorField`].
    pub fn result_error_field(&self, field: ErrorField) -> Option<String> {
        lock(&self.shared.last_error)
            .as_ref()
            .and_then(|fields| fields.field(field))
    }

    pub fn last_error(&self) -> Option<ErrorFields> {
        lock(&self.shared.last_error).clone()
    }

    fn submit<R, F>(&self, op: F) -> Result<Request<R>>
    where
        R: Send + 'static,
        F: for<'t> FnOnce(&'t mut T) -> BoxFuture<'t, Result<R>> + Send + 'static,
    {
        let ticket = self.shared.queue.enqueue()?;
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.run(ticket, op, tx).await });
        Ok(Request::new(rx, Arc::clone(&self.shared.options.observer)))
    }

    /// Run `command` with the simple query protocol.
    ///
    /// Several statements may be sent at once; the result of the last one is returned.
    pub fn exec(&self, command: impl Into<String>) -> Result<Request<QueryResult>> {
        let command = command.into();
        let registry = self.shared.options.registry.clone();
        self.submit(move |transport| {
            Box::pin(async move {
                let raw = transport.execute(&command, None).await?;
                ResultConverter::new(&registry).convert(raw)
            })
        })
    }

    /// Run `command` with `params` bound to `$1`, `$2`, ...
    pub fn exec_params(
        &self,
        command: impl Into<String>,
        params: &[Value],
    ) -> Result<Request<QueryResult>> {
        let command = command.into();
        let params = codec::params_to_sql(params);
        let registry = self.shared.options.registry.clone();
        self.submit(move |transport| {
            Box::pin(async move {
                let raw = transport.execute(&command, Some(&params)).await?;
                ResultConverter::new(&registry).convert(raw)
            })
        })
    }

    /// Create the prepared statement `name`.
    pub fn prepare(
        &self,
        name: impl Into<String>,
        command: impl Into<String>,
    ) -> Result<Request<()>> {
        let name = name.into();
        let command = command.into();
        self.submit(move |transport| {
            Box::pin(async move { transport.prepare(&name, &command).await })
        })
    }

    pub fn exec_prepared(
        &self,
        name: impl Into<String>,
        params: &[Value],
    ) -> Result<Request<QueryResult>> {
        let name = name.into();
        let params = codec::params_to_sql(params);
        let registry = self.shared.options.registry.clone();
        self.submit(move |transport| {
            Box::pin(async move {
                let raw = transport.execute_prepared(&name, &params).await?;
                ResultConverter::new(&registry).convert(raw)
            })
        })
    }

    /// Start `COPY ... FROM STDIN` and return the sink that feeds it.
    ///
    /// The copy occupies the connection until the sink is finished or aborted.
    pub fn copy_from_stream(
        &self,
        command: impl Into<String>,
        params: Option<&[Value]>,
    ) -> Result<CopyInSink> {
        let command = command.into();
        let params = params.map(codec::params_to_sql);
        let bridge = Arc::new(copy_in::Shared::default());
        let session = copy_in::Session::new(Arc::clone(&bridge));
        let shared = Arc::clone(&self.shared);
        let completion = self.submit(move |transport| {
            Box::pin(async move {
                let _hook = AbortHook::install(&shared.copy_abort, session.shared());
                copy_in::pump(transport, &command, params.as_deref(), &session).await
            })
        })?;
        Ok(CopyInSink::new(bridge, completion))
    }

    /// Start `COPY ... TO STDOUT` and return the stream of its data.
    pub fn copy_to_stream(&self, command: impl Into<String>) -> Result<CopyOutStream> {
        let command = command.into();
        let (demand, requests) = copy_out::channel();
        let completion = self.submit(move |transport| {
            Box::pin(async move { copy_out::serve(transport, &command, requests).await })
        })?;
        Ok(CopyOutStream::new(demand, completion))
    }
}

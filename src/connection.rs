use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;

use crate::backup::Backup;
use crate::error::DispatchError;
use crate::handle::{DbHandle, lock_recover};
use crate::resource::{ResourceCore, ResourceKind};
use crate::statement::Statement;
use crate::task::{Completion, Target, run_completion_loop, schedule_blocking, submit};

struct ConnState {
    pending: usize,
    /// Set once the native close has succeeded. Host-side liveness
    /// checks read this flag, never the handle mutex: an in-flight
    /// native call may hold that mutex for a long time, and the host
    /// context must not block on it.
    closed: bool,
    close_requested: bool,
    closing: bool,
    close_waiters: Vec<oneshot::Sender<Result<(), DispatchError>>>,
}

/// Shared connection state: the guarded native handle, the pending
/// operation counter, and the deferred-close bookkeeping.
///
/// Invariant: `pending` equals the number of in-flight batons whose
/// target belongs to this connection, and the native handle is never
/// freed while `pending > 0` — close requests that arrive earlier are
/// parked and performed by [`ConnectionCore::process`].
pub(crate) struct ConnectionCore {
    path: String,
    handle: Arc<DbHandle>,
    state: Mutex<ConnState>,
    completions: UnboundedSender<Completion>,
}

impl ConnectionCore {
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn handle(&self) -> &Arc<DbHandle> {
        &self.handle
    }

    pub(crate) fn completions(&self) -> UnboundedSender<Completion> {
        self.completions.clone()
    }

    /// Count one operation against this connection. Submissions are
    /// refused once a close has been requested, so the deferred close
    /// can never race work submitted after it.
    pub(crate) fn begin_operation(&self) -> Result<(), DispatchError> {
        let mut state = lock_recover(&self.state);
        if state.close_requested || state.closed {
            return Err(DispatchError::HandleClosed);
        }
        state.pending += 1;
        Ok(())
    }

    pub(crate) fn finish_operation(&self) {
        let mut state = lock_recover(&self.state);
        debug_assert!(state.pending > 0, "pending counter underflow");
        state.pending = state.pending.saturating_sub(1);
    }

    /// Drain step: perform a deferred close once no work is in flight.
    /// The `closing` flag keeps the native close from being spawned
    /// twice when completions race with a fresh close request.
    pub(crate) fn process(core: &Arc<ConnectionCore>) {
        {
            let mut state = lock_recover(&core.state);
            if !state.close_requested || state.closing {
                return;
            }
            if state.pending > 0 {
                tracing::debug!(pending = state.pending, "close deferred until pending work drains");
                return;
            }
            state.closing = true;
        }
        tracing::debug!(path = %core.path, "closing database handle");
        let core = Arc::clone(core);
        tokio::task::spawn_blocking(move || {
            let outcome = core.handle.close();
            let conn = Arc::clone(&core);
            let _ = core.completions.send(Completion::CloseDone { conn, outcome });
        });
    }

    /// Resolve every close waiter with the close outcome, exactly once
    /// per waiter. A failed native close leaves the handle in place and
    /// re-arms nothing; callers may retry.
    pub(crate) fn finish_close(&self, outcome: Result<(), DispatchError>) {
        let waiters = {
            let mut state = lock_recover(&self.state);
            state.closing = false;
            state.close_requested = false;
            if outcome.is_ok() {
                state.closed = true;
            }
            std::mem::take(&mut state.close_waiters)
        };
        if let Err(err) = &outcome {
            tracing::warn!(error = %err, "database close failed");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_recover(&self.state);
        f.debug_struct("ConnectionCore")
            .field("path", &self.path)
            .field("open", &!state.closed)
            .field("pending", &state.pending)
            .finish()
    }
}

/// Owned handle to one native database connection.
///
/// Cloning is cheap and every clone drives the same underlying handle.
/// All methods return immediately in the sense of the host thread: the
/// native call runs on a worker context and the future resolves when the
/// completion trailer has delivered the outcome.
#[derive(Clone)]
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    /// Open a database file (or URI; `rusqlite` opens with URI support
    /// enabled).
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the native open fails.
    pub async fn open(path: impl Into<String>) -> Result<Self, DispatchError> {
        let path = path.into();
        let opened = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || rusqlite::Connection::open(path))
                .await
                .map_err(|_| DispatchError::Disconnected("open task aborted"))??
        };
        Ok(Self::from_native(path, opened))
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the native open fails.
    pub async fn open_in_memory() -> Result<Self, DispatchError> {
        let opened = rusqlite::Connection::open_in_memory()?;
        Ok(Self::from_native(":memory:".to_owned(), opened))
    }

    fn from_native(path: String, conn: rusqlite::Connection) -> Self {
        let (completions, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_completion_loop(receiver));
        tracing::debug!(path = %path, "opened database");
        let core = Arc::new(ConnectionCore {
            path,
            handle: Arc::new(DbHandle::new(conn)),
            state: Mutex::new(ConnState {
                pending: 0,
                closed: false,
                close_requested: false,
                closing: false,
                close_waiters: Vec::new(),
            }),
            completions,
        });
        Self { core }
    }

    /// Execute a batch of SQL statements, returning no rows.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the handle is closed or the engine
    /// rejects any statement in the batch.
    pub async fn exec(&self, sql: &str) -> Result<(), DispatchError> {
        let sql = sql.to_owned();
        let handle = Arc::clone(&self.core.handle);
        submit(Target::Connection(Arc::clone(&self.core)), move |baton| {
            schedule_blocking(baton, move || {
                handle.with(|conn| {
                    conn.execute_batch(&sql)?;
                    Ok(())
                })
            })
        })
        .await
    }

    /// Compile `sql` on the worker side and hand back a reusable
    /// statement resource.
    ///
    /// The native statement lives in the connection's statement cache;
    /// each operation re-borrows it by SQL text.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the handle is closed or the SQL does
    /// not compile.
    pub async fn prepare(&self, sql: &str) -> Result<Statement, DispatchError> {
        let sql = Arc::new(sql.to_owned());
        let handle = Arc::clone(&self.core.handle);
        let to_compile = Arc::clone(&sql);
        submit(Target::Connection(Arc::clone(&self.core)), move |baton| {
            schedule_blocking(baton, move || {
                handle.with(|conn| {
                    conn.prepare_cached(to_compile.as_str())?;
                    Ok(())
                })
            })
        })
        .await?;
        let core = ResourceCore::new(ResourceKind::Statement, Arc::clone(&self.core));
        Ok(Statement::new(core, sql))
    }

    /// Run custom `rusqlite` logic against the guarded native handle on
    /// a worker context.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the handle is closed or the callback
    /// reports a native error.
    pub async fn with_native<T, F>(&self, func: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let handle = Arc::clone(&self.core.handle);
        submit(Target::Connection(Arc::clone(&self.core)), move |baton| {
            schedule_blocking(baton, move || {
                handle.with(|conn| func(conn).map_err(DispatchError::from))
            })
        })
        .await
    }

    /// Start an online backup of this database into `dest`.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if this connection is a private
    /// in-memory database or either side of the backup cannot be opened.
    pub async fn backup(&self, dest: impl Into<String>) -> Result<Backup, DispatchError> {
        Backup::initialize(&self.core, dest.into()).await
    }

    /// Request a close.
    ///
    /// Accepted at any time: when operations are in flight the close is
    /// deferred to the drain loop and this future resolves once the
    /// native handle has actually been closed. Closing an already-closed
    /// connection errors.
    ///
    /// # Errors
    /// Returns [`DispatchError::HandleClosed`] if already closed, or the
    /// native error if the engine refuses the close.
    pub async fn close(&self) -> Result<(), DispatchError> {
        let rx = {
            let mut state = lock_recover(&self.core.state);
            if state.closed {
                return Err(DispatchError::HandleClosed);
            }
            let (tx, rx) = oneshot::channel();
            state.close_requested = true;
            state.close_waiters.push(tx);
            rx
        };
        ConnectionCore::process(&self.core);
        rx.await
            .map_err(|_| DispatchError::Disconnected("close notification dropped"))?
    }

    /// Whether the native handle is still live. Reads host-side
    /// bookkeeping only, so it never waits on an in-flight native call.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !lock_recover(&self.core.state).closed
    }

    #[doc(hidden)]
    #[must_use]
    pub fn pending_ops_for_tests(&self) -> usize {
        lock_recover(&self.core.state).pending
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.core.path)
            .field("open", &self.is_open())
            .finish()
    }
}

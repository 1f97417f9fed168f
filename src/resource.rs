use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::connection::ConnectionCore;
use crate::error::DispatchError;
use crate::handle::lock_recover;

/// The kind of exclusive-use resource an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Statement,
    Backup,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Statement => f.write_str("statement"),
            ResourceKind::Backup => f.write_str("backup"),
        }
    }
}

/// Whether a finalize request could be performed immediately or was
/// deferred behind an in-flight operation.
pub(crate) enum FinalizeDisposition {
    Done,
    Deferred(oneshot::Receiver<()>),
}

struct ResourceState {
    prepared: bool,
    locked: bool,
    finalized: bool,
    finalize_requested: bool,
    finalize_waiters: Vec<oneshot::Sender<()>>,
}

/// Per-resource lock and lifecycle flags, shared by statements and
/// backups so the begin/end bookkeeping exists in exactly one place.
///
/// Lifecycle: `Prepared → {Locked ⇄ Unlocked} → Finalized`. `locked`
/// holds for the whole interval between submission and the completion
/// trailer; the `Locked → Unlocked` transition happens only inside
/// [`ResourceCore::end_operation`].
pub(crate) struct ResourceCore {
    kind: ResourceKind,
    conn: Arc<ConnectionCore>,
    state: Mutex<ResourceState>,
}

impl ResourceCore {
    /// Resources are handed to callers only once their native
    /// counterpart is ready, so they start in the prepared state.
    pub(crate) fn new(kind: ResourceKind, conn: Arc<ConnectionCore>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            conn,
            state: Mutex::new(ResourceState {
                prepared: true,
                locked: false,
                finalized: false,
                finalize_requested: false,
                finalize_waiters: Vec::new(),
            }),
        })
    }

    pub(crate) fn connection(&self) -> &Arc<ConnectionCore> {
        &self.conn
    }

    /// Acquire the resource for one operation and count it against the
    /// owning connection.
    ///
    /// Finalized and busy resources reject the submission; an
    /// unprepared resource here would be a bookkeeping bug, since
    /// resources are only handed out prepared.
    pub(crate) fn begin_operation(&self) -> Result<(), DispatchError> {
        {
            let mut state = lock_recover(&self.state);
            debug_assert!(state.prepared, "operation submitted on an unprepared resource");
            if state.finalized {
                return Err(DispatchError::Finalized(self.kind));
            }
            if state.locked {
                return Err(DispatchError::Busy(self.kind));
            }
            state.locked = true;
        }
        if let Err(err) = self.conn.begin_operation() {
            lock_recover(&self.state).locked = false;
            return Err(err);
        }
        Ok(())
    }

    /// The mandatory completion trailer: unlock, decrement the pending
    /// counter, then run the resource and connection drains.
    pub(crate) fn end_operation(&self) {
        {
            let mut state = lock_recover(&self.state);
            debug_assert!(state.locked, "completion trailer ran on an unlocked resource");
            state.locked = false;
        }
        self.conn.finish_operation();
        self.process();
        ConnectionCore::process(&self.conn);
    }

    /// Request the terminal transition. Performed immediately when the
    /// resource is idle, otherwise deferred to the drain step.
    pub(crate) fn request_finalize(&self) -> FinalizeDisposition {
        let mut state = lock_recover(&self.state);
        if state.finalized {
            return FinalizeDisposition::Done;
        }
        if !state.locked {
            state.finalized = true;
            tracing::debug!(kind = %self.kind, "resource finalized");
            return FinalizeDisposition::Done;
        }
        let (tx, rx) = oneshot::channel();
        state.finalize_requested = true;
        state.finalize_waiters.push(tx);
        FinalizeDisposition::Deferred(rx)
    }

    /// Drain step: perform a deferred finalize once the lock is free.
    fn process(&self) {
        let waiters = {
            let mut state = lock_recover(&self.state);
            if !state.finalize_requested || state.locked {
                return;
            }
            state.finalize_requested = false;
            state.finalized = true;
            std::mem::take(&mut state.finalize_waiters)
        };
        tracing::debug!(kind = %self.kind, "deferred finalize performed");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

impl fmt::Debug for ResourceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_recover(&self.state);
        f.debug_struct("ResourceCore")
            .field("kind", &self.kind)
            .field("locked", &state.locked)
            .field("finalized", &state.finalized)
            .finish()
    }
}

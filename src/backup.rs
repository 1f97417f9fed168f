use std::fmt;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;

use rusqlite::backup::{Backup as NativeBackup, StepResult};

use crate::connection::ConnectionCore;
use crate::error::{DispatchError, ErrorRecord};
use crate::handle::{DbHandle, lock_recover};
use crate::resource::{FinalizeDisposition, ResourceCore, ResourceKind};
use crate::task::{Baton, Target, schedule_blocking, submit};

/// Progress of an online backup after a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepProgress {
    /// Whether the backup has copied every page.
    pub done: bool,
    /// Pages still to be copied.
    pub remaining: i32,
    /// Total pages in the source database, as of the last step.
    pub page_count: i32,
}

enum BackupCommand {
    Step {
        pages: i32,
        baton: Baton<StepProgress>,
    },
    Shutdown,
}

/// Command channel to the worker thread that owns the native backup
/// object. The native type borrows both connections, so it lives on one
/// thread for its whole life and steps are routed to it, the same way a
/// long-lived native transaction would be.
struct BackupWorker {
    sender: Sender<BackupCommand>,
}

impl Drop for BackupWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(BackupCommand::Shutdown);
    }
}

struct BackupInner {
    core: Arc<ResourceCore>,
    worker: BackupWorker,
    last: Mutex<StepProgress>,
}

/// An online backup resource.
///
/// Stepping locks the backup the way statement operations lock their
/// statement: one step in flight at a time, busy submissions rejected.
/// `finish` is terminal and deferred while a step is in flight.
///
/// The backup reads through its own handle on the source database (the
/// native backup object cannot share the guarded handle), so backing up
/// an in-memory database requires a shared-cache URI. Liveness still
/// follows the owning connection: once it closes, steps fail with
/// [`DispatchError::HandleClosed`].
#[derive(Clone)]
pub struct Backup {
    inner: Arc<BackupInner>,
}

impl Backup {
    pub(crate) async fn initialize(
        conn: &Arc<ConnectionCore>,
        dest: String,
    ) -> Result<Self, DispatchError> {
        if conn.path() == ":memory:" {
            return Err(DispatchError::Config(
                "cannot back up a private in-memory database; open it with a shared-cache URI"
                    .into(),
            ));
        }
        let src_path = conn.path().to_owned();
        let src_handle = Arc::clone(conn.handle());
        let sender = submit(Target::Connection(Arc::clone(conn)), move |baton| {
            schedule_blocking(baton, move || spawn_worker(src_path, dest, src_handle))
        })
        .await?;

        let core = ResourceCore::new(ResourceKind::Backup, Arc::clone(conn));
        Ok(Self {
            inner: Arc::new(BackupInner {
                core,
                worker: BackupWorker { sender },
                last: Mutex::new(StepProgress::default()),
            }),
        })
    }

    /// Copy up to `pages` pages (negative copies everything left).
    ///
    /// `SQLITE_BUSY` and `SQLITE_LOCKED` surface as native errors; the
    /// backup stays usable and the caller decides whether to retry.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the backup is busy or finished, the
    /// owning connection is closed, or the engine reports a failure.
    pub async fn step(&self, pages: i32) -> Result<StepProgress, DispatchError> {
        let sender = self.inner.worker.sender.clone();
        let progress = submit(Target::Resource(Arc::clone(&self.inner.core)), move |baton| {
            sender
                .send(BackupCommand::Step { pages, baton })
                .map_err(|_| DispatchError::Disconnected("backup worker is gone"))
        })
        .await?;
        *lock_recover(&self.inner.last) = progress;
        Ok(progress)
    }

    /// Pages left to copy, as of the last completed step.
    #[must_use]
    pub fn remaining(&self) -> i32 {
        lock_recover(&self.inner.last).remaining
    }

    /// Source page count, as of the last completed step.
    #[must_use]
    pub fn page_count(&self) -> i32 {
        lock_recover(&self.inner.last).page_count
    }

    /// Mark the backup terminal and release the native backup object.
    /// Deferred while a step is in flight. Finishing twice is a no-op.
    ///
    /// # Errors
    /// Returns [`DispatchError::Disconnected`] if the completion loop is
    /// gone before the deferred finish is performed.
    pub async fn finish(&self) -> Result<(), DispatchError> {
        match self.inner.core.request_finalize() {
            FinalizeDisposition::Done => {}
            FinalizeDisposition::Deferred(rx) => rx
                .await
                .map_err(|_| DispatchError::Disconnected("finish notification dropped"))?,
        }
        let _ = self.inner.worker.sender.send(BackupCommand::Shutdown);
        Ok(())
    }
}

impl fmt::Debug for Backup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = *lock_recover(&self.inner.last);
        f.debug_struct("Backup")
            .field("done", &last.done)
            .field("remaining", &last.remaining)
            .finish()
    }
}

fn spawn_worker(
    src_path: String,
    dest: String,
    src_handle: Arc<DbHandle>,
) -> Result<Sender<BackupCommand>, DispatchError> {
    let (sender, receiver) = channel::<BackupCommand>();
    let (ready_tx, ready_rx) = channel::<Result<(), DispatchError>>();
    thread::Builder::new()
        .name("sqlite-backup".into())
        .spawn(move || run_backup_worker(&src_path, &dest, &src_handle, &receiver, &ready_tx))
        .map_err(|err| {
            DispatchError::Config(format!("failed to spawn backup worker thread: {err}"))
        })?;
    match ready_rx.recv() {
        Ok(Ok(())) => Ok(sender),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(DispatchError::Disconnected(
            "backup worker exited before initializing",
        )),
    }
}

fn run_backup_worker(
    src_path: &str,
    dest: &str,
    src_handle: &Arc<DbHandle>,
    receiver: &Receiver<BackupCommand>,
    ready: &Sender<Result<(), DispatchError>>,
) {
    // The backup object borrows both connections, so all three live on
    // this thread's stack until shutdown.
    let src = match rusqlite::Connection::open(src_path) {
        Ok(conn) => conn,
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return;
        }
    };
    let mut dst = match rusqlite::Connection::open(dest) {
        Ok(conn) => conn,
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return;
        }
    };
    let backup = match NativeBackup::new(&src, &mut dst) {
        Ok(backup) => backup,
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    tracing::debug!(dest, "backup worker started");

    while let Ok(command) = receiver.recv() {
        match command {
            BackupCommand::Shutdown => break,
            BackupCommand::Step { pages, baton } => {
                // The owning connection may have closed since this step
                // was queued; its guard is the liveness authority.
                if !src_handle.is_open() {
                    baton.finish(Err(DispatchError::HandleClosed));
                    continue;
                }
                baton.finish(step_once(&backup, pages));
            }
        }
    }
    tracing::debug!(dest, "backup worker stopped");
}

fn step_once(backup: &NativeBackup<'_, '_>, pages: i32) -> Result<StepProgress, DispatchError> {
    let step = backup.step(pages)?;
    let progress = backup.progress();
    match step {
        StepResult::Done => Ok(StepProgress {
            done: true,
            remaining: progress.remaining,
            page_count: progress.pagecount,
        }),
        StepResult::More => Ok(StepProgress {
            done: false,
            remaining: progress.remaining,
            page_count: progress.pagecount,
        }),
        StepResult::Busy => Err(DispatchError::Native(ErrorRecord::new(
            rusqlite::ffi::SQLITE_BUSY,
            "database is busy",
        ))),
        StepResult::Locked => Err(DispatchError::Native(ErrorRecord::new(
            rusqlite::ffi::SQLITE_LOCKED,
            "database table is locked",
        ))),
        _ => unreachable!("rusqlite StepResult has an unhandled variant"),
    }
}

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::oneshot;

use crate::error::{DispatchError, ErrorRecord};

use super::baton::{Baton, Target};
use super::dispatcher::run_trailer;

/// Submit one operation against a target.
///
/// Bookkeeping happens here on the submitting (host) task: the resource
/// lock is taken and the connection's pending counter incremented before
/// `schedule` hands the baton to a worker context. If scheduling itself
/// fails the bookkeeping is rolled back and the error surfaces
/// immediately; otherwise the caller's continuation resumes when the
/// completion loop delivers the outcome. Every submission resolves
/// exactly once.
pub(crate) async fn submit<T, S>(target: Target, schedule: S) -> Result<T, DispatchError>
where
    T: Send + 'static,
    S: FnOnce(Baton<T>) -> Result<(), DispatchError>,
{
    match &target {
        Target::Resource(resource) => resource.begin_operation()?,
        Target::Connection(conn) => conn.begin_operation()?,
    }

    let (tx, rx) = oneshot::channel();
    let baton = Baton::new(target.clone(), tx);
    if let Err(err) = schedule(baton) {
        run_trailer(&target);
        return Err(err);
    }

    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(DispatchError::Disconnected(
            "completion loop dropped before delivering a result",
        )),
    }
}

/// Run `execute` on the blocking worker pool.
///
/// `execute` must not touch host-side state; it captures every failure,
/// panics included, into the baton's error slot so the completion
/// trailer always runs.
pub(crate) fn schedule_blocking<T, F>(baton: Baton<T>, execute: F) -> Result<(), DispatchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DispatchError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let outcome = catch_unwind(AssertUnwindSafe(execute)).unwrap_or_else(|_| {
            Err(DispatchError::Native(ErrorRecord::new(
                rusqlite::ffi::SQLITE_INTERNAL,
                "operation panicked on the worker thread",
            )))
        });
        baton.finish(outcome);
    });
    Ok(())
}

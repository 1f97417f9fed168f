use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::DispatchError;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The guarded native connection handle.
///
/// The pointer slot is nulled on close, and every access goes through
/// [`DbHandle::with`], so a close racing with an in-flight operation can
/// never hand out a freed handle: the loser of the race observes the
/// empty slot and fails with [`DispatchError::HandleClosed`].
pub(crate) struct DbHandle {
    conn: Mutex<Option<rusqlite::Connection>>,
}

impl DbHandle {
    pub(crate) fn new(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }

    /// Run `f` against the live handle under the connection mutex.
    ///
    /// The mutex is released on every exit path, including panics in `f`.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let guard = lock_recover(&self.conn);
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(DispatchError::HandleClosed),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        lock_recover(&self.conn).is_some()
    }

    /// Take the handle out and close it. On failure the handle is put
    /// back, so a close that the engine refuses leaves the connection
    /// usable.
    pub(crate) fn close(&self) -> Result<(), DispatchError> {
        let mut guard = lock_recover(&self.conn);
        let Some(conn) = guard.take() else {
            return Err(DispatchError::HandleClosed);
        };
        match conn.close() {
            Ok(()) => Ok(()),
            Err((conn, err)) => {
                *guard = Some(conn);
                Err(err.into())
            }
        }
    }
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle")
            .field("open", &self.is_open())
            .finish()
    }
}

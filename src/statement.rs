use std::fmt;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::resource::{FinalizeDisposition, ResourceCore};
use crate::task::{Target, schedule_blocking, submit};
use crate::value::{Row, Rows, Value, to_sqlite_values};

/// Outcome of a statement executed for its side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    /// Rows changed by the statement.
    pub changes: usize,
    /// Rowid of the most recent successful insert on this connection.
    pub last_insert_rowid: i64,
}

/// A prepared statement resource.
///
/// Exactly one operation may be in flight per statement; a submission
/// against a busy statement is rejected with [`DispatchError::Busy`]
/// rather than queued. Clones share the same lock.
#[derive(Clone)]
pub struct Statement {
    core: Arc<ResourceCore>,
    sql: Arc<String>,
}

impl Statement {
    pub(crate) fn new(core: Arc<ResourceCore>, sql: Arc<String>) -> Self {
        Self { core, sql }
    }

    /// The SQL text this statement was prepared from.
    #[must_use]
    pub fn sql(&self) -> &str {
        self.sql.as_str()
    }

    /// Execute the statement for its side effects.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the statement is busy or finalized,
    /// the handle is closed, or the engine reports a failure.
    pub async fn run(&self, params: &[Value]) -> Result<RunResult, DispatchError> {
        let sql = Arc::clone(&self.sql);
        let values = to_sqlite_values(params);
        let handle = Arc::clone(self.core.connection().handle());
        submit(Target::Resource(Arc::clone(&self.core)), move |baton| {
            schedule_blocking(baton, move || {
                handle.with(|conn| {
                    let mut stmt = conn.prepare_cached(sql.as_str())?;
                    let refs = as_tosql(&values);
                    let changes = stmt.execute(&refs[..])?;
                    Ok(RunResult {
                        changes,
                        last_insert_rowid: conn.last_insert_rowid(),
                    })
                })
            })
        })
        .await
    }

    /// Execute the statement and return its first row, if any.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the statement is busy or finalized,
    /// the handle is closed, or the engine reports a failure.
    pub async fn get(&self, params: &[Value]) -> Result<Option<Row>, DispatchError> {
        let sql = Arc::clone(&self.sql);
        let values = to_sqlite_values(params);
        let handle = Arc::clone(self.core.connection().handle());
        submit(Target::Resource(Arc::clone(&self.core)), move |baton| {
            schedule_blocking(baton, move || {
                handle.with(|conn| {
                    let mut stmt = conn.prepare_cached(sql.as_str())?;
                    let columns = column_names(&stmt);
                    let refs = as_tosql(&values);
                    let mut rows = stmt.query(&refs[..])?;
                    match rows.next()? {
                        Some(row) => Ok(Some(read_row(row, &columns)?)),
                        None => Ok(None),
                    }
                })
            })
        })
        .await
    }

    /// Execute the statement and materialize every row.
    ///
    /// # Errors
    /// Returns [`DispatchError`] if the statement is busy or finalized,
    /// the handle is closed, or the engine reports a failure.
    pub async fn all(&self, params: &[Value]) -> Result<Rows, DispatchError> {
        let sql = Arc::clone(&self.sql);
        let values = to_sqlite_values(params);
        let handle = Arc::clone(self.core.connection().handle());
        submit(Target::Resource(Arc::clone(&self.core)), move |baton| {
            schedule_blocking(baton, move || {
                handle.with(|conn| {
                    let mut stmt = conn.prepare_cached(sql.as_str())?;
                    let columns = column_names(&stmt);
                    let refs = as_tosql(&values);
                    let mut rows = stmt.query(&refs[..])?;
                    let mut out = Rows::new(Arc::clone(&columns));
                    while let Some(row) = rows.next()? {
                        out.push(read_row(row, &columns)?);
                    }
                    Ok(out)
                })
            })
        })
        .await
    }

    /// Mark the statement terminal. Deferred while an operation is in
    /// flight; resolves once the statement is actually finalized.
    /// Finalizing twice is a no-op. The native statement is reclaimed by
    /// the connection's statement cache.
    ///
    /// # Errors
    /// Returns [`DispatchError::Disconnected`] if the completion loop is
    /// gone before the deferred finalize is performed.
    pub async fn finalize(&self) -> Result<(), DispatchError> {
        match self.core.request_finalize() {
            FinalizeDisposition::Done => Ok(()),
            FinalizeDisposition::Deferred(rx) => rx
                .await
                .map_err(|_| DispatchError::Disconnected("finalize notification dropped")),
        }
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement").field("sql", &self.sql).finish()
    }
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Arc<Vec<String>> {
    Arc::new(
        stmt.column_names()
            .iter()
            .map(|name| (*name).to_string())
            .collect(),
    )
}

fn as_tosql(values: &[rusqlite::types::Value]) -> Vec<&dyn rusqlite::ToSql> {
    values.iter().map(|v| v as &dyn rusqlite::ToSql).collect()
}

fn read_row(row: &rusqlite::Row<'_>, columns: &Arc<Vec<String>>) -> Result<Row, DispatchError> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        let value: rusqlite::types::Value = row.get(idx)?;
        values.push(Value::from_sqlite(value));
    }
    Ok(Row::new(Arc::clone(columns), values))
}

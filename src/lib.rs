//! Asynchronous task dispatch for a single native `SQLite` handle.
//!
//! This crate is the execution core for embedding `SQLite` in a
//! single-threaded scripting host: long-running operations (statement
//! execution, online-backup stepping) run off the host thread, while
//! per-resource locks and a per-connection pending counter keep work on
//! the same handle mutually exclusive and drained in a well-defined
//! order. Deferred terminal actions (close a connection while work is in
//! flight, finalize a statement mid-operation) are performed by the drain
//! step once they become safe.
//!
//! ```no_run
//! use sqlite_dispatch::{Connection, Value};
//!
//! # async fn demo() -> Result<(), sqlite_dispatch::DispatchError> {
//! let db = Connection::open("app.db").await?;
//! db.exec("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, name TEXT)")
//!     .await?;
//! let stmt = db.prepare("INSERT INTO t (name) VALUES (?1)").await?;
//! let result = stmt.run(&[Value::Text("alice".into())]).await?;
//! assert_eq!(result.changes, 1);
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub use rusqlite;

mod backup;
mod codes;
mod connection;
mod error;
mod handle;
mod resource;
mod statement;
mod task;
mod value;

pub use backup::{Backup, StepProgress};
pub use codes::code_string;
pub use connection::Connection;
pub use error::{DispatchError, ErrorRecord};
pub use resource::ResourceKind;
pub use statement::{RunResult, Statement};
pub use value::{Row, Rows, Value};

use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use sqlite_dispatch::rusqlite::functions::FunctionFlags;
use sqlite_dispatch::{Connection, DispatchError};

async fn install_gate(db: &Connection) -> (Arc<Mutex<Receiver<()>>>, Sender<()>) {
    let (entered_tx, entered_rx) = channel::<()>();
    let (release_tx, release_rx) = channel::<()>();
    let gate = Mutex::new((entered_tx, release_rx));
    db.with_native(move |conn| {
        conn.create_scalar_function("test_gate", 0, FunctionFlags::SQLITE_UTF8, move |_ctx| {
            let guard = gate.lock().expect("gate lock");
            let _ = guard.0.send(());
            let _ = guard.1.recv();
            Ok(1i64)
        })
    })
    .await
    .expect("install gate function");
    (Arc::new(Mutex::new(entered_rx)), release_tx)
}

#[tokio::test(flavor = "current_thread")]
async fn finalize_idle_statement_is_immediate() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open_in_memory().await?;
    db.exec("CREATE TABLE t (x)").await?;
    let stmt = db.prepare("INSERT INTO t (x) VALUES (1)").await?;

    stmt.finalize().await?;
    let err = stmt.run(&[]).await.unwrap_err();
    assert!(matches!(err, DispatchError::Finalized(_)));
    assert_eq!(err.code(), 21);

    // Terminal state; a second finalize is a no-op.
    stmt.finalize().await?;

    // A finalized statement does not block the connection.
    db.close().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn finalize_deferred_while_operation_in_flight() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open_in_memory().await?;
    let (entered, release) = install_gate(&db).await;
    let stmt = db.prepare("SELECT test_gate()").await?;

    let slow = {
        let stmt = stmt.clone();
        tokio::spawn(async move { stmt.all(&[]).await })
    };
    {
        let rx = Arc::clone(&entered);
        tokio::task::spawn_blocking(move || rx.lock().expect("entered lock").recv()).await??;
    }

    let finalize = {
        let stmt = stmt.clone();
        tokio::spawn(async move { stmt.finalize().await })
    };
    tokio::task::yield_now().await;

    // The in-flight operation is not interrupted by the finalize request.
    release.send(())?;
    let rows = slow.await??;
    assert_eq!(rows.len(), 1);

    finalize.await??;
    let err = stmt.get(&[]).await.unwrap_err();
    assert!(matches!(err, DispatchError::Finalized(_)));

    db.close().await?;
    Ok(())
}

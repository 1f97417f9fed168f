use sqlite_dispatch::{Connection, DispatchError, Value};
use tempfile::tempdir;

fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    // Leak the tempdir so the file persists for the duration of the test binary.
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

async fn seed_rows(db: &Connection, count: i64) -> Result<(), DispatchError> {
    db.exec("CREATE TABLE big (id INTEGER PRIMARY KEY, payload TEXT NOT NULL)")
        .await?;
    let insert = db.prepare("INSERT INTO big (id, payload) VALUES (?1, ?2)").await?;
    for i in 0..count {
        insert
            .run(&[Value::Int(i), Value::Text(format!("payload-{i:0>48}"))])
            .await?;
    }
    insert.finalize().await
}

#[tokio::test(flavor = "current_thread")]
async fn incremental_backup_to_completion() -> Result<(), Box<dyn std::error::Error>> {
    let src_path = unique_db_path("backup-src");
    let dest_path = unique_db_path("backup-dst");
    let db = Connection::open(src_path).await?;
    seed_rows(&db, 500).await?;

    let backup = db.backup(dest_path.clone()).await?;
    let first = backup.step(1).await?;
    assert!(!first.done);
    assert!(first.page_count > 1);
    assert_eq!(first.remaining, first.page_count - 1);
    assert_eq!(backup.remaining(), first.remaining);
    assert_eq!(backup.page_count(), first.page_count);

    let mut last = first;
    while !last.done {
        last = backup.step(4).await?;
    }
    assert_eq!(last.remaining, 0);
    assert_eq!(backup.remaining(), 0);
    assert!(backup.page_count() >= first.page_count);

    backup.finish().await?;
    let err = backup.step(1).await.unwrap_err();
    assert!(matches!(err, DispatchError::Finalized(_)));

    let dst = Connection::open(dest_path).await?;
    let count = dst.prepare("SELECT count(*) FROM big").await?;
    let row = count.get(&[]).await?.expect("count row");
    assert_eq!(row.get(0).unwrap().as_int(), Some(500));
    dst.close().await?;
    db.close().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn whole_backup_in_one_step() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open(unique_db_path("backup-one-src")).await?;
    seed_rows(&db, 50).await?;
    let dest_path = unique_db_path("backup-one-dst");

    let backup = db.backup(dest_path.clone()).await?;
    let progress = backup.step(-1).await?;
    assert!(progress.done);
    assert_eq!(progress.remaining, 0);
    backup.finish().await?;

    let dst = Connection::open(dest_path).await?;
    let count = dst.prepare("SELECT count(*) FROM big").await?;
    let row = count.get(&[]).await?.expect("count row");
    assert_eq!(row.get(0).unwrap().as_int(), Some(50));
    dst.close().await?;
    db.close().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn step_after_source_close_fails_closed() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open(unique_db_path("backup-closed-src")).await?;
    seed_rows(&db, 50).await?;

    let backup = db.backup(unique_db_path("backup-closed-dst")).await?;
    db.close().await?;

    let err = backup.step(1).await.unwrap_err();
    assert!(matches!(err, DispatchError::HandleClosed));
    backup.finish().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn private_memory_database_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open_in_memory().await?;
    let err = db.backup(unique_db_path("backup-mem-dst")).await.unwrap_err();
    assert!(matches!(err, DispatchError::Config(_)));
    db.close().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn shared_cache_memory_database_backs_up() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open("file:backup_shared_mem?mode=memory&cache=shared").await?;
    seed_rows(&db, 25).await?;
    let dest_path = unique_db_path("backup-shared-dst");

    let backup = db.backup(dest_path.clone()).await?;
    let progress = backup.step(-1).await?;
    assert!(progress.done);
    backup.finish().await?;
    db.close().await?;

    let dst = Connection::open(dest_path).await?;
    let count = dst.prepare("SELECT count(*) FROM big").await?;
    let row = count.get(&[]).await?.expect("count row");
    assert_eq!(row.get(0).unwrap().as_int(), Some(25));
    dst.close().await?;
    Ok(())
}

use sqlite_dispatch::{Connection, DispatchError, Value};
use tempfile::tempdir;

fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    // Leak the tempdir so the file persists for the duration of the test binary.
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

#[tokio::test(flavor = "current_thread")]
async fn open_exec_query_close() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open(unique_db_path("roundtrip")).await?;
    db.exec(
        "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL);
         INSERT INTO people (name, score) VALUES ('alice', 1.5), ('bob', 2.5);",
    )
    .await?;

    let insert = db
        .prepare("INSERT INTO people (name, score) VALUES (?1, ?2)")
        .await?;
    let result = insert
        .run(&[Value::Text("carol".into()), Value::Float(3.5)])
        .await?;
    assert_eq!(result.changes, 1);
    assert_eq!(result.last_insert_rowid, 3);

    let all = db
        .prepare("SELECT id, name, score FROM people ORDER BY id")
        .await?;
    let rows = all.all(&[]).await?;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows.columns(), &["id", "name", "score"][..]);
    let names: Vec<&str> = rows
        .iter()
        .map(|row| row.get_named("name").unwrap().as_text().unwrap())
        .collect();
    assert_eq!(names, ["alice", "bob", "carol"]);

    let one = db
        .prepare("SELECT name FROM people WHERE score > ?1 ORDER BY score")
        .await?;
    let row = one.get(&[Value::Float(2.0)]).await?.expect("matching row");
    assert_eq!(row.get(0).unwrap().as_text(), Some("bob"));
    assert!(one.get(&[Value::Float(99.0)]).await?.is_none());

    assert!(db.is_open());
    db.close().await?;
    assert!(!db.is_open());

    // Operations on a closed handle still resolve, with the dedicated error.
    let err = db.exec("SELECT 1").await.unwrap_err();
    assert!(matches!(err, DispatchError::HandleClosed));
    let err = insert
        .run(&[Value::Text("dave".into()), Value::Null])
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::HandleClosed));
    let err = db.close().await.unwrap_err();
    assert!(matches!(err, DispatchError::HandleClosed));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn in_memory_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open_in_memory().await?;
    db.exec("CREATE TABLE t (x INTEGER)").await?;
    let insert = db.prepare("INSERT INTO t (x) VALUES (?1)").await?;
    for i in 0..5 {
        insert.run(&[Value::Int(i)]).await?;
    }
    let sum = db.prepare("SELECT sum(x) FROM t").await?;
    let row = sum.get(&[]).await?.expect("aggregate row");
    assert_eq!(row.get(0).unwrap().as_int(), Some(10));
    db.close().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn stores_blobs_and_nulls() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open_in_memory().await?;
    db.exec("CREATE TABLE blobs (data BLOB, note TEXT)").await?;
    let insert = db.prepare("INSERT INTO blobs (data, note) VALUES (?1, ?2)").await?;
    insert.run(&[Value::Blob(vec![0, 1, 2, 255]), Value::Null]).await?;

    let select = db.prepare("SELECT data, note FROM blobs").await?;
    let row = select.get(&[]).await?.expect("stored row");
    assert_eq!(row.get(0).unwrap().as_blob(), Some(&[0u8, 1, 2, 255][..]));
    assert!(row.get(1).unwrap().is_null());
    db.close().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn prepare_rejects_invalid_sql() -> Result<(), Box<dyn std::error::Error>> {
    let db = Connection::open_in_memory().await?;
    let err = db.prepare("SELECT FROM WHERE").await.unwrap_err();
    assert!(matches!(err, DispatchError::Native(_)));
    db.close().await?;
    Ok(())
}

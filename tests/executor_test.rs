//! Integration tests for statement execution and row scanning on SQLite.

use std::time::Duration;
use tempfile::TempDir;
use txscope::{ConnectionSet, Context, DbError, DbPool, MainDb, Row, Value, params};

async fn setup() -> (TempDir, ConnectionSet) {
    let dir = tempfile::tempdir().unwrap();
    let primary = format!("sqlite:{}", dir.path().join("primary.db").display());
    let replica = format!("sqlite:{}", dir.path().join("replica.db").display());
    let set = ConnectionSet::open(&primary, &replica, "test").await.unwrap();

    let db = set.main();
    let ctx = Context::background();
    db.execute(
        &ctx,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL, avatar BLOB)",
        &params! {},
    )
    .await
    .unwrap();
    for (id, name) in [(1, "alice"), (2, "bob")] {
        db.execute(
            &ctx,
            "INSERT INTO users (id, name, score) VALUES (:id, :name, :score)",
            &params! { "id" => id, "name" => name, "score" => 1.5 },
        )
        .await
        .unwrap();
    }

    (dir, set)
}

async fn user_count(db: &MainDb) -> i64 {
    let (n,): (i64,) = db
        .query_row(&Context::background(), "SELECT COUNT(*) FROM users", &params! {})
        .await
        .unwrap();
    n
}

#[tokio::test]
async fn test_query_row_decodes_column_types() {
    let (_dir, set) = setup().await;
    let db = set.main();
    let ctx = Context::background();

    db.execute(
        &ctx,
        "UPDATE users SET avatar = :avatar WHERE id = :id",
        &params! { "avatar" => vec![0u8, 1, 2], "id" => 1 },
    )
    .await
    .unwrap();

    let row: Row = db
        .query_row(
            &ctx,
            "SELECT id, name, score, avatar, NULL AS missing FROM users WHERE id = :id",
            &params! { "id" => 1 },
        )
        .await
        .unwrap();

    assert_eq!(row.columns(), ["id", "name", "score", "avatar", "missing"]);
    assert_eq!(row.get(0), Some(&Value::Int(1)));
    assert_eq!(row.get_by_name("name"), Some(&Value::String("alice".to_string())));
    assert_eq!(row.get(2), Some(&Value::Float(1.5)));
    assert_eq!(row.get(3), Some(&Value::Bytes(vec![0, 1, 2])));
    assert_eq!(row.get(4), Some(&Value::Null));

    let (id, name, score, avatar, missing): (i64, String, f64, Vec<u8>, Option<String>) = db
        .query_row(
            &ctx,
            "SELECT id, name, score, avatar, NULL FROM users WHERE id = :id",
            &params! { "id" => 1 },
        )
        .await
        .unwrap();
    assert_eq!((id, name.as_str(), score), (1, "alice", 1.5));
    assert_eq!(avatar, vec![0, 1, 2]);
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_repeated_placeholder_binds_once_per_occurrence() {
    let (_dir, set) = setup().await;
    let db = set.main();

    let (n,): (i64,) = db
        .query_row(
            &Context::background(),
            "SELECT COUNT(*) FROM users WHERE id = :id OR (id + 1) = :id",
            &params! { "id" => 2 },
        )
        .await
        .unwrap();
    assert_eq!(n, 2);
}

#[tokio::test]
async fn test_placeholders_inside_literals_are_ignored() {
    let (_dir, set) = setup().await;
    let db = set.main();

    let (label,): (String,) = db
        .query_row(
            &Context::background(),
            "SELECT ':not_a_param' || name FROM users WHERE id = :id -- :ignored",
            &params! { "id" => 2 },
        )
        .await
        .unwrap();
    assert_eq!(label, ":not_a_parambob");
}

#[tokio::test]
async fn test_query_row_with_no_rows_is_scan_error() {
    let (_dir, set) = setup().await;
    let db = set.main();

    let err = db
        .query_row::<(i64,)>(
            &Context::background(),
            "SELECT id FROM users WHERE id = :id",
            &params! { "id" => 99 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Scan { .. }));
    assert!(err.sent_statement());
}

#[tokio::test]
async fn test_query_row_with_many_rows_is_scan_error() {
    let (_dir, set) = setup().await;
    let db = set.main();

    let err = db
        .query_row::<(i64,)>(&Context::background(), "SELECT id FROM users", &params! {})
        .await
        .unwrap_err();
    match err {
        DbError::Scan { message } => assert!(message.contains("more than one row")),
        other => panic!("expected Scan, got {:?}", other),
    }
}

#[tokio::test]
async fn test_scan_shape_and_type_mismatch() {
    let (_dir, set) = setup().await;
    let db = set.main();
    let ctx = Context::background();

    let err = db
        .query_row::<(i64, String)>(
            &ctx,
            "SELECT id FROM users WHERE id = :id",
            &params! { "id" => 1 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Scan { .. }));

    let err = db
        .query_row::<(i64,)>(
            &ctx,
            "SELECT name FROM users WHERE id = :id",
            &params! { "id" => 1 },
        )
        .await
        .unwrap_err();
    match err {
        DbError::Scan { message } => assert!(message.contains("column 0")),
        other => panic!("expected Scan, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rewrite_errors_send_nothing() {
    let (_dir, set) = setup().await;
    let db = set.main();
    let ctx = Context::background();

    // Name in the text but not in the mapping
    let err = db
        .execute(
            &ctx,
            "DELETE FROM users WHERE id = :id",
            &params! { "other" => 1 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Rewrite { .. }));
    assert!(!err.sent_statement());

    // Name in the mapping but not in the text
    let err = db
        .execute(
            &ctx,
            "DELETE FROM users WHERE id = :id",
            &params! { "id" => 1, "unused" => 2 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Rewrite { .. }));

    // Bare positional marker
    let err = db
        .execute(&ctx, "DELETE FROM users WHERE id = ?", &params! {})
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Rewrite { .. }));

    assert_eq!(user_count(&db).await, 2);
}

#[tokio::test]
async fn test_expired_deadline_times_out() {
    let (_dir, set) = setup().await;
    let db = set.main();

    let ctx = Context::background().with_timeout(Duration::ZERO);
    let err = db
        .execute(
            &ctx,
            "DELETE FROM users WHERE id = :id",
            &params! { "id" => 1 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(user_count(&db).await, 2);
}

#[tokio::test]
async fn test_cancelled_context_aborts_query() {
    let (_dir, set) = setup().await;
    let db = set.main();

    let (ctx, token) = Context::background().with_cancel();
    token.cancel();
    let err = db
        .query_row::<Row>(&ctx, "SELECT * FROM users WHERE id = :id", &params! { "id" => 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));
}

#[tokio::test]
async fn test_replica_is_separate_raw_pool() {
    let (_dir, set) = setup().await;

    // The replica has its own file and never sees the primary's tables
    let pool = match set.replica() {
        DbPool::SQLite(pool) => pool.clone(),
        other => panic!("expected SQLite replica, got {:?}", other),
    };
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'users'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(tables, 0);

    set.replica().ping().await.unwrap();
    set.close().await;
}

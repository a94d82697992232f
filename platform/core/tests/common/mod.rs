//! Shared setup for rbf-core's DB-backed integration tests.
//!
//! Grounded in `tests/common/mod.rs` of the teacher repo: a `setup_pool()`
//! that reads a `DATABASE_URL_*`-style env var, connects with a small pool,
//! and prepares schema. Unlike the teacher's `ar-rs` (which ships its own
//! `sqlx::migrate!` migrations), RBF's contract is that the host application
//! owns `results`/`outbox` schema creation (spec.md §6) — so this helper
//! creates the two tables directly with `CREATE TABLE IF NOT EXISTS` rather
//! than running a migration set RBF doesn't own.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn setup_pool() -> PgPool {
    dotenvy::dotenv().ok();

    let url = std::env::var("DATABASE_URL_RBF")
        .expect("DATABASE_URL_RBF must be set for rbf-core integration tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&url)
        .await
        .expect("failed to connect to rbf-core test database");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            namespace TEXT NOT NULL,
            request_id TEXT NOT NULL,
            requested_path TEXT NOT NULL,
            requested_input TEXT NOT NULL,
            data JSONB NOT NULL,
            status INTEGER NOT NULL,
            created_at BIGINT NOT NULL,
            PRIMARY KEY (namespace, request_id)
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("failed to create results table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbox (
            namespace TEXT NOT NULL,
            id UUID NOT NULL,
            source_request_id TEXT NOT NULL,
            type TEXT NOT NULL,
            path TEXT NOT NULL,
            data JSONB NOT NULL,
            target_at BIGINT,
            created_at BIGINT NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("failed to create outbox table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_posts (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("failed to create test_posts table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_views (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            views INTEGER NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("failed to create test_views table");

    pool
}

/// A fresh namespace per test run, so concurrent test functions against the
/// same database never see each other's rows.
pub fn unique_namespace(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

//! Namespace-scoped queries against the `results` and `outbox` tables
//! (spec §3, invariants 1-3).
//!
//! Grounded in `modules/ar/src/idempotency.rs` and `modules/ar/src/events/outbox.rs`
//! for the `ON CONFLICT DO NOTHING` idempotency pattern and the
//! select-then-delete outbox sweep.

use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// A row from `results`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResultRow {
    pub namespace: String,
    pub request_id: String,
    pub requested_path: String,
    pub requested_input: String,
    pub data: Value,
    pub status: i32,
    pub created_at: i64,
}

/// A row from `outbox`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub namespace: String,
    pub id: Uuid,
    pub source_request_id: String,
    pub r#type: String,
    pub path: String,
    pub data: Value,
    pub target_at: Option<i64>,
    pub created_at: i64,
}

/// Fetch the existing result row for `(namespace, request_id)`, if any.
/// Read inside the handler's serializable transaction (spec §4.3 step 5).
pub async fn find_result(
    tx: &mut Transaction<'_, Postgres>,
    namespace: &str,
    request_id: &str,
) -> Result<Option<ResultRow>, sqlx::Error> {
    sqlx::query_as::<_, ResultRow>(
        "SELECT namespace, request_id, requested_path, requested_input, data, status, created_at
         FROM results WHERE namespace = $1 AND request_id = $2",
    )
    .bind(namespace)
    .bind(request_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Insert a result row, returning `true` if this call won the race (spec
/// §4.3 step 7 / §4.9 "Result insert lost race").
#[allow(clippy::too_many_arguments)]
pub async fn insert_result(
    tx: &mut Transaction<'_, Postgres>,
    namespace: &str,
    request_id: &str,
    requested_path: &str,
    requested_input: &str,
    data: &Value,
    status: i32,
    created_at: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO results (namespace, request_id, requested_path, requested_input, data, status, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (namespace, request_id) DO NOTHING",
    )
    .bind(namespace)
    .bind(request_id)
    .bind(requested_path)
    .bind(requested_input)
    .bind(data)
    .bind(status)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert one outbox row inside the handler's transaction (spec §4.3 step 7).
#[allow(clippy::too_many_arguments)]
pub async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    namespace: &str,
    id: Uuid,
    source_request_id: &str,
    kind: &str,
    path: &str,
    data: &Value,
    target_at: Option<i64>,
    created_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO outbox (namespace, id, source_request_id, type, path, data, target_at, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(namespace)
    .bind(id)
    .bind(source_request_id)
    .bind(kind)
    .bind(path)
    .bind(data)
    .bind(target_at)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// All residual outbox rows for a `source_request_id`, re-published when
/// the idempotency short-circuit fires (spec §4.3 step 5).
pub async fn find_outbox_by_source(
    pool: &sqlx::PgPool,
    namespace: &str,
    source_request_id: &str,
) -> Result<Vec<OutboxRow>, sqlx::Error> {
    sqlx::query_as::<_, OutboxRow>(
        "SELECT namespace, id, source_request_id, type, path, data, target_at, created_at
         FROM outbox WHERE namespace = $1 AND source_request_id = $2",
    )
    .bind(namespace)
    .bind(source_request_id)
    .fetch_all(pool)
    .await
}

/// Delete all outbox rows sharing `source_request_id`, used by the fast
/// path after a successful post-commit publish (spec §4.3 step 8).
pub async fn delete_outbox_by_source(
    pool: &sqlx::PgPool,
    namespace: &str,
    source_request_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM outbox WHERE namespace = $1 AND source_request_id = $2")
        .bind(namespace)
        .bind(source_request_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a single outbox row by id, used by the Outbox Dispatcher after
/// confirmed publish (spec §4.4 step 4).
pub async fn delete_outbox_row(
    pool: &sqlx::PgPool,
    namespace: &str,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM outbox WHERE namespace = $1 AND id = $2")
        .bind(namespace)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Outbox rows past the grace period, for the dispatcher's sweep (spec §4.4
/// step 2). Rows with a future `target_at` are still returned; the caller
/// skips them for this cycle per step 3.
pub async fn due_outbox_rows(
    pool: &sqlx::PgPool,
    namespace: &str,
    grace_cutoff_ms: i64,
) -> Result<Vec<OutboxRow>, sqlx::Error> {
    sqlx::query_as::<_, OutboxRow>(
        "SELECT namespace, id, source_request_id, type, path, data, target_at, created_at
         FROM outbox WHERE namespace = $1 AND created_at < $2
         ORDER BY id ASC",
    )
    .bind(namespace)
    .bind(grace_cutoff_ms)
    .fetch_all(pool)
    .await
}

/// Result rows older than `results_max_age`, for the Result Reaper (spec §4.5).
pub async fn delete_old_results(
    pool: &sqlx::PgPool,
    namespace: &str,
    max_age_cutoff_ms: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM results WHERE namespace = $1 AND created_at < $2")
        .bind(namespace)
        .bind(max_age_cutoff_ms)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

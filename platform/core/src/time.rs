//! Time and id helpers shared across the core pipeline.

use chrono::Utc;
use uuid::Uuid;

/// Current time as milliseconds since the Unix epoch, matching the
/// `created_at`/`updated_at` column type used by `results` and `outbox`.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A time-ordered id, used for `outbox.id` so that a naive `ORDER BY id`
/// scan on the dispatcher approximates insertion order without a secondary
/// index. Business-level ids (`request_id`) are supplied by the caller.
pub fn new_ordered_id() -> Uuid {
    Uuid::now_v7()
}

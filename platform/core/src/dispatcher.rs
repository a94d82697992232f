//! Outbox Dispatcher: periodic crash-safe republish (spec §4.4).
//!
//! Grounded in `modules/ar/src/events/outbox.rs`'s fetch-unpublished /
//! mark-published sweep, adapted from a publish-then-mark model to the
//! spec's publish-then-delete model (outbox rows have no terminal state,
//! they simply cease to exist once dispatched).

use crate::store;
use crate::time::now_ms;
use crate::RbfConfig;
use rand::Rng;
use rbf_bus::{headers as bus_headers, retry_with_backoff, EventBus, PublishOptions, RetryConfig};
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Runs the Outbox Dispatcher loop until `cancel` fires, inside an
/// `info_span!` that lives for the loop's whole lifetime.
///
/// Each cycle sleeps `periodic_tasks_interval + random(0, interval/2)`
/// (jitter), selects rows older than `outbox_grace`, and publishes each one
/// — as a `Request-Id`-tagged request if `type = request`, or as a raw
/// message if `type = message` — deleting it from the table once the
/// publish acknowledges.
pub async fn run(pool: PgPool, bus: Arc<dyn EventBus>, config: RbfConfig, cancel: CancellationToken) {
    let span = tracing::info_span!("rbf_outbox_dispatcher", namespace = %config.namespace);
    async move {
        tracing::info!("outbox dispatcher starting");
        loop {
            let sleep_for = jittered_interval(config.periodic_tasks_interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("outbox dispatcher stopping");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            if let Err(e) = run_once(&pool, &bus, &config).await {
                tracing::error!(error = %e, "outbox dispatcher cycle failed");
            }
        }
    }
    .instrument(span)
    .await;
}

async fn run_once(pool: &PgPool, bus: &Arc<dyn EventBus>, config: &RbfConfig) -> Result<(), sqlx::Error> {
    let cutoff = now_ms() - config.outbox_grace.as_millis() as i64;
    let rows = store::due_outbox_rows(pool, &config.namespace, cutoff).await?;

    let now = now_ms();
    for row in rows {
        if let Some(target_at) = row.target_at {
            if target_at > now {
                continue;
            }
        }

        let payload = serde_json::to_vec(&row.data).unwrap_or_default();
        let is_request = row.r#type == "request";
        let retry_config = RetryConfig::default();
        let publish_result = retry_with_backoff(
            || {
                let bus = bus.clone();
                let payload = payload.clone();
                let path = row.path.clone();
                let id = row.id.to_string();
                async move {
                    if is_request {
                        let opts = PublishOptions::new()
                            .with_header(bus_headers::REQUEST_ID, id.clone())
                            .with_msg_id(id);
                        bus.publish_with(&path, payload, opts).await
                    } else {
                        bus.publish(&path, payload).await
                    }
                }
            },
            &retry_config,
            "outbox_dispatch",
        )
        .await;

        match publish_result {
            Ok(()) => {
                if let Err(e) = store::delete_outbox_row(pool, &config.namespace, row.id).await {
                    tracing::error!(error = %e, id = %row.id, "failed to delete dispatched outbox row");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, id = %row.id, path = %row.path, "outbox publish failed, retrying next cycle");
            }
        }
    }

    Ok(())
}

fn jittered_interval(base: std::time::Duration) -> std::time::Duration {
    let max_jitter_ms = (base.as_millis() / 2).max(1) as u64;
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
    base + std::time::Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_interval_plus_half() {
        let base = std::time::Duration::from_millis(1000);
        for _ in 0..50 {
            let jittered = jittered_interval(base);
            assert!(jittered >= base);
            assert!(jittered <= base + std::time::Duration::from_millis(500));
        }
    }
}

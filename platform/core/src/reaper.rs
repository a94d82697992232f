//! Result Reaper: periodic pruning of old `results` rows (spec §4.5).
//!
//! Co-hosted with the Outbox Dispatcher and sharing its cadence/jitter, per
//! the spec; kept as a separate loop (rather than folded into the
//! dispatcher's) so the two can be given independent concurrency/placement
//! if a host ever wants that, mirroring how the teacher runs its publisher
//! and consumer tasks as independent `tokio::spawn`s from one `main`.

use crate::store;
use crate::time::now_ms;
use crate::RbfConfig;
use rand::Rng;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Runs the Result Reaper loop until `cancel` fires, inside an `info_span!`
/// that lives for the loop's whole lifetime.
pub async fn run(pool: PgPool, config: RbfConfig, cancel: CancellationToken) {
    let span = tracing::info_span!("rbf_result_reaper", namespace = %config.namespace);
    async move {
        tracing::info!("result reaper starting");
        loop {
            let sleep_for = jittered_interval(config.periodic_tasks_interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("result reaper stopping");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            let cutoff = now_ms() - config.results_max_age.as_millis() as i64;
            match store::delete_old_results(&pool, &config.namespace, cutoff).await {
                Ok(deleted) if deleted > 0 => {
                    tracing::debug!(deleted, "result reaper pruned old rows");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "result reaper cycle failed");
                }
            }
        }
    }
    .instrument(span)
    .await;
}

fn jittered_interval(base: std::time::Duration) -> std::time::Duration {
    let max_jitter_ms = (base.as_millis() / 2).max(1) as u64;
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
    base + std::time::Duration::from_millis(jitter_ms)
}

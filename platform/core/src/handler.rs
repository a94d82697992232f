//! Message Handler: the per-message pipeline (spec §4.3).
//!
//! Grounded in `modules/ar/src/consumer_tasks.rs` for the tracing-span
//! wrapped consumer loop and `modules/ar/src/idempotency.rs` for the
//! read-through idempotency check, generalized from HTTP middleware to the
//! registry/transaction pipeline the spec describes.

use crate::error::{ErrorCode, ErrorPayload, RbfError};
use crate::registry::{HandlerEntry, Kind, Matched, Registration, Registry};
use crate::scheduler::{OutboxItem, OutboxKind, Scheduler};
use crate::store::{self, OutboxRow};
use crate::time::now_ms;
use crate::RbfConfig;
use rand::Rng;
use rbf_bus::{headers as bus_headers, BusDelivery, BusMessage, EventBus, PublishOptions};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// The context passed through the middleware chain and into handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub path: String,
    pub params: std::collections::HashMap<String, String>,
    pub input: Value,
}

/// Transforms or validates a [`RequestContext`] before the handler runs
/// (e.g. authentication, tenant resolution). Returning `Err` short-circuits
/// the pipeline exactly as a handler error would.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: RequestContext) -> Result<RequestContext, RbfError>;
}

/// A read-only query handler. Runs inside a `SERIALIZABLE READ ONLY`
/// transaction but persists nothing and receives no [`Scheduler`].
#[async_trait::async_trait]
pub trait QueryHandler: Send + Sync {
    async fn call(
        &self,
        ctx: RequestContext,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Value, RbfError>;
}

/// A mutating handler. Runs inside a `SERIALIZABLE` read-write transaction
/// and may schedule outbox work via the given [`Scheduler`].
#[async_trait::async_trait]
pub trait MutationHandler: Send + Sync {
    async fn call(
        &self,
        ctx: RequestContext,
        tx: &mut Transaction<'_, Postgres>,
        scheduler: &mut Scheduler,
    ) -> Result<Value, RbfError>;
}

/// The outcome of matching `handle` against one of the two pipeline branches.
enum Outcome {
    Replied {
        status: u16,
        body: Value,
        outbox: Vec<OutboxItem>,
    },
    ResultRaceLost,
    Transient {
        retry_delay: Option<Duration>,
    },
}

/// Executes the per-message pipeline against a [`Registry`] of
/// [`HandlerEntry`] registrations.
pub struct MessageHandler {
    registry: Arc<Registry<HandlerEntry>>,
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: RbfConfig,
}

impl MessageHandler {
    pub fn new(
        registry: Arc<Registry<HandlerEntry>>,
        pool: PgPool,
        bus: Arc<dyn EventBus>,
        config: RbfConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            bus,
            config,
        }
    }

    /// Entry point for a single delivery from a queue consumer.
    pub async fn handle(&self, subject_prefix: &str, delivery: BusDelivery) {
        let message = delivery.message.clone();
        let reply_to = message.header(bus_headers::REPLY_TO).map(str::to_owned);
        let request_id = message.header(bus_headers::REQUEST_ID).map(str::to_owned);

        let span = tracing::info_span!(
            "rbf_message",
            subject = %message.subject,
            request_id = request_id.as_deref().unwrap_or("none"),
        );

        self.handle_inner(subject_prefix, &message, reply_to, request_id, delivery)
            .instrument(span)
            .await;
    }

    async fn handle_inner(
        &self,
        subject_prefix: &str,
        message: &BusMessage,
        reply_to: Option<String>,
        request_id: Option<String>,
        delivery: BusDelivery,
    ) {
        // Step 1: subject strip.
        let Some(path) = message.subject.strip_prefix(subject_prefix) else {
            tracing::warn!(subject = %message.subject, subject_prefix, "subject outside queue prefix");
            self.reply(reply_to.as_deref(), request_id.as_deref(), 404, &Value::Null)
                .await;
            ack(&delivery).await;
            return;
        };

        // Step 2: registry match.
        let Some(matched) = self.registry.match_path(path) else {
            tracing::debug!(path, "no registry match");
            self.reply(reply_to.as_deref(), request_id.as_deref(), 404, &Value::Null)
                .await;
            ack(&delivery).await;
            return;
        };

        // Step 3: header extraction.
        let Some(request_id) = request_id else {
            tracing::warn!(path, "missing Request-Id header, malformed inbound");
            self.reply(reply_to.as_deref(), None, 404, &Value::Null).await;
            ack(&delivery).await;
            return;
        };

        let input: Value = serde_json::from_slice(&message.payload).unwrap_or(Value::Null);

        match self
            .run_in_transaction(&matched, &request_id, path, &input)
            .await
        {
            Outcome::Replied { status, body, outbox } => {
                self.reply(reply_to.as_deref(), Some(&request_id), status, &body)
                    .await;
                self.publish_fast_path(&request_id, outbox).await;
                ack(&delivery).await;
            }
            Outcome::ResultRaceLost => {
                nak(&delivery, default_retry_delay()).await;
            }
            Outcome::Transient { retry_delay } => {
                nak(&delivery, retry_delay.unwrap_or_else(default_retry_delay)).await;
            }
        }
    }

    async fn begin_txn(&self, kind: Kind) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let isolation = match kind {
            Kind::Query => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY",
            Kind::Mutation => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        };
        sqlx::query(isolation).execute(&mut *tx).await?;
        Ok(tx)
    }

    /// Steps 4-8 of §4.3. Returns the outcome; the caller replies/acks/naks.
    async fn run_in_transaction(
        &self,
        matched: &Matched<HandlerEntry>,
        request_id: &str,
        path: &str,
        input: &Value,
    ) -> Outcome {
        let mut tx = match self.begin_txn(matched.registration.kind).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!(error = %e, "failed to begin transaction");
                return Outcome::Transient { retry_delay: None };
            }
        };

        let canonical_input = canonical_json(input);

        match store::find_result(&mut tx, &self.config.namespace, request_id).await {
            Ok(Some(existing)) => {
                let _ = tx.rollback().await;
                if existing.requested_path == path && existing.requested_input == canonical_input {
                    if let Ok(rows) =
                        store::find_outbox_by_source(&self.pool, &self.config.namespace, request_id)
                            .await
                    {
                        self.republish_residual(request_id, rows).await;
                    }
                    return Outcome::Replied {
                        status: existing.status as u16,
                        body: existing.data,
                        outbox: vec![],
                    };
                }

                let payload = ErrorPayload {
                    code: ErrorCode::RequestIdConflict,
                    message: "request_id already used with a different path or input".into(),
                };
                return Outcome::Replied {
                    status: ErrorCode::RequestIdConflict.status_code(),
                    body: serde_json::to_value(payload).unwrap_or(Value::Null),
                    outbox: vec![],
                };
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.rollback().await;
                tracing::error!(error = %e, "idempotency check failed");
                return Outcome::Transient { retry_delay: None };
            }
        }

        let ctx = RequestContext {
            request_id: request_id.to_string(),
            path: path.to_string(),
            params: matched.params.clone(),
            input: input.clone(),
        };

        let ctx = match self.run_middleware(&matched.registration, ctx).await {
            Ok(ctx) => ctx,
            Err(RbfError::Business { code, message }) => {
                let _ = tx.rollback().await;
                return Outcome::Replied {
                    status: code.status_code(),
                    body: serde_json::to_value(ErrorPayload { code, message }).unwrap_or(Value::Null),
                    outbox: vec![],
                };
            }
            Err(RbfError::Transient(message)) => {
                let _ = tx.rollback().await;
                tracing::warn!(error = %message, "transient middleware error");
                return Outcome::Transient { retry_delay: None };
            }
        };

        let is_mutation = matches!(&*matched.registration.handler, HandlerEntry::Mutation { .. });
        let mut scheduler = Scheduler::new();

        let handler_result = match &*matched.registration.handler {
            HandlerEntry::Query { handler, .. } => handler.call(ctx, &mut tx).await,
            HandlerEntry::Mutation { handler, .. } => handler.call(ctx, &mut tx, &mut scheduler).await,
        };

        let (status, body) = match handler_result {
            Ok(value) => (200u16, value),
            Err(RbfError::Business { code, message }) => (
                code.status_code(),
                serde_json::to_value(ErrorPayload { code, message }).unwrap_or(Value::Null),
            ),
            Err(RbfError::Transient(message)) => {
                let _ = tx.rollback().await;
                tracing::warn!(error = %message, path, request_id, "transient handler error");
                let retry_delay = if is_mutation { scheduler.retry_delay() } else { None };
                return Outcome::Transient { retry_delay };
            }
        };

        if !is_mutation {
            let _ = tx.rollback().await;
            return Outcome::Replied { status, body, outbox: vec![] };
        }

        let outbox_items = scheduler.into_items();

        let inserted = match store::insert_result(
            &mut tx,
            &self.config.namespace,
            request_id,
            path,
            &canonical_input,
            &body,
            status as i32,
            now_ms(),
        )
        .await
        {
            Ok(inserted) => inserted,
            Err(e) => {
                let _ = tx.rollback().await;
                tracing::error!(error = %e, "result insert failed");
                return Outcome::Transient { retry_delay: None };
            }
        };

        if !inserted {
            let _ = tx.rollback().await;
            return Outcome::ResultRaceLost;
        }

        for item in &outbox_items {
            let kind = match item.kind {
                OutboxKind::Request => "request",
                OutboxKind::Message => "message",
            };
            if let Err(e) = store::insert_outbox(
                &mut tx,
                &self.config.namespace,
                item.id,
                request_id,
                kind,
                &item.path,
                &item.data,
                item.target_at,
                now_ms(),
            )
            .await
            {
                let _ = tx.rollback().await;
                tracing::error!(error = %e, "outbox insert failed");
                return Outcome::Transient { retry_delay: None };
            }
        }

        if let Err(e) = tx.commit().await {
            tracing::error!(error = %e, "commit failed");
            return Outcome::Transient { retry_delay: None };
        }

        Outcome::Replied { status, body, outbox: outbox_items }
    }

    async fn run_middleware(
        &self,
        registration: &Registration<HandlerEntry>,
        mut ctx: RequestContext,
    ) -> Result<RequestContext, RbfError> {
        let chain = match &*registration.handler {
            HandlerEntry::Query { middleware, .. } => middleware,
            HandlerEntry::Mutation { middleware, .. } => middleware,
        };
        for mw in chain {
            ctx = mw.handle(ctx).await?;
        }
        Ok(ctx)
    }

    async fn reply(&self, reply_to: Option<&str>, request_id: Option<&str>, status: u16, body: &Value) {
        let Some(reply_to) = reply_to else {
            return;
        };
        let mut opts = PublishOptions::new().with_header(bus_headers::STATUS_CODE, status.to_string());
        if let Some(request_id) = request_id {
            opts = opts.with_header(bus_headers::REQUEST_ID, request_id);
        }
        let payload = serde_json::to_vec(body).unwrap_or_default();
        if let Err(e) = self.bus.publish_with(reply_to, payload, opts).await {
            tracing::error!(error = %e, reply_to, "failed to publish reply");
        }
    }

    /// Post-commit fast-path publish (§4.3 step 8): best-effort, the Outbox
    /// Dispatcher is the correctness backstop.
    async fn publish_fast_path(&self, request_id: &str, items: Vec<OutboxItem>) {
        if items.is_empty() {
            return;
        }
        let mut any_failed = false;
        for item in &items {
            if self.publish_outbox_item(item).await.is_err() {
                any_failed = true;
            }
        }
        if !any_failed {
            if let Err(e) =
                store::delete_outbox_by_source(&self.pool, &self.config.namespace, request_id).await
            {
                tracing::error!(error = %e, "failed to delete fast-path outbox rows");
            }
        }
    }

    async fn publish_outbox_item(&self, item: &OutboxItem) -> rbf_bus::BusResult<()> {
        let payload = serde_json::to_vec(&item.data).unwrap_or_default();
        match item.kind {
            OutboxKind::Request => {
                let opts = PublishOptions::new()
                    .with_header(bus_headers::REQUEST_ID, item.id.to_string())
                    .with_msg_id(item.id.to_string());
                self.bus.publish_with(&item.path, payload, opts).await
            }
            OutboxKind::Message => self.bus.publish(&item.path, payload).await,
        }
    }

    /// Republish residual outbox rows found during the idempotency
    /// short-circuit (§4.3 step 5).
    async fn republish_residual(&self, request_id: &str, rows: Vec<OutboxRow>) {
        if rows.is_empty() {
            return;
        }
        let mut any_failed = false;
        for row in &rows {
            let payload = serde_json::to_vec(&row.data).unwrap_or_default();
            let result = if row.r#type == "request" {
                let opts = PublishOptions::new()
                    .with_header(bus_headers::REQUEST_ID, row.id.to_string())
                    .with_msg_id(row.id.to_string());
                self.bus.publish_with(&row.path, payload, opts).await
            } else {
                self.bus.publish(&row.path, payload).await
            };
            if result.is_err() {
                any_failed = true;
            }
        }
        if !any_failed {
            if let Err(e) =
                store::delete_outbox_by_source(&self.pool, &self.config.namespace, request_id).await
            {
                tracing::error!(error = %e, "failed to delete residual outbox rows");
            }
        }
    }
}

async fn ack(delivery: &BusDelivery) {
    if let Err(e) = delivery.ack().await {
        tracing::error!(error = %e, "ack failed");
    }
}

async fn nak(delivery: &BusDelivery, delay: Duration) {
    if let Err(e) = delivery.nak(delay).await {
        tracing::error!(error = %e, "nak failed");
    }
}

/// Default nak delay when no `Scheduler::set_retry_delay` override applies.
fn default_retry_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(1000..=3000))
}

/// `serde_json::Value` serializes map keys in `BTreeMap` order (this crate
/// does not enable serde_json's `preserve_order` feature), so this is stable
/// across processes and adequate as the "canonical JSON text" the spec calls
/// for when comparing `requested_input` on retry.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_is_key_order_independent() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn default_retry_delay_is_within_spec_bounds() {
        for _ in 0..50 {
            let delay = default_retry_delay();
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(3000));
        }
    }
}

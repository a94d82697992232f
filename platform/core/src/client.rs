//! Client Dispatcher: request/reply with retries over the bus (spec §4.7).

use crate::error::ClientError;
use crate::inbox::PendingRequests;
use crate::time::new_ordered_id;
use crate::RbfConfig;
use rbf_bus::{headers as bus_headers, EventBus, PublishOptions};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Options for a single [`Client::request`] call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// The application-level idempotency key. Generated if absent.
    pub request_id: Option<String>,
    pub input: Value,
    pub headers: HashMap<String, String>,
}

/// Options for [`Client::request_with_retries`].
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub retries: u32,
    pub timeout: Duration,
    pub headers: HashMap<String, String>,
}

impl RetryOptions {
    pub fn from_config(config: &RbfConfig) -> Self {
        Self {
            retries: config.default_retries,
            timeout: config.default_timeout,
            headers: HashMap::new(),
        }
    }
}

/// Publishes requests and resolves them via the [`crate::inbox::ReplyInbox`].
///
/// Holds the process-wide cancellation token: once the Lifecycle Manager
/// stops the process, every in-flight and future request is rejected.
#[derive(Clone)]
pub struct Client {
    bus: Arc<dyn EventBus>,
    pending: Arc<PendingRequests>,
    inbox_address: String,
    process_cancel: CancellationToken,
}

impl Client {
    pub fn new(
        bus: Arc<dyn EventBus>,
        pending: Arc<PendingRequests>,
        inbox_address: impl Into<String>,
        process_cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            pending,
            inbox_address: inbox_address.into(),
            process_cancel,
        }
    }

    /// One request, resolved by the first matching reply (or rejected on
    /// cancellation/timeout/bus error). The pending entry is always removed
    /// on settle, win or lose.
    pub async fn request(
        &self,
        topic: &str,
        opts: RequestOptions,
        timeout: Option<Duration>,
        caller_cancel: Option<&CancellationToken>,
    ) -> Result<Value, ClientError> {
        let reply_id = new_ordered_id().to_string();
        let reply_to = format!("{}.{}", self.inbox_address, reply_id);
        let request_id = opts.request_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let receiver = self.pending.insert(reply_id.clone());

        let mut publish_opts = PublishOptions::new()
            .with_header(bus_headers::REQUEST_ID, request_id.clone())
            .with_header(bus_headers::REPLY_TO, reply_to.clone())
            .with_msg_id(reply_to.clone());
        for (name, value) in opts.headers {
            publish_opts = publish_opts.with_header(name, value);
        }

        let payload = serde_json::to_vec(&opts.input).unwrap_or_else(|_| b"null".to_vec());

        if let Err(e) = self.bus.publish_with(topic, payload, publish_opts).await {
            self.pending.remove(&reply_id);
            return Err(ClientError::Transport(e.to_string()));
        }

        let result = tokio::select! {
            res = receiver => res.unwrap_or(Err(ClientError::Aborted)),
            _ = maybe_sleep(timeout) => Err(ClientError::Timeout),
            _ = maybe_cancelled(caller_cancel) => Err(ClientError::Aborted),
            _ = self.process_cancel.cancelled() => Err(ClientError::Aborted),
        };

        self.pending.remove(&reply_id);
        result
    }

    /// Retries up to `opts.retries` times with a stable `request_id`, so
    /// server-side idempotency makes retries safe. Stops retrying as soon
    /// as the caller aborts, the process stops, or the error is a business
    /// error — business errors are never retried (see the Client Dispatcher
    /// retry policy recorded in DESIGN.md).
    pub async fn request_with_retries(
        &self,
        topic: &str,
        input: Value,
        opts: RetryOptions,
        caller_cancel: Option<&CancellationToken>,
    ) -> Result<Value, ClientError> {
        let request_id = Uuid::new_v4().to_string();
        let retries = opts.retries.max(1);

        for attempt in 1..=retries {
            let req_opts = RequestOptions {
                request_id: Some(request_id.clone()),
                input: input.clone(),
                headers: opts.headers.clone(),
            };

            match self
                .request(topic, req_opts, Some(opts.timeout), caller_cancel)
                .await
            {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let caller_aborted = caller_cancel.map(CancellationToken::is_cancelled).unwrap_or(false);
                    let process_stopped = self.process_cancel.is_cancelled();
                    let last_attempt = attempt == retries;

                    if caller_aborted || process_stopped || err.is_business_non_retryable() || last_attempt {
                        return Err(err);
                    }

                    tracing::debug!(topic, attempt, error = %err, "client request failed, retrying");
                }
            }
        }

        unreachable!("loop always returns on its last iteration")
    }
}

async fn maybe_sleep(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}

fn maybe_cancelled(token: Option<&CancellationToken>) -> impl Future<Output = ()> + '_ {
    async move {
        match token {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbf_bus::{BusDelivery, DurableConsumer, EventBus, InMemoryBus};
    use serde_json::json;

    #[tokio::test]
    async fn request_resolves_via_reply_inbox_round_trip() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
        let pending = PendingRequests::new();
        let cancel = CancellationToken::new();

        let inbox = crate::inbox::ReplyInbox::new("inbox.proc1", pending.clone());
        let inbox_bus = bus.clone();
        let inbox_cancel = cancel.clone();
        let inbox_handle = tokio::spawn(async move { inbox.run(inbox_bus, inbox_cancel).await });

        // A fake "server": durable consumer on the request topic that
        // echoes the input back with a 200 status.
        let server_bus = bus.clone();
        let server_handle = tokio::spawn(async move {
            let mut consumer = server_bus
                .durable_consumer("echo.>", "echo-worker")
                .await
                .unwrap();
            let delivery: BusDelivery = consumer.next().await.unwrap();
            let reply_to = delivery
                .message
                .header(bus_headers::REPLY_TO)
                .unwrap()
                .to_string();
            let opts = PublishOptions::new().with_header(bus_headers::STATUS_CODE, "200");
            server_bus
                .publish_with(&reply_to, delivery.message.payload.clone(), opts)
                .await
                .unwrap();
            delivery.ack().await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let client = Client::new(bus.clone(), pending, "inbox.proc1", cancel.clone());
        let opts = RequestOptions {
            request_id: Some("req-1".into()),
            input: json!({"x": 1}),
            headers: HashMap::new(),
        };
        let result = client
            .request("echo.do", opts, Some(Duration::from_secs(2)), None)
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));

        cancel.cancel();
        let _ = inbox_handle.await;
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn request_times_out_when_no_reply_arrives() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
        let pending = PendingRequests::new();
        let cancel = CancellationToken::new();
        let client = Client::new(bus, pending, "inbox.proc1", cancel);

        let opts = RequestOptions {
            request_id: Some("req-timeout".into()),
            input: json!(null),
            headers: HashMap::new(),
        };
        let result = client
            .request("nobody.listening", opts, Some(Duration::from_millis(20)), None)
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn process_cancellation_aborts_in_flight_request() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
        let pending = PendingRequests::new();
        let cancel = CancellationToken::new();
        let client = Client::new(bus, pending, "inbox.proc1", cancel.clone());

        let opts = RequestOptions {
            request_id: Some("req-cancel".into()),
            input: json!(null),
            headers: HashMap::new(),
        };

        let request_future = client.request("nobody.listening", opts, Some(Duration::from_secs(5)), None);
        tokio::pin!(request_future);

        cancel.cancel();
        let result = request_future.await;
        assert!(matches!(result, Err(ClientError::Aborted)));
    }
}

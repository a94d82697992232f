//! Reply Inbox: client-side reply demultiplexing (spec §4.6).

use crate::error::{ClientError, ErrorCode, ErrorPayload};
use futures::StreamExt;
use rbf_bus::{headers as bus_headers, BusMessage, EventBus};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

type Settlement = Result<Value, ClientError>;

struct PendingEntry {
    sender: oneshot::Sender<Settlement>,
}

/// Concurrent map of in-flight client requests keyed by `reply_id`.
///
/// Entry-level ownership per spec §5: the Client Dispatcher writes on
/// creation, and either the Reply Inbox (on a matching reply) or the
/// client's own settle path (on timeout/cancellation) removes it.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new pending request under `reply_id`, returning the
    /// receiver half the caller awaits for settlement.
    pub fn insert(&self, reply_id: String) -> oneshot::Receiver<Settlement> {
        let (sender, receiver) = oneshot::channel();
        self.entries.lock().unwrap().insert(reply_id, PendingEntry { sender });
        receiver
    }

    /// Remove and return the entry for `reply_id`, if still pending.
    fn take(&self, reply_id: &str) -> Option<PendingEntry> {
        self.entries.lock().unwrap().remove(reply_id)
    }

    /// Remove the entry for `reply_id` without resolving it (used by the
    /// client on timeout/cancellation, after the fact).
    pub fn remove(&self, reply_id: &str) {
        self.entries.lock().unwrap().remove(reply_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Runs the Reply Inbox loop: a single subscription on
/// `<inbox_address>.*`, demultiplexing replies to pending client requests.
pub struct ReplyInbox {
    inbox_address: String,
    pending: Arc<PendingRequests>,
}

impl ReplyInbox {
    pub fn new(inbox_address: impl Into<String>, pending: Arc<PendingRequests>) -> Self {
        Self {
            inbox_address: inbox_address.into(),
            pending,
        }
    }

    /// Subscribe and loop until `cancel` fires or the subscription ends,
    /// inside an `info_span!` that lives for the loop's whole lifetime.
    pub async fn run(self, bus: Arc<dyn EventBus>, cancel: CancellationToken) {
        let span = tracing::info_span!("rbf_reply_inbox", inbox_address = %self.inbox_address);
        async move {
            tracing::info!("reply inbox starting");
            let subject = format!("{}.*", self.inbox_address);
            let mut stream = match bus.subscribe(&subject).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, subject, "reply inbox failed to subscribe");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("reply inbox stopping");
                        return;
                    }
                    next = stream.next() => {
                        let Some(msg) = next else {
                            tracing::info!("reply inbox subscription ended");
                            return;
                        };
                        self.handle_reply(msg);
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }

    fn handle_reply(&self, msg: BusMessage) {
        let Some(reply_id) = msg.subject.rsplit('.').next() else {
            return;
        };

        let Some(entry) = self.pending.take(reply_id) else {
            tracing::debug!(reply_id, "reply inbox: late reply, no pending request");
            return;
        };

        let _ = entry.sender.send(decode_reply(&msg));
    }
}

fn decode_reply(msg: &BusMessage) -> Settlement {
    let Some(status) = msg.header(bus_headers::STATUS_CODE) else {
        return Err(ClientError::Business {
            code: ErrorCode::InternalServerError,
            message: "reply missing Status-Code header".into(),
        });
    };

    let status: u16 = match status.parse() {
        Ok(status) => status,
        Err(_) => {
            return Err(ClientError::Transport(format!("invalid Status-Code header: {status:?}")))
        }
    };

    if status == 200 {
        serde_json::from_slice::<Value>(&msg.payload)
            .map_err(|e| ClientError::Transport(e.to_string()))
    } else {
        match serde_json::from_slice::<ErrorPayload>(&msg.payload) {
            Ok(payload) => Err(ClientError::Business {
                code: payload.code,
                message: payload.message,
            }),
            Err(e) => Err(ClientError::Transport(format!("malformed error payload: {e}"))),
        }
    }
}

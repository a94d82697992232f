//! In-memory bus implementation for tests and local development.

use crate::{
    Acker, BusDelivery, BusError, BusMessage, BusResult, DurableConsumer, EventBus, PublishOptions,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Bus implementation using in-memory channels.
///
/// Plain [`EventBus::subscribe`] is backed by a broadcast channel, matching
/// NATS-style wildcard semantics (`*`, `>`) — adequate for the reply inbox,
/// which listens on its own process-unique subject and needs no redelivery.
///
/// [`EventBus::durable_consumer`] is backed by a per-`(subject_filter,
/// durable_name)` unbounded queue with real ack/nak semantics: a nak'd
/// delivery is re-enqueued after its requested delay, so tests can exercise
/// redelivery without a real broker.
#[derive(Clone)]
pub struct InMemoryBus {
    broadcast: Arc<broadcast::Sender<BusMessage>>,
    queues: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<BusMessage>>>>,
}

impl InMemoryBus {
    /// Create a new in-memory bus with a 1000-message broadcast buffer.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self {
            broadcast: Arc::new(sender),
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new in-memory bus with a custom broadcast buffer size.
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            broadcast: Arc::new(sender),
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// NATS-style wildcard match: `*` matches exactly one token, `>` matches
    /// one or more remaining tokens.
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" {
                s_idx += 1;
                p_idx += 1;
            } else if subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }

    fn queue_key(subject_filter: &str, durable_name: &str) -> String {
        format!("{subject_filter}\u{1}{durable_name}")
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish_with(
        &self,
        subject: &str,
        payload: Vec<u8>,
        opts: PublishOptions,
    ) -> BusResult<()> {
        let msg = BusMessage::new(subject.to_string(), payload).with_headers(opts.headers);

        // Broadcast to plain subscribers (e.g. the reply inbox).
        let _ = self.broadcast.send(msg.clone());

        // Fan out to any durable queue whose filter matches this subject.
        let queues = self.queues.lock().unwrap();
        for (key, sender) in queues.iter() {
            let filter = key.split('\u{1}').next().unwrap_or("");
            if Self::matches_pattern(subject, filter) {
                let _ = sender.send(msg.clone());
            }
        }

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.broadcast.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "InMemoryBus subscriber lagged, dropped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn durable_consumer(
        &self,
        subject_filter: &str,
        durable_name: &str,
    ) -> BusResult<Box<dyn DurableConsumer>> {
        let key = Self::queue_key(subject_filter, durable_name);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.queues.lock().unwrap().insert(key, sender.clone());

        Ok(Box::new(InMemoryDurableConsumer { receiver, sender }))
    }
}

struct InMemoryDurableConsumer {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

#[async_trait]
impl DurableConsumer for InMemoryDurableConsumer {
    async fn next(&mut self) -> Option<BusDelivery> {
        let message = self.receiver.recv().await?;
        let acker = Box::new(InMemoryAcker {
            message: message.clone(),
            requeue: self.sender.clone(),
        });
        Some(BusDelivery::new(message, acker))
    }
}

struct InMemoryAcker {
    message: BusMessage,
    requeue: mpsc::UnboundedSender<BusMessage>,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> BusResult<()> {
        let message = self.message.clone();
        let requeue = self.requeue.clone();
        if delay.is_zero() {
            requeue
                .send(message)
                .map_err(|e| BusError::InternalError(e.to_string()))?;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = requeue.send(message);
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers;

    #[test]
    fn test_pattern_matching() {
        assert!(InMemoryBus::matches_pattern(
            "auth.events.user.created",
            "auth.events.user.created"
        ));
        assert!(InMemoryBus::matches_pattern(
            "auth.events.user.created",
            "auth.*.user.created"
        ));
        assert!(InMemoryBus::matches_pattern(
            "auth.events.user.created",
            "auth.events.*.created"
        ));
        assert!(!InMemoryBus::matches_pattern(
            "auth.events.user.created",
            "auth.*.created"
        ));
        assert!(InMemoryBus::matches_pattern("auth.events.user.created", "auth.>"));
        assert!(!InMemoryBus::matches_pattern(
            "auth.events.user.created",
            "billing.>"
        ));
        assert!(InMemoryBus::matches_pattern("single", "*"));
        assert!(InMemoryBus::matches_pattern("single", ">"));
        assert!(!InMemoryBus::matches_pattern("one.two", "one"));
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("test.events.>").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.events.user.created", payload.clone())
            .await
            .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");

        assert_eq!(msg.subject, "test.events.user.created");
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    async fn test_durable_consumer_ack_does_not_redeliver() {
        let bus = InMemoryBus::new();
        let mut consumer = bus.durable_consumer("jobs.>", "worker-1").await.unwrap();

        bus.publish("jobs.do_thing", b"payload".to_vec())
            .await
            .unwrap();

        let delivery = consumer.next().await.expect("delivery");
        delivery.ack().await.unwrap();

        let redelivered = tokio::time::timeout(Duration::from_millis(100), consumer.next()).await;
        assert!(redelivered.is_err(), "acked delivery must not redeliver");
    }

    #[tokio::test]
    async fn test_durable_consumer_nak_redelivers_after_delay() {
        let bus = InMemoryBus::new();
        let mut consumer = bus.durable_consumer("jobs.>", "worker-1").await.unwrap();

        bus.publish("jobs.do_thing", b"payload".to_vec())
            .await
            .unwrap();

        let delivery = consumer.next().await.expect("first delivery");
        delivery.nak(Duration::from_millis(20)).await.unwrap();

        // Too soon: not yet redelivered.
        let too_soon = tokio::time::timeout(Duration::from_millis(5), consumer.next()).await;
        assert!(too_soon.is_err());

        let redelivered = tokio::time::timeout(Duration::from_millis(200), consumer.next())
            .await
            .expect("timeout")
            .expect("redelivery");
        assert_eq!(redelivered.message.subject, "jobs.do_thing");
    }

    #[tokio::test]
    async fn test_request_reply_headers_round_trip() {
        let bus = InMemoryBus::new();
        let mut replies = bus.subscribe("inbox.proc1.*").await.unwrap();

        let opts = PublishOptions::new()
            .with_header(headers::REQUEST_ID, "req-1")
            .with_header(headers::STATUS_CODE, "200")
            .with_msg_id("req-1");

        bus.publish_with("inbox.proc1.reply1", b"{}".to_vec(), opts)
            .await
            .unwrap();

        let msg = replies.next().await.unwrap();
        assert_eq!(msg.header(headers::REQUEST_ID), Some("req-1"));
        assert_eq!(msg.header(headers::STATUS_CODE), Some("200"));
    }
}

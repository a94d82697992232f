//! NATS JetStream implementation of the bus abstraction.

use crate::{Acker, BusDelivery, BusError, BusMessage, BusResult, DurableConsumer, EventBus, PublishOptions};
use async_nats::jetstream::{self, consumer::AckPolicy, consumer::pull};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;

/// Bus implementation backed by a NATS client.
///
/// Plain publish/subscribe goes over core NATS. Durable consumers are
/// JetStream pull consumers: the stream and consumer are created
/// idempotently (`get_or_create_*`), mirroring how the host application is
/// expected to idempotently create the `results`/`outbox` tables — schema
/// provisioning is the caller's responsibility, not this crate's.
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Create a new bus from an already-connected NATS client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Access the underlying client for operations this trait doesn't expose.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn stream_name_for(subject_filter: &str) -> String {
        subject_filter
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish_with(
        &self,
        subject: &str,
        payload: Vec<u8>,
        opts: PublishOptions,
    ) -> BusResult<()> {
        let mut headers = HeaderMap::new();
        for (name, value) in &opts.headers {
            headers.insert(name.as_str(), value.as_str());
        }
        if let Some(msg_id) = &opts.msg_id {
            headers.insert("Nats-Msg-Id", msg_id.as_str());
        }

        self.client
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| {
            let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            if let Some(reply) = nats_msg.reply {
                msg = msg.with_reply_to(reply.to_string());
            }

            if let Some(nats_headers) = nats_msg.headers {
                let mut headers = std::collections::HashMap::new();
                for (key, values) in nats_headers.iter() {
                    if let Some(value) = values.first() {
                        headers.insert(key.to_string(), value.to_string());
                    }
                }
                msg = msg.with_headers(headers);
            }

            msg
        });

        Ok(stream.boxed())
    }

    async fn durable_consumer(
        &self,
        subject_filter: &str,
        durable_name: &str,
    ) -> BusResult<Box<dyn DurableConsumer>> {
        let js = jetstream::new(self.client.clone());
        let stream_name = Self::stream_name_for(subject_filter);

        let stream = js
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name,
                subjects: vec![subject_filter.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(Box::new(NatsDurableConsumer { messages }))
    }
}

struct NatsDurableConsumer {
    messages: pull::Stream,
}

#[async_trait]
impl DurableConsumer for NatsDurableConsumer {
    async fn next(&mut self) -> Option<BusDelivery> {
        loop {
            let next = self.messages.next().await?;
            match next {
                Ok(js_msg) => {
                    let (message, acker) = split_jetstream_message(js_msg);
                    return Some(BusDelivery::new(message, acker));
                }
                Err(e) => {
                    tracing::error!(error = %e, "jetstream pull consumer error");
                    continue;
                }
            }
        }
    }
}

fn split_jetstream_message(js_msg: jetstream::Message) -> (BusMessage, Box<dyn Acker>) {
    let mut msg = BusMessage::new(js_msg.subject.to_string(), js_msg.payload.to_vec());

    if let Some(reply) = &js_msg.reply {
        msg = msg.with_reply_to(reply.to_string());
    }
    if let Some(nats_headers) = &js_msg.headers {
        let mut headers = std::collections::HashMap::new();
        for (key, values) in nats_headers.iter() {
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        msg = msg.with_headers(headers);
    }

    (msg, Box::new(NatsAcker { inner: js_msg }))
}

struct NatsAcker {
    inner: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> BusResult<()> {
        self.inner
            .ack()
            .await
            .map_err(|e| BusError::InternalError(e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> BusResult<()> {
        self.inner
            .ack_with(jetstream::AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BusError::InternalError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running NATS server with JetStream enabled:
    //   docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore]
    async fn test_nats_bus_publish_subscribe() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let bus = NatsBus::new(client);

        let mut stream = bus.subscribe("test.nats.>").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.nats.hello", payload.clone())
            .await
            .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(msg.subject, "test.nats.hello");
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    #[ignore]
    async fn test_nats_durable_consumer_ack_nak() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");
        let bus = NatsBus::new(client);

        let mut consumer = bus
            .durable_consumer("test.jobs.>", "nats-bus-test-consumer")
            .await
            .unwrap();

        bus.publish("test.jobs.one", b"payload".to_vec())
            .await
            .unwrap();

        let delivery = tokio::time::timeout(std::time::Duration::from_secs(2), consumer.next())
            .await
            .expect("timeout")
            .expect("delivery");
        delivery.ack().await.unwrap();
    }
}

//! # Bus Abstraction
//!
//! A subject-addressed messaging abstraction for RBF: publish/subscribe for
//! ad-hoc fan-out (used by the reply inbox), plus durable, ack/nak'd
//! consumers for queue processing (used by the message handler).
//!
//! ## Implementations
//!
//! - **NatsBus**: production implementation backed by NATS JetStream.
//! - **InMemoryBus**: in-process implementation for tests and local dev —
//!   no external dependencies, full ack/nak/redelivery semantics.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rbf_bus::{EventBus, NatsBus, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let nats_client = async_nats::connect("nats://localhost:4222").await?;
//! let bus: Arc<dyn EventBus> = Arc::new(NatsBus::new(nats_client));
//!
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! bus.publish("requests.orgs.create", b"{}".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

mod consumer_retry;
pub mod headers;
mod inmemory_bus;
mod nats_bus;

pub use consumer_retry::{retry_with_backoff, RetryConfig};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// A message received from the bus, either via [`EventBus::subscribe`] or a
/// [`DurableConsumer`].
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject/topic this message was published to.
    pub subject: String,
    /// The message payload (raw bytes).
    pub payload: Vec<u8>,
    /// Headers carried on the message (e.g. `Request-Id`, `Reply-To`).
    pub headers: HashMap<String, String>,
    /// Optional reply-to subject (for request-response patterns).
    pub reply_to: Option<String>,
}

impl BusMessage {
    /// Create a new bus message with no headers and no reply-to.
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: HashMap::new(),
            reply_to: None,
        }
    }

    /// Add headers to the message.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Add a reply-to subject.
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Look up a header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }
}

/// Options controlling a single publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Headers to attach to the outbound message.
    pub headers: HashMap<String, String>,
    /// Publisher-supplied dedup id. On NATS this becomes the `Nats-Msg-Id`
    /// header, which JetStream uses to suppress duplicate publishes within
    /// the stream's dedup window.
    pub msg_id: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }
}

/// Errors that can occur when using the bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// A single delivery from a [`DurableConsumer`], carrying the message and the
/// means to acknowledge or negatively-acknowledge it.
pub struct BusDelivery {
    pub message: BusMessage,
    acker: Box<dyn Acker>,
}

impl fmt::Debug for BusDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusDelivery")
            .field("message", &self.message)
            .finish()
    }
}

impl BusDelivery {
    pub fn new(message: BusMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    /// Acknowledge successful processing; the bus will not redeliver.
    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge, requesting redelivery after `delay`.
    pub async fn nak(&self, delay: Duration) -> BusResult<()> {
        self.acker.nak(delay).await
    }
}

/// Backend-specific ack/nak mechanics for a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BusResult<()>;
    async fn nak(&self, delay: Duration) -> BusResult<()>;
}

/// A durable, ack/nak'd pull consumer bound to a subject filter.
///
/// Unlike [`EventBus::subscribe`], deliveries here survive process restarts
/// (the bus tracks delivery state) and must be explicitly acked or nak'd.
#[async_trait]
pub trait DurableConsumer: Send + Sync {
    /// Await the next delivery. Returns `None` once the consumer has been
    /// closed (e.g. on shutdown).
    async fn next(&mut self) -> Option<BusDelivery>;
}

/// Core bus abstraction: publish/subscribe plus durable consumers.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject with no headers and no dedup id.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.publish_with(subject, payload, PublishOptions::default())
            .await
    }

    /// Publish a message with headers and/or a dedup id.
    async fn publish_with(
        &self,
        subject: &str,
        payload: Vec<u8>,
        opts: PublishOptions,
    ) -> BusResult<()>;

    /// Subscribe to messages matching a subject pattern (supports NATS-style
    /// wildcards `*` and `>`). Used for ad-hoc fan-out such as the reply
    /// inbox; delivery is at-least-once and not individually acked.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Open (or attach to) a durable, ack/nak'd consumer named `durable_name`
    /// bound to `subject_filter`. Re-opening with the same `durable_name`
    /// resumes the same cursor.
    async fn durable_consumer(
        &self,
        subject_filter: &str,
        durable_name: &str,
    ) -> BusResult<Box<dyn DurableConsumer>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

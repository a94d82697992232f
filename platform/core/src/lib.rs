//! # Reliable Backend Framework (core)
//!
//! Turns [`rbf_bus`]'s at-least-once bus plus a Postgres database into a
//! platform for exactly-once-effective request/response and job
//! processing: a [`registry::Registry`] routes inbound subjects to typed
//! handlers, the [`handler::MessageHandler`] runs the per-message
//! idempotency/transaction/reply pipeline, the [`dispatcher`] and
//! [`reaper`] background loops keep the transactional outbox and result
//! table healthy, and the [`client::Client`] + [`inbox::ReplyInbox`] pair
//! gives callers a request/response API over the same bus. The
//! [`lifecycle::LifecycleManager`] starts and stops all of it together.
//!
//! ## Wiring
//!
//! ```rust,no_run
//! use rbf_core::{RbfConfig, lifecycle::{LifecycleManager, QueueConfig}, registry::{Registry, HandlerEntry, Kind, PathPattern}};
//! use rbf_bus::{EventBus, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! let pool = sqlx::postgres::PgPoolOptions::new()
//!     .connect_lazy("postgres://localhost/rbf")?;
//! let registry: Arc<Registry<HandlerEntry>> = Arc::new(Registry::new());
//! let config = RbfConfig::new("acme");
//! let queues = vec![QueueConfig::new("api.>", "acme-api-worker", "api.")];
//!
//! let manager = LifecycleManager::new(bus, pool, registry, config, queues);
//! let client = manager.start().await?;
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod inbox;
pub mod lifecycle;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod time;

pub use client::{Client, RequestOptions, RetryOptions};
pub use config::RbfConfig;
pub use error::{ClientError, ErrorCode, ErrorPayload, RbfError};
pub use handler::{MessageHandler, Middleware, MutationHandler, QueryHandler, RequestContext};
pub use inbox::{PendingRequests, ReplyInbox};
pub use lifecycle::{LifecycleManager, QueueConfig};
pub use registry::{HandlerEntry, Kind, PathPattern, Registry, RegistryError};
pub use scheduler::{OutboxItem, OutboxKind, Scheduler};

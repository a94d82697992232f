//! Lifecycle Manager: starts/stops every background loop together under one
//! cancellation token (spec §4.8).

use crate::client::Client;
use crate::dispatcher;
use crate::error::RbfError;
use crate::handler::MessageHandler;
use crate::inbox::{PendingRequests, ReplyInbox};
use crate::reaper;
use crate::registry::{HandlerEntry, Registry};
use crate::RbfConfig;
use rbf_bus::EventBus;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// One durable-consumer-backed queue to poll: its subject filter, durable
/// consumer name, the subject-prefix the Message Handler strips before a
/// registry lookup, and a per-consumer concurrency cap.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub subject_filter: String,
    pub durable_name: String,
    pub subject_prefix: String,
    /// Outstanding deliveries processed concurrently for this queue.
    /// Defaults to 1, matching a single consumer iterator processing one
    /// delivery at a time.
    pub concurrency: usize,
}

impl QueueConfig {
    pub fn new(
        subject_filter: impl Into<String>,
        durable_name: impl Into<String>,
        subject_prefix: impl Into<String>,
    ) -> Self {
        Self {
            subject_filter: subject_filter.into(),
            durable_name: durable_name.into(),
            subject_prefix: subject_prefix.into(),
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the bus, database pool, registry, and queue configuration for one
/// namespace, and drives every background loop through a shared lifecycle.
pub struct LifecycleManager {
    bus: Arc<dyn EventBus>,
    pool: PgPool,
    registry: Arc<Registry<HandlerEntry>>,
    config: RbfConfig,
    queues: Vec<QueueConfig>,
    pending: Arc<PendingRequests>,
    running: Mutex<Option<Running>>,
}

impl LifecycleManager {
    pub fn new(
        bus: Arc<dyn EventBus>,
        pool: PgPool,
        registry: Arc<Registry<HandlerEntry>>,
        config: RbfConfig,
        queues: Vec<QueueConfig>,
    ) -> Self {
        Self {
            bus,
            pool,
            registry,
            config,
            queues,
            pending: PendingRequests::new(),
            running: Mutex::new(None),
        }
    }

    /// Launch the Reply Inbox, the Outbox Dispatcher + Result Reaper, and
    /// one consumer loop per queue, all gated by a fresh cancellation
    /// token. Returns a [`Client`] bound to this run. Re-entry before
    /// [`Self::stop`] fails loudly.
    pub async fn start(&self) -> Result<Client, RbfError> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return Err(RbfError::transient(
                "lifecycle manager already started; call stop() first",
            ));
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let inbox = ReplyInbox::new(self.config.inbox_address.clone(), self.pending.clone());
        let inbox_bus = self.bus.clone();
        let inbox_cancel = cancel.child_token();
        tasks.push(tokio::spawn(async move { inbox.run(inbox_bus, inbox_cancel).await }));

        tasks.push(tokio::spawn(dispatcher::run(
            self.pool.clone(),
            self.bus.clone(),
            self.config.clone(),
            cancel.child_token(),
        )));
        tasks.push(tokio::spawn(reaper::run(
            self.pool.clone(),
            self.config.clone(),
            cancel.child_token(),
        )));

        let handler = Arc::new(MessageHandler::new(
            self.registry.clone(),
            self.pool.clone(),
            self.bus.clone(),
            self.config.clone(),
        ));

        for queue in &self.queues {
            let handler = handler.clone();
            let bus = self.bus.clone();
            let queue = queue.clone();
            let queue_cancel = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                run_queue(handler, bus, queue, queue_cancel).await
            }));
        }

        let client = Client::new(
            self.bus.clone(),
            self.pending.clone(),
            self.config.inbox_address.clone(),
            cancel.clone(),
        );

        *guard = Some(Running { cancel, tasks });
        Ok(client)
    }

    /// Trigger cancellation, await every tracked task (swallowing and
    /// logging panics), and reset state so a subsequent [`Self::start`] can
    /// succeed. A no-op if not currently started.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();

        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "lifecycle task panicked");
            }
        }
    }
}

async fn run_queue(
    handler: Arc<MessageHandler>,
    bus: Arc<dyn EventBus>,
    queue: QueueConfig,
    cancel: CancellationToken,
) {
    let span = tracing::info_span!(
        "rbf_queue_consumer",
        subject_filter = %queue.subject_filter,
        durable_name = %queue.durable_name,
    );
    async move {
        tracing::info!("queue consumer starting");

        let consumer = match bus.durable_consumer(&queue.subject_filter, &queue.durable_name).await {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(error = %e, subject_filter = %queue.subject_filter, "failed to open durable consumer");
                return;
            }
        };
        let consumer = Arc::new(Mutex::new(consumer));

        let mut workers = Vec::with_capacity(queue.concurrency.max(1));
        for _ in 0..queue.concurrency.max(1) {
            let consumer = consumer.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            let subject_prefix = queue.subject_prefix.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let delivery = tokio::select! {
                        _ = cancel.cancelled() => return,
                        delivery = async { consumer.lock().await.next().await } => delivery,
                    };

                    let Some(delivery) = delivery else {
                        return;
                    };

                    handler.handle(&subject_prefix, delivery).await;
                }
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }

        tracing::info!("queue consumer stopping");
    }
    .instrument(span)
    .await;
}

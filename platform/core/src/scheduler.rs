//! Scheduler: the per-invocation outbox accumulator handed to mutation
//! handlers (spec §4.2).

use crate::time::{new_ordered_id, now_ms};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// One planned side effect, materialized into an `outbox` row on commit.
#[derive(Debug, Clone)]
pub struct OutboxItem {
    pub id: Uuid,
    pub kind: OutboxKind,
    pub path: String,
    pub data: Value,
    pub target_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxKind {
    /// A request routed back through the registry under `path`.
    Request,
    /// A raw message published verbatim to `path`.
    Message,
}

/// Accumulates outbox items and a retry-delay override for the enclosing
/// message. Has no side effects on the bus itself — the Message Handler
/// materializes its contents into `outbox` rows on commit, or discards them
/// on rollback.
#[derive(Debug, Default)]
pub struct Scheduler {
    items: Vec<OutboxItem>,
    retry_delay: Option<Duration>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request to `target_path`, resolved against the handler's
    /// own subject namespace by the caller before being stored here.
    pub fn enqueue(&mut self, target_path: impl Into<String>, input: Value) -> Uuid {
        let id = new_ordered_id();
        self.items.push(OutboxItem {
            id,
            kind: OutboxKind::Request,
            path: target_path.into(),
            data: input,
            target_at: None,
        });
        id
    }

    /// Like [`Self::enqueue`] but not dispatched until `instant_ms`.
    pub fn run_at(&mut self, instant_ms: i64, target_path: impl Into<String>, input: Value) -> Uuid {
        let id = new_ordered_id();
        self.items.push(OutboxItem {
            id,
            kind: OutboxKind::Request,
            path: target_path.into(),
            data: input,
            target_at: Some(instant_ms),
        });
        id
    }

    /// Like [`Self::run_at`] but relative to now.
    pub fn run_after(&mut self, delay: Duration, target_path: impl Into<String>, input: Value) -> Uuid {
        self.run_at(now_ms() + delay.as_millis() as i64, target_path, input)
    }

    /// Publish a raw message (not routed through the registry) to `subject`.
    pub fn publish(&mut self, subject: impl Into<String>, payload: Value) -> Uuid {
        let id = new_ordered_id();
        self.items.push(OutboxItem {
            id,
            kind: OutboxKind::Message,
            path: subject.into(),
            data: payload,
            target_at: None,
        });
        id
    }

    /// Override the nak delay used if the enclosing transaction fails
    /// transiently and the message is redelivered.
    pub fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = Some(delay);
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    /// Drain the accumulated items, consuming the scheduler. Called by the
    /// Message Handler once the handler has returned successfully.
    pub fn into_items(self) -> Vec<OutboxItem> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_accumulates_without_bus_effects() {
        let mut scheduler = Scheduler::new();
        scheduler.enqueue("orders.create", json!({"sku": "abc"}));
        scheduler.publish("notifications.sent", json!({"ok": true}));

        let items = scheduler.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].kind, OutboxKind::Request);
        assert_eq!(items[1].kind, OutboxKind::Message);
    }

    #[test]
    fn run_after_sets_target_at_relative_to_now() {
        let mut scheduler = Scheduler::new();
        let before = now_ms();
        scheduler.run_after(Duration::from_secs(60), "jobs.sweep", json!(null));
        let items = scheduler.into_items();
        assert!(items[0].target_at.unwrap() >= before + 59_000);
    }

    #[test]
    fn retry_delay_defaults_to_none() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.retry_delay(), None);
        scheduler.set_retry_delay(Duration::from_secs(5));
        assert_eq!(scheduler.retry_delay(), Some(Duration::from_secs(5)));
    }
}

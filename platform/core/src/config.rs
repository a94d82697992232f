//! RBF configuration (spec §6).
//!
//! Grounded in `modules/ar/src/main.rs`'s env-var loading style, but RBF
//! itself never touches `std::env` — libraries shouldn't reach into process
//! environment. `RbfConfig::from_env` is a convenience constructor for hosts
//! that want the same `DATABASE_URL`/`BUS_TYPE`-style wiring the teacher's
//! binaries use; tests and other callers build `RbfConfig` directly.

use std::time::Duration;
use uuid::Uuid;

/// Tunables for the periodic tasks and client defaults.
#[derive(Debug, Clone)]
pub struct RbfConfig {
    /// Prepended to every registered path to form the bus subject, e.g. `"api."`.
    pub subject_prefix: String,
    /// Prefix for JetStream stream names created per queue.
    pub stream_name_prefix: String,
    /// Prefix for durable consumer names created per queue.
    pub consumer_name_prefix: String,
    /// Subject this process listens on for replies: `"<inbox_address>.*"`.
    pub inbox_address: String,
    /// Cadence for the Outbox Dispatcher and Result Reaper (before jitter).
    pub periodic_tasks_interval: Duration,
    /// Result rows older than this are pruned by the Result Reaper.
    pub results_max_age: Duration,
    /// Unused by the core pipeline directly; exposed for host-side request
    /// aging policies (e.g. expiring pending client calls).
    pub request_max_age: Duration,
    /// Partitions `results`/`outbox` rows so multiple RBF instances can share
    /// one database. Required — no default.
    pub namespace: String,
    /// Default per-attempt timeout for `Client::request_with_retries`.
    pub default_timeout: Duration,
    /// Default attempt count for `Client::request_with_retries`.
    pub default_retries: u32,
    /// Grace period before the Outbox Dispatcher considers a row overdue,
    /// so it doesn't race the Message Handler's post-commit fast-path publish.
    pub outbox_grace: Duration,
}

impl RbfConfig {
    /// Construct a config with spec defaults for everything but `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            subject_prefix: String::new(),
            stream_name_prefix: String::new(),
            consumer_name_prefix: String::new(),
            inbox_address: format!("inbox.{}", Uuid::new_v4()),
            periodic_tasks_interval: Duration::from_millis(30_000),
            results_max_age: Duration::from_millis(86_400_000),
            request_max_age: Duration::from_millis(300_000),
            namespace: namespace.into(),
            default_timeout: Duration::from_millis(60_000),
            default_retries: 3,
            outbox_grace: Duration::from_millis(5_000),
        }
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    pub fn with_inbox_address(mut self, address: impl Into<String>) -> Self {
        self.inbox_address = address.into();
        self
    }

    pub fn with_periodic_tasks_interval(mut self, interval: Duration) -> Self {
        self.periodic_tasks_interval = interval;
        self
    }

    pub fn with_results_max_age(mut self, age: Duration) -> Self {
        self.results_max_age = age;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_outbox_grace(mut self, grace: Duration) -> Self {
        self.outbox_grace = grace;
        self
    }

    /// Build from environment variables, following the teacher's
    /// `main.rs` convention (`VAR.unwrap_or_else(|_| default)`).
    ///
    /// Reads `RBF_NAMESPACE` (required), `RBF_SUBJECT_PREFIX`,
    /// `RBF_INBOX_ADDRESS`, `RBF_PERIODIC_TASKS_INTERVAL_MS`,
    /// `RBF_RESULTS_MAX_AGE_MS`, `RBF_REQUEST_MAX_AGE_MS`,
    /// `RBF_DEFAULT_TIMEOUT_MS`, `RBF_DEFAULT_RETRIES`.
    pub fn from_env() -> Self {
        let namespace =
            std::env::var("RBF_NAMESPACE").expect("RBF_NAMESPACE must be set");

        let mut config = Self::new(namespace);

        if let Ok(prefix) = std::env::var("RBF_SUBJECT_PREFIX") {
            config.subject_prefix = prefix;
        }
        if let Ok(address) = std::env::var("RBF_INBOX_ADDRESS") {
            config.inbox_address = address;
        }
        if let Ok(ms) = std::env::var("RBF_PERIODIC_TASKS_INTERVAL_MS") {
            if let Ok(ms) = ms.parse() {
                config.periodic_tasks_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(ms) = std::env::var("RBF_RESULTS_MAX_AGE_MS") {
            if let Ok(ms) = ms.parse() {
                config.results_max_age = Duration::from_millis(ms);
            }
        }
        if let Ok(ms) = std::env::var("RBF_REQUEST_MAX_AGE_MS") {
            if let Ok(ms) = ms.parse() {
                config.request_max_age = Duration::from_millis(ms);
            }
        }
        if let Ok(ms) = std::env::var("RBF_DEFAULT_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.default_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(n) = std::env::var("RBF_DEFAULT_RETRIES") {
            if let Ok(n) = n.parse() {
                config.default_retries = n;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = RbfConfig::new("acme");
        assert_eq!(config.namespace, "acme");
        assert_eq!(config.subject_prefix, "");
        assert_eq!(config.periodic_tasks_interval, Duration::from_secs(30));
        assert_eq!(config.results_max_age, Duration::from_secs(86_400));
        assert_eq!(config.request_max_age, Duration::from_secs(300));
        assert_eq!(config.default_timeout, Duration::from_secs(60));
        assert_eq!(config.default_retries, 3);
        assert_eq!(config.outbox_grace, Duration::from_secs(5));
        assert!(config.inbox_address.starts_with("inbox."));
    }
}

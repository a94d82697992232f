//! Well-known header names carried on request and reply messages.
//!
//! RBF does not define a generic event envelope (the teacher's `EventEnvelope<T>`
//! has no counterpart here — see DESIGN.md). Idempotency and correlation instead
//! ride on a small, fixed set of headers attached to the underlying [`BusMessage`](crate::BusMessage).

/// Application-level idempotency key, present on requests and echoed on replies.
pub const REQUEST_ID: &str = "Request-Id";

/// Bus subject the reply should be published to.
pub const REPLY_TO: &str = "Reply-To";

/// Decimal status code on a reply; `200` denotes success.
pub const STATUS_CODE: &str = "Status-Code";

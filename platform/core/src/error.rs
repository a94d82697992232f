//! Error taxonomy surfaced in replies, and the internal/business error split
//! that drives the Message Handler's branching (§4.3, §4.9, §7 of the spec).

use serde::{Deserialize, Serialize};

/// String error codes surfaced in reply bodies, each mapped to a numeric
/// HTTP-shaped status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Aborted,
    BadRequest,
    NotFound,
    Conflict,
    RequestIdConflict,
    InternalServerError,
}

impl ErrorCode {
    /// The numeric status this code maps to.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorCode::Aborted => 499,
            ErrorCode::BadRequest => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::RequestIdConflict => 409,
            ErrorCode::InternalServerError => 500,
        }
    }

    /// Business errors (status < 500) are idempotency-safe to persist and
    /// reply with; they are never retried by the Client Dispatcher.
    pub fn is_business(self) -> bool {
        self.status_code() < 500
    }
}

/// Error payload serialized into a reply body when a handler fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// The error type returned by mutation/query handlers.
///
/// `Business` errors are typed, expected failures (status < 500): they are
/// persisted as a result (for mutations), replied to the caller, and acked —
/// never retried by the bus or by the Client Dispatcher.
///
/// `Transient` errors are everything else: DB/bus hiccups, unexpected panics
/// surfaced as errors, and the like. They cause a rollback and a nak; the bus
/// redelivers and the client's own retry loop eventually times out and
/// retries.
#[derive(Debug, thiserror::Error)]
pub enum RbfError {
    #[error("{code:?}: {message}")]
    Business { code: ErrorCode, message: String },

    #[error("transient error: {0}")]
    Transient(String),
}

impl RbfError {
    pub fn business(code: ErrorCode, message: impl Into<String>) -> Self {
        RbfError::Business {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::business(ErrorCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::business(ErrorCode::BadRequest, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::business(ErrorCode::Conflict, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::business(ErrorCode::Aborted, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        RbfError::Transient(message.into())
    }

    /// `true` for a typed, idempotency-safe business error.
    pub fn is_business(&self) -> bool {
        matches!(self, RbfError::Business { .. })
    }

    /// Render this error's `{ code, message }` reply payload. `Transient`
    /// errors never reach this — the handler naks instead of replying.
    pub fn as_payload(&self) -> ErrorPayload {
        match self {
            RbfError::Business { code, message } => ErrorPayload {
                code: *code,
                message: message.clone(),
            },
            RbfError::Transient(message) => ErrorPayload {
                code: ErrorCode::InternalServerError,
                message: message.clone(),
            },
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            RbfError::Business { code, .. } => code.status_code(),
            RbfError::Transient(_) => ErrorCode::InternalServerError.status_code(),
        }
    }
}

impl From<sqlx::Error> for RbfError {
    fn from(e: sqlx::Error) -> Self {
        RbfError::Transient(e.to_string())
    }
}

impl From<rbf_bus::BusError> for RbfError {
    fn from(e: rbf_bus::BusError) -> Self {
        RbfError::Transient(e.to_string())
    }
}

/// Error type returned to callers of the Client Dispatcher.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ClientError {
    #[error("{code:?}: {message}")]
    Business { code: ErrorCode, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("request aborted")]
    Aborted,

    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Business errors (any status < 500, including ABORTED/499) are not
    /// retried by `request_with_retries`. The source text is ambiguous about
    /// whether a 499 counts; this crate takes the stricter reading recorded
    /// in DESIGN.md: no retry on any business error.
    pub fn is_business_non_retryable(&self) -> bool {
        matches!(self, ClientError::Business { code, .. } if code.is_business())
    }
}

//! Error types for request execution.
//!
//! # Design
//! Failures fall into three tiers. `TransportError` is what a transport reports
//! when no usable HTTP exchange happened. `ResponseError` is the classified
//! failure of a single attempt and drives the retry/recovery branching.
//! `RequestError` is the terminal value handed to callbacks: retryable failures
//! only surface once the attempts budget is exhausted. `ProtocolMisuse` (a
//! request that can never be sent) is reported when the operation is built,
//! so it never reaches the retry loop.

use bytes::Bytes;
use thiserror::Error;

use crate::operation::OperationId;
use crate::response::StatusCategory;

/// A request description that cannot be turned into a valid HTTP request.
///
/// This is a programmer error. It is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolMisuse {
    #[error("invalid endpoint url {endpoint:?}: {reason}")]
    InvalidUrl { endpoint: String, reason: String },

    #[error("payload for {endpoint:?} cannot be encoded: {reason}")]
    UnencodablePayload { endpoint: String, reason: String },
}

/// Failure reported by a `Transport` when the exchange did not complete.
///
/// `status` is set when the transport saw a status line before failing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport failure{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Classified failure of one attempt.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("request failed with {category:?}{}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct ResponseError {
    pub status: Option<u16>,
    pub category: StatusCategory,
    #[source]
    pub source: Option<TransportError>,
    /// Body of a non-2xx response, kept for diagnostics.
    pub body: Option<Bytes>,
}

impl ResponseError {
    pub fn is_unauthorized(&self) -> bool {
        self.category == StatusCategory::Unauthorized
    }
}

/// Terminal failure delivered to an operation's callback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// Every allowed attempt failed; carries the last classified failure.
    #[error("gave up after {attempts} retries: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: ResponseError,
    },

    /// The operation was cancelled before it produced a result.
    #[error("operation cancelled")]
    Cancelled,
}

impl RequestError {
    /// The last classified HTTP or transport failure, if any.
    pub fn response(&self) -> Option<&ResponseError> {
        match self {
            RequestError::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.response().and_then(|e| e.status)
    }

    pub fn category(&self) -> Option<StatusCategory> {
        self.response().map(|e| e.category)
    }
}

/// Errors raised by a `WorkQueue` itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("work queue {0:?} is closed")]
    Closed(String),

    #[error("work queue used outside a tokio runtime")]
    NoRuntime,

    #[error("operation {0} was already submitted")]
    AlreadySubmitted(OperationId),
}

//! Queued, deduplicated HTTP request operations with retry and session recovery.
//!
//! # Overview
//! Callers describe a request declaratively (`RequestSpec`), wrap it in a
//! `RequestOperation` and submit it to a `WorkQueue`. The operation never
//! touches the network itself: it hands a prepared `HttpRequest` to a
//! `Transport` and classifies the `HttpResponse` that comes back, which keeps
//! the retry and recovery logic deterministic under test.
//!
//! # Design
//! - Operations sharing an `OperationId` are the same operation; a queue runs
//!   at most one of them at a time and hands the result to every submitter.
//! - Failures are retried up to `RetryPolicy::max_retries`. A 401 goes through
//!   the host's `SessionRecovery` hook instead, serialized process-wide.
//! - `AggregateOperation` is a barrier that reports whether a group of
//!   requests all succeeded.
//! - `UreqTransport` (feature `ureq`, on by default) is the bundled transport.

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod multipart;
pub mod operation;
pub mod queue;
pub mod request;
pub mod request_operation;
pub mod response;
pub mod transport;

pub use aggregate::AggregateOperation;
pub use config::{QueueConfig, RetryPolicy, SessionConfig, Sessions};
pub use error::{ProtocolMisuse, QueueError, RequestError, ResponseError, TransportError};
pub use http::{Delivery, HttpMethod, HttpRequest, HttpResponse};
pub use multipart::{MimeType, MultipartPart};
pub use operation::{IdGenerator, Lifecycle, Operation, OperationId, SequentialIds, UuidIds};
pub use queue::{QualityOfService, SubmitOptions, SubmitOutcome, WorkQueue};
pub use request::{Payload, RequestMethod, RequestSpec};
pub use request_operation::{
    NoRecovery, RequestOperation, RequestOperationBuilder, RequestResult, SessionRecovery,
};
pub use response::{JsonPayload, ResponseData, StatusCategory};
pub use transport::Transport;
#[cfg(feature = "ureq")]
pub use transport::UreqTransport;

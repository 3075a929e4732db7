//! Response classification and payload accessors.
//!
//! `classify` turns the raw outcome of one transport call into either
//! `ResponseData` (any 2xx) or a `ResponseError` whose `StatusCategory` decides
//! whether the operation retries or attempts session recovery.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{ResponseError, TransportError};
use crate::http::HttpResponse;

/// Coarse grouping of HTTP failure statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusCategory {
    BadRequest,
    Unauthorized,
    PaymentRequired,
    Forbidden,
    NotFound,
    InternalServerError,
    /// Any status without a dedicated category, and transport failures with no status.
    Unlisted,
}

impl StatusCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => StatusCategory::BadRequest,
            401 => StatusCategory::Unauthorized,
            402 => StatusCategory::PaymentRequired,
            403 => StatusCategory::Forbidden,
            404 => StatusCategory::NotFound,
            500 => StatusCategory::InternalServerError,
            _ => StatusCategory::Unlisted,
        }
    }
}

/// Successful response payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseData {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// `None` when the server sent an empty body.
    pub body: Option<Bytes>,
    /// Location of a downloaded file for file deliveries.
    pub url: Option<String>,
}

impl ResponseData {
    pub fn text(&self) -> Option<String> {
        self.body.as_deref().and_then(codec::decode_text)
    }

    pub fn json(&self) -> Option<JsonPayload> {
        self.body.as_deref().and_then(codec::decode_json)
    }

    pub fn lines(&self) -> Option<Vec<String>> {
        self.body.as_deref().and_then(codec::decode_lines)
    }

    /// Decode the body into `T`; `None` when there is no body or it does not match.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        self.body
            .as_deref()
            .and_then(|body| codec::decode_typed(body).ok())
    }
}

/// Generic JSON object view of a response body.
///
/// Non-object bodies are wrapped under a reserved key so callers always get a map.
pub type JsonPayload = BTreeMap<String, serde_json::Value>;

/// Classify one transport outcome.
pub fn classify(outcome: Result<HttpResponse, TransportError>) -> Result<ResponseData, ResponseError> {
    match outcome {
        Ok(response) if response.is_success() => Ok(ResponseData {
            status: response.status,
            headers: response.headers,
            body: (!response.body.is_empty()).then_some(response.body),
            url: response.url,
        }),
        Ok(response) => Err(ResponseError {
            status: Some(response.status),
            category: StatusCategory::from_status(response.status),
            source: None,
            body: (!response.body.is_empty()).then_some(response.body),
        }),
        Err(err) => Err(ResponseError {
            status: err.status,
            category: err
                .status
                .map_or(StatusCategory::Unlisted, StatusCategory::from_status),
            source: Some(err),
            body: None,
        }),
    }
}

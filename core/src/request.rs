//! Declarative request descriptions and their preparation into `HttpRequest`s.
//!
//! # Design
//! A `RequestSpec` is immutable once an operation owns it. `prepare` is a pure
//! function of the `RequestSpec` and the session presets, so every retry of an
//! operation sends the same method, URL, headers and body. Anything that makes
//! preparation fail is a `ProtocolMisuse`: the request can never succeed and
//! must not be retried.

use std::collections::BTreeMap;

use bytes::Bytes;
use url::Url;

use crate::config::{SessionConfig, Sessions};
use crate::error::ProtocolMisuse;
use crate::http::{Delivery, HttpMethod, HttpRequest};
use crate::multipart::{self, MultipartPart, DEFAULT_BOUNDARY};

/// Body carried by upload methods.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as UTF-8.
    Text(String),
    /// Sent verbatim.
    Bytes(Bytes),
    /// Serialized as JSON.
    Json(serde_json::Value),
}

impl Payload {
    /// Serialize any `Serialize` value into a JSON payload.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Payload::Json)
    }

    fn encode(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            Payload::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => serde_json::to_vec(value).map(Bytes::from),
        }
    }
}

/// What a request does, including its method-specific body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMethod {
    /// GET with the body returned in memory.
    GetData,
    /// GET with the body downloaded to a file.
    GetUrl,
    Post(Option<Payload>),
    PostForm(Vec<MultipartPart>),
    Put(Option<Payload>),
    Delete,
    DeletePayload(Option<Payload>),
}

impl RequestMethod {
    pub fn wire_method(&self) -> HttpMethod {
        match self {
            RequestMethod::GetData | RequestMethod::GetUrl => HttpMethod::Get,
            RequestMethod::Post(_) | RequestMethod::PostForm(_) => HttpMethod::Post,
            RequestMethod::Put(_) => HttpMethod::Put,
            RequestMethod::Delete | RequestMethod::DeletePayload(_) => HttpMethod::Delete,
        }
    }

    /// Downloads and multipart uploads use the binary session.
    fn uses_binary_session(&self) -> bool {
        matches!(self, RequestMethod::GetUrl | RequestMethod::PostForm(_))
    }
}

/// Immutable description of one HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub endpoint: String,
    pub method: RequestMethod,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

impl RequestSpec {
    pub fn new(endpoint: impl Into<String>, method: RequestMethod) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, RequestMethod::GetData)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Build the wire request.
    ///
    /// # Errors
    ///
    /// - `ProtocolMisuse::InvalidUrl` when the endpoint is not an absolute URL.
    /// - `ProtocolMisuse::UnencodablePayload` when an upload has no payload or
    ///   the payload cannot be serialized.
    pub fn prepare(&self, sessions: &Sessions) -> Result<HttpRequest, ProtocolMisuse> {
        let url = self.url()?;
        let session: &SessionConfig = if self.method.uses_binary_session() {
            &sessions.binary
        } else {
            &sessions.json
        };

        let mut request = HttpRequest {
            method: self.method.wire_method(),
            url: url.to_string(),
            headers: session.default_headers.clone(),
            body: None,
            delivery: Delivery::Data,
        };
        for (name, value) in &self.headers {
            request.set_header(name, value.clone());
        }

        match &self.method {
            RequestMethod::GetData | RequestMethod::Delete => {}
            RequestMethod::GetUrl => request.delivery = Delivery::File,
            RequestMethod::Post(payload)
            | RequestMethod::Put(payload)
            | RequestMethod::DeletePayload(payload) => {
                request.body = Some(self.encode_payload(payload.as_ref())?);
            }
            RequestMethod::PostForm(parts) => {
                let (content_type, body) = multipart::encode(parts, DEFAULT_BOUNDARY);
                request.set_header("Content-Type", content_type);
                request.body = Some(body);
            }
        }

        Ok(request)
    }

    fn url(&self) -> Result<Url, ProtocolMisuse> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| ProtocolMisuse::InvalidUrl {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })?;
        if url.cannot_be_a_base() {
            return Err(ProtocolMisuse::InvalidUrl {
                endpoint: self.endpoint.clone(),
                reason: "endpoint is not a hierarchical URL".to_string(),
            });
        }
        if !self.query.is_empty() {
            url.set_query(None);
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        Ok(url)
    }

    fn encode_payload(&self, payload: Option<&Payload>) -> Result<Bytes, ProtocolMisuse> {
        let payload = payload.ok_or_else(|| ProtocolMisuse::UnencodablePayload {
            endpoint: self.endpoint.clone(),
            reason: "upload request has no payload".to_string(),
        })?;
        payload
            .encode()
            .map_err(|e| ProtocolMisuse::UnencodablePayload {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })
    }
}

//! HTTP exchange types for the host-does-IO pattern.
//!
//! # Design
//! These types describe one prepared HTTP exchange as plain data. Operations
//! build `HttpRequest` values from a `RequestSpec` and hand them to a
//! `Transport`; the transport is the only component that touches the network
//! and reports back with an `HttpResponse`. Everything above the transport is
//! deterministic and testable with scripted responses.

use bytes::Bytes;

/// HTTP method as it goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// How the transport should hand back the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Body bytes are returned in memory.
    #[default]
    Data,
    /// Body is written to a local file whose URL is returned instead.
    File,
}

/// A prepared HTTP request described as plain data.
///
/// Produced by `RequestSpec::prepare`. Headers are ordered; later entries with
/// the same name override earlier ones when a transport applies them.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub delivery: Delivery,
}

impl HttpRequest {
    /// Case-insensitive lookup of the last header with `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace every header named `name` with a single `name: value` entry.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }
}

/// A completed HTTP exchange described as plain data.
///
/// Returned by a `Transport` whenever the server answered, whatever the status.
/// `url` is set for file deliveries and points at the downloaded file.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub url: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            url: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

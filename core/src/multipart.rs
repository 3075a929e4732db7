//! `multipart/form-data` framing for file uploads.
//!
//! # Design
//! Encoding is a pure function of the ordered parts and the boundary token, so
//! retries resend byte-identical bodies. Each part is framed as
//!
//! ```text
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="<field>"; filename="<file>"\r\n
//! Content-Type: <mime>\r\n
//! \r\n
//! <bytes>\r\n
//! ```
//!
//! and the body ends with `--<boundary>--\r\n`. `decode` reverses the framing
//! and exists mostly so callers and tests can inspect what went on the wire.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BOUNDARY: &str = "NetOpsBoundary";

/// MIME types commonly attached to uploads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MimeType {
    Mpeg4,
    Png,
    Jpeg,
    Svg,
    TextPlain,
    Json,
    Other(String),
}

impl MimeType {
    pub fn as_str(&self) -> &str {
        match self {
            MimeType::Mpeg4 => "audio/mpeg4",
            MimeType::Png => "image/png",
            MimeType::Jpeg => "image/jpeg",
            MimeType::Svg => "image/svg+xml",
            MimeType::TextPlain => "text/plain",
            MimeType::Json => "application/json",
            MimeType::Other(other) => other,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "audio/mpeg4" => MimeType::Mpeg4,
            "image/png" => MimeType::Png,
            "image/jpeg" => MimeType::Jpeg,
            "image/svg+xml" => MimeType::Svg,
            "text/plain" => MimeType::TextPlain,
            "application/json" => MimeType::Json,
            other => MimeType::Other(other.to_string()),
        }
    }
}

/// One section of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub field_name: String,
    pub file_name: String,
    pub bytes: Bytes,
    pub mime_type: MimeType,
}

impl MultipartPart {
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Bytes>,
        mime_type: MimeType,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: file_name.into(),
            bytes: bytes.into(),
            mime_type,
        }
    }
}

/// Encode `parts` in order. Returns the `Content-Type` header value and the body.
pub fn encode(parts: &[MultipartPart], boundary: &str) -> (String, Bytes) {
    let mut body = BytesMut::new();
    for part in parts {
        let head = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            part.field_name,
            part.file_name,
            part.mime_type.as_str(),
        );
        body.extend_from_slice(head.as_bytes());
        body.extend_from_slice(&part.bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let content_type = format!("multipart/form-data; boundary={boundary}");
    (content_type, body.freeze())
}

/// Locate each boundary-delimited section of `body` and parse its headers.
///
/// Returns `None` when the framing does not match what [`encode`] produces.
pub fn decode(body: &[u8], boundary: &str) -> Option<Vec<MultipartPart>> {
    let delimiter = format!("--{boundary}\r\n");
    let closing = format!("--{boundary}--\r\n");
    // Every part body is followed by CRLF and then the next delimiter.
    let separator = format!("\r\n--{boundary}");

    let mut rest = body.strip_prefix(closing.as_bytes()).map_or(body, |_| &[][..]);
    let mut parts = Vec::new();
    while !rest.is_empty() {
        rest = rest.strip_prefix(delimiter.as_bytes())?;
        let header_end = find(rest, b"\r\n\r\n")?;
        let head = std::str::from_utf8(&rest[..header_end]).ok()?;
        rest = &rest[header_end + 4..];

        let body_end = find(rest, separator.as_bytes())?;
        let (field_name, file_name, mime_type) = parse_part_head(head)?;
        parts.push(MultipartPart {
            field_name,
            file_name,
            bytes: Bytes::copy_from_slice(&rest[..body_end]),
            mime_type,
        });

        // Skip the CRLF so `rest` starts at the next delimiter or the closing line.
        rest = &rest[body_end + 2..];
        if rest == closing.as_bytes() {
            break;
        }
    }
    Some(parts)
}

fn parse_part_head(head: &str) -> Option<(String, String, MimeType)> {
    let mut field_name = None;
    let mut file_name = None;
    let mut mime_type = None;
    for line in head.split("\r\n") {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-disposition") {
            field_name = quoted_param(value, "name");
            file_name = quoted_param(value, "filename");
        } else if name.eq_ignore_ascii_case("content-type") {
            mime_type = Some(MimeType::parse(value));
        }
    }
    Some((field_name?, file_name?, mime_type?))
}

fn quoted_param(value: &str, key: &str) -> Option<String> {
    value.split(';').find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        (k == key).then(|| v.trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

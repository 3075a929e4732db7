//! Stateless body decoders.

use serde::de::DeserializeOwned;

use crate::response::JsonPayload;

/// Reserved key wrapping a top-level JSON array.
pub const ARRAY_PAYLOAD_KEY: &str = "arrayPayload";

/// Reserved key wrapping a body that is text but not a JSON object or array.
pub const STRING_PAYLOAD_KEY: &str = "stringPayload";

pub fn decode_text(body: &[u8]) -> Option<String> {
    std::str::from_utf8(body).ok().map(str::to_string)
}

/// Decode a body as a JSON map.
///
/// Objects are returned as-is, arrays are wrapped under [`ARRAY_PAYLOAD_KEY`],
/// and anything else that is valid UTF-8 is wrapped as a string under
/// [`STRING_PAYLOAD_KEY`].
pub fn decode_json(body: &[u8]) -> Option<JsonPayload> {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => Some(map.into_iter().collect()),
        Ok(array @ serde_json::Value::Array(_)) => {
            Some(JsonPayload::from([(ARRAY_PAYLOAD_KEY.to_string(), array)]))
        }
        Ok(_) | Err(_) => {
            let text = decode_text(body)?;
            Some(JsonPayload::from([(
                STRING_PAYLOAD_KEY.to_string(),
                serde_json::Value::String(text),
            )]))
        }
    }
}

/// Split a text body on newlines, CSV-style. `\r\n` counts as a single break.
pub fn decode_lines(body: &[u8]) -> Option<Vec<String>> {
    let text = decode_text(body)?;
    Some(text.lines().map(str::to_string).collect())
}

pub fn decode_typed<T: DeserializeOwned>(body: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(body)
}

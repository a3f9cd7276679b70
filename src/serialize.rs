//! Message body encoding and decoding.
//!
//! Bodies travel as JSON under `application/json` or `string/utf8`, either
//! plain or gzip-compressed. Inbound decode failures are reported as
//! values so a malformed payload can never take down a consume loop.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::error::Error;

/// Content types this transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    /// `application/json`.
    #[default]
    Json,
    /// `string/utf8` (JSON on the wire, kept for legacy peers).
    Utf8,
}

impl ContentType {
    /// The AMQP `contentType` property value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Utf8 => "string/utf8",
        }
    }

    /// Parses an AMQP `contentType` property value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "application/json" => Some(ContentType::Json),
            "string/utf8" => Some(ContentType::Utf8),
            _ => None,
        }
    }
}

/// Content encodings this transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    /// Uncompressed.
    #[default]
    Plain,
    /// Gzip-compressed.
    Gzip,
}

impl ContentEncoding {
    /// The AMQP `contentEncoding` property value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Plain => "plain",
            ContentEncoding::Gzip => "gzip",
        }
    }

    /// Parses an AMQP `contentEncoding` property value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plain" => Some(ContentEncoding::Plain),
            "gzip" => Some(ContentEncoding::Gzip),
            _ => None,
        }
    }
}

/// Serializes an outbound body under the given encoding.
///
/// # Errors
///
/// Returns a validation error when the body cannot be encoded.
pub fn serialize(body: &Value, encoding: ContentEncoding) -> Result<Vec<u8>, Error> {
    let bytes = serde_json::to_vec(body)
        .map_err(|err| Error::Validation(format!("failed to serialize payload: {err}")))?;
    match encoding {
        ContentEncoding::Plain => Ok(bytes),
        ContentEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&bytes)
                .and_then(|()| encoder.finish())
                .map_err(|err| Error::Validation(format!("failed to gzip payload: {err}")))
        }
    }
}

/// Decodes an inbound body according to its declared content type and
/// encoding.
///
/// Unknown content types pass the bytes through as a lossy UTF-8 string;
/// the raw bytes remain available on the delivery itself.
///
/// # Errors
///
/// Returns a parse error (never panics) for unknown encodings, truncated
/// gzip streams or malformed JSON.
pub fn deserialize(
    data: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
) -> Result<Value, Error> {
    let encoding = match content_encoding {
        None => ContentEncoding::Plain,
        Some(value) => ContentEncoding::parse(value)
            .ok_or_else(|| Error::Parse(format!("unknown content encoding `{value}`")))?,
    };
    let plain = match encoding {
        ContentEncoding::Plain => data.to_vec(),
        ContentEncoding::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut buffer = Vec::new();
            decoder
                .read_to_end(&mut buffer)
                .map_err(|err| Error::Parse(format!("failed to gunzip payload: {err}")))?;
            buffer
        }
    };

    match content_type.and_then(ContentType::parse) {
        Some(_) => serde_json::from_slice(&plain)
            .map_err(|err| Error::Parse(format!("malformed JSON payload: {err}"))),
        None => Ok(Value::String(
            String::from_utf8_lossy(&plain).into_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn plain_json_round_trips() {
        let body = json!({"a": 1, "nested": {"b": [1, 2, 3]}});
        let bytes = serialize(&body, ContentEncoding::Plain).unwrap();
        let decoded = deserialize(&bytes, Some("application/json"), Some("plain")).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn gzip_round_trips_and_compresses() {
        let body = json!({"payload": "x".repeat(2048)});
        let plain = serialize(&body, ContentEncoding::Plain).unwrap();
        let compressed = serialize(&body, ContentEncoding::Gzip).unwrap();
        assert!(compressed.len() < plain.len());

        let decoded = deserialize(&compressed, Some("application/json"), Some("gzip")).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn utf8_content_type_is_json_on_the_wire() {
        let body = json!("just a string");
        let bytes = serialize(&body, ContentEncoding::Plain).unwrap();
        let decoded = deserialize(&bytes, Some("string/utf8"), None).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn unknown_encoding_is_a_parse_error() {
        let err = deserialize(b"{}", Some("application/json"), Some("zstd")).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = deserialize(b"{oops", Some("application/json"), Some("plain")).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn truncated_gzip_is_a_parse_error() {
        let compressed = serialize(&json!({"a": 1}), ContentEncoding::Gzip).unwrap();
        let err = deserialize(
            &compressed[..compressed.len() / 2],
            Some("application/json"),
            Some("gzip"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn unknown_content_type_passes_bytes_through() {
        let decoded = deserialize(b"raw bytes", Some("application/octet-stream"), None).unwrap();
        assert_eq!(decoded, Value::String("raw bytes".to_string()));
    }
}

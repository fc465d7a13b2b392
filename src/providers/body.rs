//! Request-scoped body cache.
//!
//! One representation of the client body is authoritative at any time.
//! Transitions replace the previous representation rather than keeping
//! several copies that could drift apart.

use crate::error::{RelayError, Result};
use bytes::Bytes;
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Bytes exactly as received from the client.
    RawBytes(Bytes),
    /// Generic map parsed from the client body.
    ParsedMap(Map<String, Value>),
    /// Bytes already prepared for a vendor; `managed_identity` records the
    /// sanitizer mode they were produced with.
    ProcessedBytes { bytes: Bytes, managed_identity: bool },
    /// Map already prepared for a vendor.
    ProcessedMap {
        map: Map<String, Value>,
        managed_identity: bool,
    },
}

impl RequestBody {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::RawBytes(_) => "raw bytes",
            RequestBody::ParsedMap(_) => "parsed map",
            RequestBody::ProcessedBytes { .. } => "processed bytes",
            RequestBody::ProcessedMap { .. } => "processed map",
        }
    }

    fn not_found(&self, wanted: &str) -> RelayError {
        RelayError::internal(
            "request_body_not_found",
            format!("request body not found: expected {wanted}, cached body is {}", self.kind()),
        )
    }

    pub fn raw_bytes(&self) -> Result<&Bytes> {
        match self {
            RequestBody::RawBytes(bytes) => Ok(bytes),
            other => Err(other.not_found("raw bytes")),
        }
    }

    pub fn parsed_map(&self) -> Result<&Map<String, Value>> {
        match self {
            RequestBody::ParsedMap(map) => Ok(map),
            other => Err(other.not_found("parsed map")),
        }
    }

    pub fn processed_bytes(&self) -> Result<(&Bytes, bool)> {
        match self {
            RequestBody::ProcessedBytes {
                bytes,
                managed_identity,
            } => Ok((bytes, *managed_identity)),
            other => Err(other.not_found("processed bytes")),
        }
    }

    pub fn processed_map(&self) -> Result<(&Map<String, Value>, bool)> {
        match self {
            RequestBody::ProcessedMap {
                map,
                managed_identity,
            } => Ok((map, *managed_identity)),
            other => Err(other.not_found("processed map")),
        }
    }

    /// Either map representation, whichever is current.
    pub fn any_map(&self) -> Option<&Map<String, Value>> {
        match self {
            RequestBody::ParsedMap(map) | RequestBody::ProcessedMap { map, .. } => Some(map),
            _ => None,
        }
    }

    /// Either byte representation, whichever is current.
    pub fn any_bytes(&self) -> Option<&Bytes> {
        match self {
            RequestBody::RawBytes(bytes) | RequestBody::ProcessedBytes { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    /// Raw bytes become a parsed map. Already-parsed bodies are left alone.
    pub fn parse_map(&mut self) -> Result<&Map<String, Value>> {
        if let RequestBody::RawBytes(bytes) = self {
            let map: Map<String, Value> = serde_json::from_slice(bytes).map_err(|e| {
                RelayError::translation("invalid_request_body", format!("invalid request body: {e}"))
            })?;
            *self = RequestBody::ParsedMap(map);
        }
        match self {
            RequestBody::ParsedMap(map) | RequestBody::ProcessedMap { map, .. } => Ok(map),
            other => Err(other.not_found("a map")),
        }
    }

    pub fn set_processed_bytes(&mut self, bytes: Bytes, managed_identity: bool) {
        *self = RequestBody::ProcessedBytes {
            bytes,
            managed_identity,
        };
    }

    pub fn set_processed_map(&mut self, map: Map<String, Value>, managed_identity: bool) {
        *self = RequestBody::ProcessedMap {
            map,
            managed_identity,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_to_parsed_transition() {
        let mut body = RequestBody::RawBytes(Bytes::from_static(br#"{"model":"m"}"#));
        assert!(body.raw_bytes().is_ok());

        let map = body.parse_map().unwrap();
        assert_eq!(map["model"], "m");

        assert!(body.raw_bytes().is_err());
        assert!(body.parsed_map().is_ok());
    }

    #[test]
    fn test_processed_replaces_previous() {
        let mut body = RequestBody::RawBytes(Bytes::from_static(b"{}"));
        body.set_processed_bytes(Bytes::from_static(b"{\"a\":1}"), true);

        let (bytes, managed) = body.processed_bytes().unwrap();
        assert_eq!(bytes.as_ref(), b"{\"a\":1}");
        assert!(managed);

        let err = body.raw_bytes().unwrap_err();
        assert_eq!(err.code(), "request_body_not_found");
    }

    #[test]
    fn test_processed_map_accessors() {
        let mut body = RequestBody::RawBytes(Bytes::from_static(br#"{"model":"m"}"#));
        assert!(body.any_bytes().is_some());
        assert!(body.any_map().is_none());

        let mut map = body.parse_map().unwrap().clone();
        map.insert("stream".to_string(), Value::Bool(true));
        body.set_processed_map(map, false);

        let (map, managed) = body.processed_map().unwrap();
        assert_eq!(map["stream"], true);
        assert!(!managed);
        assert_eq!(body.any_map().unwrap()["model"], "m");
        assert!(body.any_bytes().is_none());
        assert!(body.parsed_map().is_err());
    }

    #[test]
    fn test_invalid_json_is_translation_error() {
        let mut body = RequestBody::RawBytes(Bytes::from_static(b"{oops"));
        let err = body.parse_map().unwrap_err();
        assert!(matches!(err, RelayError::Translation { .. }));
    }
}

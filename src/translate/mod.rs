//! Protocol translation between the canonical (OpenAI-shaped) chat API and
//! the vendor dialects.
//!
//! Request converters are pure apart from media fetching; stream handlers
//! are [`LineHandler`]s that run on the decoder task and keep the usage they
//! observe until the relay collects it.

pub mod claude;
pub mod claude_types;
pub mod gemini;
pub mod gemini_types;
pub mod openai_types;

use crate::error::{RelayError, Result};
use crate::stream::{LineHandler, RawLine, StreamSink};
use openai_types::Usage;
use serde_json::Value;

/// A line handler for the OpenAI-compatible surface: it yields serialized
/// chunk JSON and reports what it learned about usage once the stream ends.
pub trait ChatStreamHandler: LineHandler<String> {
    /// Usage reported by the vendor. Zero fields were never reported.
    fn usage(&self) -> Usage;

    /// Completion text seen so far, for counting when the vendor reports none.
    fn output_text(&self) -> &str;
}

impl LineHandler<String> for Box<dyn ChatStreamHandler> {
    fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<String>) {
        (**self).handle(line, sink)
    }
}

pub fn chat_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `stop` as a list: a single string or an array of strings.
pub fn stop_sequences(stop: Option<&Value>) -> Result<Option<Vec<String>>> {
    match stop {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .map(Some)
            .ok_or_else(invalid_stop),
        Some(_) => Err(invalid_stop()),
    }
}

fn invalid_stop() -> RelayError {
    RelayError::translation(
        "invalid_stop",
        "stop must be a string or an array of strings",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stop_sequences() {
        assert_eq!(stop_sequences(None).unwrap(), None);
        assert_eq!(
            stop_sequences(Some(&json!("x"))).unwrap(),
            Some(vec!["x".to_string()])
        );
        assert_eq!(
            stop_sequences(Some(&json!(["a", "b"]))).unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(stop_sequences(Some(&json!(["a", 1]))).is_err());
        assert!(stop_sequences(Some(&json!({"a": 1}))).is_err());
    }

    #[test]
    fn test_chat_id_shape() {
        let id = chat_id();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 32);
    }
}

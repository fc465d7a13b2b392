//! Usage bookkeeping for one request and its hand-off to billing.

use crate::error::{RelayError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::translate::openai_types::Usage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Write-once usage slots: the pre-flight estimate, then the final figure.
#[derive(Debug, Default)]
pub struct UsageLedger {
    estimate: Option<u64>,
    settled: Option<Usage>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_estimate(&mut self, prompt_tokens: u64) -> Result<()> {
        if self.estimate.is_some() {
            return Err(RelayError::internal(
                "usage_already_estimated",
                "pre-flight usage was already recorded",
            ));
        }
        self.estimate = Some(prompt_tokens);
        Ok(())
    }

    pub fn settle(&mut self, usage: Usage) -> Result<()> {
        if self.settled.is_some() {
            return Err(RelayError::internal(
                "usage_already_settled",
                "final usage was already recorded",
            ));
        }
        self.settled = Some(usage);
        Ok(())
    }

    pub fn estimate(&self) -> u64 {
        self.estimate.unwrap_or_default()
    }

    pub fn settled(&self) -> Option<&Usage> {
        self.settled.as_ref()
    }
}

/// Which inbound API served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    ChatCompletions,
    Embeddings,
    Gemini,
}

/// One billing record per request.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub surface: Surface,
    /// Empty when no channel was tried.
    pub channel: String,
    pub model: String,
    pub upstream_model: String,
    pub stream: bool,
    pub estimated_prompt_tokens: u64,
    pub usage: Usage,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

pub type SharedUsageSink = Arc<dyn UsageSink>;

/// Writes records to the JSONL event log under the `usage` component.
#[derive(Clone)]
pub struct LogUsageSink {
    logger: SharedLogger,
}

impl LogUsageSink {
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }
}

impl UsageSink for LogUsageSink {
    fn record(&self, record: UsageRecord) {
        tracing::info!(
            request_id = %record.request_id,
            channel = %record.channel,
            model = %record.model,
            prompt_tokens = record.usage.prompt_tokens,
            completion_tokens = record.usage.completion_tokens,
            success = record.success,
            "Usage recorded"
        );
        let level = if record.success {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let message = format!(
            "{} {} prompt={} completion={}",
            record.channel, record.model, record.usage.prompt_tokens, record.usage.completion_tokens
        );
        match serde_json::to_value(&record) {
            Ok(context) => self.logger.log_with_context(level, "usage", message, context),
            Err(e) => self.logger.error("usage", format!("unserializable usage record: {e}")),
        }
    }
}

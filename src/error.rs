//! Error taxonomy for the relay.
//!
//! Every failure carries an HTTP status, a machine code and a "local" flag.
//! Local errors originate in the gateway itself (bad channel setup, malformed
//! client input, decoder faults); non-local errors come from the upstream
//! vendor or the network path to it. The flag is used for retry decisions
//! and usage classification only; delivery is identical.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message shown to clients instead of raw dial/TLS/timeout text.
pub const TRANSPORT_FAILURE_MESSAGE: &str = "failed to reach upstream service";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("The API interface is not supported")]
    UnsupportedOperation { operation: String },

    #[error("{message}")]
    Translation { code: &'static str, message: String },

    #[error("{message}")]
    BudgetValidation { code: &'static str, message: String },

    /// Dial, TLS or timeout failure. `detail` is kept for logs only.
    #[error("{}", TRANSPORT_FAILURE_MESSAGE)]
    UpstreamTransport { detail: String },

    #[error("{message}")]
    UpstreamProtocol {
        status: u16,
        message: String,
        kind: String,
        code: Option<String>,
    },

    #[error("stream processing panic")]
    StreamPanic { detail: String },

    #[error("{reason}")]
    ContentBlocked { reason: String, code: String },

    #[error("{message}")]
    Internal { code: &'static str, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RelayError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
        }
    }

    pub fn translation(code: &'static str, msg: impl Into<String>) -> Self {
        Self::Translation {
            code,
            message: msg.into(),
        }
    }

    pub fn budget(code: &'static str, msg: impl Into<String>) -> Self {
        Self::BudgetValidation {
            code,
            message: msg.into(),
        }
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::UpstreamTransport {
            detail: detail.into(),
        }
    }

    pub fn upstream(
        status: u16,
        message: impl Into<String>,
        kind: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        Self::UpstreamProtocol {
            status,
            message: message.into(),
            kind: kind.into(),
            code,
        }
    }

    pub fn stream_panic(detail: impl Into<String>) -> Self {
        Self::StreamPanic {
            detail: detail.into(),
        }
    }

    pub fn blocked(reason: impl Into<String>, code: impl Into<String>) -> Self {
        Self::ContentBlocked {
            reason: reason.into(),
            code: code.into(),
        }
    }

    pub fn internal(code: &'static str, msg: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: msg.into(),
        }
    }

    /// Wrap a reqwest failure. Connection-level problems become transport
    /// errors; anything else (body decoding, builder misuse) is internal.
    /// The URL is stripped since some vendors carry the key in its query.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
            Self::transport(err.to_string())
        } else {
            Self::internal("http_client_error", err.to_string())
        }
    }

    /// Gateway-origin errors are local; vendor and network failures are not.
    pub fn is_local(&self) -> bool {
        !matches!(
            self,
            Self::UpstreamTransport { .. } | Self::UpstreamProtocol { .. }
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Configuration { .. } | Self::Internal { .. } | Self::StreamPanic { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Io(_) | Self::Toml(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnsupportedOperation { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::Translation { .. } | Self::BudgetValidation { .. } | Self::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::ContentBlocked { .. } => StatusCode::BAD_REQUEST,
            Self::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamProtocol { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    pub fn code(&self) -> String {
        match self {
            Self::Configuration { .. } => "invalid_channel_config".to_string(),
            Self::UnsupportedOperation { .. } => "unsupported_api".to_string(),
            Self::Translation { code, .. }
            | Self::BudgetValidation { code, .. }
            | Self::Internal { code, .. } => (*code).to_string(),
            Self::UpstreamTransport { .. } => "upstream_unreachable".to_string(),
            Self::UpstreamProtocol { code, status, .. } => code
                .clone()
                .unwrap_or_else(|| format!("upstream_status_{status}")),
            Self::StreamPanic { .. } => "system error".to_string(),
            Self::ContentBlocked { code, .. } => code.clone(),
            Self::Json(_) => "invalid_json".to_string(),
            Self::Io(_) => "io_error".to_string(),
            Self::Toml(_) => "invalid_config_file".to_string(),
        }
    }

    pub fn kind(&self) -> String {
        match self {
            Self::UpstreamProtocol { kind, .. } if !kind.is_empty() => kind.clone(),
            Self::UpstreamProtocol { .. } | Self::UpstreamTransport { .. } => {
                "upstream_error".to_string()
            }
            Self::StreamPanic { .. } => "system_error".to_string(),
            Self::Translation { .. }
            | Self::BudgetValidation { .. }
            | Self::ContentBlocked { .. }
            | Self::Json(_) => "invalid_request_error".to_string(),
            _ => "relay_error".to_string(),
        }
    }

    /// Body for the OpenAI-compatible surface.
    pub fn to_openai_envelope(&self) -> OpenAiErrorEnvelope {
        OpenAiErrorEnvelope {
            error: OpenAiErrorBody {
                message: self.to_string(),
                error_type: self.kind(),
                code: Some(self.code()),
            },
        }
    }

    /// Body for the Gemini-compatible surface.
    pub fn to_gemini_envelope(&self) -> GeminiErrorEnvelope {
        let status = self.status();
        GeminiErrorEnvelope {
            error: GeminiErrorBody {
                code: status.as_u16(),
                message: self.to_string(),
                status: google_status(status).to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiErrorEnvelope {
    pub error: OpenAiErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiErrorBody {
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiErrorEnvelope {
    pub error: GeminiErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiErrorBody {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

fn google_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        501 => "UNIMPLEMENTED",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

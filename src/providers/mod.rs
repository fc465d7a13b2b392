//! Vendor providers.
//!
//! A provider owns one channel's resolved configuration ([`BaseProvider`])
//! and speaks that vendor's wire format. The relay only sees the
//! [`Provider`] and [`GeminiRelay`] traits.

pub mod base;
pub mod body;
pub mod claude;
pub mod gemini;
pub mod openai;
pub mod params;
pub mod presets;

pub use base::{BaseProvider, EndpointTable, InboundHeaders, Operation};
pub use body::RequestBody;
pub use presets::{GeminiVariant, ProviderPreset, WireFormat};

use crate::config::{ChannelConfig, ClaudeSettings};
use crate::error::{RelayError, Result};
use crate::image::ImageFetcher;
use crate::requester::Requester;
use crate::stream::StreamReader;
use crate::translate::gemini::GeminiRelayStreamHandler;
use crate::translate::openai_types::{ChatCompletionRequest, Usage};
use crate::translate::ChatStreamHandler;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

/// Per-request facts every provider needs besides the body.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Model name exactly as the client sent it; echoed back in responses.
    pub client_model: String,
    pub inbound: InboundHeaders,
}

/// A finished non-streaming chat call, already in the client's shape.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub body: Value,
    /// Vendor-reported usage, if any.
    pub usage: Option<Usage>,
    /// Completion text, counted when the vendor reports no usage.
    pub output_text: String,
}

pub type ChatStream = StreamReader<String, Box<dyn ChatStreamHandler>>;

#[derive(Debug, Clone)]
pub struct EmbeddingReply {
    pub body: Value,
    pub usage: Option<Usage>,
}

/// A Gemini-native call: `/{version}/models/{model}:{action}`.
#[derive(Debug, Clone)]
pub struct GeminiCall {
    pub model: String,
    pub action: String,
    pub stream: bool,
}

impl GeminiCall {
    pub fn parse(model_action: &str) -> Result<Self> {
        let (model, action) = crate::translate::gemini::parse_model_action(model_action)?;
        let stream = action == "streamGenerateContent";
        Ok(Self {
            model,
            action,
            stream,
        })
    }
}

/// Bytes to hand back verbatim plus the usage read from them.
#[derive(Debug, Clone)]
pub struct GeminiReply {
    pub body: Bytes,
    pub usage: Option<Usage>,
}

pub type GeminiStream = StreamReader<Bytes, GeminiRelayStreamHandler>;

/// Chat-completions and embeddings on the OpenAI-compatible surface.
#[async_trait]
pub trait Provider: Send + Sync {
    fn base(&self) -> &BaseProvider;

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<ChatReply>;

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<ChatStream>;

    async fn embeddings(&self, _body: &mut RequestBody, _ctx: &RequestContext) -> Result<EmbeddingReply> {
        Err(RelayError::unsupported(Operation::Embeddings.as_str()))
    }
}

/// Passthrough of Gemini-native requests to a Gemini-family channel.
#[async_trait]
pub trait GeminiRelay: Send + Sync {
    async fn relay(
        &self,
        call: &GeminiCall,
        body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<GeminiReply>;

    async fn relay_stream(
        &self,
        call: &GeminiCall,
        body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<GeminiStream>;
}

/// Shared collaborators handed to every provider.
#[derive(Debug, Clone)]
pub struct ProviderDeps {
    pub requester: Requester,
    pub fetcher: ImageFetcher,
    pub claude: Arc<ClaudeSettings>,
}

pub fn build_provider(channel: Arc<ChannelConfig>, deps: &ProviderDeps) -> Result<Arc<dyn Provider>> {
    let base = BaseProvider::new(channel, deps.requester.clone())?;
    Ok(match base.preset.format {
        WireFormat::OpenAi => Arc::new(openai::OpenAiProvider::new(base)),
        WireFormat::Claude => Arc::new(claude::ClaudeProvider::new(
            base,
            deps.claude.clone(),
            deps.fetcher.clone(),
        )),
        WireFormat::Gemini(variant) => Arc::new(gemini::GeminiProvider::new(
            base,
            variant,
            deps.fetcher.clone(),
        )?),
    })
}

/// Only Gemini-family channels accept the Gemini-native surface.
pub fn build_gemini_relay(
    channel: Arc<ChannelConfig>,
    deps: &ProviderDeps,
) -> Result<Arc<dyn GeminiRelay>> {
    let base = BaseProvider::new(channel, deps.requester.clone())?;
    match base.preset.format {
        WireFormat::Gemini(variant) => Ok(Arc::new(gemini::GeminiProvider::new(
            base,
            variant,
            deps.fetcher.clone(),
        )?)),
        _ => Err(RelayError::unsupported("gemini_relay")),
    }
}

/// Apply the channel's custom parameters to an outbound JSON body.
pub(crate) fn finish_map_body(
    base: &BaseProvider,
    map: serde_json::Map<String, Value>,
    upstream_model: &str,
) -> Result<Bytes> {
    let map = match base.custom_params()? {
        Some(spec) => params::merge_custom_params(map, &spec, upstream_model),
        None => map,
    };
    Ok(Bytes::from(serde_json::to_vec(&map)?))
}

/// Serialize a typed vendor request into a JSON object map.
pub(crate) fn to_map<T: serde::Serialize>(value: &T) -> Result<serde_json::Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(RelayError::internal(
            "marshal_failed",
            "vendor request did not serialize to an object",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;

    fn deps() -> ProviderDeps {
        ProviderDeps {
            requester: Requester::new(TimeoutConfig::default()),
            fetcher: ImageFetcher::new(),
            claude: Arc::new(ClaudeSettings::default()),
        }
    }

    fn channel(provider: &str) -> Arc<ChannelConfig> {
        Arc::new(ChannelConfig {
            name: provider.to_string(),
            provider: provider.to_string(),
            key: Some("k".to_string()),
            project_id: Some("p".to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_gemini_call_parse() {
        let call = GeminiCall::parse("gemini-2.5-pro:streamGenerateContent").unwrap();
        assert_eq!(call.model, "gemini-2.5-pro");
        assert!(call.stream);
        assert!(!GeminiCall::parse("gemini-2.5-pro:generateContent").unwrap().stream);
        assert!(GeminiCall::parse("gemini-2.5-pro").is_err());
    }

    #[test]
    fn test_build_by_format() {
        for name in ["openai", "groq", "claude", "gemini", "vertex_ai", "vertex_ai_express"] {
            assert!(build_provider(channel(name), &deps()).is_ok(), "{name}");
        }
        assert!(build_gemini_relay(channel("vertex_ai"), &deps()).is_ok());
        let err = build_gemini_relay(channel("openai"), &deps()).err().unwrap();
        assert!(matches!(err, RelayError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_embeddings_default_unsupported() {
        let provider = build_provider(channel("claude"), &deps()).unwrap();
        let mut body = RequestBody::RawBytes(Bytes::from_static(b"{}"));
        let err = tokio_test::block_on(provider.embeddings(&mut body, &RequestContext::default()))
            .unwrap_err();
        assert_eq!(err.code(), "unsupported_api");
    }
}

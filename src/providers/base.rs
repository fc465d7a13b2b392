//! Shared provider plumbing: endpoint resolution, header composition and
//! model-name mapping.

use super::presets::ProviderPreset;
use crate::config::ChannelConfig;
use crate::error::{RelayError, Result};
use crate::requester::Requester;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Logical operations a client can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ChatCompletions,
    Completions,
    Embeddings,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Moderations,
    ImagesGenerations,
    ImagesEdits,
    ImagesVariations,
    Rerank,
    ChatRealtime,
    Responses,
    ModelList,
}

impl Operation {
    pub const ALL: [Operation; 14] = [
        Operation::ChatCompletions,
        Operation::Completions,
        Operation::Embeddings,
        Operation::AudioSpeech,
        Operation::AudioTranscription,
        Operation::AudioTranslation,
        Operation::Moderations,
        Operation::ImagesGenerations,
        Operation::ImagesEdits,
        Operation::ImagesVariations,
        Operation::Rerank,
        Operation::ChatRealtime,
        Operation::Responses,
        Operation::ModelList,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::ChatCompletions => "chat_completions",
            Operation::Completions => "completions",
            Operation::Embeddings => "embeddings",
            Operation::AudioSpeech => "audio_speech",
            Operation::AudioTranscription => "audio_transcription",
            Operation::AudioTranslation => "audio_translation",
            Operation::Moderations => "moderations",
            Operation::ImagesGenerations => "images_generations",
            Operation::ImagesEdits => "images_edits",
            Operation::ImagesVariations => "images_variations",
            Operation::Rerank => "rerank",
            Operation::ChatRealtime => "chat_realtime",
            Operation::Responses => "responses",
            Operation::ModelList => "model_list",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }
}

/// Per-channel URL fragment for each supported operation.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    entries: HashMap<Operation, String>,
}

impl EndpointTable {
    /// Build from preset defaults, then apply the channel's override JSON
    /// (`{"chat_completions": "/custom"}`; `"disable"` removes a mapping).
    pub fn new(defaults: &[(Operation, &str)], overrides: &str) -> Result<Self> {
        let mut entries: HashMap<Operation, String> = defaults
            .iter()
            .map(|(op, path)| (*op, (*path).to_string()))
            .collect();

        let overrides = overrides.trim();
        if overrides.is_empty() {
            return Ok(Self { entries });
        }

        let custom: Map<String, Value> = serde_json::from_str(overrides).map_err(|e| {
            RelayError::configuration(format!("invalid endpoint_overrides JSON: {e}"))
        })?;

        for (key, value) in custom {
            let Some(op) = Operation::from_name(&key) else {
                tracing::warn!(key = %key, "Ignoring unknown operation in endpoint_overrides");
                continue;
            };
            match value.as_str() {
                Some("disable") => {
                    entries.remove(&op);
                }
                Some(path) if !path.is_empty() => {
                    entries.insert(op, path.to_string());
                }
                _ => {}
            }
        }

        Ok(Self { entries })
    }

    /// Resolve an operation, failing with `UnsupportedOperation` when unmapped.
    pub fn resolve(&self, op: Operation) -> Result<&str> {
        match self.entries.get(&op) {
            Some(path) if !path.is_empty() => Ok(path.as_str()),
            _ => Err(RelayError::unsupported(op.as_str())),
        }
    }
}

/// Content negotiation headers captured from the inbound request.
#[derive(Debug, Clone, Default)]
pub struct InboundHeaders {
    pub content_type: Option<String>,
    pub accept: Option<String>,
}

impl InboundHeaders {
    pub fn from_axum(headers: &axum::http::HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            content_type: get("content-type"),
            accept: get("accept"),
        }
    }
}

/// Exact-key model rename through the channel's JSON mapping.
/// Empty or `{}` is a passthrough; invalid JSON is a configuration error.
pub fn map_model(mapping_json: &str, model: &str) -> Result<String> {
    let raw = mapping_json.trim();
    if raw.is_empty() || raw == "{}" {
        return Ok(model.to_string());
    }

    let mapping: HashMap<String, Value> = serde_json::from_str(raw)
        .map_err(|e| RelayError::configuration(format!("invalid model_mapping JSON: {e}")))?;

    Ok(mapping
        .get(model)
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or(model)
        .to_string())
}

/// The parts every vendor provider needs: its channel, resolved endpoints and
/// the shared HTTP requester.
#[derive(Debug, Clone)]
pub struct BaseProvider {
    pub channel: Arc<ChannelConfig>,
    pub preset: &'static ProviderPreset,
    pub base_url: String,
    pub endpoints: EndpointTable,
    pub requester: Requester,
}

impl BaseProvider {
    pub fn new(channel: Arc<ChannelConfig>, requester: Requester) -> Result<Self> {
        let preset = channel.preset()?;
        let base_url = channel.effective_base_url()?;
        let endpoints = EndpointTable::new(preset.endpoints, &channel.endpoint_overrides)?;
        Ok(Self {
            channel,
            preset,
            base_url,
            endpoints,
            requester,
        })
    }

    pub fn supported_uri(&self, op: Operation) -> Result<&str> {
        self.endpoints.resolve(op)
    }

    pub fn full_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn map_model(&self, model: &str) -> Result<String> {
        map_model(&self.channel.model_mapping, model)
    }

    /// Inbound content negotiation first (defaulting to JSON), then vendor
    /// headers, then the channel's custom headers, which may override anything.
    pub fn compose_headers(
        &self,
        inbound: &InboundHeaders,
        vendor: &[(&'static str, String)],
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let content_type = inbound.content_type.as_deref().unwrap_or("application/json");
        let accept = inbound.accept.as_deref().unwrap_or("application/json");
        insert_header(&mut headers, CONTENT_TYPE.as_str(), content_type);
        insert_header(&mut headers, ACCEPT.as_str(), accept);

        for (name, value) in vendor {
            insert_header(&mut headers, name, value);
        }

        for (name, value) in custom_headers(&self.channel.model_headers) {
            insert_header(&mut headers, &name, &value);
        }

        headers
    }

    /// The channel's custom parameter spec, if one is configured.
    pub fn custom_params(&self) -> Result<Option<Map<String, Value>>> {
        let raw = self.channel.custom_parameter.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let params: Map<String, Value> = serde_json::from_str(raw).map_err(|e| {
            RelayError::configuration(format!("invalid custom_parameter JSON: {e}"))
        })?;
        Ok(Some(params))
    }
}

fn custom_headers(raw: &str) -> Vec<(String, String)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Map<String, Value>>(raw) {
        Ok(map) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring invalid model_headers JSON");
            Vec::new()
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(header = %name, "Skipping header with invalid name or value"),
    }
}

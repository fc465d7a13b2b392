//! The Gemini family: the direct API, VertexAI and VertexAI Express.
//!
//! All three share one wire format and differ in host, path and how the
//! credential travels. Every outbound body goes through the sanitizer;
//! VertexAI and Express use its managed-identity mode.

use super::base::{BaseProvider, Operation};
use super::body::RequestBody;
use super::params::merge_custom_params_bytes;
use super::presets::GeminiVariant;
use super::{
    ChatReply, ChatStream, GeminiCall, GeminiRelay, GeminiReply, GeminiStream, Provider,
    RequestContext,
};
use crate::error::{RelayError, Result};
use crate::image::ImageFetcher;
use crate::requester::{Opened, UpstreamRequest, UpstreamResponse};
use crate::sanitize::sanitize_gemini_request;
use crate::stream::{LineMode, StreamReader};
use crate::translate::gemini::{
    action_suffix, convert_usage, from_gemini_response, response_text, to_gemini_request,
    upstream_error, GeminiRelayStreamHandler, GeminiStreamHandler,
};
use crate::translate::gemini_types::GeminiChatResponse;
use crate::translate::openai_types::ChatCompletionRequest;
use crate::translate::ChatStreamHandler;
use async_trait::async_trait;
use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

const GLOBAL_REGION: &str = "global";

/// Supplies the bearer token for VertexAI calls.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A pre-issued access token, e.g. from `gcloud auth print-access-token`.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl CredentialSource for StaticToken {
    async fn token(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(RelayError::configuration("VertexAI access token is empty"));
        }
        Ok(self.0.clone())
    }
}

pub struct GeminiProvider {
    base: BaseProvider,
    variant: GeminiVariant,
    fetcher: ImageFetcher,
    credentials: Option<Arc<dyn CredentialSource>>,
}

/// A request ready to send plus the secret to scrub from vendor errors.
struct Prepared {
    request: UpstreamRequest,
    secret: String,
}

impl GeminiProvider {
    pub fn new(base: BaseProvider, variant: GeminiVariant, fetcher: ImageFetcher) -> Result<Self> {
        let credentials: Option<Arc<dyn CredentialSource>> = match variant {
            GeminiVariant::VertexAi => {
                if base.channel.project_id.as_deref().unwrap_or_default().is_empty() {
                    return Err(RelayError::configuration(format!(
                        "channel '{}': vertex_ai requires project_id",
                        base.channel.name
                    )));
                }
                Some(Arc::new(StaticToken::new(base.channel.resolve_key()?)))
            }
            GeminiVariant::Direct | GeminiVariant::VertexAiExpress => None,
        };
        Ok(Self {
            base,
            variant,
            fetcher,
            credentials,
        })
    }

    /// Replace the VertexAI token source.
    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    fn managed_identity(&self) -> bool {
        self.variant.managed_identity()
    }

    fn region(&self) -> &str {
        match self.base.channel.region.as_deref() {
            Some(region) if !region.is_empty() => region,
            _ => GLOBAL_REGION,
        }
    }

    fn host(&self) -> String {
        if self.variant != GeminiVariant::VertexAi || self.base.channel.base_url.is_some() {
            return self.base.base_url.clone();
        }
        match self.region() {
            GLOBAL_REGION => "https://aiplatform.googleapis.com".to_string(),
            region => format!("https://{region}-aiplatform.googleapis.com"),
        }
    }

    /// Full URL for `{model}:{suffix}`; `suffix` may carry `?alt=sse`.
    fn endpoint_url(&self, model: &str, suffix: &str) -> Result<String> {
        let template = self.base.supported_uri(Operation::ChatCompletions)?;
        let path = template
            .replace("{project}", self.base.channel.project_id.as_deref().unwrap_or_default())
            .replace("{region}", self.region())
            .replace("{model}", model)
            .replace("{action}", suffix);
        Ok(format!("{}{}", self.host(), path))
    }

    async fn prepare(
        &self,
        model: &str,
        suffix: &str,
        body: Bytes,
        stream: bool,
        ctx: &RequestContext,
    ) -> Result<Prepared> {
        let mut url = self.endpoint_url(model, suffix)?;
        let mut vendor = Vec::new();

        let secret = match self.variant {
            GeminiVariant::Direct => {
                let key = self.base.channel.resolve_key()?;
                vendor.push(("x-goog-api-key", key.clone()));
                key
            }
            GeminiVariant::VertexAi => {
                let source = self.credentials.as_ref().ok_or_else(|| {
                    RelayError::configuration("VertexAI channel has no credential source")
                })?;
                let token = source.token().await?;
                vendor.push(("authorization", format!("Bearer {token}")));
                token
            }
            GeminiVariant::VertexAiExpress => {
                let key = self.base.channel.resolve_key()?;
                let sep = if url.contains('?') { '&' } else { '?' };
                url = format!("{url}{sep}key={key}");
                key
            }
        };
        if stream {
            vendor.push(("accept", "text/event-stream".to_string()));
        }

        let headers = self.base.compose_headers(&ctx.inbound, &vendor);
        let request = UpstreamRequest::post(url, headers, body).with_proxy(self.base.channel.proxy.clone());
        Ok(Prepared { request, secret })
    }

    fn sanitize(&self, bytes: &Bytes) -> Result<Bytes> {
        Ok(match sanitize_gemini_request(bytes, self.managed_identity())? {
            Cow::Borrowed(_) => bytes.clone(),
            Cow::Owned(clean) => Bytes::from(clean),
        })
    }

    fn with_custom_params(&self, body: Bytes, upstream_model: &str) -> Result<Bytes> {
        match self.base.custom_params()? {
            Some(spec) => merge_custom_params_bytes(body, &spec, upstream_model),
            None => Ok(body),
        }
    }

    /// Sanitized bytes for the relay, cached on the body so retries against
    /// another channel of the same mode skip the work.
    fn relay_body(&self, body: &mut RequestBody) -> Result<Bytes> {
        let managed = self.managed_identity();
        let clean = match body {
            RequestBody::ProcessedBytes {
                bytes,
                managed_identity,
            } if *managed_identity == managed => return Ok(bytes.clone()),
            RequestBody::RawBytes(bytes) | RequestBody::ProcessedBytes { bytes, .. } => {
                self.sanitize(bytes)?
            }
            RequestBody::ParsedMap(map) | RequestBody::ProcessedMap { map, .. } => {
                self.sanitize(&Bytes::from(serde_json::to_vec(map)?))?
            }
        };
        body.set_processed_bytes(clean.clone(), managed);
        Ok(clean)
    }

    /// Translate and prepare a canonical chat request.
    async fn prepare_chat(
        &self,
        request: &ChatCompletionRequest,
        stream: bool,
        ctx: &RequestContext,
    ) -> Result<Prepared> {
        let upstream_model = self.base.map_model(&request.model)?;
        let gemini = to_gemini_request(request, &self.fetcher).await?;
        let bytes = self.sanitize(&Bytes::from(serde_json::to_vec(&gemini)?))?;
        let bytes = self.with_custom_params(bytes, &upstream_model)?;

        tracing::debug!(
            channel = %self.base.channel.name,
            model = %upstream_model,
            variant = ?self.variant,
            "Gemini chat request"
        );

        let suffix = action_suffix("generateContent", stream);
        self.prepare(&upstream_model, &suffix, bytes, stream, ctx).await
    }
}

fn parse_response(resp: &UpstreamResponse) -> Result<GeminiChatResponse> {
    serde_json::from_slice(&resp.body).map_err(|e| {
        RelayError::upstream(
            502,
            format!("invalid Gemini response: {e}"),
            "upstream_error",
            Some("invalid_response".to_string()),
        )
    })
}

/// Actions whose answer is a `GenerateContentResponse`.
fn generates_content(action: &str) -> bool {
    matches!(action, "generateContent" | "streamGenerateContent")
}

#[async_trait]
impl Provider for GeminiProvider {
    fn base(&self) -> &BaseProvider {
        &self.base
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        _body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<ChatReply> {
        let prepared = self.prepare_chat(request, false, ctx).await?;
        let resp = self.base.requester.execute(prepared.request).await?;
        if !resp.is_success() {
            return Err(resp.to_error(&prepared.secret));
        }

        let parsed = parse_response(&resp)?;
        if let Some(error) = &parsed.error {
            return Err(upstream_error(error, &prepared.secret, resp.status));
        }

        let response = from_gemini_response(&parsed, &ctx.client_model);
        Ok(ChatReply {
            usage: parsed.usage_metadata.as_ref().map(convert_usage),
            output_text: response_text(&parsed),
            body: serde_json::to_value(&response)?,
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        _body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<ChatStream> {
        let prepared = self.prepare_chat(request, true, ctx).await?;
        match self.base.requester.open_stream(prepared.request).await? {
            Opened::Failed(resp) => Err(resp.to_error(&prepared.secret)),
            Opened::Stream(resp) => {
                let handler: Box<dyn ChatStreamHandler> = Box::new(GeminiStreamHandler::new(
                    &ctx.client_model,
                    &prepared.secret,
                ));
                Ok(StreamReader::spawn(
                    Box::pin(resp.bytes_stream()),
                    handler,
                    LineMode::Trimmed,
                ))
            }
        }
    }
}

#[async_trait]
impl GeminiRelay for GeminiProvider {
    async fn relay(
        &self,
        call: &GeminiCall,
        body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<GeminiReply> {
        let upstream_model = self.base.map_model(&call.model)?;
        let bytes = self.with_custom_params(self.relay_body(body)?, &upstream_model)?;
        let suffix = action_suffix(&call.action, false);
        let prepared = self.prepare(&upstream_model, &suffix, bytes, false, ctx).await?;

        let resp = self.base.requester.execute(prepared.request).await?;
        if !resp.is_success() {
            return Err(resp.to_error(&prepared.secret));
        }
        if !generates_content(&call.action) {
            return Ok(GeminiReply {
                body: resp.body,
                usage: None,
            });
        }

        let parsed = parse_response(&resp)?;
        if let Some(error) = &parsed.error {
            return Err(upstream_error(error, &prepared.secret, resp.status));
        }
        if parsed.candidates.is_empty() {
            return Err(RelayError::upstream(
                500,
                "no candidates returned",
                "upstream_error",
                Some("no_candidates".to_string()),
            ));
        }

        Ok(GeminiReply {
            usage: parsed.usage_metadata.as_ref().map(convert_usage),
            body: resp.body,
        })
    }

    async fn relay_stream(
        &self,
        call: &GeminiCall,
        body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<GeminiStream> {
        let upstream_model = self.base.map_model(&call.model)?;
        let bytes = self.with_custom_params(self.relay_body(body)?, &upstream_model)?;
        let suffix = action_suffix(&call.action, true);
        let prepared = self.prepare(&upstream_model, &suffix, bytes, true, ctx).await?;

        match self.base.requester.open_stream(prepared.request).await? {
            Opened::Failed(resp) => Err(resp.to_error(&prepared.secret)),
            Opened::Stream(resp) => Ok(StreamReader::spawn(
                Box::pin(resp.bytes_stream()),
                GeminiRelayStreamHandler::new(&prepared.secret),
                LineMode::Untrimmed,
            )),
        }
    }
}

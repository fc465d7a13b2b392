//! Anthropic Messages API behind the canonical chat surface.

use super::base::{BaseProvider, Operation};
use super::body::RequestBody;
use super::{finish_map_body, to_map, ChatReply, ChatStream, Provider, RequestContext};
use crate::config::ClaudeSettings;
use crate::error::{RelayError, Result};
use crate::image::ImageFetcher;
use crate::requester::{Opened, UpstreamRequest};
use crate::stream::{LineMode, StreamReader};
use crate::translate::claude::{
    anthropic_beta, convert_usage, from_claude_response, response_text, to_claude_request,
    ClaudeStreamHandler, ANTHROPIC_VERSION,
};
use crate::translate::claude_types::{MessagesRequest, MessagesResponse};
use crate::translate::openai_types::ChatCompletionRequest;
use crate::translate::ChatStreamHandler;
use async_trait::async_trait;
use std::sync::Arc;

pub struct ClaudeProvider {
    base: BaseProvider,
    settings: Arc<ClaudeSettings>,
    fetcher: ImageFetcher,
}

impl ClaudeProvider {
    pub fn new(base: BaseProvider, settings: Arc<ClaudeSettings>, fetcher: ImageFetcher) -> Self {
        Self {
            base,
            settings,
            fetcher,
        }
    }

    async fn prepare(
        &self,
        request: &ChatCompletionRequest,
        stream: bool,
        ctx: &RequestContext,
    ) -> Result<(UpstreamRequest, String)> {
        let upstream_model = self.base.map_model(&request.model)?;
        let mut claude: MessagesRequest =
            to_claude_request(request, &upstream_model, &self.settings, &self.fetcher).await?;
        claude.stream = stream;

        tracing::debug!(
            channel = %self.base.channel.name,
            model = %claude.model,
            thinking = claude.thinking.is_some(),
            "Claude request"
        );

        let bytes = finish_map_body(&self.base, to_map(&claude)?, &claude.model)?;

        let key = self.base.channel.resolve_key()?;
        let mut vendor = vec![
            ("x-api-key", key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];
        if let Some(beta) = anthropic_beta(&claude.model) {
            vendor.push(("anthropic-beta", beta.to_string()));
        }
        if stream {
            vendor.push(("accept", "text/event-stream".to_string()));
        }

        let url = self.base.full_url(self.base.supported_uri(Operation::ChatCompletions)?);
        let headers = self.base.compose_headers(&ctx.inbound, &vendor);
        let req = UpstreamRequest::post(url, headers, bytes).with_proxy(self.base.channel.proxy.clone());
        Ok((req, key))
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn base(&self) -> &BaseProvider {
        &self.base
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        _body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<ChatReply> {
        let (req, key) = self.prepare(request, false, ctx).await?;
        let resp = self.base.requester.execute(req).await?;
        if !resp.is_success() {
            return Err(resp.to_error(&key));
        }

        let message: MessagesResponse = serde_json::from_slice(&resp.body).map_err(|e| {
            RelayError::upstream(
                502,
                format!("invalid Claude response: {e}"),
                "upstream_error",
                Some("invalid_response".to_string()),
            )
        })?;

        let response = from_claude_response(&message, &ctx.client_model);
        Ok(ChatReply {
            usage: message.usage.as_ref().and_then(convert_usage),
            output_text: response_text(&message),
            body: serde_json::to_value(&response)?,
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        _body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<ChatStream> {
        let (req, key) = self.prepare(request, true, ctx).await?;
        match self.base.requester.open_stream(req).await? {
            Opened::Failed(resp) => Err(resp.to_error(&key)),
            Opened::Stream(resp) => {
                let handler: Box<dyn ChatStreamHandler> =
                    Box::new(ClaudeStreamHandler::new(&ctx.client_model));
                Ok(StreamReader::spawn(
                    Box::pin(resp.bytes_stream()),
                    handler,
                    LineMode::Trimmed,
                ))
            }
        }
    }
}

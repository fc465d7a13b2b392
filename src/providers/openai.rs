//! The OpenAI dialect, shared by every OpenAI-compatible preset.
//!
//! The outbound body is the client's own JSON map with the model renamed and
//! the channel's custom parameters merged, so fields this crate does not
//! model still reach the vendor.

use super::base::{BaseProvider, Operation};
use super::body::RequestBody;
use super::{finish_map_body, ChatReply, ChatStream, EmbeddingReply, Provider, RequestContext};
use crate::error::{RelayError, Result};
use crate::requester::{Opened, UpstreamRequest, UpstreamResponse};
use crate::stream::{LineHandler, LineMode, RawLine, StreamReader, StreamSink};
use crate::translate::openai_types::{ChatCompletionRequest, Usage};
use crate::translate::ChatStreamHandler;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

const DONE: &[u8] = b"[DONE]";

pub struct OpenAiProvider {
    base: BaseProvider,
}

impl OpenAiProvider {
    pub fn new(base: BaseProvider) -> Self {
        Self { base }
    }

    /// The client's map with the mapped model and the channel's parameters.
    fn outbound(&self, body: &mut RequestBody, stream: bool) -> Result<(bytes::Bytes, String)> {
        let mut map: Map<String, Value> = body.parse_map()?.clone();
        let client_model = map
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let upstream_model = self.base.map_model(&client_model)?;
        map.insert("model".to_string(), Value::String(upstream_model.clone()));

        // Ask for the trailing usage chunk unless the client decided already.
        if stream && !map.contains_key("stream_options") {
            map.insert("stream_options".to_string(), json!({"include_usage": true}));
        }

        let bytes = finish_map_body(&self.base, map, &upstream_model)?;
        Ok((bytes, upstream_model))
    }

    fn request(&self, op: Operation, body: bytes::Bytes, ctx: &RequestContext, stream: bool) -> Result<UpstreamRequest> {
        let url = self.base.full_url(self.base.supported_uri(op)?);
        let key = self.base.channel.resolve_key()?;
        let mut vendor = vec![("authorization", format!("Bearer {key}"))];
        if stream {
            vendor.push(("accept", "text/event-stream".to_string()));
        }
        let headers = self.base.compose_headers(&ctx.inbound, &vendor);
        Ok(UpstreamRequest::post(url, headers, body).with_proxy(self.base.channel.proxy.clone()))
    }

    async fn execute(&self, req: UpstreamRequest) -> Result<Value> {
        let resp = self.base.requester.execute(req).await?;
        if !resp.is_success() {
            return Err(self.vendor_error(&resp));
        }
        serde_json::from_slice(&resp.body).map_err(|e| {
            RelayError::upstream(
                502,
                format!("invalid upstream response: {e}"),
                "upstream_error",
                Some("invalid_response".to_string()),
            )
        })
    }

    fn vendor_error(&self, resp: &UpstreamResponse) -> RelayError {
        let key = self.base.channel.resolve_key().unwrap_or_default();
        resp.to_error(&key)
    }
}

fn set_model(body: &mut Value, model: &str) {
    if let Some(object) = body.as_object_mut() {
        object.insert("model".to_string(), Value::String(model.to_string()));
    }
}

fn usage_of(body: &Value) -> Option<Usage> {
    body.get("usage")
        .filter(|u| !u.is_null())
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
        .filter(|u| !u.is_empty())
}

fn message_text(body: &Value) -> String {
    body.get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.pointer("/message/content").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn base(&self) -> &BaseProvider {
        &self.base
    }

    async fn chat(
        &self,
        _request: &ChatCompletionRequest,
        body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<ChatReply> {
        let (bytes, upstream_model) = self.outbound(body, false)?;
        tracing::debug!(channel = %self.base.channel.name, model = %upstream_model, "OpenAI chat");

        let mut response = self
            .execute(self.request(Operation::ChatCompletions, bytes, ctx, false)?)
            .await?;
        set_model(&mut response, &ctx.client_model);

        Ok(ChatReply {
            usage: usage_of(&response),
            output_text: message_text(&response),
            body: response,
        })
    }

    async fn chat_stream(
        &self,
        _request: &ChatCompletionRequest,
        body: &mut RequestBody,
        ctx: &RequestContext,
    ) -> Result<ChatStream> {
        let (bytes, upstream_model) = self.outbound(body, true)?;
        tracing::debug!(channel = %self.base.channel.name, model = %upstream_model, "OpenAI chat stream");

        let req = self.request(Operation::ChatCompletions, bytes, ctx, true)?;
        match self.base.requester.open_stream(req).await? {
            Opened::Failed(resp) => Err(self.vendor_error(&resp)),
            Opened::Stream(resp) => {
                let handler: Box<dyn ChatStreamHandler> =
                    Box::new(OpenAiStreamHandler::new(&ctx.client_model));
                Ok(StreamReader::spawn(
                    Box::pin(resp.bytes_stream()),
                    handler,
                    LineMode::Trimmed,
                ))
            }
        }
    }

    async fn embeddings(&self, body: &mut RequestBody, ctx: &RequestContext) -> Result<EmbeddingReply> {
        let uri = self.base.supported_uri(Operation::Embeddings)?.to_string();
        let (bytes, _) = self.outbound(body, false)?;
        let url = self.base.full_url(&uri);
        let key = self.base.channel.resolve_key()?;
        let headers = self
            .base
            .compose_headers(&ctx.inbound, &[("authorization", format!("Bearer {key}"))]);
        let req = UpstreamRequest::post(url, headers, bytes).with_proxy(self.base.channel.proxy.clone());

        let mut response = self.execute(req).await?;
        set_model(&mut response, &ctx.client_model);
        Ok(EmbeddingReply {
            usage: usage_of(&response),
            body: response,
        })
    }
}

/// Re-serializes each `data:` chunk with the client's model name.
#[derive(Debug)]
pub struct OpenAiStreamHandler {
    model: String,
    usage: Usage,
    text: String,
}

impl OpenAiStreamHandler {
    pub fn new(client_model: &str) -> Self {
        Self {
            model: client_model.to_string(),
            usage: Usage::default(),
            text: String::new(),
        }
    }
}

impl LineHandler<String> for OpenAiStreamHandler {
    fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<String>) {
        let Some(payload) = line.bytes().and_then(|b| b.strip_prefix(b"data:")) else {
            line.suppress();
            return;
        };
        let payload = payload.trim_ascii();
        if payload == DONE {
            line.close();
            return;
        }

        let mut chunk: Value = match serde_json::from_slice(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                sink.error(RelayError::upstream(
                    502,
                    format!("invalid stream chunk: {e}"),
                    "upstream_error",
                    Some("invalid_stream_event".to_string()),
                ));
                return;
            }
        };

        if let Some(error) = chunk.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream stream error");
            let kind = error.get("type").and_then(Value::as_str).unwrap_or_default();
            sink.error(RelayError::upstream(500, message, kind, None));
            return;
        }

        if let Some(usage) = usage_of(&chunk) {
            self.usage = usage;
        }
        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
                    self.text.push_str(text);
                }
            }
        }

        set_model(&mut chunk, &self.model);
        sink.send(chunk.to_string());
    }
}

impl ChatStreamHandler for OpenAiStreamHandler {
    fn usage(&self) -> Usage {
        self.usage
    }

    fn output_text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, TimeoutConfig};
    use crate::requester::Requester;
    use bytes::Bytes;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, extra: impl FnOnce(&mut ChannelConfig)) -> OpenAiProvider {
        let mut channel = ChannelConfig {
            name: "oai".to_string(),
            provider: "openai".to_string(),
            base_url: Some(server.uri()),
            key: Some("sk-secret".to_string()),
            ..Default::default()
        };
        extra(&mut channel);
        let base = BaseProvider::new(Arc::new(channel), Requester::new(TimeoutConfig::default())).unwrap();
        OpenAiProvider::new(base)
    }

    fn ctx(model: &str) -> RequestContext {
        RequestContext {
            client_model: model.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chat_maps_model_and_keeps_unknown_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-secret"))
            .and(body_partial_json(json!({
                "model": "gpt-4o",
                "seed": 7,
                "temperature": 0.1
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "model": "gpt-4o-2024-08-06",
                "system_fingerprint": "fp",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            })))
            .mount(&server)
            .await;

        let provider = provider(&server, |c| {
            c.model_mapping = r#"{"my-gpt": "gpt-4o"}"#.to_string();
            c.custom_parameter = r#"{"temperature": 0.1}"#.to_string();
        });
        let mut body = RequestBody::RawBytes(Bytes::from_static(
            br#"{"model":"my-gpt","seed":7,"messages":[{"role":"user","content":"hey"}]}"#,
        ));
        let req = ChatCompletionRequest::default();
        let reply = provider.chat(&req, &mut body, &ctx("my-gpt")).await.unwrap();

        assert_eq!(reply.body["model"], "my-gpt");
        assert_eq!(reply.body["system_fingerprint"], "fp");
        assert_eq!(reply.usage.unwrap().total_tokens, 4);
        assert_eq!(reply.output_text, "hi");
        // The cache still holds the client's own map.
        assert_eq!(body.parsed_map().unwrap()["model"], "my-gpt");
    }

    #[tokio::test]
    async fn test_vendor_error_is_scrubbed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided: sk-secret", "type": "invalid_request_error", "code": "invalid_api_key"}
            })))
            .mount(&server)
            .await;

        let provider = provider(&server, |_| {});
        let mut body = RequestBody::RawBytes(Bytes::from_static(br#"{"model":"gpt-4o","messages":[]}"#));
        let err = provider
            .chat(&ChatCompletionRequest::default(), &mut body, &ctx("gpt-4o"))
            .await
            .unwrap_err();
        assert_eq!(err.status().as_u16(), 401);
        assert!(!err.to_string().contains("sk-secret"));
        assert!(!err.is_local());
    }

    #[tokio::test]
    async fn test_embeddings_unsupported_on_chat_only_preset() {
        let server = MockServer::start().await;
        let provider = provider(&server, |c| c.provider = "groq".to_string());
        let mut body = RequestBody::RawBytes(Bytes::from_static(br#"{"model":"m","input":"x"}"#));
        let err = provider.embeddings(&mut body, &ctx("m")).await.unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedOperation { .. }));
    }

    fn feed(handler: &mut OpenAiStreamHandler, line: &str) -> (Vec<String>, Vec<RelayError>, RawLine) {
        let mut raw = RawLine::Data(line.as_bytes().to_vec());
        let mut sink = StreamSink::new();
        handler.handle(&mut raw, &mut sink);
        let (data, errors) = sink.into_parts();
        (data, errors, raw)
    }

    #[test]
    fn test_stream_handler_rewrites_model_and_captures_usage() {
        let mut handler = OpenAiStreamHandler::new("client-model");

        let (_, _, raw) = feed(&mut handler, ": keep-alive");
        assert_eq!(raw, RawLine::Suppressed);

        let (data, _, _) = feed(
            &mut handler,
            r#"data: {"id":"c","model":"gpt-4o-2024","choices":[{"index":0,"delta":{"content":"Hi"}}]}"#,
        );
        let chunk: Value = serde_json::from_str(&data[0]).unwrap();
        assert_eq!(chunk["model"], "client-model");

        feed(
            &mut handler,
            r#"data: {"id":"c","model":"x","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
        );
        assert_eq!(handler.usage().total_tokens, 7);
        assert_eq!(handler.output_text(), "Hi");

        let (data, _, raw) = feed(&mut handler, "data: [DONE]");
        assert!(data.is_empty());
        assert_eq!(raw, RawLine::Closed);
    }
}

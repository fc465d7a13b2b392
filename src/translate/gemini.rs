//! Canonical chat ↔ Gemini `generateContent` translation, plus the line
//! handlers for both Gemini-backed surfaces.

use super::gemini_types::{
    Content, FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
    GeminiChatRequest, GeminiChatResponse, GeminiErrorBody, GeminiTool, GenerationConfig,
    InlineData, Part, ThinkingConfig, ToolConfig, UsageMetadata,
};
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent,
    ChatToolCall, ChatToolCallFunction, ChatToolChoice, Choice, ChoiceMessage, ChunkDelta,
    ChunkToolCall, ChunkToolCallFunction, CompletionTokensDetails, ContentPart,
    PromptTokensDetails, Reasoning, Usage,
};
use super::{chat_id, stop_sequences, unix_now, ChatStreamHandler};
use crate::error::{RelayError, Result};
use crate::image::ImageFetcher;
use crate::stream::{LineHandler, RawLine, StreamSink};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;

const DATA_PREFIX: &[u8] = b"data: ";
const KEY_PLACEHOLDER: &str = "xxxxx";

/// Thinking budgets for effort tiers when no explicit budget is given.
const EFFORT_BUDGETS: [(&str, u32); 3] = [("low", 1024), ("medium", 8192), ("high", 24576)];

/// URL suffix after `{model}:` for a relay action.
pub fn action_suffix(action: &str, stream: bool) -> String {
    let action = if action.is_empty() {
        "generateContent"
    } else {
        action
    };
    match action {
        "countTokens" => "countTokens".to_string(),
        "predictLongRunning" => "predictLongRunning".to_string(),
        "streamGenerateContent" => "streamGenerateContent?alt=sse".to_string(),
        "generateContent" if stream => "streamGenerateContent?alt=sse".to_string(),
        "generateContent" => "generateContent".to_string(),
        other if stream && !other.contains("stream") => {
            format!("stream{}?alt=sse", title_case(other))
        }
        other => other.to_string(),
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Split `gemini-pro:generateContent` into model and action.
pub fn parse_model_action(model_action: &str) -> Result<(String, String)> {
    let model_action = model_action.trim_start_matches('/');
    let pieces: Vec<&str> = model_action.split(':').collect();
    match pieces.as_slice() {
        [model, action] if !model.is_empty() && !action.is_empty() => {
            Ok(((*model).to_string(), (*action).to_string()))
        }
        _ => Err(RelayError::translation(
            "invalid_model_action",
            format!("expected {{model}}:{{action}}, got '{model_action}'"),
        )),
    }
}

/// Build a Gemini request from the canonical one.
pub async fn to_gemini_request(
    request: &ChatCompletionRequest,
    fetcher: &ImageFetcher,
) -> Result<GeminiChatRequest> {
    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut previous_was_tool = false;

    for msg in &request.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                let text = msg.text();
                if !text.is_empty() {
                    system_parts.push(text_part(text));
                }
                previous_was_tool = false;
            }
            "assistant" => {
                let mut parts = Vec::new();
                let text = msg.text();
                if !text.is_empty() {
                    parts.push(text_part(text));
                }
                for call in msg.tool_calls.iter().flatten() {
                    call_names.insert(call.id.as_str(), call.function.name.as_str());
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: call.function.name.clone(),
                            args: parse_arguments(call)?,
                        }),
                        ..Default::default()
                    });
                }
                contents.push(Content {
                    role: Some("model".to_string()),
                    parts,
                });
                previous_was_tool = false;
            }
            "tool" => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let name = call_names
                    .get(id)
                    .copied()
                    .or(msg.name.as_deref())
                    .ok_or_else(|| {
                        RelayError::translation(
                            "invalid_tool_message",
                            format!("tool result '{id}' has no matching assistant tool call"),
                        )
                    })?;
                let part = Part {
                    function_response: Some(FunctionResponse {
                        name: name.to_string(),
                        response: json!({"name": name, "content": tool_output(&msg.text())}),
                    }),
                    ..Default::default()
                };
                // Parallel results answer one model turn, so they share one content.
                match contents.last_mut() {
                    Some(last) if previous_was_tool => last.parts.push(part),
                    _ => contents.push(Content {
                        role: Some("user".to_string()),
                        parts: vec![part],
                    }),
                }
                previous_was_tool = true;
            }
            _ => {
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts: user_parts(msg.content.as_ref(), fetcher).await?,
                });
                previous_was_tool = false;
            }
        }
    }

    let tools = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.clone(),
                })
                .collect(),
        }]
    });

    let generation_config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.output_limit(),
        stop_sequences: stop_sequences(request.stop.as_ref())?,
        thinking_config: request.reasoning.as_ref().map(thinking_config),
    };

    Ok(GeminiChatRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| Content {
            role: None,
            parts: system_parts,
        }),
        tools,
        tool_config: request.tool_choice.as_ref().map(tool_config),
        generation_config: (generation_config != GenerationConfig::default())
            .then_some(generation_config),
    })
}

fn text_part(text: String) -> Part {
    Part {
        text: Some(text),
        ..Default::default()
    }
}

async fn user_parts(content: Option<&ChatContent>, fetcher: &ImageFetcher) -> Result<Vec<Part>> {
    let mut parts = Vec::new();
    let Some(content) = content else {
        return Ok(parts);
    };
    for part in content.parts() {
        match part {
            ContentPart::Text { text } => parts.push(text_part(text)),
            ContentPart::ImageUrl { image_url } => {
                let image = fetcher.fetch(&image_url.url).await?;
                parts.push(Part {
                    inline_data: Some(InlineData {
                        data: image.base64(),
                        mime_type: image.mime_type,
                    }),
                    ..Default::default()
                });
            }
            ContentPart::Unsupported => {}
        }
    }
    Ok(parts)
}

fn parse_arguments(call: &ChatToolCall) -> Result<Value> {
    let raw = call.function.arguments.trim();
    if raw.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| {
        RelayError::translation(
            "conversion_error",
            format!("tool call {} arguments are not valid JSON: {e}", call.function.name),
        )
    })
}

/// Tool output is passed as JSON when it is JSON, otherwise as a string.
fn tool_output(text: &str) -> Value {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
        .unwrap_or_else(|| Value::String(text.to_string()))
}

fn thinking_config(reasoning: &Reasoning) -> ThinkingConfig {
    let budget = reasoning.max_tokens.or_else(|| {
        let effort = reasoning.effort.as_deref()?;
        EFFORT_BUDGETS
            .iter()
            .find(|(tier, _)| *tier == effort)
            .map(|(_, budget)| *budget)
    });
    ThinkingConfig {
        thinking_budget: budget,
        include_thoughts: true,
    }
}

fn tool_config(choice: &ChatToolChoice) -> ToolConfig {
    let (mode, allowed) = match choice {
        ChatToolChoice::Specific(specific) => ("ANY", Some(vec![specific.function.name.clone()])),
        ChatToolChoice::String(s) => match s.as_str() {
            "none" => ("NONE", None),
            "required" => ("ANY", None),
            _ => ("AUTO", None),
        },
    };
    ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: mode.to_string(),
            allowed_function_names: allowed,
        },
    }
}

pub fn convert_usage(metadata: &UsageMetadata) -> Usage {
    let completion = metadata.candidates_token_count + metadata.thoughts_token_count;
    Usage {
        prompt_tokens: metadata.prompt_token_count,
        completion_tokens: completion,
        total_tokens: metadata.total_token_count,
        prompt_tokens_details: PromptTokensDetails {
            cached_tokens: metadata.cached_content_token_count,
            ..Default::default()
        },
        completion_tokens_details: CompletionTokensDetails {
            reasoning_tokens: metadata.thoughts_token_count,
        },
    }
}

pub fn map_finish_reason(reason: Option<&str>, has_function_call: bool) -> Option<String> {
    if has_function_call {
        return Some("tool_calls".to_string());
    }
    let mapped = match reason? {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => "content_filter",
        "" | "FINISH_REASON_UNSPECIFIED" => return None,
        other => other,
    };
    Some(mapped.to_string())
}

/// Replace the channel key wherever the vendor echoed it back.
pub fn scrub_key(message: &str, key: &str) -> String {
    if key.is_empty() {
        return message.to_string();
    }
    message.replace(key, KEY_PLACEHOLDER)
}

/// A Gemini error body as a relay error, with the channel key removed.
pub fn upstream_error(error: &GeminiErrorBody, key: &str, fallback_status: u16) -> RelayError {
    let status = if error.code >= 400 {
        error.code
    } else {
        fallback_status
    };
    RelayError::upstream(status, scrub_key(&error.message, key), error.status.clone(), None)
}

/// Texts, thoughts and function calls of one candidate.
#[derive(Default)]
struct CandidateView {
    text: String,
    thoughts: String,
    calls: Vec<FunctionCall>,
}

fn view_parts(content: Option<&Content>) -> CandidateView {
    let mut view = CandidateView::default();
    for part in content.map(|c| c.parts.as_slice()).unwrap_or_default() {
        if let Some(call) = &part.function_call {
            view.calls.push(call.clone());
        }
        if let Some(text) = &part.text {
            if part.thought == Some(true) {
                view.thoughts.push_str(text);
            } else {
                view.text.push_str(text);
            }
        }
    }
    view
}

fn tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

pub fn from_gemini_response(response: &GeminiChatResponse, client_model: &str) -> ChatCompletionResponse {
    let choices = response
        .candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let view = view_parts(candidate.content.as_ref());
            let tool_calls = (!view.calls.is_empty()).then(|| {
                view.calls
                    .iter()
                    .map(|call| ChatToolCall {
                        id: tool_call_id(),
                        call_type: "function".to_string(),
                        function: ChatToolCallFunction {
                            name: call.name.clone(),
                            arguments: call.args.to_string(),
                        },
                    })
                    .collect()
            });
            Choice {
                index: candidate.index.unwrap_or(i as u32),
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: Some(view.text),
                    reasoning_content: (!view.thoughts.is_empty()).then_some(view.thoughts),
                    tool_calls,
                },
                finish_reason: map_finish_reason(
                    candidate.finish_reason.as_deref(),
                    !view.calls.is_empty(),
                ),
            }
        })
        .collect();

    ChatCompletionResponse {
        id: chat_id(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: client_model.to_string(),
        choices,
        usage: response.usage_metadata.as_ref().map(convert_usage),
    }
}

/// Non-thought text across candidates.
pub fn response_text(response: &GeminiChatResponse) -> String {
    response
        .candidates
        .iter()
        .map(|c| view_parts(c.content.as_ref()).text)
        .collect()
}

fn parse_data_line(line: &[u8]) -> Option<&[u8]> {
    line.trim_ascii().strip_prefix(DATA_PREFIX)
}

fn invalid_event(e: serde_json::Error) -> RelayError {
    RelayError::upstream(
        502,
        format!("invalid Gemini stream event: {e}"),
        "upstream_error",
        Some("invalid_stream_event".to_string()),
    )
}

/// Gemini SSE to OpenAI chunk JSON for the chat surface.
#[derive(Debug)]
pub struct GeminiStreamHandler {
    model: String,
    id: String,
    created: i64,
    key: String,
    usage: Usage,
    text: String,
    tools_seen: u32,
}

impl GeminiStreamHandler {
    pub fn new(client_model: &str, key: &str) -> Self {
        Self {
            model: client_model.to_string(),
            id: chat_id(),
            created: unix_now(),
            key: key.to_string(),
            usage: Usage::default(),
            text: String::new(),
            tools_seen: 0,
        }
    }

    fn emit(&self, sink: &mut StreamSink<String>, index: u32, delta: ChunkDelta, finish: Option<String>) {
        let mut chunk = ChatCompletionChunk::new(&self.id, &self.model, self.created, delta);
        chunk.choices[0].index = index;
        chunk.choices[0].finish_reason = finish;
        match serde_json::to_string(&chunk) {
            Ok(json) => sink.send(json),
            Err(e) => sink.error(e.into()),
        }
    }
}

impl LineHandler<String> for GeminiStreamHandler {
    fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<String>) {
        let Some(payload) = line.bytes().and_then(parse_data_line) else {
            line.suppress();
            return;
        };
        let response: GeminiChatResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                sink.error(invalid_event(e));
                return;
            }
        };
        if let Some(error) = &response.error {
            sink.error(upstream_error(error, &self.key, 500));
            return;
        }

        for (i, candidate) in response.candidates.iter().enumerate() {
            let index = candidate.index.unwrap_or(i as u32);
            let view = view_parts(candidate.content.as_ref());
            self.text.push_str(&view.text);

            let tool_calls = (!view.calls.is_empty()).then(|| {
                view.calls
                    .iter()
                    .map(|call| {
                        let index = self.tools_seen;
                        self.tools_seen += 1;
                        ChunkToolCall {
                            index,
                            id: Some(tool_call_id()),
                            call_type: Some("function".to_string()),
                            function: Some(ChunkToolCallFunction {
                                name: Some(call.name.clone()),
                                arguments: Some(call.args.to_string()),
                            }),
                        }
                    })
                    .collect()
            });

            let delta = ChunkDelta {
                role: Some("assistant".to_string()),
                content: (!view.text.is_empty()).then_some(view.text),
                reasoning_content: (!view.thoughts.is_empty()).then_some(view.thoughts),
                tool_calls,
            };
            let finish =
                map_finish_reason(candidate.finish_reason.as_deref(), !view.calls.is_empty());
            self.emit(sink, index, delta, finish);
        }

        if let Some(metadata) = &response.usage_metadata {
            self.usage = convert_usage(metadata);
        }
    }
}

impl ChatStreamHandler for GeminiStreamHandler {
    fn usage(&self) -> Usage {
        self.usage
    }

    fn output_text(&self) -> &str {
        &self.text
    }
}

/// Passthrough for the Gemini-native surface: lines are forwarded verbatim
/// (line endings included) while usage is read off the way.
#[derive(Debug)]
pub struct GeminiRelayStreamHandler {
    key: String,
    usage: Usage,
}

impl GeminiRelayStreamHandler {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            usage: Usage::default(),
        }
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }
}

impl LineHandler<Bytes> for GeminiRelayStreamHandler {
    fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<Bytes>) {
        let Some(bytes) = line.bytes() else {
            return;
        };
        let raw = Bytes::copy_from_slice(bytes);
        if !bytes.starts_with(DATA_PREFIX) {
            sink.send(raw);
            return;
        }

        let payload = bytes.trim_ascii();
        let response: GeminiChatResponse = match serde_json::from_slice(&payload[DATA_PREFIX.len()..]) {
            Ok(response) => response,
            Err(e) => {
                sink.error(invalid_event(e));
                return;
            }
        };
        if let Some(error) = &response.error {
            sink.error(upstream_error(error, &self.key, 500));
            return;
        }

        sink.send(raw);
        if let Some(metadata) = &response.usage_metadata {
            let usage = convert_usage(metadata);
            self.usage.prompt_tokens = usage.prompt_tokens;
            self.usage.completion_tokens = usage.completion_tokens;
            self.usage.completion_tokens_details = usage.completion_tokens_details;
            self.usage.total_tokens = usage.total_tokens;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(value: Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_action_suffixes() {
        assert_eq!(action_suffix("generateContent", false), "generateContent");
        assert_eq!(action_suffix("generateContent", true), "streamGenerateContent?alt=sse");
        assert_eq!(action_suffix("", false), "generateContent");
        assert_eq!(action_suffix("streamGenerateContent", false), "streamGenerateContent?alt=sse");
        assert_eq!(action_suffix("countTokens", true), "countTokens");
        assert_eq!(action_suffix("predictLongRunning", false), "predictLongRunning");
        assert_eq!(action_suffix("embedContent", false), "embedContent");
        assert_eq!(action_suffix("embedContent", true), "streamEmbedContent?alt=sse");
        assert_eq!(action_suffix("streamFoo", true), "streamFoo");
    }

    #[test]
    fn test_parse_model_action() {
        assert_eq!(
            parse_model_action("gemini-pro:generateContent").unwrap(),
            ("gemini-pro".to_string(), "generateContent".to_string())
        );
        assert_eq!(
            parse_model_action("/gemini-2.5-flash:streamGenerateContent").unwrap().1,
            "streamGenerateContent"
        );
        assert!(parse_model_action("gemini-pro").is_err());
        assert!(parse_model_action("a:b:c").is_err());
    }

    #[tokio::test]
    async fn test_conversation_conversion() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "temperature": 0.3,
            "max_tokens": 256,
            "stop": ["END"],
            "reasoning": {"effort": "medium"},
            "tool_choice": {"type": "function", "function": {"name": "lookup"}},
            "tools": [{"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}],
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "find rust"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}},
                    {"id": "c2", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"ferris\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "{\"hits\":3}"},
                {"role": "tool", "tool_call_id": "c2", "content": "none"}
            ]
        }));
        let gemini = to_gemini_request(&req, &ImageFetcher::new()).await.unwrap();
        let v = serde_json::to_value(&gemini).unwrap();

        assert_eq!(v["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(v["contents"][0]["role"], "user");
        assert_eq!(v["contents"][1]["role"], "model");
        assert_eq!(v["contents"][1]["parts"][0]["functionCall"]["args"]["q"], "rust");
        assert_eq!(v["contents"].as_array().unwrap().len(), 3);
        let responses = v["contents"][2]["parts"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["functionResponse"]["name"], "lookup");
        assert_eq!(responses[0]["functionResponse"]["response"]["content"]["hits"], 3);
        assert_eq!(responses[1]["functionResponse"]["response"]["content"], "none");

        assert_eq!(v["tools"][0]["functionDeclarations"][0]["name"], "lookup");
        assert_eq!(v["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
        assert_eq!(
            v["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"][0],
            "lookup"
        );
        let config = &v["generationConfig"];
        assert_eq!(config["temperature"], 0.3);
        assert_eq!(config["maxOutputTokens"], 256);
        assert_eq!(config["stopSequences"][0], "END");
        assert_eq!(config["thinkingConfig"]["thinkingBudget"], 8192);
        assert_eq!(config["thinkingConfig"]["includeThoughts"], true);
    }

    #[tokio::test]
    async fn test_orphan_tool_result_rejected() {
        let req = request(json!({
            "model": "gemini-pro",
            "messages": [{"role": "tool", "tool_call_id": "missing", "content": "x"}]
        }));
        let err = to_gemini_request(&req, &ImageFetcher::new()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_tool_message");
    }

    #[tokio::test]
    async fn test_image_becomes_inline_data() {
        let req = request(json!({
            "model": "gemini-pro",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": crate::image::tests::png_data_url(4, 4)}}
            ]}]
        }));
        let gemini = to_gemini_request(&req, &ImageFetcher::new()).await.unwrap();
        let inline = gemini.contents[0].parts[0].inline_data.as_ref().unwrap();
        assert_eq!(inline.mime_type, "image/png");
        assert!(gemini.generation_config.is_none());
    }

    #[test]
    fn test_response_mapping() {
        let response: GeminiChatResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "Answer"},
                    {"functionCall": {"name": "lookup", "args": {"q": 1}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 10, "candidatesTokenCount": 5,
                "thoughtsTokenCount": 3, "cachedContentTokenCount": 2, "totalTokenCount": 18
            }
        }))
        .unwrap();

        let mapped = from_gemini_response(&response, "client-gemini");
        assert_eq!(mapped.model, "client-gemini");
        let choice = &mapped.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("Answer"));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("pondering"));
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(
            choice.message.tool_calls.as_ref().unwrap()[0].function.arguments,
            r#"{"q":1}"#
        );

        let usage = mapped.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 8);
        assert_eq!(usage.completion_tokens_details.reasoning_tokens, 3);
        assert_eq!(usage.prompt_tokens_details.cached_tokens, 2);
        assert_eq!(usage.total_tokens, 18);
        assert_eq!(response_text(&response), "Answer");
    }

    #[test]
    fn test_finish_reasons() {
        assert_eq!(map_finish_reason(Some("STOP"), false).as_deref(), Some("stop"));
        assert_eq!(map_finish_reason(Some("MAX_TOKENS"), false).as_deref(), Some("length"));
        for r in ["SAFETY", "RECITATION", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"] {
            assert_eq!(map_finish_reason(Some(r), false).as_deref(), Some("content_filter"));
        }
        assert_eq!(map_finish_reason(Some("STOP"), true).as_deref(), Some("tool_calls"));
        assert_eq!(map_finish_reason(None, false), None);
    }

    #[test]
    fn test_scrub_key() {
        assert_eq!(
            scrub_key("API key AIzaSECRET not valid", "AIzaSECRET"),
            "API key xxxxx not valid"
        );
        assert_eq!(scrub_key("unchanged", ""), "unchanged");
    }

    fn run<H: LineHandler<String>>(handler: &mut H, line: &str) -> (Vec<String>, Vec<RelayError>, RawLine) {
        handle_line(handler, line.as_bytes())
    }

    fn relay(handler: &mut GeminiRelayStreamHandler, line: &[u8]) -> (Vec<Bytes>, Vec<RelayError>) {
        let (data, errors, _) = handle_line(handler, line);
        (data, errors)
    }

    fn handle_line<T, H: LineHandler<T>>(handler: &mut H, line: &[u8]) -> (Vec<T>, Vec<RelayError>, RawLine) {
        let mut raw = RawLine::Data(line.to_vec());
        let mut sink = StreamSink::new();
        handler.handle(&mut raw, &mut sink);
        let (data, errors) = sink.into_parts();
        (data, errors, raw)
    }

    #[test]
    fn test_chat_stream_handler() {
        let mut handler = GeminiStreamHandler::new("client", "k");
        let (_, _, raw) = run(&mut handler, "event: message");
        assert_eq!(raw, RawLine::Suppressed);

        let (data, errors, _) = run(
            &mut handler,
            r#"data: {"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#,
        );
        assert!(errors.is_empty());
        let chunk: Value = serde_json::from_str(&data[0]).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(chunk["model"], "client");

        let (data, _, _) = run(
            &mut handler,
            r#"data: {"candidates":[{"content":{"parts":[{"text":" there"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6}}"#,
        );
        let chunk: Value = serde_json::from_str(&data[0]).unwrap();
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(handler.output_text(), "Hi there");
        assert_eq!(handler.usage().total_tokens, 6);
    }

    #[test]
    fn test_relay_handler_passthrough_and_usage() {
        let mut handler = GeminiRelayStreamHandler::new("secret");
        let line = "data: {\"candidates\":[],\"usageMetadata\":{\"promptTokenCount\":7,\"candidatesTokenCount\":3,\"thoughtsTokenCount\":1,\"totalTokenCount\":11}}\r\n";
        let (data, errors) = relay(&mut handler, line.as_bytes());
        assert!(errors.is_empty());
        assert_eq!(data, vec![Bytes::from(line)]);
        assert_eq!(handler.usage().completion_tokens, 4);

        let (data, _) = relay(&mut handler, b"\n");
        assert_eq!(data, vec![Bytes::from_static(b"\n")]);
    }

    #[test]
    fn test_relay_handler_keeps_invalid_utf8() {
        let mut handler = GeminiRelayStreamHandler::new("secret");
        let line: &[u8] = b": keep-alive \xff\xfe\r\n";
        let (data, errors) = relay(&mut handler, line);
        assert!(errors.is_empty());
        assert_eq!(data, vec![Bytes::from_static(line)]);
    }

    #[test]
    fn test_relay_handler_scrubs_key_from_errors() {
        let mut handler = GeminiRelayStreamHandler::new("secret");
        let (data, errors) = relay(
            &mut handler,
            b"data: {\"error\":{\"code\":400,\"message\":\"bad key secret\",\"status\":\"INVALID_ARGUMENT\"}}\n",
        );
        assert!(data.is_empty());
        assert_eq!(errors[0].to_string(), "bad key xxxxx");
        assert_eq!(errors[0].status().as_u16(), 400);
    }
}

//! Canonical chat ↔ Anthropic Messages translation.

use super::claude_types::{
    ClaudeUsage, ContentBlock, Delta, ErrorBody, MediaSource, Message, MessagesRequest,
    MessagesResponse, ResponseBlock, StreamEvent, Thinking, Tool, ToolChoice,
};
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatContent, ChatMessage, ChatToolCall,
    ChatToolCallFunction, ChatToolChoice, ChoiceMessage, Choice, ChatCompletionResponse,
    ChunkDelta, ChunkToolCall, ChunkToolCallFunction, ContentPart, PromptTokensDetails, Reasoning,
    Usage,
};
use super::{chat_id, stop_sequences, unix_now, ChatStreamHandler};
use crate::config::ClaudeSettings;
use crate::error::{RelayError, Result};
use crate::image::ImageFetcher;
use crate::stream::{LineHandler, RawLine, StreamSink};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Model suffix that turns extended thinking on without a reasoning directive.
const THINKING_SUFFIX: &str = "-thinking";

const MIN_THINKING_BUDGET: u32 = 1024;
const THINKING_MAX_TOKENS_FLOOR: u32 = 1280;

/// Every Claude stream line worth decoding starts with this.
const STREAM_PREFIX: &[u8] = b"data: {\"type\"";

/// `claude-3-7-sonnet-thinking` → (`claude-3-7-sonnet`, true).
pub fn split_thinking_suffix(model: &str) -> (&str, bool) {
    match model.strip_suffix(THINKING_SUFFIX) {
        Some(base) if !base.is_empty() => (base, true),
        _ => (model, false),
    }
}

/// Beta header unlocking the larger output windows.
pub fn anthropic_beta(model: &str) -> Option<&'static str> {
    if model.starts_with("claude-3-5-sonnet") {
        Some("max-tokens-3-5-sonnet-2024-07-15")
    } else if model.starts_with("claude-3-7-sonnet") {
        Some("output-128k-2025-02-19")
    } else {
        None
    }
}

/// Build the Messages request for `upstream_model` (already mapped).
pub async fn to_claude_request(
    request: &ChatCompletionRequest,
    upstream_model: &str,
    settings: &ClaudeSettings,
    fetcher: &ImageFetcher,
) -> Result<MessagesRequest> {
    let (model, suffix_thinking) = split_thinking_suffix(upstream_model);
    let thinking = suffix_thinking || request.reasoning.is_some();

    let mut system = String::new();
    let mut messages = Vec::with_capacity(request.messages.len());
    let last = request.messages.len().saturating_sub(1);

    for (index, msg) in request.messages.iter().enumerate() {
        let mut role = msg.role.as_str();
        // Extended thinking refuses a conversation ending on an assistant prefill.
        if thinking && index == last && matches!(role, "assistant" | "system") {
            role = "user";
        }
        if role == "system" {
            system.push_str(&msg.text());
            continue;
        }
        messages.push(convert_message(msg, role, fetcher).await?);
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| Tool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            })
            .collect::<Vec<_>>()
    });

    let max_tokens = match request.output_limit() {
        Some(n) if n > 0 => n,
        _ => settings.max_tokens_for(model),
    };

    let mut claude = MessagesRequest {
        model: model.to_string(),
        max_tokens,
        messages,
        system: (!system.is_empty()).then_some(system),
        stream: request.is_stream(),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: stop_sequences(request.stop.as_ref())?,
        tools,
        tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
        thinking: None,
    };

    if thinking {
        let (max_tokens, budget) = negotiate_thinking(
            claude.max_tokens,
            request.reasoning.as_ref(),
            settings.budget_tokens_percentage,
        )?;
        claude.max_tokens = max_tokens;
        claude.thinking = Some(budget);
        claude.top_p = None;
    }

    Ok(claude)
}

/// Pick the thinking budget and the (possibly raised) output limit.
///
/// An explicit budget must lie in `1024..=max_tokens`. An effort tier takes
/// 20% (`low`), 50% (`medium`) or 80% of `max_tokens`; no directive uses the
/// configured percentage. Budgets are floored at 1024, and a `max_tokens`
/// that no longer exceeds the budget becomes 1280.
pub fn negotiate_thinking(
    max_tokens: u32,
    reasoning: Option<&Reasoning>,
    default_percentage: f64,
) -> Result<(u32, Thinking)> {
    let share = |pct: f64| (f64::from(max_tokens) * pct) as u32;

    let budget = match reasoning {
        Some(Reasoning {
            max_tokens: Some(budget),
            ..
        }) if *budget > 0 => {
            if *budget < MIN_THINKING_BUDGET {
                return Err(RelayError::budget(
                    "budget_tokens_too_small",
                    "budget_token must be greater than 1024",
                ));
            }
            if *budget > max_tokens {
                return Err(RelayError::budget(
                    "budget_tokens_too_large",
                    format!(
                        "budget_token cannot be greater than the max_token, max_token: {max_tokens}, budget_token: {budget}"
                    ),
                ));
            }
            *budget
        }
        Some(Reasoning {
            effort: Some(effort),
            ..
        }) if !effort.is_empty() => match effort.as_str() {
            "low" => share(0.2),
            "medium" => share(0.5),
            _ => share(0.8),
        },
        _ => share(default_percentage),
    };

    let budget = budget.max(MIN_THINKING_BUDGET);
    let max_tokens = if max_tokens <= budget {
        THINKING_MAX_TOKENS_FLOOR
    } else {
        max_tokens
    };

    Ok((
        max_tokens,
        Thinking {
            thinking_type: "enabled".to_string(),
            budget_tokens: budget,
        },
    ))
}

async fn convert_message(msg: &ChatMessage, role: &str, fetcher: &ImageFetcher) -> Result<Message> {
    let claude_role = match role {
        "assistant" => "assistant",
        _ => "user",
    };

    if let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        let mut content = Vec::with_capacity(calls.len() + 1);
        let text = msg.text();
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
        for call in calls {
            content.push(tool_use_block(call)?);
        }
        return Ok(Message {
            role: claude_role.to_string(),
            content,
        });
    }

    if role == "tool" {
        return Ok(Message {
            role: "user".to_string(),
            content: vec![ContentBlock::ToolResult {
                tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                content: Some(msg.text()),
            }],
        });
    }

    let mut content = Vec::new();
    match &msg.content {
        Some(ChatContent::Text(text)) => content.push(ContentBlock::Text { text: text.clone() }),
        Some(ChatContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        content.push(ContentBlock::Text { text: text.clone() })
                    }
                    ContentPart::ImageUrl { image_url } => {
                        let image = fetcher.fetch(&image_url.url).await.map_err(|e| {
                            RelayError::translation("image_url_invalid", e.to_string())
                        })?;
                        let source = MediaSource {
                            source_type: "base64".to_string(),
                            media_type: image.mime_type.clone(),
                            data: image.base64(),
                        };
                        content.push(if image.is_pdf() {
                            ContentBlock::Document { source }
                        } else {
                            ContentBlock::Image { source }
                        });
                    }
                    ContentPart::Unsupported => {}
                }
            }
        }
        None => {}
    }

    Ok(Message {
        role: claude_role.to_string(),
        content,
    })
}

fn tool_use_block(call: &ChatToolCall) -> Result<ContentBlock> {
    let input: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&call.function.arguments).map_err(|e| {
            RelayError::translation(
                "conversion_error",
                format!(
                    "tool call {} arguments are not a JSON object: {e}",
                    call.function.name
                ),
            )
        })?;
    Ok(ContentBlock::ToolUse {
        id: call.id.clone(),
        name: call.function.name.clone(),
        input: serde_json::Value::Object(input),
    })
}

fn convert_tool_choice(choice: &ChatToolChoice) -> ToolChoice {
    match choice {
        ChatToolChoice::Specific(specific) => ToolChoice {
            choice_type: "tool".to_string(),
            name: Some(specific.function.name.clone()),
        },
        ChatToolChoice::String(s) if s == "required" => ToolChoice {
            choice_type: "any".to_string(),
            name: None,
        },
        ChatToolChoice::String(_) => ToolChoice {
            choice_type: "auto".to_string(),
            name: None,
        },
    }
}

pub fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    let mapped = match reason? {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        "" => return None,
        other => other,
    };
    Some(mapped.to_string())
}

/// Vendor usage in canonical form. `None` when Claude reported nothing.
pub fn convert_usage(usage: &ClaudeUsage) -> Option<Usage> {
    if usage.input_tokens == 0 && usage.output_tokens == 0 {
        return None;
    }
    let prompt =
        usage.input_tokens + usage.cache_creation_input_tokens + usage.cache_read_input_tokens;
    let mut converted = Usage::new(prompt, usage.output_tokens);
    converted.prompt_tokens_details = PromptTokensDetails {
        cached_tokens: usage.cache_read_input_tokens,
        ..Default::default()
    };
    Some(converted)
}

/// Text blocks become choices; `tool_use` blocks attach to the latest choice.
/// Thinking text rides along on the text choices that follow it.
pub fn from_claude_response(response: &MessagesResponse, client_model: &str) -> ChatCompletionResponse {
    let role = if response.role.is_empty() {
        "assistant"
    } else {
        response.role.as_str()
    };
    let finish = map_stop_reason(response.stop_reason.as_deref());
    let mut choices: Vec<Choice> = Vec::new();
    let mut reasoning: Option<String> = None;

    for block in &response.content {
        match block {
            ResponseBlock::ToolUse { id, name, input } => {
                if choices.is_empty() {
                    choices.push(Choice {
                        index: 0,
                        message: ChoiceMessage {
                            role: role.to_string(),
                            content: Some(String::new()),
                            ..Default::default()
                        },
                        finish_reason: None,
                    });
                }
                if let Some(last) = choices.last_mut() {
                    last.message
                        .tool_calls
                        .get_or_insert_with(Vec::new)
                        .push(ChatToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: ChatToolCallFunction {
                                name: name.clone(),
                                arguments: input.to_string(),
                            },
                        });
                    last.finish_reason = Some("tool_calls".to_string());
                }
            }
            ResponseBlock::Thinking { thinking, .. } => reasoning = Some(thinking.clone()),
            ResponseBlock::RedactedThinking { .. } | ResponseBlock::Other => {}
            ResponseBlock::Text { text } => choices.push(Choice {
                index: choices.len() as u32,
                message: ChoiceMessage {
                    role: role.to_string(),
                    content: Some(text.clone()),
                    reasoning_content: reasoning.clone(),
                    tool_calls: None,
                },
                finish_reason: finish.clone(),
            }),
        }
    }

    if choices.is_empty() {
        choices.push(Choice {
            index: 0,
            message: ChoiceMessage {
                role: role.to_string(),
                content: Some(String::new()),
                ..Default::default()
            },
            finish_reason: finish,
        });
    }

    ChatCompletionResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: client_model.to_string(),
        choices,
        usage: response.usage.as_ref().and_then(convert_usage),
    }
}

/// Concatenated text blocks, for counting completion tokens when usage is missing.
pub fn response_text(response: &MessagesResponse) -> String {
    response
        .content
        .iter()
        .filter_map(|b| match b {
            ResponseBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// HTTP status Anthropic uses for each error type.
pub fn error_status(error_type: &str) -> u16 {
    match error_type {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    }
}

fn stream_error(error: ErrorBody) -> RelayError {
    let status = error_status(&error.error_type);
    RelayError::upstream(status, error.message, error.error_type, None)
}

#[derive(Debug)]
struct OpenToolCall {
    index: u32,
    has_arguments: bool,
}

/// Turns Claude SSE lines into OpenAI chunk JSON, tracking usage as it goes.
#[derive(Debug)]
pub struct ClaudeStreamHandler {
    model: String,
    id: String,
    created: i64,
    usage: Usage,
    text: String,
    tool: Option<OpenToolCall>,
    tools_seen: u32,
}

impl ClaudeStreamHandler {
    pub fn new(client_model: &str) -> Self {
        Self {
            model: client_model.to_string(),
            id: chat_id(),
            created: unix_now(),
            usage: Usage::default(),
            text: String::new(),
            tool: None,
            tools_seen: 0,
        }
    }

    fn emit(&self, sink: &mut StreamSink<String>, delta: ChunkDelta, finish: Option<String>) {
        let mut chunk = ChatCompletionChunk::new(&self.id, &self.model, self.created, delta);
        chunk.choices[0].finish_reason = finish;
        match serde_json::to_string(&chunk) {
            Ok(json) => sink.send(json),
            Err(e) => sink.error(e.into()),
        }
    }

    fn emit_arguments(&self, sink: &mut StreamSink<String>, index: u32, arguments: &str) {
        let delta = ChunkDelta {
            tool_calls: Some(vec![ChunkToolCall {
                index,
                id: None,
                call_type: None,
                function: Some(ChunkToolCallFunction {
                    name: None,
                    arguments: Some(arguments.to_string()),
                }),
            }]),
            ..Default::default()
        };
        self.emit(sink, delta, None);
    }

    fn on_block_start(&mut self, block: ResponseBlock, sink: &mut StreamSink<String>) {
        match block {
            ResponseBlock::Text { text } if !text.is_empty() => {
                self.text.push_str(&text);
                self.emit(sink, content_delta(text), None);
            }
            ResponseBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                self.emit(sink, reasoning_delta(thinking), None);
            }
            ResponseBlock::ToolUse { id, name, .. } => {
                let index = self.tools_seen;
                self.tools_seen += 1;
                self.tool = Some(OpenToolCall {
                    index,
                    has_arguments: false,
                });
                let delta = ChunkDelta {
                    tool_calls: Some(vec![ChunkToolCall {
                        index,
                        id: Some(id),
                        call_type: Some("function".to_string()),
                        function: Some(ChunkToolCallFunction {
                            name: Some(name),
                            arguments: Some(String::new()),
                        }),
                    }]),
                    ..Default::default()
                };
                self.emit(sink, delta, None);
            }
            _ => {}
        }
    }

    fn on_block_delta(&mut self, delta: Delta, sink: &mut StreamSink<String>) {
        match delta {
            Delta::TextDelta { text } => {
                self.text.push_str(&text);
                self.emit(sink, content_delta(text), None);
            }
            Delta::InputJsonDelta { partial_json } => {
                if partial_json.is_empty() {
                    return;
                }
                let Some(tool) = self.tool.as_mut() else {
                    return;
                };
                tool.has_arguments = true;
                let index = tool.index;
                self.emit_arguments(sink, index, &partial_json);
            }
            Delta::ThinkingDelta { thinking } => self.emit(sink, reasoning_delta(thinking), None),
            Delta::SignatureDelta { .. } | Delta::Other => {}
        }
    }

    fn on_block_stop(&mut self, sink: &mut StreamSink<String>) {
        if let Some(tool) = self.tool.take() {
            if !tool.has_arguments {
                self.emit_arguments(sink, tool.index, "{}");
            }
        }
    }
}

fn content_delta(text: String) -> ChunkDelta {
    ChunkDelta {
        content: Some(text),
        ..Default::default()
    }
}

fn reasoning_delta(text: String) -> ChunkDelta {
    ChunkDelta {
        reasoning_content: Some(text),
        ..Default::default()
    }
}

impl LineHandler<String> for ClaudeStreamHandler {
    fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<String>) {
        let Some(bytes) = line.bytes() else {
            return;
        };
        if !bytes.starts_with(STREAM_PREFIX) {
            line.suppress();
            return;
        }

        let event: StreamEvent = match serde_json::from_slice(&bytes[b"data: ".len()..]) {
            Ok(event) => event,
            Err(e) => {
                sink.error(RelayError::upstream(
                    502,
                    format!("invalid Claude stream event: {e}"),
                    "upstream_error",
                    Some("invalid_stream_event".to_string()),
                ));
                return;
            }
        };

        match event {
            StreamEvent::Error { error } => sink.error(stream_error(error)),
            StreamEvent::MessageStop => line.close(),
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage.as_ref().and_then(convert_usage) {
                    self.usage.prompt_tokens = usage.prompt_tokens;
                    self.usage.prompt_tokens_details = usage.prompt_tokens_details;
                }
                let delta = ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(String::new()),
                    ..Default::default()
                };
                self.emit(sink, delta, None);
            }
            StreamEvent::ContentBlockStart { content_block, .. } => {
                self.on_block_start(content_block, sink)
            }
            StreamEvent::ContentBlockDelta { delta, .. } => self.on_block_delta(delta, sink),
            StreamEvent::ContentBlockStop { .. } => self.on_block_stop(sink),
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage.completion_tokens = usage.output_tokens;
                    self.usage.total_tokens =
                        self.usage.prompt_tokens + self.usage.completion_tokens;
                }
                let finish = map_stop_reason(delta.stop_reason.as_deref());
                if finish.is_some() {
                    self.emit(sink, ChunkDelta::default(), finish);
                }
            }
            StreamEvent::Ping | StreamEvent::Unknown => {}
        }
    }
}

impl ChatStreamHandler for ClaudeStreamHandler {
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
    use crate::translate::openai_types::{ChatFunction, ChatTool};
    use serde_json::json;

    fn request(value: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    async fn convert(req: &ChatCompletionRequest) -> Result<MessagesRequest> {
        to_claude_request(req, &req.model, &ClaudeSettings::default(), &ImageFetcher::new()).await
    }

    #[tokio::test]
    async fn test_basic_conversion() {
        let req = request(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 512,
            "top_p": 0.9,
            "stop": "END",
            "messages": [
                {"role": "system", "content": "be brief. "},
                {"role": "system", "content": "be kind."},
                {"role": "user", "content": "hello"}
            ]
        }));
        let claude = convert(&req).await.unwrap();
        assert_eq!(claude.system.as_deref(), Some("be brief. be kind."));
        assert_eq!(claude.max_tokens, 512);
        assert_eq!(claude.stop_sequences, Some(vec!["END".to_string()]));
        assert_eq!(claude.messages.len(), 1);
        assert_eq!(claude.top_p, Some(0.9));
        assert!(claude.thinking.is_none());
    }

    #[tokio::test]
    async fn test_stop_shapes() {
        let mut req = request(json!({"model": "claude-x", "messages": [], "stop": ["a", "b"]}));
        assert_eq!(
            convert(&req).await.unwrap().stop_sequences,
            Some(vec!["a".to_string(), "b".to_string()])
        );

        req.stop = Some(json!(42));
        let err = convert(&req).await.unwrap_err();
        assert!(matches!(err, RelayError::Translation { .. }));
    }

    #[tokio::test]
    async fn test_default_max_tokens() {
        let req = request(json!({"model": "claude-x", "messages": []}));
        let claude = convert(&req).await.unwrap();
        assert_eq!(claude.max_tokens, ClaudeSettings::default().default_max_tokens);
    }

    #[tokio::test]
    async fn test_tool_round_trip_shapes() {
        let mut req = request(json!({
            "model": "claude-x",
            "tool_choice": "required",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "rainy"}
            ]
        }));
        req.tools = Some(vec![ChatTool {
            tool_type: "function".to_string(),
            function: ChatFunction {
                name: "get_weather".to_string(),
                description: Some("weather lookup".to_string()),
                parameters: Some(json!({"type": "object"})),
            },
        }]);

        let claude = convert(&req).await.unwrap();
        assert_eq!(
            claude.messages[1].content[0],
            ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "get_weather".to_string(),
                input: json!({"city": "Oslo"}),
            }
        );
        assert_eq!(claude.messages[2].role, "user");
        assert_eq!(
            claude.messages[2].content[0],
            ContentBlock::ToolResult {
                tool_use_id: "call_1".to_string(),
                content: Some("rainy".to_string()),
            }
        );
        assert_eq!(claude.tool_choice.unwrap().choice_type, "any");
        assert_eq!(claude.tools.unwrap()[0].name, "get_weather");
    }

    #[tokio::test]
    async fn test_non_object_tool_arguments_rejected() {
        let req = request(json!({
            "model": "claude-x",
            "messages": [{"role": "assistant", "tool_calls": [{
                "id": "c", "type": "function",
                "function": {"name": "f", "arguments": "[1,2]"}
            }]}]
        }));
        let err = convert(&req).await.unwrap_err();
        assert_eq!(err.code(), "conversion_error");
    }

    #[tokio::test]
    async fn test_image_part_becomes_base64_source() {
        let url = crate::image::tests::png_data_url(2, 2);
        let req = request(json!({
            "model": "claude-x",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": url}}
            ]}]
        }));
        let claude = convert(&req).await.unwrap();
        match &claude.messages[0].content[1] {
            ContentBlock::Image { source } => {
                assert_eq!(source.source_type, "base64");
                assert_eq!(source.media_type, "image/png");
            }
            other => panic!("expected image block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_thinking_suffix_rewrites_last_assistant() {
        let req = request(json!({
            "model": "claude-3-7-sonnet-thinking",
            "max_tokens": 4000,
            "top_p": 0.5,
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "let me"}
            ]
        }));
        let claude = convert(&req).await.unwrap();
        assert_eq!(claude.model, "claude-3-7-sonnet");
        assert_eq!(claude.messages[1].role, "user");
        assert_eq!(claude.thinking.as_ref().unwrap().budget_tokens, 3200);
        assert!(claude.top_p.is_none());
    }

    #[test]
    fn test_thinking_budget_rules() {
        let explicit = |n| Reasoning {
            max_tokens: Some(n),
            effort: None,
        };
        let effort = |e: &str| Reasoning {
            max_tokens: None,
            effort: Some(e.to_string()),
        };

        let err = negotiate_thinking(8000, Some(&explicit(512)), 0.8).unwrap_err();
        assert_eq!(err.code(), "budget_tokens_too_small");
        let err = negotiate_thinking(2000, Some(&explicit(4000)), 0.8).unwrap_err();
        assert_eq!(err.code(), "budget_tokens_too_large");

        let (max, t) = negotiate_thinking(8000, Some(&explicit(2048)), 0.8).unwrap();
        assert_eq!((max, t.budget_tokens), (8000, 2048));

        assert_eq!(negotiate_thinking(10000, Some(&effort("low")), 0.8).unwrap().1.budget_tokens, 2000);
        assert_eq!(negotiate_thinking(10000, Some(&effort("medium")), 0.8).unwrap().1.budget_tokens, 5000);
        assert_eq!(negotiate_thinking(10000, Some(&effort("high")), 0.8).unwrap().1.budget_tokens, 8000);
        assert_eq!(negotiate_thinking(10000, None, 0.5).unwrap().1.budget_tokens, 5000);

        // Floor at 1024, and max_tokens lifted once it no longer exceeds the budget.
        let (max, t) = negotiate_thinking(1000, Some(&effort("low")), 0.8).unwrap();
        assert_eq!((max, t.budget_tokens), (1280, 1024));
    }

    #[test]
    fn test_thinking_invariant_holds_for_all_limits() {
        for max_tokens in [1, 100, 1024, 1279, 1280, 1281, 5000, 64000] {
            for pct in [0.0, 0.2, 0.8, 1.0] {
                let (max, t) = negotiate_thinking(max_tokens, None, pct).unwrap();
                assert!(t.budget_tokens >= 1024);
                assert!(max > t.budget_tokens || max == 1280, "{max_tokens} {pct}");
            }
        }
    }

    #[test]
    fn test_beta_headers() {
        assert_eq!(
            anthropic_beta("claude-3-5-sonnet-20241022"),
            Some("max-tokens-3-5-sonnet-2024-07-15")
        );
        assert_eq!(
            anthropic_beta("claude-3-7-sonnet-latest"),
            Some("output-128k-2025-02-19")
        );
        assert_eq!(anthropic_beta("claude-opus-4"), None);
    }

    #[test]
    fn test_response_mapping() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                {"type": "redacted_thinking", "data": "xx"},
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "tu_1", "name": "lookup", "input": {"q": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 4, "cache_read_input_tokens": 5}
        }))
        .unwrap();

        let mapped = from_claude_response(&response, "my-claude");
        assert_eq!(mapped.id, "msg_1");
        assert_eq!(mapped.model, "my-claude");
        assert_eq!(mapped.choices.len(), 1);
        let choice = &mapped.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("Checking."));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("hmm"));
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let call = &choice.message.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.arguments, r#"{"q":1}"#);

        let usage = mapped.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 15);
        assert_eq!(usage.prompt_tokens_details.cached_tokens, 5);
        assert_eq!(usage.total_tokens, 19);
    }

    #[test]
    fn test_empty_response_yields_one_choice() {
        let response = MessagesResponse {
            stop_reason: Some("max_tokens".to_string()),
            ..Default::default()
        };
        let mapped = from_claude_response(&response, "m");
        assert_eq!(mapped.choices.len(), 1);
        assert_eq!(mapped.choices[0].finish_reason.as_deref(), Some("length"));
        assert!(mapped.usage.is_none());
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")).as_deref(), Some("stop"));
        assert_eq!(map_stop_reason(Some("stop_sequence")).as_deref(), Some("stop"));
        assert_eq!(map_stop_reason(Some("max_tokens")).as_deref(), Some("length"));
        assert_eq!(map_stop_reason(Some("refusal")).as_deref(), Some("content_filter"));
        assert_eq!(map_stop_reason(None), None);
    }

    fn feed(handler: &mut ClaudeStreamHandler, lines: &[&str]) -> (Vec<serde_json::Value>, Vec<RelayError>, bool) {
        let mut out = Vec::new();
        let mut errors = Vec::new();
        let mut closed = false;
        for l in lines {
            let mut line = RawLine::Data(l.as_bytes().to_vec());
            let mut sink = StreamSink::new();
            handler.handle(&mut line, &mut sink);
            closed |= line == RawLine::Closed;
            let (data, errs) = sink.into_parts();
            out.extend(data.iter().map(|s| serde_json::from_str(s).unwrap()));
            errors.extend(errs);
        }
        (out, errors, closed)
    }

    #[test]
    fn test_stream_text_and_usage() {
        let mut handler = ClaudeStreamHandler::new("client-model");
        let (chunks, errors, closed) = feed(
            &mut handler,
            &[
                "event: message_start",
                r#"data: {"type":"message_start","message":{"id":"m","role":"assistant","content":[],"usage":{"input_tokens":12,"output_tokens":1}}}"#,
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                r#"data: {"type":"ping"}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
                r#"data: {"type":"content_block_stop","index":0}"#,
                r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
                r#"data: {"type":"message_stop"}"#,
            ],
        );
        assert!(errors.is_empty());
        assert!(closed);
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[0]["model"], "client-model");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(chunks[3]["choices"][0]["finish_reason"], "stop");
        assert_eq!(handler.output_text(), "Hello");

        let usage = handler.usage();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens, usage.total_tokens), (12, 7, 19));
    }

    #[test]
    fn test_stream_tool_call_accumulation() {
        let mut handler = ClaudeStreamHandler::new("m");
        let (chunks, _, _) = feed(
            &mut handler,
            &[
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"search","input":{}}}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":""}}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
                r#"data: {"type":"content_block_stop","index":0}"#,
                r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_2","name":"now","input":{}}}"#,
                r#"data: {"type":"content_block_stop","index":1}"#,
            ],
        );

        let calls: Vec<&serde_json::Value> = chunks
            .iter()
            .map(|c| &c["choices"][0]["delta"]["tool_calls"][0])
            .collect();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[0]["id"], "tu_1");
        assert_eq!(calls[0]["function"]["name"], "search");
        let args: String = calls[1..3]
            .iter()
            .map(|c| c["function"]["arguments"].as_str().unwrap())
            .collect();
        assert_eq!(args, r#"{"q":"rust"}"#);
        assert_eq!(calls[3]["index"], 1);
        assert_eq!(calls[4]["index"], 1);
        assert_eq!(calls[4]["function"]["arguments"], "{}");
    }

    #[test]
    fn test_stream_suppresses_foreign_lines_and_reports_errors() {
        let mut handler = ClaudeStreamHandler::new("m");
        let mut line = RawLine::Data(b"event: ping".to_vec());
        let mut sink = StreamSink::new();
        handler.handle(&mut line, &mut sink);
        assert_eq!(line, RawLine::Suppressed);

        let (_, errors, _) = feed(
            &mut handler,
            &[r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#],
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status().as_u16(), 529);
        assert_eq!(errors[0].to_string(), "Overloaded");
    }
}

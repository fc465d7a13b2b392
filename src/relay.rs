//! Request orchestration for the three inbound surfaces.
//!
//! Each surface runs the same sequence: cache the body, parse it, pick the
//! candidate channels, screen the prompt, estimate prompt tokens, dispatch
//! (retrying non-local failures on the next channel), then settle usage.
//! The whole sequence runs on a spawned task and streamed bodies are pumped
//! by another, so a client that goes away never cuts billing short.

use crate::config::{ChannelConfig, GatewayConfig};
use crate::error::{RelayError, Result};
use crate::image::ImageFetcher;
use crate::logging::SharedLogger;
use crate::providers::base::map_model;
use crate::providers::{
    build_gemini_relay, build_provider, ChatReply, ChatStream, EmbeddingReply, GeminiCall,
    GeminiReply, GeminiStream, InboundHeaders, ProviderDeps, RequestBody, RequestContext,
    WireFormat,
};
use crate::requester::Requester;
use crate::safety::{KeywordChecker, SharedChecker};
use crate::stream::{LineHandler, StreamReader};
use crate::tokens::{PreCost, TokenCounter};
use crate::translate::openai_types::{ChatCompletionRequest, Usage};
use crate::usage::{LogUsageSink, SharedUsageSink, Surface, UsageLedger, UsageRecord};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

const CLIENT_QUEUE: usize = 64;
const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// What the server sends back on success.
#[derive(Debug)]
pub enum RelayOutput {
    /// A complete JSON body.
    Json(Bytes),
    /// Server-sent events, already framed for the surface.
    EventStream(mpsc::Receiver<Bytes>),
}

/// Facts about one request that end up on its usage record.
#[derive(Debug, Clone)]
struct Trace {
    request_id: String,
    surface: Surface,
    model: String,
    stream: bool,
    started: Instant,
    channel: String,
    upstream_model: String,
}

impl Trace {
    fn new(surface: Surface, model: &str, stream: bool) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            surface,
            model: model.to_string(),
            stream,
            started: Instant::now(),
            channel: String::new(),
            upstream_model: model.to_string(),
        }
    }

    fn enter(&mut self, channel: &ChannelConfig) {
        self.channel = channel.name.clone();
        self.upstream_model =
            map_model(&channel.model_mapping, &self.model).unwrap_or_else(|_| self.model.clone());
    }
}

enum ChatDispatch {
    Reply(ChatReply),
    Stream(ChatStream),
}

enum GeminiDispatch {
    Reply(GeminiReply),
    Stream(GeminiStream),
}

/// Result of pumping one upstream stream to the client.
struct Drained<H> {
    handler: Option<H>,
    error: Option<RelayError>,
    client_open: bool,
}

/// Text of a Gemini body, skipping everything else without allocating it.
#[derive(Deserialize)]
struct GeminiText {
    #[serde(default)]
    contents: Vec<GeminiTextContent>,
}

#[derive(Deserialize)]
struct GeminiTextContent {
    #[serde(default)]
    parts: Vec<GeminiTextPart>,
}

#[derive(Deserialize)]
struct GeminiTextPart {
    #[serde(default)]
    text: Option<String>,
}

pub struct Relay {
    channels: Vec<Arc<ChannelConfig>>,
    retry_times: usize,
    deps: ProviderDeps,
    counter: Arc<TokenCounter>,
    checker: Option<SharedChecker>,
    usage: SharedUsageSink,
    logger: SharedLogger,
}

impl Relay {
    pub fn new(config: &GatewayConfig, logger: SharedLogger) -> Self {
        let fetcher = ImageFetcher::new();
        let checker = KeywordChecker::from_settings(&config.safety)
            .map(|checker| Arc::new(checker) as SharedChecker);
        Self {
            channels: config.channels.iter().cloned().map(Arc::new).collect(),
            retry_times: config.retry_times,
            deps: ProviderDeps {
                requester: Requester::new(config.timeouts.clone()),
                fetcher: fetcher.clone(),
                claude: Arc::new(config.claude.clone()),
            },
            counter: Arc::new(TokenCounter::with_fetcher(&config.tokens, fetcher)),
            checker,
            usage: Arc::new(LogUsageSink::new(logger.clone())),
            logger,
        }
    }

    pub fn with_usage_sink(mut self, sink: SharedUsageSink) -> Self {
        self.usage = sink;
        self
    }

    pub fn with_checker(mut self, checker: SharedChecker) -> Self {
        self.checker = Some(checker);
        self
    }

    /// `(model, provider)` pairs across all channels, first channel wins.
    pub fn models(&self) -> Vec<(String, String)> {
        let mut seen = std::collections::HashSet::new();
        self.channels
            .iter()
            .flat_map(|c| c.models.iter().map(move |m| (m.clone(), c.provider.clone())))
            .filter(|(model, _)| seen.insert(model.clone()))
            .collect()
    }

    pub async fn chat_completions(
        self: Arc<Self>,
        body: Bytes,
        inbound: InboundHeaders,
    ) -> Result<RelayOutput> {
        detach(tokio::spawn(async move { self.run_chat(body, inbound).await })).await
    }

    pub async fn embeddings(self: Arc<Self>, body: Bytes, inbound: InboundHeaders) -> Result<RelayOutput> {
        detach(tokio::spawn(async move { self.run_embeddings(body, inbound).await })).await
    }

    /// `model_action` is the path tail after `/models/`, e.g. `gemini-pro:generateContent`.
    pub async fn gemini(
        self: Arc<Self>,
        model_action: String,
        body: Bytes,
        inbound: InboundHeaders,
    ) -> Result<RelayOutput> {
        detach(tokio::spawn(async move {
            self.run_gemini(&model_action, body, inbound).await
        }))
        .await
    }

    fn candidates(&self, model: &str, accepts: impl Fn(WireFormat) -> bool) -> Result<Vec<Arc<ChannelConfig>>> {
        let found: Vec<_> = self
            .channels
            .iter()
            .filter(|c| c.serves(model) && c.format().map(&accepts).unwrap_or(false))
            .take(self.retry_times + 1)
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(RelayError::translation(
                "model_not_found",
                format!("no channel serves model '{model}'"),
            ));
        }
        Ok(found)
    }

    fn screen(&self, text: &str) -> Result<()> {
        match &self.checker {
            Some(checker) if !text.is_empty() => checker.check(text).into_result(),
            _ => Ok(()),
        }
    }

    /// Whether to stop after a failed attempt; logs the retry otherwise.
    fn give_up(&self, err: &RelayError, attempt: usize, attempts: usize, trace: &Trace) -> bool {
        if err.is_local() || attempt + 1 >= attempts {
            return true;
        }
        tracing::warn!(
            request_id = %trace.request_id,
            channel = %trace.channel,
            status = err.status().as_u16(),
            error = %err,
            "Upstream failure; trying next channel"
        );
        self.logger.warn(
            "relay",
            format!("{} failed on {} ({}); retrying", trace.request_id, trace.channel, err.code()),
        );
        false
    }

    /// Fill what the vendor did not report: the prompt from the estimate,
    /// the completion by counting the output text.
    fn reconcile(&self, reported: Option<Usage>, output_text: &str, estimate: u64, model: &str) -> Usage {
        let mut usage = reported.unwrap_or_default();
        let mut patched = false;
        if usage.prompt_tokens == 0 && estimate > 0 {
            usage.prompt_tokens = estimate;
            patched = true;
        }
        if usage.completion_tokens == 0 && !output_text.is_empty() {
            usage.completion_tokens = self.counter.count_text(output_text, model);
            patched = true;
        }
        if patched || usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        usage
    }

    fn finish(&self, trace: &Trace, ledger: &mut UsageLedger, usage: Usage, error: Option<&RelayError>) {
        if let Err(e) = ledger.settle(usage) {
            tracing::error!(request_id = %trace.request_id, error = %e, "Usage settled twice");
            return;
        }
        if let Some(err) = error {
            tracing::warn!(
                request_id = %trace.request_id,
                channel = %trace.channel,
                code = %err.code(),
                error = %err,
                "Relay failed"
            );
        }
        self.usage.record(UsageRecord {
            request_id: trace.request_id.clone(),
            timestamp: chrono::Utc::now(),
            surface: trace.surface,
            channel: trace.channel.clone(),
            model: trace.model.clone(),
            upstream_model: trace.upstream_model.clone(),
            stream: trace.stream,
            estimated_prompt_tokens: ledger.estimate(),
            usage,
            duration_ms: trace.started.elapsed().as_millis() as u64,
            success: error.is_none(),
            error_code: error.map(RelayError::code),
        });
    }

    fn fail<T>(&self, trace: &Trace, ledger: &mut UsageLedger, err: RelayError) -> Result<T> {
        self.finish(trace, ledger, Usage::default(), Some(&err));
        Err(err)
    }

    async fn run_chat(self: Arc<Self>, bytes: Bytes, inbound: InboundHeaders) -> Result<RelayOutput> {
        let mut body = RequestBody::RawBytes(bytes);
        let map = body.parse_map()?.clone();
        let request: ChatCompletionRequest = serde_json::from_value(Value::Object(map))
            .map_err(|e| RelayError::translation("invalid_request_body", format!("invalid request body: {e}")))?;
        let model = request.model.clone();
        let stream = request.is_stream();

        let candidates = self.candidates(&model, |_| true)?;
        let prompt_text: Vec<String> = request.messages.iter().map(|m| m.text()).collect();
        self.screen(&prompt_text.join("\n"))?;

        let mut ledger = UsageLedger::new();
        let estimate = self
            .counter
            .count_messages(&request.messages, &model, candidates[0].pre_cost)
            .await?;
        ledger.record_estimate(estimate)?;

        let mut trace = Trace::new(Surface::ChatCompletions, &model, stream);
        let ctx = RequestContext {
            client_model: model.clone(),
            inbound,
        };

        let mut failure = None;
        let mut dispatched = None;
        let mut served = candidates[0].pre_cost;
        for (attempt, channel) in candidates.iter().enumerate() {
            trace.enter(channel);
            self.logger.info(
                "relay",
                format!("{} chat model={} channel={} stream={stream}", trace.request_id, model, channel.name),
            );
            let result = async {
                let provider = build_provider(channel.clone(), &self.deps)?;
                if stream {
                    provider.chat_stream(&request, &mut body, &ctx).await.map(ChatDispatch::Stream)
                } else {
                    provider.chat(&request, &mut body, &ctx).await.map(ChatDispatch::Reply)
                }
            }
            .await;
            match result {
                Ok(d) => {
                    served = channel.pre_cost;
                    dispatched = Some(d);
                    break;
                }
                Err(e) => {
                    let stop = self.give_up(&e, attempt, candidates.len(), &trace);
                    failure = Some(e);
                    if stop {
                        break;
                    }
                }
            }
        }

        let estimate = if served == candidates[0].pre_cost {
            estimate
        } else {
            match self.counter.count_messages(&request.messages, &model, served).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    tracing::warn!(request_id = %trace.request_id, error = %e, "Re-estimate failed; keeping pre-flight count");
                    estimate
                }
            }
        };

        match dispatched {
            Some(ChatDispatch::Reply(mut reply)) => {
                let usage = self.reconcile(reply.usage, &reply.output_text, estimate, &trace.upstream_model);
                if let Some(object) = reply.body.as_object_mut() {
                    object.insert("usage".to_string(), serde_json::to_value(usage)?);
                }
                self.finish(&trace, &mut ledger, usage, None);
                Ok(RelayOutput::Json(Bytes::from(serde_json::to_vec(&reply.body)?)))
            }
            Some(ChatDispatch::Stream(reader)) => {
                let relay = Arc::clone(&self);
                Ok(RelayOutput::EventStream(spawn_pump(
                    reader,
                    |chunk| Bytes::from(format!("data: {chunk}\n\n")),
                    move |drained, tx| async move {
                        let (reported, text) = drained
                            .handler
                            .map(|h| (Some(h.usage()), h.output_text().to_string()))
                            .unwrap_or_default();
                        let reported = reported.filter(|u| !u.is_empty());
                        let usage = relay.reconcile(reported, &text, estimate, &trace.upstream_model);
                        if drained.client_open {
                            let tail = match &drained.error {
                                Some(err) => sse_json(&err.to_openai_envelope()),
                                None => Bytes::from_static(DONE_FRAME),
                            };
                            let _ = tx.send(tail).await;
                        }
                        relay.finish(&trace, &mut ledger, usage, drained.error.as_ref());
                    },
                )))
            }
            None => {
                let err = failure.unwrap_or_else(no_attempt);
                self.fail(&trace, &mut ledger, err)
            }
        }
    }

    async fn run_embeddings(self: Arc<Self>, bytes: Bytes, inbound: InboundHeaders) -> Result<RelayOutput> {
        let mut body = RequestBody::RawBytes(bytes);
        let map = body.parse_map()?;
        let model = map
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input = map.get("input").cloned().unwrap_or(Value::Null);

        let candidates = self.candidates(&model, |f| f == WireFormat::OpenAi)?;
        if let Value::String(text) = &input {
            self.screen(text)?;
        }

        let estimate_for = |cost: PreCost| match cost {
            PreCost::None => 0,
            _ => self.counter.count_input(&input, &model),
        };
        let mut ledger = UsageLedger::new();
        let mut estimate = estimate_for(candidates[0].pre_cost);
        ledger.record_estimate(estimate)?;

        let mut trace = Trace::new(Surface::Embeddings, &model, false);
        let ctx = RequestContext {
            client_model: model.clone(),
            inbound,
        };

        let mut failure = None;
        let mut reply: Option<EmbeddingReply> = None;
        let mut served = candidates[0].pre_cost;
        for (attempt, channel) in candidates.iter().enumerate() {
            trace.enter(channel);
            let result = async {
                build_provider(channel.clone(), &self.deps)?
                    .embeddings(&mut body, &ctx)
                    .await
            }
            .await;
            match result {
                Ok(r) => {
                    served = channel.pre_cost;
                    reply = Some(r);
                    break;
                }
                Err(e) => {
                    let stop = self.give_up(&e, attempt, candidates.len(), &trace);
                    failure = Some(e);
                    if stop {
                        break;
                    }
                }
            }
        }

        let Some(mut reply) = reply else {
            let err = failure.unwrap_or_else(no_attempt);
            return self.fail(&trace, &mut ledger, err);
        };
        if served != candidates[0].pre_cost {
            estimate = estimate_for(served);
        }
        let usage = self.reconcile(reply.usage, "", estimate, &trace.upstream_model);
        if let Some(object) = reply.body.as_object_mut() {
            object.insert("usage".to_string(), serde_json::to_value(usage)?);
        }
        self.finish(&trace, &mut ledger, usage, None);
        Ok(RelayOutput::Json(Bytes::from(serde_json::to_vec(&reply.body)?)))
    }

    async fn run_gemini(
        self: Arc<Self>,
        model_action: &str,
        bytes: Bytes,
        inbound: InboundHeaders,
    ) -> Result<RelayOutput> {
        let call = GeminiCall::parse(model_action)?;
        let candidates = self.candidates(&call.model, |f| matches!(f, WireFormat::Gemini(_)))?;

        if self.checker.is_some() {
            let parsed: GeminiText = serde_json::from_slice(&bytes).map_err(|e| {
                RelayError::translation("invalid_request_body", format!("invalid request body: {e}"))
            })?;
            for text in parsed.contents.iter().flat_map(|c| &c.parts).filter_map(|p| p.text.as_deref()) {
                self.screen(text)?;
            }
        }

        let counting = call.action == "countTokens";
        let estimate_for = |cost: PreCost| {
            if counting {
                Ok(0)
            } else {
                self.counter.count_gemini_bytes(&bytes, &call.model, cost)
            }
        };
        let mut ledger = UsageLedger::new();
        let estimate = estimate_for(candidates[0].pre_cost)?;
        ledger.record_estimate(estimate)?;

        let mut body = RequestBody::RawBytes(bytes.clone());
        let mut trace = Trace::new(Surface::Gemini, &call.model, call.stream);
        let ctx = RequestContext {
            client_model: call.model.clone(),
            inbound,
        };

        let mut failure = None;
        let mut dispatched = None;
        let mut served = candidates[0].pre_cost;
        for (attempt, channel) in candidates.iter().enumerate() {
            trace.enter(channel);
            self.logger.info(
                "relay",
                format!(
                    "{} gemini {}:{} channel={}",
                    trace.request_id, call.model, call.action, channel.name
                ),
            );
            let result = async {
                let relay = build_gemini_relay(channel.clone(), &self.deps)?;
                if call.stream {
                    relay.relay_stream(&call, &mut body, &ctx).await.map(GeminiDispatch::Stream)
                } else {
                    relay.relay(&call, &mut body, &ctx).await.map(GeminiDispatch::Reply)
                }
            }
            .await;
            match result {
                Ok(d) => {
                    served = channel.pre_cost;
                    dispatched = Some(d);
                    break;
                }
                Err(e) => {
                    let stop = self.give_up(&e, attempt, candidates.len(), &trace);
                    failure = Some(e);
                    if stop {
                        break;
                    }
                }
            }
        }

        let estimate = if served == candidates[0].pre_cost {
            estimate
        } else {
            estimate_for(served).unwrap_or_else(|e| {
                tracing::warn!(request_id = %trace.request_id, error = %e, "Re-estimate failed; keeping pre-flight count");
                estimate
            })
        };

        match dispatched {
            Some(GeminiDispatch::Reply(reply)) => {
                let usage = if counting {
                    Usage::default()
                } else {
                    self.reconcile(reply.usage, "", estimate, &trace.upstream_model)
                };
                self.finish(&trace, &mut ledger, usage, None);
                Ok(RelayOutput::Json(reply.body))
            }
            Some(GeminiDispatch::Stream(reader)) => {
                let relay = Arc::clone(&self);
                Ok(RelayOutput::EventStream(spawn_pump(
                    reader,
                    |line: Bytes| line,
                    move |drained, tx| async move {
                        let reported = drained.handler.map(|h| h.usage()).filter(|u| !u.is_empty());
                        let usage = relay.reconcile(reported, "", estimate, &trace.upstream_model);
                        if let (true, Some(err)) = (drained.client_open, &drained.error) {
                            let _ = tx.send(sse_json(&err.to_gemini_envelope())).await;
                        }
                        relay.finish(&trace, &mut ledger, usage, drained.error.as_ref());
                    },
                )))
            }
            None => {
                let err = failure.unwrap_or_else(no_attempt);
                self.fail(&trace, &mut ledger, err)
            }
        }
    }
}

fn no_attempt() -> RelayError {
    RelayError::internal("no_channel_attempted", "no channel was attempted")
}

fn sse_json<T: serde::Serialize>(payload: &T) -> Bytes {
    match serde_json::to_string(payload) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(_) => Bytes::from_static(b"data: {\"error\":{\"message\":\"internal error\"}}\n\n"),
    }
}

/// Await a detached relay task, surfacing a panic as an internal error.
async fn detach(task: tokio::task::JoinHandle<Result<RelayOutput>>) -> Result<RelayOutput> {
    task.await.unwrap_or_else(|e| {
        Err(RelayError::internal(
            "relay_task_failed",
            format!("relay task failed: {e}"),
        ))
    })
}

/// Start the pump task and return the client's end of the event queue.
///
/// The pump forwards framed items while the client listens and keeps
/// draining after it leaves, so the handler always reaches `settle` with
/// the usage it saw.
fn spawn_pump<T, H, F, S, Fut>(reader: StreamReader<T, H>, frame: F, settle: S) -> mpsc::Receiver<Bytes>
where
    T: Send + 'static,
    H: LineHandler<T>,
    F: Fn(T) -> Bytes + Send + 'static,
    S: FnOnce(Drained<H>, mpsc::Sender<Bytes>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
    tokio::spawn(async move {
        let drained = drain(reader, &tx, frame).await;
        settle(drained, tx).await;
    });
    rx
}

async fn drain<T, H, F>(reader: StreamReader<T, H>, tx: &mpsc::Sender<Bytes>, frame: F) -> Drained<H>
where
    T: Send + 'static,
    H: LineHandler<T>,
    F: Fn(T) -> Bytes,
{
    let (mut data, mut errors, task) = reader.into_parts();
    let mut client_open = true;

    while let Some(item) = data.recv().await {
        if client_open && tx.send(frame(item)).await.is_err() {
            client_open = false;
            tracing::debug!("Client disconnected; draining upstream for usage");
        }
    }

    // The decoder has exited, so the error queue is closed or holds its one error.
    let error = errors.recv().await;
    let handler = match task.await {
        Ok(handler) => Some(handler),
        Err(e) => {
            tracing::error!(error = %e, "Stream decoder task failed");
            None
        }
    };

    Drained {
        handler,
        error,
        client_open,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::openai::OpenAiStreamHandler;
    use crate::safety::{ContentChecker, KeywordChecker, SafetyVerdict};
    use crate::stream::LineMode;
    use crate::translate::ChatStreamHandler;
    use crate::usage::UsageSink;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Collect(Mutex<Vec<UsageRecord>>);

    impl UsageSink for Collect {
        fn record(&self, record: UsageRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn config(channels: Vec<ChannelConfig>) -> GatewayConfig {
        let mut config = GatewayConfig {
            channels,
            ..Default::default()
        };
        config.tokens.approximate = true;
        config
    }

    /// Wait for the pump task to settle a streamed request.
    async fn settled(sink: &Collect) -> Vec<UsageRecord> {
        for _ in 0..250 {
            let records = sink.0.lock().unwrap().clone();
            if !records.is_empty() {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Vec::new()
    }

    fn chunk_line(content: &str) -> String {
        format!(
            "data: {{\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-4o\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
        )
    }

    const USAGE_LINE: &str = "data: {\"id\":\"c\",\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":200,\"total_tokens\":212}}\n\n";

    /// Remembers every text it was asked about; blocks `stop`.
    #[derive(Default)]
    struct Screened(Mutex<Vec<String>>);

    impl ContentChecker for Screened {
        fn check(&self, text: &str) -> SafetyVerdict {
            self.0.lock().unwrap().push(text.to_string());
            if text == "stop" {
                SafetyVerdict::blocked("stop word", "sensitive_words_detected")
            } else {
                SafetyVerdict::safe()
            }
        }
    }

    fn channel(name: &str, provider: &str, models: &[&str]) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            provider: provider.to_string(),
            key: Some("k".to_string()),
            models: models.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_candidates_filter_by_model_and_family() {
        let relay = Relay::new(
            &config(vec![
                channel("a", "openai", &["gpt-4o"]),
                channel("b", "gemini", &[]),
                channel("c", "openrouter", &[]),
            ]),
            SharedLogger::in_memory(),
        );

        let names = |list: Vec<Arc<ChannelConfig>>| list.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(relay.candidates("gpt-4o", |_| true).unwrap()), ["a", "b"]);
        assert_eq!(
            names(relay.candidates("gemini-pro", |f| matches!(f, WireFormat::Gemini(_))).unwrap()),
            ["b"]
        );
        let err = relay
            .candidates("gpt-4o", |f| f == WireFormat::Claude)
            .unwrap_err();
        assert_eq!(err.code(), "model_not_found");
    }

    #[test]
    fn test_reconcile_fills_gaps() {
        let relay = Relay::new(&config(vec![]), SharedLogger::in_memory());

        let reported = Usage::new(10, 5);
        assert_eq!(relay.reconcile(Some(reported), "ignored", 99, "gpt-4o"), reported);

        let filled = relay.reconcile(None, "hello world", 7, "gpt-4o");
        assert_eq!(filled.prompt_tokens, 7);
        assert!(filled.completion_tokens > 0);
        assert_eq!(filled.total_tokens, 7 + filled.completion_tokens);

        let mut cached = Usage::new(10, 5);
        cached.total_tokens = 20;
        assert_eq!(relay.reconcile(Some(cached), "", 0, "gpt-4o").total_tokens, 20);
    }

    #[tokio::test]
    async fn test_blocked_prompt_never_dispatches() {
        let sink = Arc::new(Collect::default());
        let relay = Arc::new(
            Relay::new(&config(vec![channel("a", "openai", &[])]), SharedLogger::in_memory())
                .with_checker(Arc::new(KeywordChecker::new(["secret plan"])))
                .with_usage_sink(sink.clone()),
        );
        let body = Bytes::from_static(
            br#"{"model":"gpt-4o","messages":[{"role":"user","content":"the Secret Plan is"}]}"#,
        );
        let err = relay
            .chat_completions(body, InboundHeaders::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ContentBlocked { .. }));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_failure_is_recorded_without_retry() {
        let sink = Arc::new(Collect::default());
        let mut broken = channel("broken", "openai", &[]);
        broken.model_mapping = "{not json".to_string();
        let relay = Arc::new(
            Relay::new(
                &config(vec![broken, channel("spare", "openai", &[])]),
                SharedLogger::in_memory(),
            )
            .with_usage_sink(sink.clone()),
        );

        let body = Bytes::from_static(br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#);
        let err = relay
            .chat_completions(body, InboundHeaders::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Configuration { .. }));

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel, "broken");
        assert!(!records[0].success);
        assert!(records[0].estimated_prompt_tokens > 0);
    }

    #[tokio::test]
    async fn test_drain_outlives_client() {
        let mut body = String::new();
        for _ in 0..3 {
            body.push_str(&chunk_line("x"));
        }
        body.push_str(USAGE_LINE);
        body.push_str("data: [DONE]\n\n");
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);
        let reader = StreamReader::spawn(upstream, OpenAiStreamHandler::new("gpt-4o"), LineMode::Trimmed);

        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        drop(rx);
        let drained = drain(reader, &tx, |chunk: String| Bytes::from(chunk)).await;

        assert!(!drained.client_open);
        assert!(drained.error.is_none());
        let handler = drained.handler.unwrap();
        assert_eq!(handler.usage().total_tokens, 212);
        assert_eq!(handler.output_text(), "xxx");
    }

    #[tokio::test]
    async fn test_client_disconnect_still_records_usage() {
        let mut sse = String::new();
        for _ in 0..200 {
            sse.push_str(&chunk_line("x"));
        }
        sse.push_str(USAGE_LINE);
        sse.push_str("data: [DONE]\n\n");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let mut openai = channel("openai", "openai", &[]);
        openai.base_url = Some(server.uri());
        let sink = Arc::new(Collect::default());
        let relay = Arc::new(
            Relay::new(&config(vec![openai]), SharedLogger::in_memory()).with_usage_sink(sink.clone()),
        );

        let body = Bytes::from_static(
            br#"{"model":"gpt-4o","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        );
        let output = relay.chat_completions(body, InboundHeaders::default()).await.unwrap();
        let RelayOutput::EventStream(mut rx) = output else {
            panic!("expected an event stream");
        };
        let first = rx.recv().await.unwrap();
        assert!(first.starts_with(b"data: "));
        drop(rx);

        let records = settled(&sink).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].usage.total_tokens, 212);
    }

    #[tokio::test]
    async fn test_estimate_follows_serving_channel_pre_cost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/broken/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("{\"error\":{\"message\":\"down\"}}"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "c",
                "object": "chat.completion",
                "model": "gpt-4o",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let mut free = channel("free", "openai", &[]);
        free.base_url = Some(format!("{}/broken", server.uri()));
        free.pre_cost = PreCost::None;
        let mut billed = channel("billed", "openai", &[]);
        billed.base_url = Some(server.uri());

        let sink = Arc::new(Collect::default());
        let mut config = config(vec![free, billed]);
        config.retry_times = 1;
        let relay = Arc::new(Relay::new(&config, SharedLogger::in_memory()).with_usage_sink(sink.clone()));

        let body = Bytes::from_static(
            br#"{"model":"gpt-4o","messages":[{"role":"user","content":"how many tokens is this prompt"}]}"#,
        );
        relay.chat_completions(body, InboundHeaders::default()).await.unwrap();

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel, "billed");
        assert_eq!(records[0].estimated_prompt_tokens, 0);
        assert!(records[0].usage.prompt_tokens > 0);
    }

    #[tokio::test]
    async fn test_gemini_parts_screened_one_by_one() {
        let checker = Arc::new(Screened::default());
        let relay = Arc::new(
            Relay::new(&config(vec![channel("g", "gemini", &[])]), SharedLogger::in_memory())
                .with_checker(checker.clone()),
        );
        let body = Bytes::from_static(
            br#"{"contents":[{"role":"user","parts":[{"text":"go"},{"inlineData":{}},{"text":"stop"}]},{"parts":[{"text":"later"}]}]}"#,
        );
        let err = relay
            .gemini("gemini-pro:generateContent".to_string(), body, InboundHeaders::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::ContentBlocked { .. }));
        assert_eq!(*checker.0.lock().unwrap(), ["go", "stop"]);
    }

    #[tokio::test]
    async fn test_malformed_model_action() {
        let relay = Arc::new(Relay::new(&config(vec![channel("g", "gemini", &[])]), SharedLogger::in_memory()));
        let err = relay
            .gemini("gemini-pro".to_string(), Bytes::from_static(b"{}"), InboundHeaders::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_model_action");
    }
}

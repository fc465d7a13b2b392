//! Outbound HTTP to vendors.
//!
//! Every upstream call runs on its own spawned task. The inbound handler only
//! awaits the join handle, so a client disconnect (which drops the handler
//! future) cannot abort a call whose usage still has to be billed.

use crate::config::TimeoutConfig;
use crate::error::{RelayError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// A fully prepared upstream request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub proxy: Option<String>,
}

impl UpstreamRequest {
    pub fn post(url: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers,
            body,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.is_empty());
        self
    }
}

/// A buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode a vendor error body.
    ///
    /// OpenAI (`{"error":{"message","type","code"}}`), Anthropic
    /// (`{"type":"error","error":{"type","message"}}`) and Google
    /// (`{"error":{"code","message","status"}}`) bodies all keep the message
    /// under `error`; anything else is surfaced as the raw body text.
    /// `secret` is scrubbed from the message.
    pub fn to_error(&self, secret: &str) -> RelayError {
        let scrub = |message: &str| {
            if secret.is_empty() {
                message.to_string()
            } else {
                message.replace(secret, "xxxxx")
            }
        };

        let parsed: Option<VendorErrorEnvelope> = serde_json::from_slice(&self.body).ok();
        match parsed.and_then(|e| e.error) {
            Some(body) => {
                let kind = body.error_type.or(body.status).unwrap_or_default();
                let code = match body.code {
                    Some(Value::String(s)) if !s.is_empty() => Some(s),
                    _ => None,
                };
                RelayError::upstream(self.status, scrub(&body.message), kind, code)
            }
            None => {
                let text = String::from_utf8_lossy(&self.body);
                let message = if text.trim().is_empty() {
                    format!("upstream returned status {}", self.status)
                } else {
                    scrub(text.trim())
                };
                RelayError::upstream(self.status, message, "upstream_error", None)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct VendorErrorEnvelope {
    #[serde(default)]
    error: Option<VendorErrorBody>,
}

#[derive(Debug, Deserialize)]
struct VendorErrorBody {
    #[serde(default)]
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

/// Result of opening a streaming call: either a live body or the buffered
/// error response the vendor sent instead.
#[derive(Debug)]
pub enum Opened {
    Stream(Response),
    Failed(UpstreamResponse),
}

#[derive(Debug, Clone)]
pub struct Requester {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    timeouts: TimeoutConfig,
    /// One client per proxy URL; the empty key is the direct client.
    clients: DashMap<String, Client>,
}

impl Requester {
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeouts,
                clients: DashMap::new(),
            }),
        }
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.inner.timeouts
    }

    fn client(&self, proxy: Option<&str>) -> Result<Client> {
        let key = proxy.unwrap_or_default();
        if let Some(client) = self.inner.clients.get(key) {
            return Ok(client.clone());
        }

        let timeouts = &self.inner.timeouts;
        let mut builder = Client::builder()
            .connect_timeout(timeouts.tls_handshake())
            .timeout(timeouts.relay());
        if let Some(url) = proxy {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| RelayError::configuration(format!("invalid proxy '{url}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| RelayError::configuration(format!("failed to build HTTP client: {e}")))?;

        self.inner.clients.insert(key.to_string(), client.clone());
        Ok(client)
    }

    fn build(&self, req: UpstreamRequest) -> Result<reqwest::RequestBuilder> {
        let client = self.client(req.proxy.as_deref())?;
        Ok(client
            .request(req.method, &req.url)
            .headers(req.headers)
            .body(req.body))
    }

    /// Non-streaming call: send and buffer the whole body under the shorter
    /// request timeout.
    pub async fn execute(&self, req: UpstreamRequest) -> Result<UpstreamResponse> {
        let url = req.url.clone();
        let builder = self.build(req)?.timeout(self.inner.timeouts.request());
        let header_timeout = self.inner.timeouts.response_header();

        let task = tokio::spawn(async move {
            let response = await_headers(builder, header_timeout).await?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(RelayError::from_reqwest)?;
            Ok(UpstreamResponse { status, body })
        });

        join(task, &url).await
    }

    /// Streaming call: wait for headers only. The returned body is read by the
    /// caller's decoder task and stays bounded by the relay timeout.
    pub async fn open_stream(&self, req: UpstreamRequest) -> Result<Opened> {
        let url = req.url.clone();
        let builder = self.build(req)?;
        let header_timeout = self.inner.timeouts.response_header();

        let task = tokio::spawn(async move {
            let response = await_headers(builder, header_timeout).await?;
            if response.status().is_success() {
                return Ok(Opened::Stream(response));
            }
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(RelayError::from_reqwest)?;
            Ok(Opened::Failed(UpstreamResponse { status, body }))
        });

        join(task, &url).await
    }
}

async fn await_headers(
    builder: reqwest::RequestBuilder,
    header_timeout: std::time::Duration,
) -> Result<Response> {
    match tokio::time::timeout(header_timeout, builder.send()).await {
        Ok(result) => result.map_err(RelayError::from_reqwest),
        Err(_) => Err(RelayError::transport(format!(
            "no response headers within {}s",
            header_timeout.as_secs()
        ))),
    }
}

/// The URL up to its query string.
fn without_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

async fn join<T>(task: tokio::task::JoinHandle<Result<T>>, url: &str) -> Result<T> {
    match task.await {
        Ok(result) => {
            if let Err(RelayError::UpstreamTransport { ref detail }) = result {
                tracing::warn!(url = %without_query(url), detail = %detail, "Upstream transport failure");
            }
            result
        }
        Err(e) => Err(RelayError::internal(
            "upstream_task_failed",
            format!("upstream task failed: {e}"),
        )),
    }
}

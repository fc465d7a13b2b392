//! Token accounting: pre-flight prompt estimates and completion fallbacks.
//!
//! Three counting paths exist, one per cached body representation (typed
//! messages, a generic JSON map, raw Gemini bytes), so an estimate never
//! forces a second parse of the request.

use crate::config::TokenSettings;
use crate::error::{RelayError, Result};
use crate::image::ImageFetcher;
use crate::raw::{parse_array, RawObject};
use crate::translate::openai_types::{ChatContent, ChatMessage, ContentPart};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer};
use tiktoken_rs::CoreBPE;

/// Which parts of a prompt are estimated before dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreCost {
    #[default]
    All,
    /// Text only; image parts cost nothing up front.
    SkipImages,
    /// No estimate at all.
    None,
}

/// Tile pricing for OpenAI-style vision models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileCost {
    pub low: u64,
    pub high: u64,
    pub additional: u64,
}

/// Per-vendor image cost heuristics, selected by model prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCostTable {
    pub general: TileCost,
    pub gpt_4o_mini: TileCost,
    /// Flat cost per Gemini image.
    pub gemini: u64,
    /// Claude charges `ceil(width * height / claude_pixels_per_token)`.
    pub claude_pixels_per_token: u64,
    pub glm: u64,
}

impl Default for ImageCostTable {
    fn default() -> Self {
        Self {
            general: TileCost {
                low: 85,
                high: 170,
                additional: 85,
            },
            gpt_4o_mini: TileCost {
                low: 2833,
                high: 5667,
                additional: 2833,
            },
            gemini: 258,
            claude_pixels_per_token: 750,
            glm: 1047,
        }
    }
}

const APPROXIMATION_RATIO: f64 = 0.38;
const REPLY_PRIMING: u64 = 3;
const GEMINI_TOKENS_PER_CONTENT: u64 = 4;
const GEMINI_INLINE_MEDIA: u64 = 200;

/// Known families, longest prefix first.
const PREFIX_TOKENIZERS: &[(&str, Tokenizer)] = &[
    ("gpt-4.1", Tokenizer::O200kBase),
    ("gpt-4o", Tokenizer::O200kBase),
    ("gpt-5", Tokenizer::O200kBase),
    ("gpt-3.5", Tokenizer::Cl100kBase),
    ("text-embedding", Tokenizer::Cl100kBase),
    ("gpt-4", Tokenizer::Cl100kBase),
    ("o1", Tokenizer::O200kBase),
    ("o3", Tokenizer::O200kBase),
    ("o4", Tokenizer::O200kBase),
];

fn bpe_for(tokenizer: Tokenizer) -> &'static CoreBPE {
    match tokenizer {
        Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        Tokenizer::R50kBase | Tokenizer::P50kBase | Tokenizer::P50kEdit | Tokenizer::Gpt2 => {
            tiktoken_rs::r50k_base_singleton()
        }
    }
}

fn resolve_tokenizer(model: &str) -> Tokenizer {
    PREFIX_TOKENIZERS
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, t)| *t)
        .or_else(|| get_tokenizer(model))
        .unwrap_or(Tokenizer::Cl100kBase)
}

/// Text, role and name of one message plus the images it references.
struct MessageView<'a> {
    role: &'a str,
    name: Option<&'a str>,
    texts: Vec<&'a str>,
    images: Vec<(&'a str, Option<&'a str>)>,
}

pub struct TokenCounter {
    approximate: bool,
    disabled: bool,
    image_cost: ImageCostTable,
    fetcher: ImageFetcher,
    /// Model id to encoder. Concurrent first lookups may both resolve; the
    /// result is the same either way.
    encoders: DashMap<String, &'static CoreBPE>,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("approximate", &self.approximate)
            .field("disabled", &self.disabled)
            .field("cached_models", &self.encoders.len())
            .finish()
    }
}

impl TokenCounter {
    pub fn new(settings: &TokenSettings) -> Self {
        Self::with_fetcher(settings, ImageFetcher::new())
    }

    pub fn with_fetcher(settings: &TokenSettings, fetcher: ImageFetcher) -> Self {
        if settings.disabled {
            tracing::info!("Token encoders disabled; using length approximation");
        }
        Self {
            approximate: settings.approximate,
            disabled: settings.disabled,
            image_cost: settings.image_cost.clone(),
            fetcher,
            encoders: DashMap::new(),
        }
    }

    fn encoder(&self, model: &str) -> &'static CoreBPE {
        if let Some(bpe) = self.encoders.get(model) {
            return *bpe;
        }
        let bpe = bpe_for(resolve_tokenizer(model));
        self.encoders.insert(model.to_string(), bpe);
        bpe
    }

    /// Tokens in `text` for `model`.
    pub fn count_text(&self, text: &str, model: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        if self.disabled || self.approximate {
            return (text.len() as f64 * APPROXIMATION_RATIO) as u64;
        }
        self.encoder(model).encode_with_special_tokens(text).len() as u64
    }

    /// Embedding input: a string, an array of strings, or anything else
    /// rendered as JSON text.
    pub fn count_input(&self, input: &Value, model: &str) -> u64 {
        match input {
            Value::String(s) => self.count_text(s, model),
            Value::Array(items) if items.iter().all(Value::is_string) => {
                let joined: String = items.iter().filter_map(Value::as_str).collect();
                self.count_text(&joined, model)
            }
            other => self.count_text(&other.to_string(), model),
        }
    }

    /// Typed chat messages.
    pub async fn count_messages(
        &self,
        messages: &[ChatMessage],
        model: &str,
        pre_cost: PreCost,
    ) -> Result<u64> {
        if pre_cost == PreCost::None {
            return Ok(0);
        }
        let views = messages
            .iter()
            .map(|m| {
                let mut view = MessageView {
                    role: m.role.as_str(),
                    name: m.name.as_deref(),
                    texts: Vec::new(),
                    images: Vec::new(),
                };
                if let Some(content) = &m.content {
                    match content {
                        ChatContent::Text(t) => view.texts.push(t.as_str()),
                        ChatContent::Parts(parts) => {
                            for part in parts {
                                match part {
                                    ContentPart::Text { text } => view.texts.push(text.as_str()),
                                    ContentPart::ImageUrl { image_url } => view
                                        .images
                                        .push((image_url.url.as_str(), image_url.detail.as_deref())),
                                    ContentPart::Unsupported => {}
                                }
                            }
                        }
                    }
                }
                view
            })
            .collect::<Vec<_>>();
        self.count_views(&views, model, pre_cost).await
    }

    /// The `messages` array of a generic request map.
    pub async fn count_value_messages(
        &self,
        messages: &Value,
        model: &str,
        pre_cost: PreCost,
    ) -> Result<u64> {
        if pre_cost == PreCost::None {
            return Ok(0);
        }
        let views = messages
            .as_array()
            .map(|list| list.iter().map(view_from_value).collect::<Vec<_>>())
            .unwrap_or_default();
        self.count_views(&views, model, pre_cost).await
    }

    async fn count_views(
        &self,
        views: &[MessageView<'_>],
        model: &str,
        pre_cost: PreCost,
    ) -> Result<u64> {
        // Every message follows <|start|>{role/name}\n{content}<|end|>\n
        let (per_message, per_name): (u64, i64) = if model == "gpt-3.5-turbo-0301" {
            (4, -1)
        } else {
            (3, 1)
        };

        let mut total: i64 = 0;
        let mut text = String::new();
        for view in views {
            total += per_message as i64;
            for t in &view.texts {
                text.push_str(t);
                text.push('\n');
            }
            if pre_cost == PreCost::All {
                for (url, detail) in &view.images {
                    total += self.image_tokens(url, *detail, model).await? as i64;
                }
            }
            text.push_str(view.role);
            text.push('\n');
            if let Some(name) = view.name {
                total += per_name;
                text.push_str(name);
                text.push('\n');
            }
        }

        total += self.count_text(&text, model) as i64;
        total += REPLY_PRIMING as i64;
        Ok(total.max(0) as u64)
    }

    /// Raw Gemini request bytes: per-content framing, a flat cost per inline
    /// media part, and all text counted in one pass.
    pub fn count_gemini_bytes(&self, body: &[u8], model: &str, pre_cost: PreCost) -> Result<u64> {
        if pre_cost == PreCost::None {
            return Ok(0);
        }
        let malformed =
            |e: serde_json::Error| RelayError::translation("invalid_request_body", e.to_string());

        let top = RawObject::parse(body).map_err(malformed)?;
        let Some(contents) = top.get("contents") else {
            return Ok(0);
        };

        let mut total = 0;
        let mut text = String::new();
        for content in parse_array(contents).map_err(malformed)? {
            total += GEMINI_TOKENS_PER_CONTENT;
            let content = RawObject::parse_raw(content).map_err(malformed)?;
            let Some(parts) = content.get("parts") else {
                continue;
            };
            for part in parse_array(parts).map_err(malformed)? {
                let part = RawObject::parse_raw(part).map_err(malformed)?;
                if let Some(t) = part.get("text") {
                    if let Ok(s) = serde_json::from_str::<String>(t.get()) {
                        text.push_str(&s);
                    }
                }
                if pre_cost == PreCost::All
                    && (part.contains_key("inlineData") || part.contains_key("inline_data"))
                {
                    total += GEMINI_INLINE_MEDIA;
                }
            }
        }
        Ok(total + self.count_text(&text, model))
    }

    /// Cost of one image for `model`. Fetch or measurement failures are errors.
    pub async fn image_tokens(&self, url: &str, detail: Option<&str>, model: &str) -> Result<u64> {
        let table = &self.image_cost;
        if model.starts_with("gemini-") {
            return Ok(table.gemini);
        }
        if model.starts_with("glm-") {
            return Ok(table.glm);
        }
        if model.starts_with("claude-") {
            let (w, h) = self.fetcher.dimensions(url).await?;
            let per = table.claude_pixels_per_token.max(1);
            return Ok((w * h).div_ceil(per));
        }

        let cost = if model.starts_with("gpt-4o-mini") {
            table.gpt_4o_mini
        } else {
            table.general
        };
        match detail.unwrap_or("") {
            "low" => Ok(cost.low),
            "" | "auto" | "high" => {
                let (w, h) = self.fetcher.dimensions(url).await?;
                Ok(tile_cost(w, h, cost))
            }
            other => Err(RelayError::translation(
                "invalid_image_detail",
                format!("invalid detail option: {other}"),
            )),
        }
    }
}

/// Scale into a 2048px box, then shrink the short side to 768px, then
/// charge per 512px tile plus a fixed base.
pub fn tile_cost(width: u64, height: u64, cost: TileCost) -> u64 {
    let (mut w, mut h) = (width as f64, height as f64);
    if w > 2048.0 || h > 2048.0 {
        let ratio = 2048.0 / w.max(h);
        w = (w * ratio).floor();
        h = (h * ratio).floor();
    }
    if w > 768.0 && h > 768.0 {
        let ratio = 768.0 / w.min(h);
        w = (w * ratio).floor();
        h = (h * ratio).floor();
    }
    let tiles = ((w / 512.0).ceil() * (h / 512.0).ceil()) as u64;
    tiles * cost.high + cost.additional
}

fn view_from_value(message: &Value) -> MessageView<'_> {
    let mut view = MessageView {
        role: message.get("role").and_then(Value::as_str).unwrap_or(""),
        name: message.get("name").and_then(Value::as_str),
        texts: Vec::new(),
        images: Vec::new(),
    };
    match message.get("content") {
        Some(Value::String(s)) => view.texts.push(s),
        Some(Value::Array(parts)) => {
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = part.get("text").and_then(Value::as_str) {
                            view.texts.push(t);
                        }
                    }
                    Some("image_url") => {
                        let image = part.get("image_url");
                        if let Some(url) = image.and_then(|i| i.get("url")).and_then(Value::as_str) {
                            let detail = image.and_then(|i| i.get("detail")).and_then(Value::as_str);
                            view.images.push((url, detail));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    view
}

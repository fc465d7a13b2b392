use crate::error::{RelayError, Result};
use crate::providers::presets::{ProviderPreset, WireFormat};
use crate::tokens::{ImageCostTable, PreCost};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// How many additional channels to try after a non-local upstream failure.
    #[serde(default = "default_retry_times")]
    pub retry_times: usize,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub tokens: TokenSettings,
    #[serde(default)]
    pub claude: ClaudeSettings,
    #[serde(default)]
    pub safety: SafetySettings,
}

/// One upstream vendor record. The JSON-valued fields are kept as raw strings
/// and parsed per request so a broken value fails only the requests that use it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Preset name, e.g. `openai`, `openrouter`, `claude`, `gemini`, `vertex_ai`.
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Models served by this channel. Empty means any model.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: String,
    #[serde(default)]
    pub custom_parameter: String,
    #[serde(default)]
    pub model_headers: String,
    #[serde(default)]
    pub endpoint_overrides: String,
    #[serde(default)]
    pub pre_cost: PreCost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_tls_handshake_secs")]
    pub tls_handshake_secs: u64,
    #[serde(default = "default_response_header_secs")]
    pub response_header_secs: u64,
    /// Whole-request lifetime, including streamed body reads.
    #[serde(default = "default_relay_secs")]
    pub relay_secs: u64,
    /// Tighter lifetime for non-streaming calls.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenSettings {
    /// Count text as `len * 0.38` instead of running the tokenizer.
    #[serde(default)]
    pub approximate: bool,
    /// Skip tokenizer loading entirely.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub image_cost: ImageCostTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeSettings {
    #[serde(default = "default_budget_percentage")]
    pub budget_tokens_percentage: f64,
    #[serde(default = "default_claude_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default)]
    pub model_max_tokens: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub blocked_words: Vec<String>,
}

fn default_port() -> u16 {
    3000
}

fn default_retry_times() -> usize {
    1
}

fn default_tls_handshake_secs() -> u64 {
    30
}

fn default_response_header_secs() -> u64 {
    120
}

fn default_relay_secs() -> u64 {
    600
}

fn default_request_secs() -> u64 {
    300
}

fn default_budget_percentage() -> f64 {
    0.8
}

fn default_claude_max_tokens() -> u32 {
    8192
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tls_handshake_secs: default_tls_handshake_secs(),
            response_header_secs: default_response_header_secs(),
            relay_secs: default_relay_secs(),
            request_secs: default_request_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn tls_handshake(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_secs)
    }

    pub fn response_header(&self) -> Duration {
        Duration::from_secs(self.response_header_secs)
    }

    pub fn relay(&self) -> Duration {
        Duration::from_secs(self.relay_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

impl Default for ClaudeSettings {
    fn default() -> Self {
        Self {
            budget_tokens_percentage: default_budget_percentage(),
            default_max_tokens: default_claude_max_tokens(),
            model_max_tokens: HashMap::new(),
        }
    }
}

impl ClaudeSettings {
    pub fn max_tokens_for(&self, model: &str) -> u32 {
        self.model_max_tokens
            .get(model)
            .copied()
            .unwrap_or(self.default_max_tokens)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            retry_times: default_retry_times(),
            channels: Vec::new(),
            timeouts: TimeoutConfig::default(),
            tokens: TokenSettings::default(),
            claude: ClaudeSettings::default(),
            safety: SafetySettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(RelayError::configuration(format!(
            "No config file found. Searched: {}",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Fail fast on channels that could never serve a request.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(RelayError::configuration("no channels configured"));
        }
        for channel in &self.channels {
            channel.preset()?;
            channel.effective_base_url()?;
        }
        Ok(())
    }
}

impl ChannelConfig {
    pub fn preset(&self) -> Result<&'static ProviderPreset> {
        ProviderPreset::from_name(&self.provider).ok_or_else(|| {
            RelayError::configuration(format!(
                "channel '{}': unknown provider '{}'. Known providers: {}",
                self.name,
                self.provider,
                ProviderPreset::all()
                    .iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }

    pub fn format(&self) -> Result<WireFormat> {
        Ok(self.preset()?.format)
    }

    /// Resolve the effective base URL (channel override or provider preset default)
    pub fn effective_base_url(&self) -> Result<String> {
        if let Some(ref url) = self.base_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let preset = self.preset()?;
        if preset.base_url.is_empty() {
            return Err(RelayError::configuration(format!(
                "channel '{}': provider '{}' requires base_url",
                self.name, self.provider
            )));
        }
        Ok(preset.base_url.to_string())
    }

    /// Inline key first, then the channel's env var, then the preset's default env var.
    pub fn resolve_key(&self) -> Result<String> {
        if let Some(ref key) = self.key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        let env_name = match self.key_env {
            Some(ref name) => name.as_str(),
            None => self.preset()?.default_api_key_env,
        };
        std::env::var(env_name).map_err(|_| {
            RelayError::configuration(format!(
                "channel '{}': environment variable '{}' not set",
                self.name, env_name
            ))
        })
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("relay-gateway.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("relay-gateway").join("config.toml"));
    }
    if let Some(home) = dirs_path() {
        paths.push(home.join(".config").join("relay-gateway").join("config.toml"));
        paths.push(home.join(".relay-gateway.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// Printed by `--show-config-paths`.
pub fn describe_search_paths() -> Vec<String> {
    config_search_paths()
        .iter()
        .map(|p| p.display().to_string())
        .collect()
}

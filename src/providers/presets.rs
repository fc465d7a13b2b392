//! Built-in provider presets.
//!
//! Each preset defines the default base URL, the wire format spoken by the
//! vendor, the endpoint table and the environment variable holding the
//! credential. A channel names a preset and overrides whatever it needs.
//! OpenAI-derivative vendors are presets of the one OpenAI translator.

use super::base::Operation;

/// Deployment variants of the Gemini wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeminiVariant {
    /// `generativelanguage.googleapis.com` with an API key header.
    Direct,
    /// Vertex AI with a per-request bearer token (managed identity).
    VertexAi,
    /// Vertex AI Express with an API key in the query string.
    VertexAiExpress,
}

impl GeminiVariant {
    /// Whether the sanitizer runs in managed-identity mode for this variant.
    pub fn managed_identity(self) -> bool {
        !matches!(self, GeminiVariant::Direct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAi,
    Claude,
    Gemini(GeminiVariant),
}

#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub format: WireFormat,
    pub default_api_key_env: &'static str,
    pub endpoints: &'static [(Operation, &'static str)],
}

const OPENAI_ENDPOINTS: &[(Operation, &str)] = &[
    (Operation::Completions, "/v1/completions"),
    (Operation::ChatCompletions, "/v1/chat/completions"),
    (Operation::Embeddings, "/v1/embeddings"),
    (Operation::Moderations, "/v1/moderations"),
    (Operation::AudioSpeech, "/v1/audio/speech"),
    (Operation::AudioTranscription, "/v1/audio/transcriptions"),
    (Operation::AudioTranslation, "/v1/audio/translations"),
    (Operation::ImagesGenerations, "/v1/images/generations"),
    (Operation::ImagesEdits, "/v1/images/edits"),
    (Operation::ImagesVariations, "/v1/images/variations"),
    (Operation::ModelList, "/v1/models"),
    (Operation::ChatRealtime, "/v1/realtime"),
    (Operation::Responses, "/v1/responses"),
];

const CHAT_ONLY_ENDPOINTS: &[(Operation, &str)] = &[
    (Operation::ChatCompletions, "/v1/chat/completions"),
    (Operation::ModelList, "/v1/models"),
];

const CHAT_EMBEDDING_ENDPOINTS: &[(Operation, &str)] = &[
    (Operation::ChatCompletions, "/v1/chat/completions"),
    (Operation::Embeddings, "/v1/embeddings"),
    (Operation::ModelList, "/v1/models"),
];

const CLAUDE_ENDPOINTS: &[(Operation, &str)] = &[
    (Operation::ChatCompletions, "/v1/messages"),
    (Operation::ModelList, "/v1/models"),
];

const GEMINI_ENDPOINTS: &[(Operation, &str)] = &[
    (Operation::ChatCompletions, "/v1beta/models/{model}:{action}"),
    (Operation::ModelList, "/v1beta/models"),
];

const VERTEX_AI_ENDPOINTS: &[(Operation, &str)] = &[(
    Operation::ChatCompletions,
    "/v1/projects/{project}/locations/{region}/publishers/google/models/{model}:{action}",
)];

const VERTEX_AI_EXPRESS_ENDPOINTS: &[(Operation, &str)] = &[(
    Operation::ChatCompletions,
    "/v1/publishers/google/models/{model}:{action}",
)];

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com",
        format: WireFormat::OpenAi,
        default_api_key_env: "OPENAI_API_KEY",
        endpoints: OPENAI_ENDPOINTS,
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api",
        format: WireFormat::OpenAi,
        default_api_key_env: "OPENROUTER_API_KEY",
        endpoints: CHAT_ONLY_ENDPOINTS,
    },
    ProviderPreset {
        name: "moonshot",
        base_url: "https://api.moonshot.cn",
        format: WireFormat::OpenAi,
        default_api_key_env: "MOONSHOT_API_KEY",
        endpoints: CHAT_ONLY_ENDPOINTS,
    },
    ProviderPreset {
        name: "fireworks",
        base_url: "https://api.fireworks.ai/inference",
        format: WireFormat::OpenAi,
        default_api_key_env: "FIREWORKS_API_KEY",
        endpoints: CHAT_EMBEDDING_ENDPOINTS,
    },
    ProviderPreset {
        name: "grok",
        base_url: "https://api.x.ai",
        format: WireFormat::OpenAi,
        default_api_key_env: "XAI_API_KEY",
        endpoints: CHAT_ONLY_ENDPOINTS,
    },
    ProviderPreset {
        name: "together",
        base_url: "https://api.together.xyz",
        format: WireFormat::OpenAi,
        default_api_key_env: "TOGETHER_API_KEY",
        endpoints: CHAT_EMBEDDING_ENDPOINTS,
    },
    ProviderPreset {
        name: "groq",
        base_url: "https://api.groq.com/openai",
        format: WireFormat::OpenAi,
        default_api_key_env: "GROQ_API_KEY",
        endpoints: CHAT_ONLY_ENDPOINTS,
    },
    ProviderPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com",
        format: WireFormat::OpenAi,
        default_api_key_env: "DEEPSEEK_API_KEY",
        endpoints: CHAT_ONLY_ENDPOINTS,
    },
    ProviderPreset {
        name: "claude",
        base_url: "https://api.anthropic.com",
        format: WireFormat::Claude,
        default_api_key_env: "ANTHROPIC_API_KEY",
        endpoints: CLAUDE_ENDPOINTS,
    },
    ProviderPreset {
        name: "gemini",
        base_url: "https://generativelanguage.googleapis.com",
        format: WireFormat::Gemini(GeminiVariant::Direct),
        default_api_key_env: "GEMINI_API_KEY",
        endpoints: GEMINI_ENDPOINTS,
    },
    ProviderPreset {
        name: "vertex_ai",
        base_url: "https://aiplatform.googleapis.com",
        format: WireFormat::Gemini(GeminiVariant::VertexAi),
        default_api_key_env: "VERTEX_AI_ACCESS_TOKEN",
        endpoints: VERTEX_AI_ENDPOINTS,
    },
    ProviderPreset {
        name: "vertex_ai_express",
        base_url: "https://aiplatform.googleapis.com",
        format: WireFormat::Gemini(GeminiVariant::VertexAiExpress),
        default_api_key_env: "VERTEX_AI_EXPRESS_API_KEY",
        endpoints: VERTEX_AI_EXPRESS_ENDPOINTS,
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        let name = name.to_lowercase();
        let name = match name.as_str() {
            "anthropic" => "claude",
            "xai" => "grok",
            other => other,
        };
        PRESETS.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }
}

use serde::Deserialize;
use serde::Serialize;

/// Metadata about a model. Providers may carry their own catalog in config;
/// this table covers the well-known slugs so a bare `models.large` entry
/// still gets a context window.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Size of the context window in tokens.
    pub context_window: u64,
    /// Default maximum number of output tokens.
    pub default_max_tokens: i64,
}

impl ModelDescriptor {
    fn new(id: &str, context_window: u64, default_max_tokens: i64) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            context_window,
            default_max_tokens,
        }
    }
}

/// Built-in fallback for models absent from the provider catalog. Numbers
/// can go stale; the per-provider catalog in config overrides them.
pub fn default_model_info(model_id: &str) -> Option<ModelDescriptor> {
    match model_id {
        "gpt-4o" => Some(ModelDescriptor::new(model_id, 128_000, 16_384)),
        "gpt-4.1" => Some(ModelDescriptor::new(model_id, 1_047_576, 32_768)),
        "o3" | "o4-mini" => Some(ModelDescriptor::new(model_id, 200_000, 100_000)),
        "claude-3-5-haiku-20241022" => Some(ModelDescriptor::new(model_id, 200_000, 8_192)),
        "gemini-2.5-pro" | "gemini-2.5-flash" => {
            Some(ModelDescriptor::new(model_id, 1_048_576, 65_536))
        }
        _ if model_id.starts_with("gpt-5") => Some(ModelDescriptor::new(model_id, 272_000, 128_000)),
        _ if model_id.starts_with("claude-sonnet-4") || model_id.starts_with("claude-opus-4") => {
            Some(ModelDescriptor::new(model_id, 200_000, 64_000))
        }
        _ => None,
    }
}

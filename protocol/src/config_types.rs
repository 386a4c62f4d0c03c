use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Persisted UI mode. `Auto` lets the input router decide between shell and
/// agent per submission.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
pub enum AppMode {
    Shell,
    Agent,
    #[default]
    Auto,
}

/// Which configured model slot an agent is bound to.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SelectedModelType {
    #[default]
    Large,
    Small,
}

/// Wire shape spoken by a provider endpoint.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderType {
    #[default]
    OpenAi,
    Anthropic,
    Gemini,
}

/// Transport used to reach an MCP server.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum McpTransportType {
    #[default]
    Stdio,
    Sse,
    Http,
}

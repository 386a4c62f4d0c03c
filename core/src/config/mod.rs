//! Application configuration.
//!
//! A single JSON tree loaded at startup, read by every component, and
//! mutated only through [`Config::set_config_field`], an atomic
//! read-modify-write on the on-disk representation. Values may embed `$VAR`
//! and `$(command)` substitutions, resolved lazily where they are consumed
//! (provider keys, MCP headers and env).

mod model_info;
mod paths;
mod resolver;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use tracing::error;
use tracing::warn;

pub use model_info::ModelDescriptor;
pub use model_info::default_model_info;
pub use paths::APP_NAME;
pub use paths::config_root;
pub use paths::data_root;
pub use paths::global_config_path;
pub use resolver::ShellVariableResolver;

use crate::error::Result;
use crate::error::TetherErr;
use tether_protocol::config_types::AppMode;
use tether_protocol::config_types::McpTransportType;
use tether_protocol::config_types::ProviderType;
use tether_protocol::config_types::SelectedModelType;

pub const DEFAULT_DATA_DIRECTORY: &str = ".tether";

/// Files read as additional model context when present in the workspace.
fn default_context_paths() -> Vec<String> {
    [
        "AGENTS.md",
        "AGENT.md",
        "CLAUDE.md",
        "tether.md",
        ".cursorrules",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SelectedModel {
    pub model: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub think: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ProviderConfig {
    #[serde(default)]
    pub r#type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra_body: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
    /// Optional per-provider model catalog; the built-in table is consulted
    /// when a selected model is not listed here.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelDescriptor>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct McpConfig {
    #[serde(default)]
    pub r#type: McpTransportType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl McpConfig {
    /// User-provided env with `$VAR`/`$(command)` substitution applied.
    /// Unresolvable entries are dropped with an error log rather than
    /// failing server startup.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        resolve_string_map(&self.env, "environment variable")
    }

    /// Headers for HTTP/SSE transports, substitutions applied.
    pub fn resolved_headers(&self) -> HashMap<String, String> {
        resolve_string_map(&self.headers, "header")
    }
}

fn resolve_string_map(map: &HashMap<String, String>, what: &str) -> HashMap<String, String> {
    let resolver = ShellVariableResolver::new();
    let mut resolved = HashMap::with_capacity(map.len());
    for (key, value) in map {
        match resolver.resolve_value(value) {
            Ok(v) => {
                resolved.insert(key.clone(), v);
            }
            Err(e) => {
                error!(variable = %key, "error resolving {what}: {e}");
            }
        }
    }
    resolved
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LspConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConfigOptions {
    pub context_paths: Vec<String>,
    /// Relative to the working directory.
    pub data_directory: String,
    /// Max duration for a single agent request; 0 = unlimited.
    pub request_timeout_seconds: u64,
    /// Max duration for each tool call unless the tool itself specifies a
    /// shorter one; 0 = no extra cap.
    pub tool_call_timeout_seconds: u64,
    pub debug: bool,
    pub debug_lsp: bool,
    pub disable_auto_summarize: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            context_paths: default_context_paths(),
            data_directory: DEFAULT_DATA_DIRECTORY.to_string(),
            request_timeout_seconds: 0,
            tool_call_timeout_seconds: 0,
            debug: false,
            debug_lsp: false,
            disable_auto_summarize: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Tool names or `tool:action` keys that never prompt.
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    /// When explicitly false, agent-suggested shell executions run without
    /// prompting (shell execute entries are added to the allow-list).
    pub confirm_agent_exec: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mode: AppMode,
    /// Global skip-requests override.
    pub yolo: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub models: HashMap<SelectedModelType, SelectedModel>,
    pub providers: HashMap<String, ProviderConfig>,
    pub mcp: HashMap<String, McpConfig>,
    pub lsp: HashMap<String, LspConfig>,
    pub options: ConfigOptions,
    pub permissions: PermissionsConfig,
    pub safety: SafetyConfig,
    pub app: AppConfig,

    #[serde(skip)]
    working_dir: PathBuf,
    /// Target of `set_config_field` writes.
    #[serde(skip)]
    config_path: PathBuf,
}

/// Serializes same-process writers of the on-disk config file. Cross-process
/// concurrency is not supported.
static CONFIG_FILE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

impl Config {
    /// Load the configuration for `working_dir`.
    ///
    /// Lookup order: `<config-root>/tether/config.json`, then the legacy
    /// `tether.json` / `.tether.json` in the working directory. A missing
    /// file yields the defaults; an unreadable or malformed file is fatal.
    pub fn load(working_dir: &Path) -> Result<Self> {
        let global = global_config_path();
        let mut candidates = vec![global.clone()];
        for name in paths::LEGACY_CONFIG_FILENAMES {
            candidates.push(working_dir.join(name));
        }

        let mut cfg = Config::default();
        for candidate in &candidates {
            if candidate.is_file() {
                let data = std::fs::read_to_string(candidate)?;
                cfg = serde_json::from_str(&data)?;
                break;
            }
        }

        cfg.working_dir = working_dir.to_path_buf();
        cfg.config_path = global;
        Ok(cfg)
    }

    /// Fresh instance for tests, writing to an explicit path.
    pub fn for_test(working_dir: &Path, config_path: &Path) -> Self {
        Config {
            working_dir: working_dir.to_path_buf(),
            config_path: config_path.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Directory for application data, resolved against the working dir.
    pub fn data_directory(&self) -> PathBuf {
        let dir = Path::new(&self.options.data_directory);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.working_dir.join(dir)
        }
    }

    /// True when at least one provider is enabled.
    pub fn is_configured(&self) -> bool {
        self.providers.values().any(|p| !p.disable)
    }

    pub fn selected_model(&self, model_type: SelectedModelType) -> Option<&SelectedModel> {
        self.models.get(&model_type)
    }

    pub fn provider_for(&self, model_type: SelectedModelType) -> Option<(&str, &ProviderConfig)> {
        let selected = self.models.get(&model_type)?;
        let provider = self.providers.get(&selected.provider)?;
        Some((selected.provider.as_str(), provider))
    }

    /// Descriptor for the selected model: the provider's catalog first, the
    /// built-in table as a fallback.
    pub fn model_descriptor(&self, model_type: SelectedModelType) -> Option<ModelDescriptor> {
        let selected = self.models.get(&model_type)?;
        if let Some(provider) = self.providers.get(&selected.provider)
            && let Some(descriptor) = provider.models.iter().find(|m| m.id == selected.model)
        {
            return Some(descriptor.clone());
        }
        default_model_info(&selected.model)
    }

    /// Persisted UI mode, `Auto` when unset.
    pub fn active_mode(&self) -> AppMode {
        self.app.mode
    }

    /// Persist `mode` under `app.mode` and update in-memory state.
    pub fn set_active_mode(&mut self, mode: AppMode) -> Result<()> {
        self.app.mode = mode;
        self.set_config_field("app.mode", serde_json::to_value(mode)?)
    }

    pub fn update_preferred_model(
        &mut self,
        model_type: SelectedModelType,
        model: SelectedModel,
    ) -> Result<()> {
        let value = serde_json::to_value(&model)?;
        self.models.insert(model_type, model);
        self.set_config_field(&format!("models.{model_type}"), value)
    }

    /// Atomic read-modify-write of one dotted field in the on-disk config.
    /// Same-process writers are serialized by a file-level mutex.
    pub fn set_config_field(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let _guard = CONFIG_FILE_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let data = match std::fs::read_to_string(&self.config_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => "{}".to_string(),
            Err(e) => return Err(e.into()),
        };
        let mut root: serde_json::Value = if data.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&data)?
        };

        set_json_path(&mut root, key, value)?;

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&self.config_path, &serde_json::to_vec_pretty(&root)?)?;
        Ok(())
    }

    /// Read one dotted field back from the on-disk config.
    pub fn get_config_field(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let data = match std::fs::read_to_string(&self.config_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let root: serde_json::Value = serde_json::from_str(&data)?;
        let mut current = &root;
        for segment in key.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()))
    }

    /// Effective permission allow-list: the configured entries, plus shell
    /// execution when the safety confirm toggle is explicitly off.
    pub fn effective_allowed_tools(&self) -> Vec<String> {
        let mut allowed = self.permissions.allowed_tools.clone();
        if self.safety.confirm_agent_exec == Some(false) {
            allowed.push("shell".to_string());
            allowed.push("shell:execute".to_string());
        }
        allowed
    }

    /// Resolve a provider API key through the variable resolver. Returns
    /// `None` when the key is unset or fails to resolve.
    pub fn resolved_api_key(&self, provider: &ProviderConfig) -> Option<String> {
        let raw = provider.api_key.as_deref()?;
        match ShellVariableResolver::new().resolve_value(raw) {
            Ok(key) if !key.is_empty() => Some(key),
            Ok(_) => None,
            Err(e) => {
                warn!("failed to resolve provider api_key: {e}");
                None
            }
        }
    }
}

/// Set `value` at a dotted `key` path, creating intermediate objects.
fn set_json_path(root: &mut serde_json::Value, key: &str, value: serde_json::Value) -> Result<()> {
    let mut current = root;
    let segments: Vec<&str> = key.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let map = current
            .as_object_mut()
            .ok_or_else(|| TetherErr::Other(anyhow::anyhow!(
                "config field `{key}` traverses a non-object value"
            )))?;
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return Ok(());
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    }
    Ok(())
}

/// Write with owner-only permissions on unix.
pub(crate) fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.flush()
}

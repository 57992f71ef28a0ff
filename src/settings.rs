//! Settings loading with deep merge and environment variable overrides.
//!
//! Layers, lowest priority first:
//! 1. Compiled [`Settings::default()`]
//! 2. `~/.quorum/settings.json` (or `--config`), deep-merged over the defaults
//! 3. `QUORUM_*` environment variables

use std::path::{Path, PathBuf};

use anyhow::Context;
use quorum_core::retry::RetryPolicy;
use quorum_telemetry::{LoggingConfig, PollerConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub retry: RetryPolicy,
    pub agent: AgentSettings,
    pub specialists: Vec<SpecialistSettings>,
    pub workspace: WorkspaceSettings,
    pub trace: TraceSettings,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            model: ModelSettings::default(),
            retry: RetryPolicy::default(),
            agent: AgentSettings::default(),
            specialists: default_specialists(),
            workspace: WorkspaceSettings::default(),
            trace: TraceSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Any OpenAI-compatible endpoint.
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            max_tokens: Some(4096),
            temperature: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_turns: u32,
    /// Tool-call queue size per run. Values below 2 are raised to 2.
    pub queue_capacity: usize,
    pub event_buffer: usize,
    pub tool_timeout_secs: Option<u64>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 50,
            queue_capacity: 256,
            event_buffer: 256,
            tool_timeout_secs: None,
        }
    }
}

/// One specialist. With `endpoint` set it is called over HTTP, otherwise it
/// is answered by the configured model using `system_prompt`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialistSettings {
    pub name: String,
    pub description: String,
    pub system_prompt: Option<String>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Base URL of the shared workspace service. `None` disables the tool.
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// Log query endpoint. `None` disables trace correlation.
    pub endpoint: Option<String>,
    pub workspace_id: String,
    pub token_env: String,
    #[serde(flatten)]
    pub poller: PollerConfig,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            workspace_id: String::new(),
            token_env: "QUORUM_TRACE_TOKEN".into(),
            poller: PollerConfig::default(),
        }
    }
}

fn default_specialists() -> Vec<SpecialistSettings> {
    let specialist = |name: &str, description: &str, prompt: &str| SpecialistSettings {
        name: name.into(),
        description: description.into(),
        system_prompt: Some(prompt.into()),
        ..Default::default()
    };
    vec![
        specialist(
            "market_analyst",
            "Analyzes demand, customer segments and market size for a business idea.",
            "You are a market analyst. Answer concisely with concrete figures where you can.",
        ),
        specialist(
            "competitor_analyst",
            "Surveys existing competitors, their pricing and positioning.",
            "You are a competitive intelligence analyst. List competitors and how they differ.",
        ),
        specialist(
            "financial_analyst",
            "Estimates costs, revenue and break-even for a business plan.",
            "You are a financial analyst. Give rough numbers and state your assumptions.",
        ),
    ]
}

/// Resolve the default settings file path (`~/.quorum/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".quorum").join("settings.json")
}

/// Load settings from `path` with env var overrides. A missing file yields
/// the defaults; an unreadable or invalid one is an error.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let user: Value = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged).context("invalid settings")?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Recursive merge: objects merge per key, everything else is replaced by
/// `source`. Nulls in `source` keep the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `QUORUM_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| env(name).filter(|v| !v.is_empty());

    if let Some(v) = read("QUORUM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("QUORUM_PORT") {
        match v.parse::<u16>() {
            Ok(port) if port > 0 => settings.server.port = port,
            _ => warn!(key = "QUORUM_PORT", value = %v, "invalid port, ignoring"),
        }
    }
    if let Some(v) = read("QUORUM_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = read("QUORUM_BASE_URL") {
        settings.model.base_url = v;
    }
    if let Some(v) = read("QUORUM_WORKSPACE_URL") {
        settings.workspace.endpoint = Some(v);
    }
    if let Some(v) = read("QUORUM_TRACE_ENDPOINT") {
        settings.trace.endpoint = Some(v);
    }
    if let Some(v) = read("QUORUM_TRACE_WORKSPACE_ID") {
        settings.trace.workspace_id = v;
    }
    if let Some(v) = read("QUORUM_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

use config::{Config, Environment, File};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub mod sanitize;
pub mod validator;
pub mod watcher;

pub use validator::{ConfigError, ConfigValidator};

use crate::cli::Cli;
use crate::domain::{Credentials, ProviderConfig, ProviderKind};

/// Environment variable prefix for configuration overrides
/// (`CONCIERGE__LLM__MODEL=gpt-4o` sets `llm.model`)
pub const ENV_PREFIX: &str = "CONCIERGE";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(default)]
    pub llm: Option<LlmSettings>,
    /// Remote MCP providers keyed by provider id
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub health: HealthSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    #[default]
    #[serde(alias = "open_ai")]
    OpenAI,
    Ollama,
}

impl LlmProviderType {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProviderType::OpenAI => "https://api.openai.com/v1",
            LlmProviderType::Ollama => "http://localhost:11434/v1",
        }
    }
}

impl std::fmt::Display for LlmProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProviderType::OpenAI => write!(f, "openai"),
            LlmProviderType::Ollama => write!(f, "ollama"),
        }
    }
}

/// Language model connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub provider: LlmProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub stream: bool,
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl LlmSettings {
    /// Resolve the API key: inline value, then the named variable, then `OPENAI_API_KEY`
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        match &self.api_key_env {
            Some(var) => std::env::var(var).ok().filter(|k| !k.is_empty()),
            None if self.provider == LlmProviderType::OpenAI => {
                std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())
            }
            None => None,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Connection to one remote MCP provider
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    /// Provider kind; inferred from the provider id when absent
    #[serde(default)]
    pub kind: Option<ProviderKind>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Full endpoint URL; takes precedence over host/port
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_mcp_path")]
    pub path: String,
    #[serde(default = "default_mcp_timeout")]
    pub timeout_seconds: u64,
    /// Tools assumed available before discovery succeeds
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

fn default_mcp_path() -> String {
    "/mcp".to_string()
}

fn default_mcp_timeout() -> u64 {
    30
}

impl McpServerConfig {
    pub fn resolve_kind(&self, id: &str) -> Option<ProviderKind> {
        self.kind.or_else(|| ProviderKind::infer_from_name(id))
    }

    /// Endpoint URL, built from host/port/path when no explicit url is set
    pub fn base_url(&self) -> Option<String> {
        if let Some(url) = self.url.as_ref().filter(|u| !u.is_empty()) {
            return Some(url.clone());
        }
        let host = self.host.as_ref().filter(|h| !h.is_empty())?;
        let port = self.port?;
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        if host.starts_with("http://") || host.starts_with("https://") {
            Some(format!("{}:{}{}", host.trim_end_matches('/'), port, path))
        } else {
            Some(format!("http://{}:{}{}", host, port, path))
        }
    }

    /// Build the runtime provider configuration.
    ///
    /// Disabled entries without an endpoint still convert, so they show up in
    /// status listings; enabled ones are checked by the validator first.
    pub fn to_provider_config(&self, id: &str) -> Result<ProviderConfig, ConfigError> {
        let kind = self.resolve_kind(id).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("mcp_servers.{}.kind", id),
            reason: "kind is not set and cannot be inferred from the provider name".to_string(),
        })?;

        let base_url = match (self.base_url(), self.enabled) {
            (Some(url), _) => url,
            (None, false) => String::new(),
            (None, true) => {
                return Err(ConfigError::MissingField(format!("mcp_servers.{}.url", id)));
            }
        };

        let declared_tools = if self.tools.is_empty() {
            kind.default_tools().iter().map(|t| t.to_string()).collect()
        } else {
            self.tools.clone()
        };

        Ok(ProviderConfig {
            id: id.to_string(),
            kind,
            enabled: self.enabled,
            host: self.host.clone(),
            port: self.port,
            base_url,
            credentials: Credentials::new(self.credentials.clone()),
            timeout: Duration::from_secs(self.timeout_seconds),
            declared_tools,
            keywords: self.keywords.clone(),
        })
    }
}

/// Policy for a turn arriving while the session already has one in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    #[default]
    Queue,
    Reject,
}

/// Tool selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterStrategy {
    #[default]
    Keyword,
    Llm,
    /// Language-model selection falling back to keywords
    Hybrid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatSettings {
    pub history_capacity: usize,
    /// Number of recent messages included in the prompt
    pub history_window: usize,
    pub busy_policy: BusyPolicy,
    pub router: RouterStrategy,
    pub system_prompt: Option<String>,
    pub invocation_timeout_ms: u64,
    pub turn_timeout_ms: u64,
    /// Sessions kept in memory; least recently used idle ones go first
    pub max_sessions: usize,
    /// Idle sessions older than this are dropped; 0 keeps them until evicted
    pub session_idle_seconds: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            history_window: 10,
            busy_policy: BusyPolicy::Queue,
            router: RouterStrategy::Keyword,
            system_prompt: None,
            invocation_timeout_ms: 10_000,
            turn_timeout_ms: 20_000,
            max_sessions: 1_000,
            session_idle_seconds: 24 * 60 * 60,
        }
    }
}

impl ChatSettings {
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn session_idle_ttl(&self) -> Option<Duration> {
        (self.session_idle_seconds > 0).then(|| Duration::from_secs(self.session_idle_seconds))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Cap on the serialized size of a context bundle
    pub max_bytes: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self { max_bytes: 16 * 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_seconds: u64,
    pub max_backoff_seconds: u64,
    /// Randomization factor applied to probe delays (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            max_backoff_seconds: 300,
            jitter: 0.2,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, anyhow::Error> {
        Self::load(Path::new("concierge.toml"))
    }

    /// Sections that differ from `next` but are only read at startup
    pub fn restart_required(&self, next: &Settings) -> Vec<&'static str> {
        let mut sections = Vec::new();
        if self.server != next.server {
            sections.push("server");
        }
        if self.llm != next.llm {
            sections.push("llm");
        }
        sections
    }

    /// Create settings from CLI arguments (config file, environment, then CLI overrides)
    pub fn new_with_cli(cli: &Cli) -> Result<Self, anyhow::Error> {
        let mut settings = Self::build(&cli.config)?;
        settings.apply_cli_overrides(cli);
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate settings from a file; the file may be absent
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let settings = Self::build(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn build(path: &Path) -> Result<Self, anyhow::Error> {
        let s = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .build()?;

        Ok(s.try_deserialize()?)
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if cli.debug {
            self.server.debug = true;
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        ConfigValidator::validate(self).map_err(|errors| {
            let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            anyhow::anyhow!(
                "Configuration validation failed:\n{}",
                error_messages.join("\n")
            )
        })
    }

    /// Runtime provider configurations, skipping entries that cannot be resolved
    pub fn provider_configs(&self) -> Vec<ProviderConfig> {
        self.mcp_servers
            .iter()
            .filter_map(|(id, cfg)| match cfg.to_provider_config(id) {
                Ok(provider) => Some(provider),
                Err(e) => {
                    tracing::warn!(provider = %id, error = %e, "Skipping provider");
                    None
                }
            })
            .collect()
    }
}

/// One immutable snapshot of loaded configuration
#[derive(Debug)]
pub struct ConfigGeneration {
    pub number: u64,
    pub settings: Arc<Settings>,
}

/// Holder of the current configuration generation.
///
/// Readers take an `Arc` to the generation they started with; a reload swaps
/// in a new generation without touching the old one.
pub struct SettingsHandle {
    current: RwLock<Arc<ConfigGeneration>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(ConfigGeneration {
                number: 1,
                settings: Arc::new(settings),
            })),
        }
    }

    pub fn current(&self) -> Arc<ConfigGeneration> {
        self.current.read().clone()
    }

    /// Swap in a new generation and return it
    pub fn replace(&self, settings: Settings) -> Arc<ConfigGeneration> {
        let mut guard = self.current.write();
        let next = Arc::new(ConfigGeneration {
            number: guard.number + 1,
            settings: Arc::new(settings),
        });
        *guard = next.clone();
        next
    }
}

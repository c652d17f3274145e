use thiserror::Error;

use crate::config::{
    ChatSettings, ContextSettings, HealthSettings, LlmProviderType, LlmSettings, McpServerConfig,
    ServerSettings, Settings,
};

/// Smallest accepted context cap; below this not even a marker fits
pub const MIN_CONTEXT_BYTES: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a full configuration, collecting every problem found
    pub fn validate(settings: &Settings) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        Self::validate_server(&settings.server, &mut errors);

        match &settings.llm {
            Some(llm) => Self::validate_llm(llm, &mut errors),
            None => errors.push(ConfigError::MissingField("llm".to_string())),
        }

        for (id, server) in &settings.mcp_servers {
            Self::validate_mcp_server(id, server, &mut errors);
        }

        Self::validate_chat(&settings.chat, &mut errors);
        Self::validate_context(&settings.context, &mut errors);
        Self::validate_health(&settings.health, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_server(server: &ServerSettings, errors: &mut Vec<ConfigError>) {
        if server.host.is_empty() {
            errors.push(ConfigError::MissingField("server.host".to_string()));
        }

        if server.port == 0 {
            errors.push(invalid("server.port", "Port must be greater than 0"));
        }
    }

    fn validate_llm(llm: &LlmSettings, errors: &mut Vec<ConfigError>) {
        if llm.model.trim().is_empty() {
            errors.push(ConfigError::MissingField("llm.model".to_string()));
        }

        if !(0.0..=2.0).contains(&llm.temperature) {
            errors.push(invalid("llm.temperature", "must be between 0.0 and 2.0"));
        }

        if llm.max_tokens == 0 {
            errors.push(invalid("llm.max_tokens", "must be greater than 0"));
        }

        if llm.timeout_seconds == 0 {
            errors.push(invalid("llm.timeout_seconds", "must be greater than 0"));
        }

        if let Some(url) = &llm.base_url {
            if !is_http_url(url) {
                errors.push(invalid("llm.base_url", "must be an http(s) URL"));
            }
        }

        // Local OpenAI-compatible servers usually run without a key
        if llm.provider == LlmProviderType::OpenAI
            && llm.base_url.is_none()
            && llm.resolve_api_key().is_none()
        {
            let field = match &llm.api_key_env {
                Some(var) => format!("llm.api_key (environment variable {} is not set)", var),
                None => "llm.api_key".to_string(),
            };
            errors.push(ConfigError::MissingField(field));
        }
    }

    fn validate_mcp_server(id: &str, server: &McpServerConfig, errors: &mut Vec<ConfigError>) {
        if server.resolve_kind(id).is_none() {
            errors.push(invalid(
                format!("mcp_servers.{}.kind", id),
                "kind is not set and cannot be inferred from the provider name",
            ));
        }

        if !server.enabled {
            return;
        }

        match server.base_url() {
            Some(url) if !is_http_url(&url) => {
                errors.push(invalid(
                    format!("mcp_servers.{}.url", id),
                    "must be an http(s) URL",
                ));
            }
            Some(_) => {}
            None => errors.push(ConfigError::MissingField(format!(
                "mcp_servers.{}.url (or host and port)",
                id
            ))),
        }

        if server.timeout_seconds == 0 {
            errors.push(invalid(
                format!("mcp_servers.{}.timeout_seconds", id),
                "must be greater than 0",
            ));
        }
    }

    fn validate_chat(chat: &ChatSettings, errors: &mut Vec<ConfigError>) {
        if chat.history_capacity == 0 {
            errors.push(invalid("chat.history_capacity", "must be at least 1"));
        }

        if chat.max_sessions == 0 {
            errors.push(invalid("chat.max_sessions", "must be at least 1"));
        }

        if chat.invocation_timeout_ms == 0 {
            errors.push(invalid("chat.invocation_timeout_ms", "must be greater than 0"));
        }

        if chat.turn_timeout_ms == 0 {
            errors.push(invalid("chat.turn_timeout_ms", "must be greater than 0"));
        }
    }

    fn validate_context(context: &ContextSettings, errors: &mut Vec<ConfigError>) {
        if context.max_bytes < MIN_CONTEXT_BYTES {
            errors.push(invalid(
                "context.max_bytes",
                format!("must be at least {}", MIN_CONTEXT_BYTES),
            ));
        }
    }

    fn validate_health(health: &HealthSettings, errors: &mut Vec<ConfigError>) {
        if health.interval_seconds == 0 {
            errors.push(invalid("health.interval_seconds", "must be greater than 0"));
        }

        if health.max_backoff_seconds < health.interval_seconds {
            errors.push(invalid(
                "health.max_backoff_seconds",
                "must not be smaller than health.interval_seconds",
            ));
        }

        if !(0.0..=1.0).contains(&health.jitter) {
            errors.push(invalid("health.jitter", "must be between 0.0 and 1.0"));
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: serde_json::Value) -> Settings {
        serde_json::from_value(value).unwrap()
    }

    fn base() -> serde_json::Value {
        json!({
            "server": {"host": "127.0.0.1", "port": 8000},
            "llm": {"api_key": "sk-test", "model": "gpt-4o-mini"}
        })
    }

    #[test]
    fn test_valid_config() {
        let result = ConfigValidator::validate(&settings(base()));
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_port() {
        let mut value = base();
        value["server"]["port"] = json!(0);
        let errors = ConfigValidator::validate(&settings(value)).unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_missing_llm_section() {
        let errors = ConfigValidator::validate(&settings(json!({
            "server": {"host": "127.0.0.1", "port": 8000}
        })))
        .unwrap_err();
        assert_eq!(errors, vec![ConfigError::MissingField("llm".to_string())]);
    }

    #[test]
    fn test_missing_api_key_env_is_reported() {
        let mut value = base();
        value["llm"] = json!({
            "model": "gpt-4o-mini",
            "api_key_env": "CONCIERGE_VALIDATOR_TEST_UNSET_KEY"
        });
        let errors = ConfigValidator::validate(&settings(value)).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::MissingField(f) if f.starts_with("llm.api_key"))));
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let mut value = base();
        value["llm"] = json!({"provider": "ollama", "model": "llama3"});
        assert!(ConfigValidator::validate(&settings(value)).is_ok());
    }

    #[test]
    fn test_enabled_provider_without_endpoint() {
        let mut value = base();
        value["mcp_servers"] = json!({"gitlab": {"enabled": true}});
        let errors = ConfigValidator::validate(&settings(value)).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::MissingField(f) if f.starts_with("mcp_servers.gitlab.url"))));
    }

    #[test]
    fn test_disabled_provider_needs_no_endpoint() {
        let mut value = base();
        value["mcp_servers"] = json!({"ldap": {"enabled": false}});
        assert!(ConfigValidator::validate(&settings(value)).is_ok());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut value = base();
        value["mcp_servers"] = json!({"weather": {"enabled": true, "url": "http://w/mcp"}});
        let errors = ConfigValidator::validate(&settings(value)).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::InvalidValue { field, .. } if field == "mcp_servers.weather.kind")));
    }

    #[test]
    fn test_collects_every_error() {
        let mut value = base();
        value["context"] = json!({"max_bytes": 10});
        value["health"] = json!({"interval_seconds": 0, "jitter": 3.0});
        let errors = ConfigValidator::validate(&settings(value)).unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}

//! Client-safe view of the loaded configuration.
//!
//! The view is built from an explicit whitelist of fields. As a second line,
//! every string in the result is scrubbed of any known secret value, so a
//! credential that leaks into an unrelated field (a URL, a host name) is still
//! masked.

use serde_json::{json, Map, Value};

use super::Settings;

pub const REDACTED: &str = "[redacted]";

/// Build the sanitized configuration view
pub fn sanitized_view(settings: &Settings) -> Value {
    let secrets = collect_secrets(settings);

    let llm = settings.llm.as_ref().map(|llm| {
        json!({
            "provider": llm.provider.to_string(),
            "model": llm.model,
            "base_url": llm.base_url(),
            "temperature": llm.temperature,
            "max_tokens": llm.max_tokens,
            "stream": llm.stream,
            "api_key_configured": llm.resolve_api_key().is_some(),
        })
    });

    let mut servers = Map::new();
    for (id, server) in &settings.mcp_servers {
        let credentials: Map<String, Value> = server
            .credentials
            .keys()
            .map(|k| (k.clone(), Value::String(REDACTED.to_string())))
            .collect();
        servers.insert(
            id.clone(),
            json!({
                "kind": server.resolve_kind(id).map(|k| k.to_string()),
                "enabled": server.enabled,
                "host": server.host,
                "port": server.port,
                "url": server.base_url(),
                "tools": server.tools,
                "credentials": credentials,
            }),
        );
    }

    let view = json!({
        "server": {
            "host": settings.server.host,
            "port": settings.server.port,
            "debug": settings.server.debug,
        },
        "llm": llm,
        "mcp_servers": servers,
        "chat": {
            "history_capacity": settings.chat.history_capacity,
            "history_window": settings.chat.history_window,
            "busy_policy": settings.chat.busy_policy,
            "router": settings.chat.router,
            "max_sessions": settings.chat.max_sessions,
            "session_idle_seconds": settings.chat.session_idle_seconds,
        },
        "context": {"max_bytes": settings.context.max_bytes},
    });

    scrub(view, &secrets)
}

fn collect_secrets(settings: &Settings) -> Vec<String> {
    let mut secrets: Vec<String> = Vec::new();

    if let Some(llm) = &settings.llm {
        secrets.extend(llm.api_key.clone());
        secrets.extend(llm.resolve_api_key());
    }

    for server in settings.mcp_servers.values() {
        secrets.extend(server.credentials.values().cloned());
    }

    secrets.retain(|s| !s.is_empty());
    // Longest first so a secret containing another is masked whole
    secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    secrets.dedup();
    secrets
}

fn scrub_str(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if out.contains(secret.as_str()) {
            out = out.replace(secret.as_str(), REDACTED);
        }
    }
    // The mask itself may spell out a (very short) secret
    if secrets.iter().any(|s| out.contains(s.as_str())) {
        String::new()
    } else {
        out
    }
}

fn scrub(value: Value, secrets: &[String]) -> Value {
    if secrets.is_empty() {
        return value;
    }
    match value {
        Value::String(s) => Value::String(scrub_str(&s, secrets)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| scrub(v, secrets)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (scrub_str(&k, secrets), scrub(v, secrets)))
                .collect(),
        ),
        Value::Number(_) | Value::Bool(_) => {
            let text = value.to_string();
            if secrets.iter().any(|s| text.contains(s.as_str())) {
                Value::String(scrub_str(&text, secrets))
            } else {
                value
            }
        }
        Value::Null => Value::Null,
    }
}

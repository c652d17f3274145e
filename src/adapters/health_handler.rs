use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::SettingsHandle;
use crate::domain::ProviderStatus;
use crate::mcp::registry::ProviderRegistry;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    pub config_generation: u64,
    pub llm: String,
    pub providers_healthy: usize,
    pub providers_enabled: usize,
}

pub struct HealthHandler {
    settings: Arc<SettingsHandle>,
    registry: Arc<ProviderRegistry>,
    start_time: std::time::Instant,
}

impl HealthHandler {
    pub fn new(settings: Arc<SettingsHandle>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            settings,
            registry,
            start_time: std::time::Instant::now(),
        }
    }

    fn checks(&self) -> HealthChecks {
        let generation = self.settings.current();
        let statuses: Vec<ProviderStatus> = self
            .registry
            .handles()
            .iter()
            .map(|h| h.status())
            .filter(|s| *s != ProviderStatus::Disabled)
            .collect();

        HealthChecks {
            config_generation: generation.number,
            llm: match &generation.settings.llm {
                Some(llm) => format!("{} ({})", llm.provider, llm.model),
                None => "not configured".to_string(),
            },
            providers_healthy: statuses.iter().filter(|s| **s == ProviderStatus::Healthy).count(),
            providers_enabled: statuses.len(),
        }
    }

    /// Basic health check. Provider outages degrade the status but never fail it.
    pub async fn health(&self) -> impl IntoResponse {
        let checks = self.checks();
        let status = if checks.providers_healthy < checks.providers_enabled {
            "degraded"
        } else {
            "healthy"
        };

        (
            StatusCode::OK,
            Json(HealthStatus {
                status: status.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_seconds: self.start_time.elapsed().as_secs(),
                checks,
            }),
        )
    }

    /// Readiness: a language model is configured and every enabled provider
    /// has finished its first probe
    pub async fn ready(&self) -> impl IntoResponse {
        let llm_ok = self.settings.current().settings.llm.is_some();
        let pending: Vec<String> = self
            .registry
            .handles()
            .iter()
            .filter(|h| matches!(h.status(), ProviderStatus::Unknown | ProviderStatus::Probing))
            .map(|h| h.id().to_string())
            .collect();

        if llm_ok && pending.is_empty() {
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "ready",
                    "message": "Server is ready to accept requests"
                })),
            )
        } else {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "llm_configured": llm_ok,
                    "providers_pending": pending
                })),
            )
        }
    }

    /// Liveness check - returns 200 if server is alive
    pub async fn live(&self) -> impl IntoResponse {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "alive",
                "message": "Server is alive"
            })),
        )
    }
}

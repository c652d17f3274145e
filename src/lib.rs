//! # Concierge - MCP orchestration chat service
//!
//! Concierge answers chat questions with live data from enterprise systems.
//! Per turn it decides which remote MCP providers (source control, issue
//! tracker, documentation, directory) are relevant, calls their tools
//! concurrently, merges the results into a bounded context and streams a
//! language model reply back to the client.
//!
//! ## Features
//!
//! - **Provider registry**: health state machine with background probing and backoff
//! - **Dispatcher**: concurrent tool calls with per-call timeouts and a turn ceiling
//! - **Context assembly**: provenance-tagged, size-capped context bundles
//! - **Routing**: keyword or language-model tool selection behind one trait
//! - **Streaming**: tokens over WebSocket or Server-Sent Events
//! - **Metrics**: Prometheus metrics for turns, tool calls and probes
//! - **Live Reload**: provider and chat settings reload without restart
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use concierge::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load configuration
//!     let settings = Settings::new()?;
//!
//!     // Server will start on configured host:port
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod chat;
pub mod cli;
pub mod config;
pub mod domain;
pub mod mcp;

use crate::adapters::api_handler::{self, ApiState};
use crate::adapters::health_handler::HealthHandler;
use crate::adapters::metrics_handler::{MetricsCollector, MetricsHandler};
use crate::adapters::ws_handler;
use crate::chat::llm::create_provider;
use crate::chat::{CompletionService, TurnPipeline};
use crate::config::SettingsHandle;
use crate::mcp::registry::ProviderRegistry;
use crate::mcp::ClientFactory;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Everything the HTTP surface needs, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsHandle>,
    pub registry: Arc<ProviderRegistry>,
    pub pipeline: Arc<TurnPipeline>,
    pub metrics: Arc<MetricsCollector>,
    pub health: Arc<HealthHandler>,
}

impl AppState {
    /// Wire the registry, language model and pipeline for the current
    /// configuration generation
    pub fn build(settings: Arc<SettingsHandle>, factory: ClientFactory) -> anyhow::Result<Self> {
        let generation = settings.current();
        let llm_settings = generation
            .settings
            .llm
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("llm section is required"))?;
        let llm = create_provider(llm_settings)?;
        Self::with_llm(settings, factory, llm)
    }

    /// Same as [`AppState::build`] with an explicit language model provider
    pub fn with_llm(
        settings: Arc<SettingsHandle>,
        factory: ClientFactory,
        llm: Arc<dyn crate::chat::llm::LlmProvider>,
    ) -> anyhow::Result<Self> {
        let generation = settings.current();
        let metrics = Arc::new(MetricsCollector::new()?);

        let registry = Arc::new(ProviderRegistry::new(factory));
        registry.apply_generation(generation.settings.provider_configs());

        let completion = CompletionService::new(llm, metrics.clone());
        let pipeline = Arc::new(TurnPipeline::new(
            settings.clone(),
            registry.clone(),
            completion,
            metrics.clone(),
        ));
        let health = Arc::new(HealthHandler::new(settings.clone(), registry.clone()));

        Ok(Self {
            settings,
            registry,
            pipeline,
            metrics,
            health,
        })
    }
}

/// Creates the Axum application router with all endpoints configured.
pub fn create_app(state: &AppState) -> Router {
    let health_handler = state.health.clone();
    let metrics_handler = Arc::new(MetricsHandler::new(state.metrics.clone()));

    let public_router = Router::new()
        // Health check endpoints
        .route("/health", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.health().await }
            }
        }))
        .route("/health/ready", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.ready().await }
            }
        }))
        .route("/health/live", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.live().await }
            }
        }))
        .route("/metrics", get({
            let handler = metrics_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.metrics().await }
            }
        }));

    let api_state = ApiState {
        pipeline: state.pipeline.clone(),
        settings: state.settings.clone(),
        registry: state.registry.clone(),
        metrics: state.metrics.clone(),
    };

    let api_router = Router::new()
        // Chat
        .route("/chat", post(api_handler::submit_chat))
        .route("/chat/stream", post(api_handler::stream_chat))
        .route("/chat/sessions", get(api_handler::list_sessions))
        .route("/chat/:session_id/history", get(api_handler::get_history))
        // Providers
        .route("/mcp/status", get(api_handler::get_status))
        .route("/mcp/status/:provider_id/probe", post(api_handler::probe_provider))
        .route("/mcp/info/:provider_id", get(api_handler::get_server_info))
        .route("/mcp/tools", get(api_handler::list_tools))
        .route("/mcp/tools/:provider_id", get(api_handler::get_provider_tools))
        .route("/mcp/call", post(api_handler::call_tool))
        // Configuration
        .route("/config", get(api_handler::get_config))
        .with_state(api_state.clone());

    let ws_router = Router::new()
        .route("/ws", get(ws_handler::handle_upgrade))
        .with_state(api_state);

    public_router
        .nest("/api", api_router)
        .merge(ws_router)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

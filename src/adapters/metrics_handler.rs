use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use crate::domain::ProviderStatus;

pub struct MetricsCollector {
    registry: Registry,

    // Turn metrics
    pub turns_total: CounterVec,
    pub turn_duration: HistogramVec,
    pub turns_in_flight: Gauge,

    // Tool invocation metrics
    pub tool_invocations: CounterVec,
    pub tool_duration: HistogramVec,

    // Provider health metrics
    pub probes_total: CounterVec,
    pub provider_status: GaugeVec,

    // Language model metrics
    pub llm_requests: CounterVec,
    pub context_truncations: CounterVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let turns_total = CounterVec::new(
            Opts::new("concierge_turns_total", "Total chat turns by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(turns_total.clone()))?;

        let turn_duration = HistogramVec::new(
            HistogramOpts::new("concierge_turn_duration_seconds", "Chat turn duration in seconds"),
            &["mode"],
        )?;
        registry.register(Box::new(turn_duration.clone()))?;

        let turns_in_flight = Gauge::new(
            "concierge_turns_in_flight",
            "Number of chat turns currently being processed",
        )?;
        registry.register(Box::new(turns_in_flight.clone()))?;

        let tool_invocations = CounterVec::new(
            Opts::new("concierge_tool_invocations_total", "Total tool invocations"),
            &["provider", "tool", "outcome"],
        )?;
        registry.register(Box::new(tool_invocations.clone()))?;

        let tool_duration = HistogramVec::new(
            HistogramOpts::new(
                "concierge_tool_invocation_duration_seconds",
                "Tool invocation duration in seconds",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(tool_duration.clone()))?;

        let probes_total = CounterVec::new(
            Opts::new("concierge_provider_probes_total", "Total provider health probes"),
            &["provider", "outcome"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let provider_status = GaugeVec::new(
            Opts::new(
                "concierge_provider_healthy",
                "1 when the provider's last probe succeeded, 0 otherwise",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(provider_status.clone()))?;

        let llm_requests = CounterVec::new(
            Opts::new("concierge_llm_requests_total", "Total language model requests"),
            &["purpose", "outcome"],
        )?;
        registry.register(Box::new(llm_requests.clone()))?;

        let context_truncations = CounterVec::new(
            Opts::new(
                "concierge_context_truncations_total",
                "Context bundles that had entries dropped to fit the size cap",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(context_truncations.clone()))?;

        Ok(Self {
            registry,
            turns_total,
            turn_duration,
            turns_in_flight,
            tool_invocations,
            tool_duration,
            probes_total,
            provider_status,
            llm_requests,
            context_truncations,
        })
    }

    pub fn record_probe(&self, provider: &str, status: ProviderStatus) {
        let outcome = if status == ProviderStatus::Healthy {
            "reachable"
        } else {
            "unreachable"
        };
        self.probes_total.with_label_values(&[provider, outcome]).inc();
        self.provider_status
            .with_label_values(&[provider])
            .set(if status == ProviderStatus::Healthy { 1.0 } else { 0.0 });
    }

    pub fn forget_provider(&self, provider: &str) {
        let _ = self.provider_status.remove_label_values(&[provider]);
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub struct MetricsHandler {
    collector: Arc<MetricsCollector>,
}

impl MetricsHandler {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }

    pub async fn metrics(&self) -> String {
        self.collector.encode().unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
            String::from("# Error encoding metrics\n")
        })
    }
}

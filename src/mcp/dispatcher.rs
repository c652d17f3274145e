//! Concurrent tool invocation with partial-failure semantics.
//!
//! Every invocation runs as its own spawned task under its own timeout. The
//! whole batch is bounded by a turn-level ceiling: whatever has not finished
//! when the ceiling hits is reported as timed out, and the detached tasks are
//! left to finish on their own.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::registry::ProviderRegistry;
use crate::adapters::metrics_handler::MetricsCollector;
use crate::domain::{CapabilityError, ToolInvocation, ToolResult};

/// Timeouts applied to one dispatch
#[derive(Debug, Clone, Copy)]
pub struct DispatchLimits {
    /// Default per-invocation timeout when the invocation carries none
    pub invocation_timeout: Duration,
    /// Ceiling for the whole batch
    pub turn_timeout: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(10),
            turn_timeout: Duration::from_secs(20),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<MetricsCollector>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ProviderRegistry>, metrics: Arc<MetricsCollector>) -> Self {
        Self { registry, metrics }
    }

    /// Execute invocations concurrently.
    ///
    /// The result list has the same length and order as `invocations`. A
    /// failing invocation never aborts its siblings.
    pub async fn dispatch(
        &self,
        invocations: Vec<ToolInvocation>,
        limits: DispatchLimits,
    ) -> Vec<ToolResult> {
        let started = Instant::now();
        let deadline = started + limits.turn_timeout;
        let mut results: Vec<Option<ToolResult>> = (0..invocations.len()).map(|_| None).collect();
        let mut pending = FuturesUnordered::new();

        for (idx, invocation) in invocations.iter().enumerate() {
            let Some(handle) = self.registry.get(&invocation.provider_id) else {
                results[idx] = Some(ToolResult::failed(
                    invocation,
                    CapabilityError::Unavailable(format!(
                        "unknown provider {}",
                        invocation.provider_id
                    )),
                    Duration::ZERO,
                ));
                continue;
            };

            let status = handle.status();
            if !status.is_dispatchable() {
                debug!(
                    provider = %invocation.provider_id,
                    tool = %invocation.tool_name,
                    status = %status,
                    "Skipping invocation for unavailable provider"
                );
                results[idx] = Some(ToolResult::failed(
                    invocation,
                    CapabilityError::Unavailable(format!(
                        "{} is {}",
                        invocation.provider_id, status
                    )),
                    Duration::ZERO,
                ));
                continue;
            }

            let timeout = invocation.timeout.unwrap_or(limits.invocation_timeout);
            let client = handle.client();
            let invocation = invocation.clone();
            let task = tokio::spawn(async move {
                let start = Instant::now();
                let arguments = Value::Object(invocation.arguments.clone());
                let outcome = tokio::time::timeout(
                    timeout,
                    client.invoke(&invocation.tool_name, &arguments, timeout),
                )
                .await;
                let elapsed = start.elapsed();
                match outcome {
                    Ok(Ok(payload)) => ToolResult::ok(&invocation, payload, elapsed),
                    Ok(Err(e)) => ToolResult::failed(&invocation, e, elapsed),
                    Err(_) => ToolResult::failed(&invocation, CapabilityError::timeout(timeout), elapsed),
                }
            });
            pending.push(async move { (idx, task.await) });
        }

        let ceiling = tokio::time::sleep_until(deadline);
        tokio::pin!(ceiling);

        while !pending.is_empty() {
            tokio::select! {
                Some((idx, joined)) = pending.next() => {
                    results[idx] = Some(match joined {
                        Ok(result) => result,
                        Err(e) => ToolResult::failed(
                            &invocations[idx],
                            CapabilityError::Connection(format!("invocation task failed: {}", e)),
                            started.elapsed(),
                        ),
                    });
                }
                _ = &mut ceiling => {
                    warn!(
                        pending = pending.len(),
                        ceiling_ms = limits.turn_timeout.as_millis() as u64,
                        "Turn ceiling reached, abandoning pending invocations"
                    );
                    break;
                }
            }
        }
        // Dropping the join handles detaches the remaining tasks
        drop(pending);

        let results: Vec<ToolResult> = results
            .into_iter()
            .zip(invocations.iter())
            .map(|(result, invocation)| {
                result.unwrap_or_else(|| {
                    ToolResult::failed(
                        invocation,
                        CapabilityError::timeout(limits.turn_timeout),
                        started.elapsed(),
                    )
                })
            })
            .collect();

        for result in &results {
            let outcome = match &result.error {
                None => "ok",
                Some(e) => e.label(),
            };
            self.metrics
                .tool_invocations
                .with_label_values(&[&result.provider_id, &result.tool_name, outcome])
                .inc();
            self.metrics
                .tool_duration
                .with_label_values(&[&result.provider_id])
                .observe(result.latency_ms as f64 / 1000.0);
        }

        debug!(
            count = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch finished"
        );

        results
    }
}

//! Background health monitoring.
//!
//! One tokio task per enabled provider probes it periodically. A failed probe
//! stretches the next delay exponentially (capped, with jitter); a successful
//! one resets it to the base interval. Chat turns never wait on these tasks,
//! they only read the cached status.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::registry::{ProviderHandle, ProviderRegistry};
use crate::adapters::metrics_handler::MetricsCollector;
use crate::config::HealthSettings;

struct MonitorTask {
    handle: Arc<ProviderHandle>,
    task: JoinHandle<()>,
}

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    settings: RwLock<HealthSettings>,
    metrics: Arc<MetricsCollector>,
    tasks: Mutex<HashMap<String, MonitorTask>>,
}

/// Backoff policy for probe scheduling
pub fn probe_backoff(settings: &HealthSettings) -> ExponentialBackoff {
    let interval = Duration::from_secs(settings.interval_seconds.max(1));
    ExponentialBackoff {
        current_interval: interval,
        initial_interval: interval,
        max_interval: Duration::from_secs(settings.max_backoff_seconds.max(settings.interval_seconds)),
        randomization_factor: settings.jitter,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Delay before the next probe given the outcome of the last one
pub fn next_delay(policy: &mut ExponentialBackoff, reachable: bool) -> Duration {
    if reachable {
        policy.reset();
        policy.initial_interval
    } else {
        policy.next_backoff().unwrap_or(policy.max_interval)
    }
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        settings: HealthSettings,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            settings: RwLock::new(settings),
            metrics,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start, restart or stop probe tasks so there is exactly one per
    /// enabled provider currently in the registry. Must run inside a tokio
    /// runtime.
    pub fn sync(&self) {
        let handles = self.registry.handles();
        let mut tasks = self.tasks.lock();

        tasks.retain(|id, running| {
            let keep = handles.iter().any(|h| {
                h.id() == id && h.config().enabled && Arc::ptr_eq(h, &running.handle)
            });
            if !keep {
                debug!(provider = %id, "Stopping health probe task");
                running.task.abort();
                self.metrics.forget_provider(id);
            }
            keep
        });

        let settings = self.settings.read().clone();
        for handle in handles.into_iter().filter(|h| h.config().enabled) {
            if tasks.contains_key(handle.id()) {
                continue;
            }
            debug!(provider = %handle.id(), "Starting health probe task");
            let task = tokio::spawn(probe_loop(
                handle.clone(),
                probe_backoff(&settings),
                self.metrics.clone(),
            ));
            tasks.insert(handle.id().to_string(), MonitorTask { handle, task });
        }
    }

    /// Apply new probe settings, restarting every task
    pub fn update_settings(&self, settings: HealthSettings) {
        *self.settings.write() = settings;
        self.shutdown();
        self.sync();
    }

    /// Follow a configuration reload. Tasks of unchanged providers keep
    /// their backoff state unless the probe settings themselves changed.
    pub fn reconfigure(&self, settings: HealthSettings) {
        if *self.settings.read() == settings {
            self.sync();
        } else {
            info!("Health settings changed, restarting probe tasks");
            self.update_settings(settings);
        }
    }

    pub fn running(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Ids of providers with a probe task, sorted
    pub fn monitored(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) {
        for (_, running) in self.tasks.lock().drain() {
            running.task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn probe_loop(
    handle: Arc<ProviderHandle>,
    mut policy: ExponentialBackoff,
    metrics: Arc<MetricsCollector>,
) {
    info!(provider = %handle.id(), "Health monitoring started");
    loop {
        let delay = match handle.probe().await {
            Some(outcome) => {
                metrics.record_probe(handle.id(), handle.status());
                next_delay(&mut policy, outcome.reachable)
            }
            // An on-demand probe is running; check back at the base interval
            None => policy.initial_interval,
        };
        debug!(provider = %handle.id(), delay_ms = delay.as_millis() as u64, "Next probe scheduled");
        tokio::time::sleep(delay).await;
    }
}

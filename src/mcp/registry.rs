//! Provider registry: declared configurations plus runtime reachability.
//!
//! Each provider gets a [`ProviderHandle`] holding its client and health
//! state. State lives behind a synchronous lock that is never held across an
//! await, so status reads from chat turns never wait on a probe in flight.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ClientFactory;
use crate::domain::{
    CapabilityClient, ProbeEvent, ProbeOutcome, ProviderConfig, ProviderKind, ProviderStatus,
    ProviderStatusView, ServerInfo, ToolDescriptor,
};

#[derive(Debug, Clone)]
struct HandleState {
    status: ProviderStatus,
    last_probe_at: Option<DateTime<Utc>>,
    last_latency: Option<Duration>,
    last_error: Option<String>,
    /// Tools reported by the provider; `None` until discovery succeeds
    discovered: Option<Vec<ToolDescriptor>>,
}

/// Runtime state of one registered provider
pub struct ProviderHandle {
    config: Arc<ProviderConfig>,
    client: Arc<dyn CapabilityClient>,
    state: RwLock<HandleState>,
    probe_lock: tokio::sync::Mutex<()>,
}

impl ProviderHandle {
    fn new(config: Arc<ProviderConfig>, client: Arc<dyn CapabilityClient>) -> Self {
        let status = if config.enabled {
            ProviderStatus::Unknown
        } else {
            ProviderStatus::Disabled
        };
        Self {
            config,
            client,
            state: RwLock::new(HandleState {
                status,
                last_probe_at: None,
                last_latency: None,
                last_error: None,
                discovered: None,
            }),
            probe_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &Arc<ProviderConfig> {
        &self.config
    }

    pub fn client(&self) -> Arc<dyn CapabilityClient> {
        self.client.clone()
    }

    pub fn status(&self) -> ProviderStatus {
        self.state.read().status
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.client.server_info()
    }

    /// Discovered tools, or the declared catalog until discovery succeeds
    pub fn capabilities(&self) -> Vec<ToolDescriptor> {
        match &self.state.read().discovered {
            Some(tools) => tools.clone(),
            None => self
                .config
                .declared_tools
                .iter()
                .map(ToolDescriptor::named)
                .collect(),
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        match &self.state.read().discovered {
            Some(tools) => tools.iter().any(|t| t.name == name),
            None => self.config.declared_tools.iter().any(|t| t == name),
        }
    }

    pub fn view(&self) -> ProviderStatusView {
        let state = self.state.read();
        let tool_count = match &state.discovered {
            Some(tools) => tools.len(),
            None => self.config.declared_tools.len(),
        };
        ProviderStatusView {
            provider_id: self.config.id.clone(),
            kind: self.config.kind,
            status: state.status,
            last_probe_at: state.last_probe_at,
            last_latency_ms: state.last_latency.map(|d| d.as_millis() as u64),
            last_error: state.last_error.clone(),
            tool_count,
        }
    }

    /// Run one probe unless another is already in flight.
    ///
    /// Returns `None` when the provider is disabled or a probe is running.
    /// On a transition into `Healthy` (or while discovery has not yet
    /// succeeded) the tool list is refreshed.
    pub async fn probe(&self) -> Option<ProbeOutcome> {
        if !self.config.enabled {
            return None;
        }
        let _guard = self.probe_lock.try_lock().ok()?;

        let previous = {
            let mut state = self.state.write();
            let previous = state.status;
            state.status = state.status.on_event(ProbeEvent::Started);
            previous
        };

        let outcome = self.client.probe().await;

        let refresh = {
            let mut state = self.state.write();
            let event = if outcome.reachable {
                ProbeEvent::Succeeded
            } else {
                ProbeEvent::Failed
            };
            state.status = state.status.on_event(event);
            state.last_probe_at = Some(Utc::now());
            state.last_latency = Some(outcome.latency);
            state.last_error = outcome.error.clone();
            outcome.reachable
                && (previous != ProviderStatus::Healthy || state.discovered.is_none())
        };

        if previous != self.status() {
            info!(
                provider = %self.config.id,
                from = %previous,
                to = %self.status(),
                latency_ms = outcome.latency.as_millis() as u64,
                error = ?outcome.error,
                "Provider status changed"
            );
        }

        if refresh {
            self.refresh_capabilities().await;
        }

        Some(outcome)
    }

    async fn refresh_capabilities(&self) {
        match self.client.list_capabilities().await {
            Ok(tools) => {
                debug!(provider = %self.config.id, count = tools.len(), "Discovered tools");
                self.state.write().discovered = Some(tools);
            }
            Err(e) => {
                warn!(provider = %self.config.id, error = %e, "Tool discovery failed, keeping declared catalog");
            }
        }
    }
}

/// Tools a router may choose from for one provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCapabilities {
    pub provider_id: String,
    pub kind: ProviderKind,
    pub status: ProviderStatus,
    pub tools: Vec<ToolDescriptor>,
    #[serde(skip)]
    pub keywords: Vec<String>,
}

/// Result of reconciling the registry with a configuration generation
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RegistryChanges {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

pub struct ProviderRegistry {
    factory: ClientFactory,
    providers: RwLock<BTreeMap<String, Arc<ProviderHandle>>>,
}

impl ProviderRegistry {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            factory,
            providers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a provider. Re-registering an identical configuration keeps
    /// the existing handle; a changed configuration replaces it.
    pub fn register(&self, config: ProviderConfig) -> Arc<ProviderHandle> {
        if let Some(existing) = self.providers.read().get(&config.id) {
            if *existing.config == config {
                return existing.clone();
            }
        }

        let config = Arc::new(config);
        let client = (self.factory)(config.clone());
        let handle = Arc::new(ProviderHandle::new(config.clone(), client));
        self.providers
            .write()
            .insert(config.id.clone(), handle.clone());
        info!(
            provider = %config.id,
            kind = %config.kind,
            enabled = config.enabled,
            endpoint = %config.base_url,
            "Registered provider"
        );
        handle
    }

    pub fn deregister(&self, id: &str) -> bool {
        let removed = self.providers.write().remove(id).is_some();
        if removed {
            info!(provider = %id, "Deregistered provider");
        }
        removed
    }

    /// Reconcile with the provider set of a new configuration generation
    pub fn apply_generation(&self, configs: Vec<ProviderConfig>) -> RegistryChanges {
        let mut changes = RegistryChanges::default();

        let incoming: Vec<String> = configs.iter().map(|c| c.id.clone()).collect();
        let stale: Vec<String> = self
            .providers
            .read()
            .keys()
            .filter(|id| !incoming.contains(id))
            .cloned()
            .collect();
        for id in stale {
            if self.deregister(&id) {
                changes.removed.push(id);
            }
        }

        for config in configs {
            let before = self.get(&config.id);
            let id = config.id.clone();
            let after = self.register(config);
            match before {
                None => changes.added.push(id),
                Some(before) if !Arc::ptr_eq(&before, &after) => changes.updated.push(id),
                Some(_) => {}
            }
        }

        changes
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.read().get(id).cloned()
    }

    pub fn handles(&self) -> Vec<Arc<ProviderHandle>> {
        self.providers.read().values().cloned().collect()
    }

    pub fn status(&self, id: &str) -> Option<ProviderStatus> {
        self.get(id).map(|h| h.status())
    }

    /// Cached status of every provider; never waits on probes
    pub fn status_snapshot(&self) -> Vec<ProviderStatusView> {
        self.handles().iter().map(|h| h.view()).collect()
    }

    /// Capabilities of every provider that is not disabled
    pub fn available_capabilities(&self) -> Vec<ProviderCapabilities> {
        self.handles()
            .iter()
            .filter(|h| h.status() != ProviderStatus::Disabled)
            .map(|h| ProviderCapabilities {
                provider_id: h.id().to_string(),
                kind: h.config.kind,
                status: h.status(),
                tools: h.capabilities(),
                keywords: h.config.keywords.clone(),
            })
            .collect()
    }

    /// Probe one provider now; `None` if the id is unknown
    pub async fn probe_now(&self, id: &str) -> Option<ProviderStatusView> {
        let handle = self.get(id)?;
        if handle.probe().await.is_none() {
            debug!(provider = %id, "Probe skipped (disabled or already in flight)");
        }
        Some(handle.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CapabilityError, Credentials};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedClient {
        id: String,
        reachable: AtomicBool,
        probes: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl CapabilityClient for ScriptedClient {
        fn provider_id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::SourceControl
        }
        async fn connect(&self) -> Result<(), CapabilityError> {
            Ok(())
        }
        async fn list_capabilities(&self) -> Result<Vec<ToolDescriptor>, CapabilityError> {
            Ok(vec![ToolDescriptor::named("discovered_tool")])
        }
        async fn invoke(&self, _: &str, _: &Value, _: Duration) -> Result<Value, CapabilityError> {
            Ok(Value::Null)
        }
        async fn probe(&self) -> ProbeOutcome {
            self.probes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.reachable.load(Ordering::SeqCst) {
                ProbeOutcome::reachable(self.delay)
            } else {
                ProbeOutcome::unreachable(self.delay, "connection refused")
            }
        }
    }

    fn config(id: &str, enabled: bool) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            kind: ProviderKind::SourceControl,
            enabled,
            host: None,
            port: None,
            base_url: format!("http://{}/mcp", id),
            credentials: Credentials::default(),
            timeout: Duration::from_secs(1),
            declared_tools: vec!["list_projects".to_string()],
            keywords: vec![],
        }
    }

    fn registry(reachable: bool, delay: Duration) -> (ProviderRegistry, Arc<ScriptedClient>) {
        let client = Arc::new(ScriptedClient {
            id: "gitlab".to_string(),
            reachable: AtomicBool::new(reachable),
            probes: AtomicUsize::new(0),
            delay,
        });
        let shared = client.clone();
        let factory: ClientFactory = Arc::new(move |_| shared.clone() as Arc<dyn CapabilityClient>);
        (ProviderRegistry::new(factory), client)
    }

    #[test]
    fn test_register_is_idempotent() {
        let (registry, _) = registry(true, Duration::ZERO);
        let first = registry.register(config("gitlab", true));
        let second = registry.register(config("gitlab", true));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.status_snapshot().len(), 1);
    }

    #[test]
    fn test_disabled_registered_as_disabled_and_hidden() {
        let (registry, _) = registry(true, Duration::ZERO);
        registry.register(config("gitlab", false));
        assert_eq!(registry.status("gitlab"), Some(ProviderStatus::Disabled));
        assert!(registry.available_capabilities().is_empty());
    }

    #[tokio::test]
    async fn test_probe_success_discovers_tools() {
        let (registry, _) = registry(true, Duration::ZERO);
        let handle = registry.register(config("gitlab", true));
        assert_eq!(handle.capabilities()[0].name, "list_projects");

        let view = registry.probe_now("gitlab").await.unwrap();
        assert_eq!(view.status, ProviderStatus::Healthy);
        assert!(view.last_probe_at.is_some());
        assert!(handle.has_tool("discovered_tool"));
    }

    #[tokio::test]
    async fn test_probe_failure_marks_unreachable() {
        let (registry, _) = registry(false, Duration::ZERO);
        registry.register(config("gitlab", true));
        let view = registry.probe_now("gitlab").await.unwrap();
        assert_eq!(view.status, ProviderStatus::Unreachable);
        assert_eq!(view.last_error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_at_most_one_probe_in_flight() {
        let (registry, client) = registry(true, Duration::from_millis(100));
        let handle = registry.register(config("gitlab", true));

        let (a, b) = tokio::join!(handle.probe(), handle.probe());
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
        assert_eq!(client.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_readable_while_probing() {
        let (registry, _) = registry(true, Duration::from_millis(100));
        let handle = registry.register(config("gitlab", true));

        let probing = tokio::spawn({
            let handle = handle.clone();
            async move { handle.probe().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.status("gitlab"), Some(ProviderStatus::Probing));
        probing.await.unwrap();
        assert_eq!(registry.status("gitlab"), Some(ProviderStatus::Healthy));
    }

    #[test]
    fn test_apply_generation_reports_changes() {
        let (registry, _) = registry(true, Duration::ZERO);
        registry.register(config("gitlab", true));
        registry.register(config("jira", true));

        let mut changed = config("gitlab", true);
        changed.base_url = "http://gitlab-2/mcp".to_string();
        let changes = registry.apply_generation(vec![changed, config("ldap", false)]);

        assert_eq!(changes.added, vec!["ldap".to_string()]);
        assert_eq!(changes.updated, vec!["gitlab".to_string()]);
        assert_eq!(changes.removed, vec!["jira".to_string()]);
    }
}

//! Provider kinds, runtime configuration and health state

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Kind of enterprise system a provider fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Source control (GitLab, GitHub, ...)
    #[serde(alias = "source-control")]
    SourceControl,
    /// Issue tracker or documentation store (Jira, Confluence, ...)
    #[serde(alias = "issue-tracker", alias = "doc_store", alias = "doc-store")]
    IssueTracker,
    /// Directory service (LDAP, Active Directory)
    #[serde(alias = "directory_service", alias = "directory-service")]
    Directory,
}

impl ProviderKind {
    /// Guess the kind from a well-known provider name
    pub fn infer_from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        const SOURCE_CONTROL: &[&str] = &["gitlab", "github", "gitea", "bitbucket", "git"];
        const TRACKER: &[&str] = &["jira", "confluence", "youtrack", "redmine", "wiki", "tracker"];
        const DIRECTORY: &[&str] = &["ldap", "active_directory", "activedirectory", "directory"];

        if SOURCE_CONTROL.iter().any(|n| name.contains(n)) {
            Some(Self::SourceControl)
        } else if TRACKER.iter().any(|n| name.contains(n)) {
            Some(Self::IssueTracker)
        } else if DIRECTORY.iter().any(|n| name.contains(n)) || name == "ad" {
            Some(Self::Directory)
        } else {
            None
        }
    }

    /// Tool catalog assumed for this kind when configuration declares none
    pub fn default_tools(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::SourceControl => &["list_projects", "search", "list_merge_requests"],
            ProviderKind::IssueTracker => &["search_issues", "get_issue", "search_pages"],
            ProviderKind::Directory => &["find_user", "list_group_members"],
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::SourceControl => write!(f, "source_control"),
            ProviderKind::IssueTracker => write!(f, "issue_tracker"),
            ProviderKind::Directory => write!(f, "directory"),
        }
    }
}

/// Reachability state of a registered provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Registered, never probed
    Unknown,
    /// First probe in flight
    Probing,
    /// Last probe succeeded
    Healthy,
    /// Last probe failed
    Unreachable,
    /// Disabled by configuration; never leaves this state
    Disabled,
}

/// Event fed into the per-provider health state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    Started,
    Succeeded,
    Failed,
}

impl ProviderStatus {
    /// Apply a probe event.
    ///
    /// `Disabled` absorbs every event. `Started` only moves `Unknown` to
    /// `Probing`; a re-probe of a healthy or unreachable provider keeps the
    /// previous status visible until the outcome overwrites it.
    pub fn on_event(self, event: ProbeEvent) -> ProviderStatus {
        match (self, event) {
            (ProviderStatus::Disabled, _) => ProviderStatus::Disabled,
            (ProviderStatus::Unknown, ProbeEvent::Started) => ProviderStatus::Probing,
            (status, ProbeEvent::Started) => status,
            (_, ProbeEvent::Succeeded) => ProviderStatus::Healthy,
            (_, ProbeEvent::Failed) => ProviderStatus::Unreachable,
        }
    }

    /// Whether the dispatcher may send calls to a provider in this state
    pub fn is_dispatchable(self) -> bool {
        !matches!(self, ProviderStatus::Disabled | ProviderStatus::Unreachable)
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderStatus::Unknown => "unknown",
            ProviderStatus::Probing => "probing",
            ProviderStatus::Healthy => "healthy",
            ProviderStatus::Unreachable => "unreachable",
            ProviderStatus::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

/// Opaque credential bag; values never appear in `Debug` output
#[derive(Clone, Default)]
pub struct Credentials(Arc<BTreeMap<String, SecretString>>);

impl Credentials {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(Arc::new(
            values
                .into_iter()
                .map(|(k, v)| (k, SecretString::from(v)))
                .collect(),
        ))
    }

    /// Exposes a credential value for forwarding on the wire
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|s| s.expose_secret())
            .filter(|s| !s.is_empty())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.expose_secret() == vb.expose_secret())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Immutable runtime configuration of one provider
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Provider id (the configuration key, e.g. "gitlab")
    pub id: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Endpoint of the MCP server
    pub base_url: String,
    pub credentials: Credentials,
    /// Default per-call timeout
    pub timeout: Duration,
    /// Tool names assumed available until discovery succeeds
    pub declared_tools: Vec<String>,
    /// Extra routing keywords for deterministic intent matching
    pub keywords: Vec<String>,
}

/// Result of a lightweight reachability check
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn reachable(latency: Duration) -> Self {
        Self {
            reachable: true,
            latency,
            error: None,
        }
    }

    pub fn unreachable(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// What a provider reported about itself during the `initialize` handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: String,
    #[serde(rename = "serverInfo", default)]
    pub server_info: serde_json::Value,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

/// Externally visible status of one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatusView {
    pub provider_id: String,
    pub kind: ProviderKind,
    pub status: ProviderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub tool_count: usize,
}

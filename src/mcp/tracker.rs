use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::timed_probe;
use super::transport::{Auth, McpTransport};
use crate::domain::{
    CapabilityClient, CapabilityError, Credentials, ProbeOutcome, ProviderConfig, ProviderKind,
    ServerInfo, ToolDescriptor,
};

/// Issue tracker / documentation store provider (Jira, Confluence)
pub struct IssueTrackerClient {
    config: Arc<ProviderConfig>,
    transport: McpTransport,
}

/// Basic auth with `username` + `api_token` when both are present, else bearer `token`
fn tracker_auth(credentials: &Credentials) -> Auth {
    match (
        credentials.get("username"),
        credentials.get("api_token"),
        credentials.get("token"),
    ) {
        (Some(username), Some(api_token), _) => Auth::Basic {
            username: username.to_string(),
            password: SecretString::from(api_token.to_string()),
        },
        (_, _, Some(token)) => Auth::Bearer(SecretString::from(token.to_string())),
        _ => Auth::None,
    }
}

impl IssueTrackerClient {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        let auth = tracker_auth(&config.credentials);
        let transport = McpTransport::new(&config.id, &config.base_url, auth, config.timeout);
        Self { config, transport }
    }
}

#[async_trait]
impl CapabilityClient for IssueTrackerClient {
    fn provider_id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::IssueTracker
    }

    async fn connect(&self) -> Result<(), CapabilityError> {
        self.transport.connect(self.config.timeout).await
    }

    async fn list_capabilities(&self) -> Result<Vec<ToolDescriptor>, CapabilityError> {
        self.transport.list_tools(self.config.timeout).await
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        self.transport.call_tool(tool, arguments, timeout).await
    }

    fn server_info(&self) -> Option<ServerInfo> {
        self.transport.server_info()
    }

    async fn probe(&self) -> ProbeOutcome {
        timed_probe(async {
            self.transport
                .list_tools(self.config.timeout)
                .await
                .map(|_| ())
        })
        .await
    }
}

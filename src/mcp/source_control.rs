use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::timed_probe;
use super::transport::{Auth, McpTransport};
use crate::domain::{
    CapabilityClient, CapabilityError, ProbeOutcome, ProviderConfig, ProviderKind, ServerInfo,
    ToolDescriptor,
};

/// Source control provider (GitLab, GitHub). Authenticates with a bearer `token`.
pub struct SourceControlClient {
    config: Arc<ProviderConfig>,
    transport: McpTransport,
}

impl SourceControlClient {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        let auth = match config.credentials.get("token") {
            Some(token) => Auth::Bearer(SecretString::from(token.to_string())),
            None => Auth::None,
        };
        let transport = McpTransport::new(&config.id, &config.base_url, auth, config.timeout);
        Self { config, transport }
    }
}

#[async_trait]
impl CapabilityClient for SourceControlClient {
    fn provider_id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::SourceControl
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

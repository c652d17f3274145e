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

pub const BIND_DN_HEADER: &str = "X-Bind-DN";
pub const BIND_PASSWORD_HEADER: &str = "X-Bind-Password";

/// Directory service provider (LDAP, Active Directory).
///
/// Bind credentials are forwarded to the MCP server as headers; the server
/// performs the actual directory bind. Probing uses the cheap MCP `ping`
/// instead of listing tools.
pub struct DirectoryClient {
    config: Arc<ProviderConfig>,
    transport: McpTransport,
}

impl DirectoryClient {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        let mut headers = Vec::new();
        if let Some(dn) = config.credentials.get("bind_dn") {
            headers.push((BIND_DN_HEADER, SecretString::from(dn.to_string())));
        }
        if let Some(password) = config.credentials.get("bind_password") {
            headers.push((BIND_PASSWORD_HEADER, SecretString::from(password.to_string())));
        }
        let auth = if headers.is_empty() {
            Auth::None
        } else {
            Auth::Headers(headers)
        };
        let transport = McpTransport::new(&config.id, &config.base_url, auth, config.timeout);
        Self { config, transport }
    }
}

#[async_trait]
impl CapabilityClient for DirectoryClient {
    fn provider_id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Directory
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
        timed_probe(self.transport.ping(self.config.timeout)).await
    }
}

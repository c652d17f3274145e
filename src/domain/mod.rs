use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub mod context;
pub mod message;
pub mod provider;
pub mod tool;

pub use context::{ContextBundle, ContextEntry, ContextSummary, EntryContent};
pub use message::{ChatMessage, Role};
pub use provider::{
    Credentials, ProbeEvent, ProbeOutcome, ProviderConfig, ProviderKind, ProviderStatus,
    ProviderStatusView, ServerInfo,
};
pub use tool::{CapabilityError, ToolDescriptor, ToolInvocation, ToolResult};

/// Contract every remote provider kind implements
#[async_trait]
pub trait CapabilityClient: Send + Sync {
    fn provider_id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Establish a protocol session using the stored credentials
    async fn connect(&self) -> Result<(), CapabilityError>;

    async fn list_capabilities(&self) -> Result<Vec<ToolDescriptor>, CapabilityError>;

    async fn invoke(
        &self,
        tool: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<Value, CapabilityError>;

    /// Reachability check; reports failures in the outcome instead of erroring
    async fn probe(&self) -> ProbeOutcome;

    /// Handshake result of the last successful connect, if any
    fn server_info(&self) -> Option<ServerInfo> {
        None
    }
}

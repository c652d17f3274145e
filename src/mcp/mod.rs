//! MCP provider clients and the orchestration around them: registry,
//! background health monitoring and concurrent dispatch.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

pub mod directory;
pub mod dispatcher;
pub mod health;
pub mod registry;
pub mod source_control;
pub mod tracker;
pub mod transport;

pub use directory::DirectoryClient;
pub use dispatcher::Dispatcher;
pub use health::HealthMonitor;
pub use registry::ProviderRegistry;
pub use source_control::SourceControlClient;
pub use tracker::IssueTrackerClient;

use crate::domain::{CapabilityClient, CapabilityError, ProbeOutcome, ProviderConfig, ProviderKind};

/// Builds the capability client for a provider configuration
pub type ClientFactory = Arc<dyn Fn(Arc<ProviderConfig>) -> Arc<dyn CapabilityClient> + Send + Sync>;

/// Create the client matching the provider kind
pub fn create_client(config: Arc<ProviderConfig>) -> Arc<dyn CapabilityClient> {
    match config.kind {
        ProviderKind::SourceControl => Arc::new(SourceControlClient::new(config)),
        ProviderKind::IssueTracker => Arc::new(IssueTrackerClient::new(config)),
        ProviderKind::Directory => Arc::new(DirectoryClient::new(config)),
    }
}

/// Factory producing real MCP clients
pub fn default_factory() -> ClientFactory {
    Arc::new(create_client)
}

/// Run a reachability check, turning its error into an unreachable outcome
pub(crate) async fn timed_probe<F>(check: F) -> ProbeOutcome
where
    F: Future<Output = Result<(), CapabilityError>>,
{
    let start = Instant::now();
    match check.await {
        Ok(()) => ProbeOutcome::reachable(start.elapsed()),
        Err(e) => ProbeOutcome::unreachable(start.elapsed(), e.to_string()),
    }
}

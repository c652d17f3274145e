//! Intent routing: which providers and tools a turn needs.
//!
//! Strategies live behind [`IntentRouter`]. Whatever a strategy proposes goes
//! through [`select_invocations`], which drops every proposal naming a
//! provider or tool that is not currently available.

mod keyword;
mod llm;

pub use keyword::KeywordRouter;
pub use llm::LlmRouter;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::adapters::metrics_handler::MetricsCollector;
use crate::chat::llm::LlmProvider;
use crate::config::RouterStrategy;
use crate::domain::{ChatMessage, ToolInvocation};
use crate::mcp::registry::ProviderCapabilities;

/// Strategy proposing tool invocations for one message
#[async_trait]
pub trait IntentRouter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Propose invocations. Output is unvalidated.
    async fn propose(
        &self,
        message: &str,
        history: &[ChatMessage],
        available: &[ProviderCapabilities],
    ) -> Vec<ToolInvocation>;
}

/// Ask the router for invocations and keep only those naming an available
/// provider and one of its tools
pub async fn select_invocations(
    router: &dyn IntentRouter,
    message: &str,
    history: &[ChatMessage],
    available: &[ProviderCapabilities],
) -> Vec<ToolInvocation> {
    if available.is_empty() {
        return Vec::new();
    }
    let proposed = router.propose(message, history, available).await;
    validate(proposed, available, router.name())
}

fn validate(
    proposed: Vec<ToolInvocation>,
    available: &[ProviderCapabilities],
    router: &str,
) -> Vec<ToolInvocation> {
    let mut seen = HashSet::new();
    proposed
        .into_iter()
        .filter(|inv| {
            let Some(provider) = available.iter().find(|p| p.provider_id == inv.provider_id) else {
                warn!(
                    router,
                    provider = %inv.provider_id,
                    tool = %inv.tool_name,
                    "Dropping invocation for unknown provider"
                );
                return false;
            };
            if !provider.tools.iter().any(|t| t.name == inv.tool_name) {
                warn!(
                    router,
                    provider = %inv.provider_id,
                    tool = %inv.tool_name,
                    "Dropping invocation for unknown tool"
                );
                return false;
            }
            let key = format!(
                "{}\u{0}{}\u{0}{}",
                inv.provider_id,
                inv.tool_name,
                serde_json::Value::Object(inv.arguments.clone())
            );
            seen.insert(key)
        })
        .collect()
}

/// Build the configured routing strategy. Without a language model every
/// strategy degrades to keyword matching.
pub fn build_router(
    strategy: RouterStrategy,
    llm: Option<Arc<dyn LlmProvider>>,
    metrics: Arc<MetricsCollector>,
) -> Arc<dyn IntentRouter> {
    match (strategy, llm) {
        (RouterStrategy::Keyword, _) | (_, None) => Arc::new(KeywordRouter::new()),
        (RouterStrategy::Llm, Some(llm)) => Arc::new(LlmRouter::new(llm, metrics)),
        (RouterStrategy::Hybrid, Some(llm)) => Arc::new(
            LlmRouter::new(llm, metrics).with_fallback(Arc::new(KeywordRouter::new())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProviderKind, ProviderStatus, ToolDescriptor};

    struct Scripted(Vec<ToolInvocation>);

    #[async_trait]
    impl IntentRouter for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn propose(
            &self,
            _message: &str,
            _history: &[ChatMessage],
            _available: &[ProviderCapabilities],
        ) -> Vec<ToolInvocation> {
            self.0.clone()
        }
    }

    fn caps() -> Vec<ProviderCapabilities> {
        vec![ProviderCapabilities {
            provider_id: "gitlab".into(),
            kind: ProviderKind::SourceControl,
            status: ProviderStatus::Healthy,
            tools: vec![ToolDescriptor::named("search")],
            keywords: vec![],
        }]
    }

    #[tokio::test]
    async fn test_unknown_provider_and_tool_are_dropped() {
        let router = Scripted(vec![
            ToolInvocation::new("gitlab", "search").with_argument("query", "x"),
            ToolInvocation::new("gitlab", "drop_database"),
            ToolInvocation::new("ldap", "find_user"),
            ToolInvocation::new("gitlab", "search").with_argument("query", "x"),
        ]);
        let selected = select_invocations(&router, "msg", &[], &caps()).await;
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].tool_name, "search");
    }

    #[tokio::test]
    async fn test_nothing_available_selects_nothing() {
        let router = Scripted(vec![ToolInvocation::new("gitlab", "search")]);
        assert!(select_invocations(&router, "msg", &[], &[]).await.is_empty());
    }
}

//! Routing through a preliminary tool-selection call to the language model

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::IntentRouter;
use crate::adapters::metrics_handler::MetricsCollector;
use crate::chat::error::LlmError;
use crate::chat::llm::{CompletionRequest, LlmProvider, Message, ToolCall, ToolChoice, ToolDefinition};
use crate::domain::{ChatMessage, Role, ToolInvocation};
use crate::mcp::registry::ProviderCapabilities;

/// Separator between provider id and tool name in function names
pub const FUNCTION_SEPARATOR: &str = "__";

const ROUTING_PROMPT: &str = "You decide which tools must be called to answer the user's latest \
message. Call every tool whose data is needed, with arguments taken from the conversation. \
If no tool is needed, reply with an empty JSON array: []";

const HISTORY_WINDOW: usize = 4;
const ARGUMENT_PATTERN: &str = r#"(\w+)\s*=\s*(?:'([^']*)'|"([^"]*)"|([^,\s)]+))"#;

pub struct LlmRouter {
    llm: Arc<dyn LlmProvider>,
    fallback: Option<Arc<dyn IntentRouter>>,
    metrics: Arc<MetricsCollector>,
    max_elapsed: Duration,
    argument: Option<Regex>,
}

impl LlmRouter {
    pub fn new(llm: Arc<dyn LlmProvider>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            llm,
            fallback: None,
            metrics,
            max_elapsed: Duration::from_secs(5),
            argument: Regex::new(ARGUMENT_PATTERN).ok(),
        }
    }

    /// Router to consult when the selection call fails
    pub fn with_fallback(mut self, fallback: Arc<dyn IntentRouter>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    fn build_request(
        &self,
        message: &str,
        history: &[ChatMessage],
        available: &[ProviderCapabilities],
    ) -> Option<CompletionRequest> {
        let tools: Vec<ToolDefinition> = available
            .iter()
            .flat_map(|provider| {
                provider.tools.iter().map(move |tool| ToolDefinition {
                    name: format!("{}{}{}", provider.provider_id, FUNCTION_SEPARATOR, tool.name),
                    description: tool
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("{} on {} ({})", tool.name, provider.provider_id, provider.kind)),
                    parameters: tool.schema(),
                })
            })
            .collect();
        if tools.is_empty() {
            return None;
        }

        let mut messages = vec![Message::system(ROUTING_PROMPT)];
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        messages.extend(
            history[start..]
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| Message {
                    role: m.role,
                    content: m.content.clone(),
                }),
        );
        messages.push(Message::user(message));

        Some(CompletionRequest {
            messages,
            temperature: Some(0.0),
            tools: Some(tools),
            tool_choice: Some(ToolChoice::Auto),
            stream: false,
            ..Default::default()
        })
    }

    async fn select(&self, request: CompletionRequest) -> Result<(Vec<ToolCall>, String), LlmError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        let response = backoff::future::retry(policy, || {
            let request = request.clone();
            async move {
                self.llm.complete(request).await.map_err(|e| match e.retry_after() {
                    Some(wait) => backoff::Error::retry_after(e, wait),
                    None if e.is_transient() => backoff::Error::transient(e),
                    None => backoff::Error::permanent(e),
                })
            }
        })
        .await?;

        Ok((response.tool_calls, response.content))
    }

    fn to_invocations(
        &self,
        calls: Vec<ToolCall>,
        content: &str,
        available: &[ProviderCapabilities],
    ) -> Vec<ToolInvocation> {
        if !calls.is_empty() {
            return calls
                .into_iter()
                .filter_map(|call| {
                    let (provider, tool) = split_function_name(&call.name, available)?;
                    let arguments = match call.arguments {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                    let mut invocation = ToolInvocation::new(provider, tool);
                    invocation.arguments = arguments;
                    Some(invocation)
                })
                .collect();
        }
        self.parse_textual_calls(content, available)
    }

    /// Parse replies of the form `["gitlab_search(query='ONEC-1', scope='issues')"]`
    fn parse_textual_calls(&self, content: &str, available: &[ProviderCapabilities]) -> Vec<ToolInvocation> {
        let body = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        let Ok(Value::Array(items)) = serde_json::from_str::<Value>(body) else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|call| {
                let call = call.trim();
                let open = call.find('(')?;
                if !call.ends_with(')') {
                    return None;
                }
                let (provider, tool) = split_function_name(call[..open].trim(), available)?;
                let args = &call[open + 1..call.len() - 1];

                let mut invocation = ToolInvocation::new(provider, tool);
                if let Some(re) = &self.argument {
                    for caps in re.captures_iter(args) {
                        let value = caps
                            .get(2)
                            .or_else(|| caps.get(3))
                            .or_else(|| caps.get(4))
                            .map(|m| m.as_str())
                            .unwrap_or_default();
                        invocation = invocation.with_argument(&caps[1], value);
                    }
                }
                Some(invocation)
            })
            .collect()
    }

    fn record(&self, outcome: &str) {
        self.metrics
            .llm_requests
            .with_label_values(&["routing", outcome])
            .inc();
    }
}

/// Split a function name into provider id and tool name, preferring the
/// `provider__tool` form and accepting `provider_tool`
pub(crate) fn split_function_name(
    name: &str,
    available: &[ProviderCapabilities],
) -> Option<(String, String)> {
    if let Some((provider, tool)) = name.split_once(FUNCTION_SEPARATOR) {
        if available.iter().any(|p| p.provider_id == provider) {
            return Some((provider.to_string(), tool.to_string()));
        }
    }

    available
        .iter()
        .filter_map(|p| {
            name.strip_prefix(p.provider_id.as_str())
                .and_then(|rest| rest.strip_prefix('_'))
                .map(|tool| (p.provider_id.as_str(), tool))
        })
        // Longest provider id wins when ids share a prefix
        .max_by_key(|(provider, _)| provider.len())
        .map(|(provider, tool)| (provider.to_string(), tool.trim_start_matches('_').to_string()))
}

#[async_trait]
impl IntentRouter for LlmRouter {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn propose(
        &self,
        message: &str,
        history: &[ChatMessage],
        available: &[ProviderCapabilities],
    ) -> Vec<ToolInvocation> {
        let Some(request) = self.build_request(message, history, available) else {
            return Vec::new();
        };

        match self.select(request).await {
            Ok((calls, content)) => {
                self.record("ok");
                let invocations = self.to_invocations(calls, &content, available);
                debug!(count = invocations.len(), "Language model proposed tool calls");
                invocations
            }
            Err(e) => {
                self.record(e.label());
                match &self.fallback {
                    Some(fallback) => {
                        warn!(error = %e, fallback = fallback.name(), "Tool selection failed, using fallback router");
                        fallback.propose(message, history, available).await
                    }
                    None => {
                        warn!(error = %e, "Tool selection failed, answering without tools");
                        Vec::new()
                    }
                }
            }
        }
    }
}

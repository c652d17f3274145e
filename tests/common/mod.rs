//! Shared fakes for integration tests: scripted providers, a scripted
//! language model and an in-process server.

#![allow(dead_code)]

use async_trait::async_trait;
use concierge::chat::llm::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, LlmStream, StreamChunk,
    STREAM_BUFFER,
};
use concierge::chat::LlmResult;
use concierge::config::{Settings, SettingsHandle};
use concierge::domain::{
    CapabilityClient, CapabilityError, ProbeOutcome, ProviderConfig, ProviderKind, Role,
    ServerInfo, ToolDescriptor,
};
use concierge::mcp::ClientFactory;
use concierge::AppState;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Provider ids that refuse every connection
#[derive(Clone, Default)]
pub struct FakeProviders {
    down: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeProviders {
    pub fn set_down(&self, id: &str) {
        self.down.lock().insert(id.to_string());
    }

    /// `provider.tool` for every invocation that reached a provider
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn factory(&self) -> ClientFactory {
        let providers = self.clone();
        Arc::new(move |config: Arc<ProviderConfig>| {
            Arc::new(FakeClient {
                id: config.id.clone(),
                kind: config.kind,
                providers: providers.clone(),
            }) as Arc<dyn CapabilityClient>
        })
    }
}

struct FakeClient {
    id: String,
    kind: ProviderKind,
    providers: FakeProviders,
}

impl FakeClient {
    fn is_down(&self) -> bool {
        self.providers.down.lock().contains(&self.id)
    }
}

#[async_trait]
impl CapabilityClient for FakeClient {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self) -> Result<(), CapabilityError> {
        if self.is_down() {
            Err(CapabilityError::Connection("connection refused".into()))
        } else {
            Ok(())
        }
    }

    async fn list_capabilities(&self) -> Result<Vec<ToolDescriptor>, CapabilityError> {
        self.connect().await?;
        Ok(self
            .kind
            .default_tools()
            .iter()
            .map(|t| ToolDescriptor::named(*t))
            .collect())
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: &Value,
        _timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        self.connect().await?;
        self.providers.calls.lock().push(format!("{}.{}", self.id, tool));
        Ok(json!({ "provider": self.id, "tool": tool, "arguments": arguments }))
    }

    fn server_info(&self) -> Option<ServerInfo> {
        if self.is_down() {
            return None;
        }
        Some(ServerInfo {
            protocol_version: "2025-03-26".to_string(),
            server_info: json!({"name": format!("fake-{}", self.id), "version": "1.0"}),
            capabilities: json!({"tools": {}}),
        })
    }

    async fn probe(&self) -> ProbeOutcome {
        match self.connect().await {
            Ok(()) => ProbeOutcome::reachable(Duration::from_millis(1)),
            Err(e) => ProbeOutcome::unreachable(Duration::from_millis(1), e.to_string()),
        }
    }
}

/// Language model that echoes the user message, optionally slowly
pub struct EchoLlm {
    delay: Duration,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl EchoLlm {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    /// System prompt of the most recent request
    pub fn last_system_prompt(&self) -> String {
        self.requests
            .lock()
            .last()
            .and_then(|r| r.messages.iter().find(|m| m.role == Role::System))
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    fn reply_for(request: &CompletionRequest) -> String {
        let question = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        format!("echo: {}", question)
    }
}

#[async_trait]
impl LlmProvider for EchoLlm {
    fn name(&self) -> &str {
        "echo"
    }

    fn model(&self) -> &str {
        "echo-1"
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<CompletionResponse> {
        self.requests.lock().push(request.clone());
        tokio::time::sleep(self.delay).await;
        Ok(CompletionResponse {
            content: Self::reply_for(&request),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: None,
        })
    }

    fn complete_stream(&self, request: CompletionRequest) -> LlmStream {
        self.requests.lock().push(request.clone());
        let reply = Self::reply_for(&request);
        let delay = self.delay;
        let (tx, stream) = LlmStream::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            for word in reply.split_inclusive(' ') {
                tokio::time::sleep(delay).await;
                if tx.send_text(word).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamChunk::finish(FinishReason::Stop, None)).await;
        });
        stream
    }
}

/// Settings with the given providers and chat overrides
pub fn settings(mcp_servers: Value, chat: Value) -> Settings {
    serde_json::from_value(json!({
        "server": {"host": "127.0.0.1", "port": 0},
        "llm": {"provider": "ollama", "model": "llama3", "api_key": "sk-live-do-not-leak"},
        "mcp_servers": mcp_servers,
        "chat": chat,
    }))
    .expect("test settings")
}

/// gitlab, jira and ldap, all enabled
pub fn standard_providers() -> Value {
    json!({
        "gitlab": {
            "enabled": true,
            "url": "http://gitlab-mcp:8001/mcp",
            "credentials": {"token": "glpat-very-secret"}
        },
        "jira": {
            "enabled": true,
            "url": "http://jira-mcp:8002/mcp",
            "credentials": {"username": "bot", "api_token": "jira-token-secret"}
        },
        "ldap": {
            "enabled": true,
            "url": "http://ldap-mcp:8003/mcp",
            "credentials": {"bind_password": "ldap-pass-secret"}
        }
    })
}

/// Build the app state and run a first probe of every provider
pub async fn app_state(settings: Settings, providers: &FakeProviders, llm: Arc<EchoLlm>) -> AppState {
    let handle = Arc::new(SettingsHandle::new(settings));
    let state = AppState::with_llm(handle, providers.factory(), llm).expect("app state");
    for provider in state.registry.handles() {
        state.registry.probe_now(provider.id()).await;
    }
    state
}

/// The app served on an ephemeral port
pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
}

impl TestServer {
    pub async fn new(state: &AppState) -> Self {
        let app = concierge::create_app(state);

        // Start server on random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer { addr, base_url }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

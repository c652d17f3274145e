//! OpenAI-compatible LLM provider with streaming support

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, LlmStream, LlmStreamSender,
    StreamChunk, TokenUsage, ToolCall, ToolChoice, STREAM_BUFFER,
};
use crate::chat::error::{LlmError, LlmResult};
use crate::config::{LlmProviderType, LlmSettings};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider for any `/chat/completions` endpoint (OpenAI, Ollama, vLLM, ...)
pub struct OpenAiProvider {
    client: reqwest::Client,
    kind: LlmProviderType,
    api_key: Option<SecretString>,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAiProvider {
    /// Create a new provider from configuration
    pub fn new(settings: &LlmSettings) -> LlmResult<Self> {
        let api_key = settings.resolve_api_key().map(SecretString::from);

        if api_key.is_none()
            && settings.provider == LlmProviderType::OpenAI
            && settings.base_url.is_none()
        {
            return Err(LlmError::Authentication(
                "no API key configured for openai".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            kind: settings.provider,
            api_key,
            base_url: settings.base_url().trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            timeout: settings.timeout(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }

    /// Build the request body for the chat completions API
    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(self.temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
        });

        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = json!(tools
                .iter()
                .map(|t| {
                    // The API requires at minimum {"type": "object"} for parameters
                    let mut params = t.parameters.clone();
                    match params.as_object_mut() {
                        Some(obj) => {
                            obj.entry("type").or_insert_with(|| json!("object"));
                        }
                        None => params = json!({"type": "object", "properties": {}}),
                    }
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": params
                        }
                    })
                })
                .collect::<Vec<_>>());

            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => json!("auto"),
                    ToolChoice::None => json!("none"),
                    ToolChoice::Required => json!("required"),
                };
            }
        }

        if request.stream {
            body["stream"] = json!(true);
            if self.kind == LlmProviderType::OpenAI {
                body["stream_options"] = json!({ "include_usage": true });
            }
        }

        body
    }

    /// Turn a non-success HTTP response into an error
    async fn error_from_response(response: Response) -> LlmError {
        let status = response.status();
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as u64);
        let message = response.text().await.unwrap_or_default();

        match status {
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                retry_after_ms: retry_after_ms.unwrap_or(1_000),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Authentication(message),
            StatusCode::BAD_REQUEST => LlmError::InvalidRequest(message),
            _ => LlmError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }

    fn parse_response(response: OpenAiResponse) -> LlmResult<CompletionResponse> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Parse("No choices in response".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(Value::Object(Default::default())),
            })
            .collect();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason: FinishReason::from_openai(choice.finish_reason.as_deref()),
            usage: response.usage.map(TokenUsage::from),
        })
    }

    async fn stream_completion(
        request: RequestBuilder,
        timeout: Duration,
        sender: LlmStreamSender,
    ) -> LlmResult<()> {
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| LlmError::Timeout)??;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let next = tokio::select! {
                // Consumer went away: dropping the response aborts the request
                _ = sender.closed() => return Ok(()),
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Err(LlmError::Timeout),
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk.map_err(|e| LlmError::Streaming(e.to_string()))?,
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete lines
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                match parse_sse_line(&line) {
                    SseLine::Done => return Ok(()),
                    SseLine::Chunk(chunk) => {
                        if sender.send(chunk).await.is_err() {
                            return Ok(());
                        }
                    }
                    SseLine::Skip => {}
                }
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum SseLine {
    Chunk(StreamChunk),
    Done,
    Skip,
}

/// Parse one line of a streamed chat completion
pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let Ok(parsed) = serde_json::from_str::<OpenAiStreamResponse>(data) else {
        debug!(line = %data, "Ignoring unparseable stream line");
        return SseLine::Skip;
    };

    let usage = parsed.usage.map(TokenUsage::from);
    match parsed.choices.into_iter().next() {
        Some(choice) => SseLine::Chunk(StreamChunk {
            content: choice.delta.content.unwrap_or_default(),
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map(|r| FinishReason::from_openai(Some(r))),
            usage,
        }),
        // Final usage-only chunk
        None if usage.is_some() => SseLine::Chunk(StreamChunk {
            usage,
            ..Default::default()
        }),
        None => SseLine::Skip,
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        match self.kind {
            LlmProviderType::OpenAI => "openai",
            LlmProviderType::Ollama => "ollama",
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<CompletionResponse> {
        let mut request = request;
        request.stream = false;
        let body = self.build_request_body(&request);

        let response = self
            .authorize(self.client.post(self.endpoint()))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("Failed to parse response: {}", e)))?;

        Self::parse_response(parsed)
    }

    fn complete_stream(&self, request: CompletionRequest) -> LlmStream {
        let (sender, stream) = LlmStream::channel(STREAM_BUFFER);

        let mut request = request;
        request.stream = true;
        let body = self.build_request_body(&request);
        let builder = self
            .authorize(self.client.post(self.endpoint()))
            .json(&body);
        let timeout = self.timeout;

        tokio::spawn(async move {
            if let Err(e) = Self::stream_completion(builder, timeout, sender.clone()).await {
                let _ = sender.send_error(e).await;
            }
        });

        stream
    }
}

// Chat completions API response types

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(u: OpenAiUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::llm::{Message, ToolDefinition};

    fn settings(value: Value) -> LlmSettings {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_sse_content_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        match parse_sse_line(line) {
            SseLine::Chunk(chunk) => {
                assert_eq!(chunk.content, "Hi");
                assert!(chunk.finish_reason.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_sse_done_and_noise() {
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line(": keep-alive"), SseLine::Skip));
        assert!(matches!(parse_sse_line("data: not json"), SseLine::Skip));
    }

    #[test]
    fn test_parse_sse_usage_only_chunk() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#;
        match parse_sse_line(line) {
            SseLine::Chunk(chunk) => assert_eq!(chunk.usage.unwrap().total_tokens, 5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_openai_requires_key() {
        let result = OpenAiProvider::new(&settings(json!({
            "model": "gpt-4o-mini",
            "api_key_env": "CONCIERGE_OPENAI_TEST_UNSET_KEY"
        })));
        assert!(matches!(result, Err(LlmError::Authentication(_))));
    }

    #[test]
    fn test_request_body_includes_tools() {
        let provider = OpenAiProvider::new(&settings(json!({
            "provider": "ollama",
            "model": "llama3"
        })))
        .unwrap();
        let body = provider.build_request_body(&CompletionRequest {
            messages: vec![Message::system("sys"), Message::user("hi")],
            tools: Some(vec![ToolDefinition {
                name: "gitlab__search".into(),
                description: "Search".into(),
                parameters: json!({"properties": {}}),
            }]),
            tool_choice: Some(ToolChoice::Auto),
            stream: true,
            ..Default::default()
        });

        assert_eq!(body["model"], "llama3");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["stream"], true);
        assert!(body.get("stream_options").is_none());
        assert_eq!(provider.endpoint(), "http://localhost:11434/v1/chat/completions");
    }
}

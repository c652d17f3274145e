//! Prompt construction and the completion call.
//!
//! Provider failures never escape: they turn into a degraded assistant
//! message that tells the user what went wrong. Transient failures are
//! retried first, but only while nothing has been streamed yet.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::{ChatError, LlmError};
use super::event::TurnEvent;
use super::llm::{CompletionRequest, LlmProvider, Message};
use crate::adapters::metrics_handler::MetricsCollector;
use crate::config::ChatSettings;
use crate::domain::{ChatMessage, ContextBundle, Role};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to the \
company's source control, issue tracker, documentation and directory systems. Use the data \
retrieved from those systems when it is provided, say so when a system was unavailable, and \
do not invent data. Answer in the language the user writes in.";

pub struct CompletionService {
    llm: Arc<dyn LlmProvider>,
    metrics: Arc<MetricsCollector>,
    retry_window: Duration,
}

impl CompletionService {
    pub fn new(llm: Arc<dyn LlmProvider>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            llm,
            metrics,
            retry_window: Duration::from_secs(10),
        }
    }

    /// Bound on the total time spent retrying transient failures
    pub fn with_retry_window(mut self, retry_window: Duration) -> Self {
        self.retry_window = retry_window;
        self
    }

    pub fn llm(&self) -> &Arc<dyn LlmProvider> {
        &self.llm
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(4),
            max_elapsed_time: Some(self.retry_window),
            ..Default::default()
        }
    }

    fn record(&self, outcome: &str) {
        self.metrics
            .llm_requests
            .with_label_values(&["completion", outcome])
            .inc();
    }

    /// Produce the whole reply at once
    pub async fn complete(
        &self,
        settings: &ChatSettings,
        history: &[ChatMessage],
        bundle: &ContextBundle,
        message: &str,
    ) -> ChatMessage {
        let request = CompletionRequest {
            messages: build_messages(settings, history, bundle, message),
            ..Default::default()
        };

        let result = backoff::future::retry(self.retry_policy(), || {
            let request = request.clone();
            async move {
                self.llm.complete(request).await.map_err(|e| {
                    debug!(error = %e, "Completion attempt failed");
                    match e.retry_after() {
                        Some(wait) => backoff::Error::retry_after(e, wait),
                        None if e.is_transient() => backoff::Error::transient(e),
                        None => backoff::Error::permanent(e),
                    }
                })
            }
        })
        .await;

        match result {
            Ok(response) => {
                self.record("ok");
                ChatMessage::assistant(response.content)
            }
            Err(e) => {
                self.record(e.label());
                warn!(error = %e, model = %self.llm.model(), "Completion failed, replying degraded");
                ChatMessage::assistant(degraded_reply(&e)).degraded()
            }
        }
    }

    /// Stream the reply to `sink` token by token.
    ///
    /// Returns `Cancelled` once the receiving side of `sink` is gone; the
    /// provider stream is dropped with it, which aborts the request.
    pub async fn complete_streaming(
        &self,
        settings: &ChatSettings,
        history: &[ChatMessage],
        bundle: &ContextBundle,
        message: &str,
        sink: &mpsc::Sender<TurnEvent>,
    ) -> Result<ChatMessage, ChatError> {
        let request = CompletionRequest {
            messages: build_messages(settings, history, bundle, message),
            stream: true,
            ..Default::default()
        };
        let mut policy = self.retry_policy();
        let started = Instant::now();

        loop {
            let mut stream = self.llm.complete_stream(request.clone());
            let mut content = String::new();

            let failure = loop {
                let next = tokio::select! {
                    _ = sink.closed() => return Err(ChatError::Cancelled),
                    next = stream.next() => next,
                };
                match next {
                    None => break None,
                    Some(Ok(chunk)) => {
                        if !chunk.has_content() {
                            continue;
                        }
                        content.push_str(&chunk.content);
                        if sink.send(TurnEvent::token(chunk.content)).await.is_err() {
                            return Err(ChatError::Cancelled);
                        }
                    }
                    Some(Err(e)) => break Some(e),
                }
            };

            let Some(error) = failure else {
                self.record("ok");
                debug!(
                    chars = content.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Streamed completion finished"
                );
                return Ok(ChatMessage::assistant(content));
            };

            if content.is_empty() && error.is_transient() {
                if let Some(delay) = policy.next_backoff() {
                    let delay = error.retry_after().map_or(delay, |wait| wait.max(delay));
                    debug!(error = %error, delay_ms = delay.as_millis() as u64, "Retrying completion");
                    tokio::select! {
                        _ = sink.closed() => return Err(ChatError::Cancelled),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            }

            self.record(error.label());
            warn!(error = %error, model = %self.llm.model(), "Streamed completion failed, replying degraded");

            let note = degraded_reply(&error);
            let (text, reply) = if content.is_empty() {
                (note.clone(), note)
            } else {
                let tail = format!("\n\n{}", note);
                (tail.clone(), format!("{}{}", content, tail))
            };
            if sink.send(TurnEvent::token(text)).await.is_err() {
                return Err(ChatError::Cancelled);
            }
            return Ok(ChatMessage::assistant(reply).degraded());
        }
    }
}

/// System preamble and context, a window of recent history, then the message
pub fn build_messages(
    settings: &ChatSettings,
    history: &[ChatMessage],
    bundle: &ContextBundle,
    message: &str,
) -> Vec<Message> {
    let mut system = settings
        .system_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .to_string();
    let context = bundle.render();
    if !context.is_empty() {
        system.push_str("\n\n");
        system.push_str(&context);
    }

    let mut messages = Vec::with_capacity(settings.history_window + 2);
    messages.push(Message::system(system));

    let recent: Vec<&ChatMessage> = history.iter().filter(|m| m.role != Role::System).collect();
    let start = recent.len().saturating_sub(settings.history_window);
    messages.extend(recent[start..].iter().map(|m| Message {
        role: m.role,
        content: m.content.clone(),
    }));

    messages.push(Message::user(message));
    messages
}

/// User-facing explanation of a completion failure
pub fn degraded_reply(error: &LlmError) -> String {
    let reason = match error {
        LlmError::RateLimited { .. } => {
            "the language model is receiving too many requests right now".to_string()
        }
        LlmError::Timeout => "the language model did not respond in time".to_string(),
        LlmError::Authentication(_) => {
            "the service could not authenticate with the language model".to_string()
        }
        LlmError::Network(_) => "the language model could not be reached".to_string(),
        other => format!("the language model returned an error ({})", other),
    };
    format!("Sorry, I could not produce an answer: {}. Please try again later.", reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::error::LlmResult;
    use crate::chat::llm::{CompletionResponse, FinishReason, LlmStream};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Fails the first `failures` calls with a network error, then answers
    struct FlakyLlm {
        failures: Mutex<usize>,
        tokens: Vec<&'static str>,
        error_after_tokens: bool,
    }

    impl FlakyLlm {
        fn new(failures: usize, tokens: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                tokens,
                error_after_tokens: false,
            })
        }

        fn take_failure(&self) -> bool {
            let mut left = self.failures.lock();
            if *left > 0 {
                *left -= 1;
                true
            } else {
                false
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyLlm {
        fn name(&self) -> &str {
            "flaky"
        }

        fn model(&self) -> &str {
            "flaky-1"
        }

        async fn complete(&self, _request: CompletionRequest) -> LlmResult<CompletionResponse> {
            if self.take_failure() {
                return Err(LlmError::Network("reset".into()));
            }
            Ok(CompletionResponse {
                content: self.tokens.concat(),
                tool_calls: vec![],
                finish_reason: FinishReason::Stop,
                usage: None,
            })
        }

        fn complete_stream(&self, _request: CompletionRequest) -> LlmStream {
            let (sender, stream) = LlmStream::channel(8);
            let fail = self.take_failure();
            let tokens = self.tokens.clone();
            let error_after_tokens = self.error_after_tokens;
            tokio::spawn(async move {
                if fail {
                    let _ = sender.send_error(LlmError::Timeout).await;
                    return;
                }
                for token in tokens {
                    if sender.send_text(token).await.is_err() {
                        return;
                    }
                }
                if error_after_tokens {
                    let _ = sender.send_error(LlmError::Streaming("cut".into())).await;
                }
            });
            stream
        }
    }

    fn service(llm: Arc<FlakyLlm>) -> CompletionService {
        CompletionService::new(llm, Arc::new(MetricsCollector::new().unwrap()))
            .with_retry_window(Duration::from_secs(2))
    }

    fn drain(rx: &mut mpsc::Receiver<TurnEvent>) -> String {
        let mut out = String::new();
        while let Ok(event) = rx.try_recv() {
            if let TurnEvent::Token { content } = event {
                out.push_str(&content);
            }
        }
        out
    }

    #[test]
    fn test_prompt_layout_and_window() {
        let settings = ChatSettings {
            history_window: 2,
            ..Default::default()
        };
        let history = vec![
            ChatMessage::user("one"),
            ChatMessage::assistant("two"),
            ChatMessage::user("three"),
        ];
        let messages = build_messages(&settings, &history, &ContextBundle::empty("t"), "four");

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("language the user writes in"));
        assert_eq!(messages[1].content, "two");
        assert_eq!(messages[3].content, "four");
    }

    #[test]
    fn test_custom_system_prompt() {
        let settings = ChatSettings {
            system_prompt: Some("Be brief.".into()),
            ..Default::default()
        };
        let messages = build_messages(&settings, &[], &ContextBundle::empty("t"), "hi");
        assert_eq!(messages[0].content, "Be brief.");
    }

    #[tokio::test]
    async fn test_complete_retries_transient_failure() {
        let reply = service(FlakyLlm::new(1, vec!["Hel", "lo"]))
            .complete(&ChatSettings::default(), &[], &ContextBundle::empty("t"), "hi")
            .await;
        assert_eq!(reply.content, "Hello");
        assert!(!reply.degraded);
    }

    #[tokio::test]
    async fn test_complete_degrades_when_retries_exhausted() {
        let llm = FlakyLlm::new(usize::MAX, vec![]);
        let reply = CompletionService::new(llm, Arc::new(MetricsCollector::new().unwrap()))
            .with_retry_window(Duration::from_millis(100))
            .complete(&ChatSettings::default(), &[], &ContextBundle::empty("t"), "hi")
            .await;
        assert!(reply.degraded);
        assert!(reply.content.contains("could not be reached"));
    }

    #[tokio::test]
    async fn test_streaming_forwards_tokens_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let reply = service(FlakyLlm::new(1, vec!["a", "b", "c"]))
            .complete_streaming(&ChatSettings::default(), &[], &ContextBundle::empty("t"), "hi", &tx)
            .await
            .unwrap();
        assert_eq!(reply.content, "abc");
        assert_eq!(drain(&mut rx), "abc");
    }

    #[tokio::test]
    async fn test_streaming_failure_after_tokens_is_not_retried() {
        let llm = Arc::new(FlakyLlm {
            failures: Mutex::new(0),
            tokens: vec!["par", "tial"],
            error_after_tokens: true,
        });
        let (tx, mut rx) = mpsc::channel(16);
        let reply = service(llm)
            .complete_streaming(&ChatSettings::default(), &[], &ContextBundle::empty("t"), "hi", &tx)
            .await
            .unwrap();
        assert!(reply.degraded);
        assert!(reply.content.starts_with("partial\n\nSorry"));
        assert_eq!(drain(&mut rx), reply.content);
    }

    #[tokio::test]
    async fn test_streaming_cancelled_when_sink_closes() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let result = service(FlakyLlm::new(0, vec!["a"]))
            .complete_streaming(&ChatSettings::default(), &[], &ContextBundle::empty("t"), "hi", &tx)
            .await;
        assert_eq!(result.unwrap_err(), ChatError::Cancelled);
    }
}

//! Streaming types for LLM responses

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::{CompletionResponse, FinishReason, TokenUsage};
use crate::chat::error::LlmError;

/// Capacity of the channel between the HTTP reader task and the consumer
pub const STREAM_BUFFER: usize = 64;

/// A chunk of streamed LLM response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Delta content (text being generated)
    #[serde(default)]
    pub content: String,
    /// Finish reason (if this is the final chunk)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Token usage (usually only in final chunk)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason, usage: Option<TokenUsage>) -> Self {
        Self {
            content: String::new(),
            finish_reason: Some(reason),
            usage,
        }
    }

    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }
}

/// Streaming response from an LLM provider.
///
/// Dropping the stream closes the channel; the producing task notices and
/// abandons the HTTP request.
pub struct LlmStream {
    receiver: mpsc::Receiver<Result<StreamChunk, LlmError>>,
}

impl LlmStream {
    /// Create a channel pair for building an LLM stream
    pub fn channel(buffer: usize) -> (LlmStreamSender, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (LlmStreamSender { sender: tx }, Self { receiver: rx })
    }

    /// Collect all chunks into a complete response
    pub async fn collect(mut self) -> Result<CompletionResponse, LlmError> {
        let mut content = String::new();
        let mut finish_reason = None;
        let mut usage = None;

        while let Some(result) = self.receiver.recv().await {
            let chunk = result?;
            content.push_str(&chunk.content);
            if chunk.finish_reason.is_some() {
                finish_reason = chunk.finish_reason;
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
        }

        Ok(CompletionResponse {
            content,
            tool_calls: Vec::new(),
            finish_reason: finish_reason.unwrap_or(FinishReason::Stop),
            usage,
        })
    }
}

impl Stream for LlmStream {
    type Item = Result<StreamChunk, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}

type SendResult = Result<(), mpsc::error::SendError<Result<StreamChunk, LlmError>>>;

/// Sender half for building an LLM stream
#[derive(Clone)]
pub struct LlmStreamSender {
    sender: mpsc::Sender<Result<StreamChunk, LlmError>>,
}

impl LlmStreamSender {
    pub async fn send(&self, chunk: StreamChunk) -> SendResult {
        self.sender.send(Ok(chunk)).await
    }

    pub async fn send_error(&self, error: LlmError) -> SendResult {
        self.sender.send(Err(error)).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> SendResult {
        self.send(StreamChunk::text(text)).await
    }

    /// Resolves once the consumer has dropped the stream
    pub async fn closed(&self) {
        self.sender.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_collect_concatenates_in_order() {
        let (sender, stream) = LlmStream::channel(4);
        tokio::spawn(async move {
            sender.send_text("Hel").await.unwrap();
            sender.send_text("lo").await.unwrap();
            sender
                .send(StreamChunk::finish(FinishReason::Stop, None))
                .await
                .unwrap();
        });
        let response = stream.collect().await.unwrap();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_error_ends_collect() {
        let (sender, stream) = LlmStream::channel(4);
        tokio::spawn(async move {
            sender.send_text("partial").await.unwrap();
            sender.send_error(LlmError::Timeout).await.unwrap();
        });
        assert!(matches!(stream.collect().await, Err(LlmError::Timeout)));
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_sender() {
        let (sender, mut stream) = LlmStream::channel(1);
        sender.send_text("a").await.unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);
        sender.closed().await;
        assert!(sender.is_closed());
        assert!(sender.send_text("b").await.is_err());
    }
}

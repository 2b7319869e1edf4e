use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{ChatMessage, ChunkStream, ClientInfo, Completion, CompletionClient, StreamChunk, TokenUsage};

#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64, cost_usd: Option<f64>) -> Self {
        self.usage = Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_usd,
        });
        self
    }
}

/// Offline client that replays canned replies in order. Once the queue is
/// empty every call returns the fallback reply.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    chunk_delay: Option<Duration>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    provider: String,
}

const MOCK_FINISH: &str =
    r#"{"thoughts":"Nothing to change.","tool_calls":[{"tool_name":"finish_feature","arguments":{}}]}"#;

impl ScriptedClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: ScriptedReply::text(MOCK_FINISH),
            chunk_delay: None,
            requests: Mutex::new(Vec::new()),
            provider: "scripted".to_string(),
        }
    }

    /// The client behind `FACTORY_MOCK_LLM`: finishes immediately.
    pub fn mock() -> Self {
        let mut client = Self::new(Vec::new());
        client.provider = "mock".to_string();
        client
    }

    pub fn with_fallback(mut self, fallback: ScriptedReply) -> Self {
        self.fallback = fallback;
        self
    }

    /// Sleep between streamed chunks, giving cancellation a window.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_reply(&self, messages: Vec<ChatMessage>) -> ScriptedReply {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages);
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn split_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() || current.len() >= 24 {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    fn info(&self) -> ClientInfo {
        ClientInfo {
            provider: self.provider.clone(),
            model: format!("{}-1", self.provider),
        }
    }

    async fn complete_once(&self, messages: Vec<ChatMessage>) -> anyhow::Result<Completion> {
        let reply = self.next_reply(messages);
        Ok(Completion {
            text: reply.text,
            usage: reply.usage,
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let reply = self.next_reply(messages);
        let delay = self.chunk_delay;
        let chunks = split_chunks(&reply.text);
        let usage = reply.usage;
        let stream = stream! {
            let mut cancelled = false;
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                yield Ok::<_, anyhow::Error>(StreamChunk::TextDelta(chunk));
            }
            if cancelled {
                yield Ok(StreamChunk::Done {
                    finish_reason: "cancelled".to_string(),
                    usage: None,
                });
            } else {
                yield Ok(StreamChunk::Done {
                    finish_reason: "stop".to_string(),
                    usage,
                });
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect_stream;

    #[tokio::test]
    async fn replays_in_order_then_falls_back() {
        let client = ScriptedClient::new(vec![
            ScriptedReply::text("first reply"),
            ScriptedReply::text("second").with_usage(4, 2, Some(0.01)),
        ]);
        let (a, _, _) = collect_stream(
            client
                .stream(vec![ChatMessage::user("1")], CancellationToken::new())
                .await
                .expect("stream"),
        )
        .await
        .expect("collect");
        let (b, usage, _) = collect_stream(
            client
                .stream(vec![ChatMessage::user("2")], CancellationToken::new())
                .await
                .expect("stream"),
        )
        .await
        .expect("collect");
        let c = client
            .complete_once(vec![ChatMessage::user("3")])
            .await
            .expect("complete");
        assert_eq!(a, "first reply");
        assert_eq!(b, "second");
        assert_eq!(usage.expect("usage").total_tokens, 6);
        assert!(c.text.contains("finish_feature"));
        assert_eq!(client.request_count(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_stream_before_next_chunk() {
        let client = ScriptedClient::new(vec![ScriptedReply::text("a b c d e f g h")])
            .with_chunk_delay(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let stream = client
            .stream(vec![ChatMessage::user("go")], cancel.clone())
            .await
            .expect("stream");
        cancel.cancel();
        let (text, usage, reason) = collect_stream(stream).await.expect("collect");
        assert!(text.is_empty());
        assert!(usage.is_none());
        assert_eq!(reason, "cancelled");
    }
}

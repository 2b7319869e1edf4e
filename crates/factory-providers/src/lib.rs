use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

mod openai;
mod scripted;

pub use openai::OpenAiCompatibleClient;
pub use scripted::{ScriptedClient, ScriptedReply};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Cost reported by the provider itself, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub provider: String,
    pub model: String,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// A language-model completion service.
///
/// Streaming implementations must check `cancel` before yielding each chunk
/// and end the stream with a `Done { finish_reason: "cancelled" }` chunk once
/// it fires.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn info(&self) -> ClientInfo;

    async fn complete_once(&self, messages: Vec<ChatMessage>) -> anyhow::Result<Completion>;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        if cancel.is_cancelled() {
            return Ok(Box::pin(futures::stream::iter(vec![Ok(StreamChunk::Done {
                finish_reason: "cancelled".to_string(),
                usage: None,
            })])));
        }
        let completion = self.complete_once(messages).await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(completion.text)),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: completion.usage,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

/// Drain a chunk stream into text plus the final usage report.
#[cfg(test)]
pub(crate) async fn collect_stream(mut stream: ChunkStream) -> anyhow::Result<(String, Option<TokenUsage>, String)> {
    use futures::StreamExt;

    let mut text = String::new();
    let mut usage = None;
    let mut finish_reason = "stop".to_string();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta(delta) => text.push_str(&delta),
            StreamChunk::Done {
                finish_reason: reason,
                usage: reported,
            } => {
                finish_reason = reason;
                if reported.is_some() {
                    usage = reported;
                }
            }
        }
    }
    Ok((text, usage, finish_reason))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

impl LlmConfig {
    pub fn model_or_default(&self) -> String {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("gpt-4o-mini")
            .to_string()
    }

    /// Explicit key first, then the provider's conventional env var.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !is_placeholder_api_key(k))
            .or_else(|| env_api_key_for_provider(&self.provider))
    }
}

/// Either a ready client or a configuration to build one from.
#[derive(Clone)]
pub enum CompletionSource {
    Client(Arc<dyn CompletionClient>),
    Config(LlmConfig),
}

impl std::fmt::Debug for CompletionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionSource::Client(client) => {
                let info = client.info();
                write!(f, "Client({}/{})", info.provider, info.model)
            }
            CompletionSource::Config(cfg) => write!(f, "Config({}/{:?})", cfg.provider, cfg.model),
        }
    }
}

impl From<Arc<dyn CompletionClient>> for CompletionSource {
    fn from(client: Arc<dyn CompletionClient>) -> Self {
        CompletionSource::Client(client)
    }
}

impl From<LlmConfig> for CompletionSource {
    fn from(config: LlmConfig) -> Self {
        CompletionSource::Config(config)
    }
}

impl CompletionSource {
    pub fn into_client(self) -> anyhow::Result<Arc<dyn CompletionClient>> {
        match self {
            CompletionSource::Client(client) => Ok(client),
            CompletionSource::Config(config) => build_client(config),
        }
    }
}

/// Resolve a configuration into a client. `FACTORY_MOCK_LLM=1` or the
/// `mock` provider yields an offline scripted client.
pub fn build_client(config: LlmConfig) -> anyhow::Result<Arc<dyn CompletionClient>> {
    let mock_env = std::env::var("FACTORY_MOCK_LLM")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if mock_env || config.provider == "mock" {
        tracing::debug!("using scripted mock completion client");
        return Ok(Arc::new(ScriptedClient::mock()));
    }
    let client = OpenAiCompatibleClient::from_config(&config)?;
    Ok(Arc::new(client))
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => "OPENAI_API_KEY",
        "openrouter" => "OPENROUTER_API_KEY",
        "groq" => "GROQ_API_KEY",
        "mistral" => "MISTRAL_API_KEY",
        "together" => "TOGETHER_API_KEY",
        _ => return None,
    };
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl CompletionClient for Fixed {
        fn info(&self) -> ClientInfo {
            ClientInfo {
                provider: "fixed".to_string(),
                model: "fixed-1".to_string(),
            }
        }

        async fn complete_once(&self, _messages: Vec<ChatMessage>) -> anyhow::Result<Completion> {
            Ok(Completion {
                text: "hello".to_string(),
                usage: Some(TokenUsage {
                    prompt_tokens: 3,
                    completion_tokens: 1,
                    total_tokens: 4,
                    cost_usd: None,
                }),
            })
        }
    }

    #[tokio::test]
    async fn default_stream_wraps_complete_once() {
        let stream = Fixed
            .stream(vec![ChatMessage::user("hi")], CancellationToken::new())
            .await
            .expect("stream");
        let (text, usage, reason) = collect_stream(stream).await.expect("collect");
        assert_eq!(text, "hello");
        assert_eq!(reason, "stop");
        assert_eq!(usage.expect("usage").total_tokens, 4);
    }

    #[tokio::test]
    async fn default_stream_short_circuits_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = Fixed
            .stream(vec![ChatMessage::user("hi")], cancel)
            .await
            .expect("stream");
        let (text, _, reason) = collect_stream(stream).await.expect("collect");
        assert!(text.is_empty());
        assert_eq!(reason, "cancelled");
    }

    #[test]
    fn client_source_is_used_as_is() {
        let client: Arc<dyn CompletionClient> = Arc::new(Fixed);
        let resolved = CompletionSource::from(client)
            .into_client()
            .expect("client");
        assert_eq!(resolved.info().provider, "fixed");
    }

    #[test]
    fn mock_provider_config_builds_scripted_client() {
        let source = CompletionSource::from(LlmConfig {
            provider: "mock".to_string(),
            ..LlmConfig::default()
        });
        let client = source.into_client().expect("client");
        assert_eq!(client.info().provider, "mock");
    }

    #[test]
    fn placeholder_keys_are_ignored() {
        let cfg = LlmConfig {
            provider: "custom".to_string(),
            api_key: Some("placeholder".to_string()),
            ..LlmConfig::default()
        };
        assert!(cfg.resolved_api_key().is_none());
        assert_eq!(cfg.model_or_default(), "gpt-4o-mini");
    }
}

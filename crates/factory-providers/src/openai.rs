use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{ChatMessage, ChunkStream, ClientInfo, Completion, CompletionClient, LlmConfig, StreamChunk, TokenUsage};

/// Client for any `/v1/chat/completions` compatible endpoint.
pub struct OpenAiCompatibleClient {
    provider: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let base = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(default_base_for(&config.provider));
        if !base.starts_with("http://") && !base.starts_with("https://") {
            anyhow::bail!("invalid completion base url `{}`", base);
        }
        let api_key = config.resolved_api_key();
        if api_key.is_none() && config.provider != "ollama" {
            tracing::warn!(
                provider = %config.provider,
                "no API key configured; requests will likely be rejected"
            );
        }
        Ok(Self {
            provider: config.provider.clone(),
            base_url: normalize_base(base),
            api_key,
            model: config.model_or_default(),
            client: Client::new(),
        })
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }
}

fn default_base_for(provider: &str) -> &'static str {
    match provider {
        "openrouter" => "https://openrouter.ai/api/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "mistral" => "https://api.mistral.ai/v1",
        "together" => "https://api.together.xyz/v1",
        "ollama" => "http://127.0.0.1:11434/v1",
        _ => "https://api.openai.com/v1",
    }
}

fn wire_messages(messages: Vec<ChatMessage>) -> Vec<serde_json::Value> {
    messages
        .into_iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect()
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    fn info(&self) -> ClientInfo {
        ClientInfo {
            provider: self.provider.clone(),
            model: self.model.clone(),
        }
    }

    async fn complete_once(&self, messages: Vec<ChatMessage>) -> anyhow::Result<Completion> {
        let body = json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "stream": false,
        });
        let response = self.request(&body).send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("completion request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }

        let text = value
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str());
        match text {
            Some(text) => Ok(Completion {
                text: text.to_string(),
                usage: extract_usage(&value),
            }),
            None => anyhow::bail!(
                "provider returned no completion content for model `{}` (response: {})",
                self.model,
                truncate_for_error(&value.to_string(), 500)
            ),
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let body = json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        let resp = self.request(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "completion stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut frames = SseFrames::default();
            let mut usage: Option<TokenUsage> = None;
            let mut finish_reason = "stop".to_string();
            let mut done = false;
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: usage.take(),
                    };
                    done = true;
                    break;
                }

                let chunk = chunk?;
                frames.push(&chunk);

                while let Some(frame) = frames.next_frame() {
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };
                        if let Some(detail) = extract_openai_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }
                        if let Some(reported) = extract_usage(&value) {
                            usage = Some(reported);
                        }
                        let choices = value
                            .get("choices")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        for choice in choices {
                            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                                finish_reason = reason.to_string();
                            }
                            let text = choice
                                .get("delta")
                                .and_then(|d| d.get("content"))
                                .and_then(|v| v.as_str())
                                .unwrap_or_default();
                            if !text.is_empty() {
                                yield StreamChunk::TextDelta(text.to_string());
                            }
                        }
                    }
                }
            }
            if !done {
                yield StreamChunk::Done {
                    finish_reason,
                    usage,
                };
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Splits a server-sent event byte stream into frames. Bytes are held
/// until their frame is complete, so a character may span chunks.
#[derive(Debug, Default)]
struct SseFrames {
    buffer: Vec<u8>,
}

impl SseFrames {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Option<String> {
        let pos = self.buffer.windows(2).position(|w| w == b"\n\n")?;
        let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
        Some(String::from_utf8_lossy(&frame[..pos]).into_owned())
    }
}

fn normalize_base(input: &str) -> String {
    if input.trim_end_matches('/').ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    let cost_usd = usage.get("cost").and_then(|v| v.as_f64());
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cost_usd,
    })
}

fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_appends_v1_once() {
        assert_eq!(normalize_base("https://api.example.com"), "https://api.example.com/v1");
        assert_eq!(normalize_base("https://api.example.com/v1/"), "https://api.example.com/v1");
    }

    #[test]
    fn usage_falls_back_to_sum_and_reads_cost() {
        let value = json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5, "cost": 0.02}});
        let usage = extract_usage(&value).expect("usage");
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.cost_usd, Some(0.02));
        assert!(extract_usage(&json!({"usage": null})).is_none());
    }

    #[test]
    fn rejects_non_http_base_url() {
        let cfg = LlmConfig {
            base_url: Some("ftp://nope".to_string()),
            api_key: Some("sk-test".to_string()),
            ..LlmConfig::default()
        };
        assert!(OpenAiCompatibleClient::from_config(&cfg).is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate_for_error("ééééé", 3);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn frames_reassemble_characters_split_across_chunks() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"ok 🦀\"}}]}\n\n".as_bytes();
        let crab = event.iter().position(|b| *b == 0xF0).expect("emoji start");
        let mut frames = SseFrames::default();

        frames.push(&event[..crab + 2]);
        assert!(frames.next_frame().is_none());
        frames.push(&event[crab + 2..]);
        frames.push(b"data: [DONE]\n\n");

        let first = frames.next_frame().expect("first frame");
        assert!(first.contains("ok 🦀"));
        assert!(!first.contains('\u{FFFD}'));
        assert_eq!(frames.next_frame().as_deref(), Some("data: [DONE]"));
        assert!(frames.next_frame().is_none());
    }
}

// Agent interaction loop
// Streams one completion per turn, parses the agent's JSON reply and runs
// its tool calls against the project. File edits of one turn become one
// proposal.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use factory_observability::redact_text;
use factory_providers::{ChatMessage, ClientInfo, CompletionClient, StreamChunk, TokenUsage};
use factory_types::{LlmMeta, ProposedChange, RunEventKind, UsageDelta};

use crate::orchestrator::{RunContext, RunOrchestrator};
use crate::sandbox::{normalize_relative, resolve_in_root};

const MAX_READ_BYTES: usize = 64 * 1024;
const MAX_LISTED_FILES: usize = 500;

const SYSTEM_PROMPT: &str = r#"You are a software agent working inside a project directory.
Every reply must be a single JSON object of the form
{"thoughts": "<short reasoning>", "tool_calls": [{"tool_name": "<tool>", "arguments": {...}}]}

Tools:
- read_files {"paths": ["relative/path", ...]}
- list_files {"path": "relative/dir"}            (optional path, defaults to the project root)
- write_file {"path": "relative/path", "content": "<full file content>"}
- delete_file {"path": "relative/path"}
- rename_file {"from": "old/path", "to": "new/path"}
- finish_feature {"summary": "<what was done>"}  (alias: finish_spec)
- block_feature {"reason": "<why you cannot continue>"}  (alias: block_task)

File edits are proposed for human review, they are not applied immediately.
Tool results arrive in the next user message."#;

const INVALID_REPLY: &str =
    "Your previous reply was not a valid JSON object with `thoughts` and `tool_calls`. Reply again using that format.";

#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(default)]
    thoughts: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    #[serde(alias = "name")]
    tool_name: String,
    #[serde(default)]
    arguments: Value,
}

/// How the agent loop ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AgentOutcome {
    Finished { summary: Option<String> },
    Blocked { reason: String },
    TurnsExhausted { turns: u32 },
    /// The abort signal fired mid-loop
    Aborted,
}

impl AgentOutcome {
    pub(crate) fn to_payload(&self, proposals: &[String]) -> Value {
        match self {
            AgentOutcome::Finished { summary } => json!({
                "outcome": "finished",
                "summary": summary,
                "proposals": proposals,
            }),
            AgentOutcome::Blocked { reason } => json!({
                "outcome": "blocked",
                "reason": reason,
                "proposals": proposals,
            }),
            AgentOutcome::TurnsExhausted { turns } => json!({
                "outcome": "max_turns",
                "turns": turns,
                "proposals": proposals,
            }),
            AgentOutcome::Aborted => json!({ "outcome": "aborted" }),
        }
    }
}

struct ToolStep {
    results: Vec<Value>,
    outcome: Option<AgentOutcome>,
}

type ToolResult = std::result::Result<Value, String>;

pub(crate) struct AgentLoop {
    orchestrator: RunOrchestrator,
    ctx: Arc<RunContext>,
    client: Arc<dyn CompletionClient>,
    context: String,
    proposals: Vec<String>,
}

impl AgentLoop {
    pub(crate) fn new(
        orchestrator: RunOrchestrator,
        ctx: Arc<RunContext>,
        client: Arc<dyn CompletionClient>,
        context: String,
    ) -> Self {
        Self {
            orchestrator,
            ctx,
            client,
            context,
            proposals: Vec::new(),
        }
    }

    pub(crate) fn proposals(&self) -> &[String] {
        &self.proposals
    }

    pub(crate) async fn run(&mut self) -> anyhow::Result<AgentOutcome> {
        let info = self.client.info();
        let max_turns = self.orchestrator.config.max_turns.max(1);
        let mut system = SYSTEM_PROMPT.to_string();
        if !self.context.trim().is_empty() {
            system.push_str("\n\nContext:\n");
            system.push_str(&self.context);
        }
        let mut messages = vec![
            ChatMessage::system(system),
            ChatMessage::user("Begin working. Respond with a single JSON object."),
        ];

        for turn in 1..=max_turns {
            if self.ctx.abort.is_cancelled() {
                return Ok(AgentOutcome::Aborted);
            }
            let Some(reply) = self.complete_turn(turn, &info, &messages).await? else {
                return Ok(AgentOutcome::Aborted);
            };
            messages.push(ChatMessage::assistant(reply.clone()));
            self.ctx.set_progress(f64::from(turn) / f64::from(max_turns));

            let Some(parsed) = parse_reply(&reply) else {
                tracing::debug!(
                    run_id = %self.ctx.run_id(),
                    turn,
                    reply = %redact_text(&reply),
                    "agent reply was not valid JSON"
                );
                messages.push(ChatMessage::user(INVALID_REPLY));
                continue;
            };
            self.ctx.bus.publish(RunEventKind::ProgressSnapshot {
                progress: self.ctx.progress(),
                message: parsed.thoughts.clone().filter(|t| !t.trim().is_empty()),
                usage: self.ctx.usage(),
            });

            let step = self.execute_tools(turn, parsed.tool_calls).await;
            if let Some(outcome) = step.outcome {
                return Ok(outcome);
            }
            messages.push(ChatMessage::user(serde_json::to_string(&json!({
                "tool_results": step.results
            }))?));
        }
        Ok(AgentOutcome::TurnsExhausted { turns: max_turns })
    }

    /// Stream one reply. `None` means the run was aborted mid-stream.
    async fn complete_turn(
        &self,
        turn: u32,
        info: &ClientInfo,
        messages: &[ChatMessage],
    ) -> anyhow::Result<Option<String>> {
        let bus = &self.ctx.bus;
        bus.publish(RunEventKind::LlmStart {
            turn,
            provider: Some(info.provider.clone()),
            model: Some(info.model.clone()),
        });
        let started = Instant::now();
        let mut stream = self.client.stream(messages.to_vec(), self.ctx.abort.clone()).await?;

        let mut text = String::new();
        let mut finish_reason = None;
        let mut usage = None;
        while let Some(chunk) = stream.next().await {
            if self.ctx.abort.is_cancelled() {
                return Ok(None);
            }
            match chunk? {
                StreamChunk::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    bus.publish(RunEventKind::LlmDelta { turn, text: delta });
                }
                StreamChunk::Done {
                    finish_reason: reason,
                    usage: reported,
                } => {
                    finish_reason = Some(reason);
                    if reported.is_some() {
                        usage = reported;
                    }
                }
            }
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        bus.publish(RunEventKind::LlmEnd {
            turn,
            finish_reason: finish_reason.clone(),
            duration_ms,
        });
        if finish_reason.as_deref() == Some("cancelled") || self.ctx.abort.is_cancelled() {
            return Ok(None);
        }
        self.record_usage(info, usage, duration_ms)?;
        Ok(Some(text))
    }

    fn record_usage(&self, info: &ClientInfo, usage: Option<TokenUsage>, duration_ms: u64) -> crate::error::Result<()> {
        let delta = match usage {
            Some(usage) => {
                let cost_usd = usage
                    .cost_usd
                    .filter(|c| c.is_finite() && *c >= 0.0)
                    .or_else(|| {
                        self.orchestrator.pricing.estimate_cost(
                            &info.provider,
                            &info.model,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                        )
                    });
                UsageDelta {
                    requests: 1,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: (usage.total_tokens > 0).then_some(usage.total_tokens),
                    cost_usd,
                }
            }
            None => UsageDelta {
                requests: 1,
                ..UsageDelta::default()
            },
        };
        let meta = LlmMeta {
            provider: Some(info.provider.clone()),
            model: Some(info.model.clone()),
            duration_ms: Some(duration_ms),
        };
        self.orchestrator
            .add_usage_to_run(self.ctx.run_id(), delta, Some(meta))?;
        Ok(())
    }

    async fn execute_tools(&mut self, turn: u32, calls: Vec<ToolCall>) -> ToolStep {
        let mut results = Vec::new();
        let mut pending = Vec::new();
        let mut outcome = None;

        for call in calls {
            let name = call.tool_name.trim().to_string();
            let args = &call.arguments;
            let result = match name.as_str() {
                "read_files" => self.read_files(args).await,
                "list_files" => self.list_files(args).await,
                "write_file" => self.stage_write(args, &mut pending).await,
                "delete_file" => stage_delete(args, &mut pending),
                "rename_file" => self.stage_rename(args, &mut pending).await,
                "finish_feature" | "finish_spec" => {
                    outcome = Some(AgentOutcome::Finished {
                        summary: str_arg(args, "summary"),
                    });
                    Ok(json!("finishing"))
                }
                "block_feature" | "block_task" => {
                    outcome = Some(AgentOutcome::Blocked {
                        reason: str_arg(args, "reason").unwrap_or_else(|| "blocked by agent".to_string()),
                    });
                    Ok(json!("blocking"))
                }
                other => Err(format!("unknown tool `{other}`")),
            };
            results.push(match result {
                Ok(output) => json!({ "tool": name, "ok": true, "output": output }),
                Err(error) => json!({ "tool": name, "ok": false, "error": error }),
            });
            if outcome.is_some() {
                break;
            }
        }

        if !pending.is_empty() {
            let title = format!("Turn {turn} changes");
            match self
                .orchestrator
                .propose_changes(self.ctx.run_id(), pending, Some(title))
                .await
            {
                Ok(proposal_id) => {
                    results.push(json!({ "tool": "propose_changes", "ok": true, "output": { "proposalId": proposal_id } }));
                    self.proposals.push(proposal_id);
                }
                Err(err) => {
                    tracing::warn!(run_id = %self.ctx.run_id(), "agent proposal rejected: {}", err);
                    results.push(json!({ "tool": "propose_changes", "ok": false, "error": err.to_string() }));
                }
            }
        }

        ToolStep { results, outcome }
    }

    fn root(&self) -> &Path {
        self.ctx.project_root()
    }

    async fn read_files(&self, args: &Value) -> ToolResult {
        let mut paths: Vec<String> = args
            .get("paths")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(single) = str_arg(args, "path") {
            paths.push(single);
        }
        if paths.is_empty() {
            return Err("read_files requires `paths`".to_string());
        }
        let mut files = serde_json::Map::new();
        for path in paths {
            let entry = match resolve_in_root(self.root(), &path).await {
                Ok(target) => match tokio::fs::read_to_string(&target).await {
                    Ok(content) => json!({ "content": truncate_utf8(&content, MAX_READ_BYTES) }),
                    Err(err) => json!({ "error": err.to_string() }),
                },
                Err(err) => json!({ "error": err.to_string() }),
            };
            files.insert(path, entry);
        }
        Ok(Value::Object(files))
    }

    async fn list_files(&self, args: &Value) -> ToolResult {
        let start = match str_arg(args, "path").filter(|p| !matches!(p.trim(), "" | "." | "./")) {
            Some(path) => {
                resolve_in_root(self.root(), &path).await.map_err(|e| e.to_string())?;
                Some(normalize_relative(&path).map_err(|e| e.to_string())?)
            }
            None => None,
        };
        let mut pending_dirs = vec![start.clone()];
        let mut listed = Vec::new();
        while let Some(dir) = pending_dirs.pop() {
            let abs = match &dir {
                Some(rel) => self.root().join(rel),
                None => self.root().to_path_buf(),
            };
            let mut entries = match tokio::fs::read_dir(&abs).await {
                Ok(entries) => entries,
                Err(err) if dir == start => return Err(err.to_string()),
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if name == ".git" {
                    continue;
                }
                let rel = match &dir {
                    Some(parent) => format!("{parent}/{name}"),
                    None => name,
                };
                // symlinks are listed, never followed
                match entry.file_type().await {
                    Ok(kind) if kind.is_dir() => pending_dirs.push(Some(rel)),
                    Ok(_) => listed.push(rel),
                    Err(_) => {}
                }
                if listed.len() >= MAX_LISTED_FILES {
                    break;
                }
            }
            if listed.len() >= MAX_LISTED_FILES {
                break;
            }
        }
        listed.sort();
        Ok(json!(listed))
    }

    async fn stage_write(&self, args: &Value, pending: &mut Vec<ProposedChange>) -> ToolResult {
        let path = str_arg(args, "path").ok_or("write_file requires `path`")?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or("write_file requires `content`")?;
        let rel = normalize_relative(&path).map_err(|e| e.to_string())?;
        let exists = tokio::fs::try_exists(self.root().join(&rel)).await.unwrap_or(false);
        pending.push(if exists {
            ProposedChange::modified(rel.clone(), content)
        } else {
            ProposedChange::added(rel.clone(), content)
        });
        Ok(json!({ "staged": rel }))
    }

    async fn stage_rename(&self, args: &Value, pending: &mut Vec<ProposedChange>) -> ToolResult {
        let from = str_arg(args, "from").ok_or("rename_file requires `from`")?;
        let to = str_arg(args, "to").ok_or("rename_file requires `to`")?;
        let from = normalize_relative(&from).map_err(|e| e.to_string())?;
        let to = normalize_relative(&to).map_err(|e| e.to_string())?;
        let source = resolve_in_root(self.root(), &from).await.map_err(|e| e.to_string())?;
        let content = tokio::fs::read_to_string(&source)
            .await
            .map_err(|e| format!("cannot read `{from}`: {e}"))?;
        pending.push(ProposedChange::deleted(from.clone()));
        pending.push(ProposedChange::added(to.clone(), content));
        Ok(json!({ "staged": [from, to] }))
    }
}

fn stage_delete(args: &Value, pending: &mut Vec<ProposedChange>) -> ToolResult {
    let path = str_arg(args, "path").ok_or("delete_file requires `path`")?;
    let rel = normalize_relative(&path).map_err(|e| e.to_string())?;
    pending.push(ProposedChange::deleted(rel.clone()));
    Ok(json!({ "staged": rel }))
}

fn str_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse the agent reply, tolerating code fences and prose around the
/// JSON object.
fn parse_reply(text: &str) -> Option<AgentReply> {
    if let Ok(reply) = serde_json::from_str::<AgentReply>(text.trim()) {
        return Some(reply);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn truncate_utf8(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }
    let mut end = max_bytes;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &input[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_reply() {
        let text = "Sure.\n```json\n{\"thoughts\":\"add readme\",\"tool_calls\":[{\"tool_name\":\"write_file\",\"arguments\":{\"path\":\"README.md\",\"content\":\"hi\"}}]}\n```";
        let reply = parse_reply(text).expect("reply");
        assert_eq!(reply.thoughts.as_deref(), Some("add readme"));
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].tool_name, "write_file");
        assert_eq!(reply.tool_calls[0].arguments["path"], "README.md");
    }

    #[test]
    fn accepts_name_alias_and_missing_arguments() {
        let reply = parse_reply(r#"{"tool_calls":[{"name":"finish_spec"}]}"#).expect("reply");
        assert_eq!(reply.tool_calls[0].tool_name, "finish_spec");
        assert!(reply.tool_calls[0].arguments.is_null());
        assert!(reply.thoughts.is_none());
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_reply("I will now edit the file.").is_none());
        assert!(parse_reply("} nope {").is_none());
    }

    #[test]
    fn delete_tool_validates_paths() {
        let mut pending = Vec::new();
        assert!(stage_delete(&json!({"path": "../etc/passwd"}), &mut pending).is_err());
        assert!(stage_delete(&json!({}), &mut pending).is_err());
        stage_delete(&json!({"path": "./src/old.rs"}), &mut pending).expect("staged");
        assert_eq!(pending, vec![ProposedChange::deleted("src/old.rs")]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ééé";
        assert_eq!(truncate_utf8(text, 3), "é...[truncated]");
        assert_eq!(truncate_utf8(text, 10), text);
    }

    #[test]
    fn payload_names_outcome() {
        let payload = AgentOutcome::Blocked {
            reason: "needs credentials".to_string(),
        }
        .to_payload(&["prop_1".to_string()]);
        assert_eq!(payload["outcome"], "blocked");
        assert_eq!(payload["proposals"][0], "prop_1");
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChangeCounts, ChangeKind, LlmMeta, ProposalState, RunStatus, UsageDelta, UsageStats};

/// One event on a run's bus. `seq` is assigned by the bus and strictly
/// increases per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub seq: u64,
    pub run_id: String,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

impl RunEvent {
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffPayload {
    pub path: String,
    pub status: ChangeKind,
    /// Unified diff text, empty for deletions
    pub diff: String,
}

/// Closed set of event kinds a run can emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum RunEventKind {
    #[serde(rename = "run/started")]
    RunStarted {
        project_id: String,
        task_id: Option<String>,
        feature_id: Option<String>,
        budget_usd: Option<f64>,
    },
    #[serde(rename = "run/progress")]
    RunProgress { message: String },
    #[serde(rename = "run/progress/snapshot")]
    ProgressSnapshot {
        /// Fraction in `[0, 0.99]` while the agent loop is running
        progress: Option<f64>,
        message: Option<String>,
        usage: UsageStats,
    },
    #[serde(rename = "run/usage")]
    RunUsage {
        usage: UsageStats,
        delta: UsageDelta,
        llm: Option<LlmMeta>,
    },
    #[serde(rename = "run/budget-exceeded")]
    BudgetExceeded { budget_usd: f64, cost_usd: f64 },
    #[serde(rename = "run/completed")]
    RunCompleted { payload: Option<Value> },
    #[serde(rename = "run/cancelled")]
    RunCancelled { reason: Option<String> },
    #[serde(rename = "run/error")]
    RunError { message: String },
    #[serde(rename = "run/log")]
    RunLog { level: String, message: String },
    #[serde(rename = "llm/start")]
    LlmStart {
        turn: u32,
        provider: Option<String>,
        model: Option<String>,
    },
    #[serde(rename = "llm/delta")]
    LlmDelta { turn: u32, text: String },
    #[serde(rename = "llm/end")]
    LlmEnd {
        turn: u32,
        finish_reason: Option<String>,
        duration_ms: u64,
    },
    #[serde(rename = "file/proposal")]
    FileProposal {
        proposal_id: String,
        title: Option<String>,
        counts: ChangeCounts,
    },
    #[serde(rename = "file/diff")]
    FileDiff {
        proposal_id: String,
        files: Vec<DiffPayload>,
    },
    #[serde(rename = "file/proposal-state")]
    ProposalStateChanged {
        proposal_id: String,
        state: ProposalState,
        accepted: Vec<String>,
        rejected: Vec<String>,
    },
    #[serde(rename = "git/commit")]
    GitCommit {
        proposal_id: String,
        commit_sha: String,
        branch: String,
        message: String,
        files: Vec<String>,
        /// False when there was nothing new to commit
        created: bool,
    },
    /// Internal signal that follows the first terminal event and triggers cleanup
    #[serde(rename = "run/complete")]
    RunComplete { status: RunStatus },
}

impl RunEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEventKind::RunStarted { .. } => "run/started",
            RunEventKind::RunProgress { .. } => "run/progress",
            RunEventKind::ProgressSnapshot { .. } => "run/progress/snapshot",
            RunEventKind::RunUsage { .. } => "run/usage",
            RunEventKind::BudgetExceeded { .. } => "run/budget-exceeded",
            RunEventKind::RunCompleted { .. } => "run/completed",
            RunEventKind::RunCancelled { .. } => "run/cancelled",
            RunEventKind::RunError { .. } => "run/error",
            RunEventKind::RunLog { .. } => "run/log",
            RunEventKind::LlmStart { .. } => "llm/start",
            RunEventKind::LlmDelta { .. } => "llm/delta",
            RunEventKind::LlmEnd { .. } => "llm/end",
            RunEventKind::FileProposal { .. } => "file/proposal",
            RunEventKind::FileDiff { .. } => "file/diff",
            RunEventKind::ProposalStateChanged { .. } => "file/proposal-state",
            RunEventKind::GitCommit { .. } => "git/commit",
            RunEventKind::RunComplete { .. } => "run/complete",
        }
    }

    /// Status implied by a user-visible terminal event
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            RunEventKind::RunCompleted { .. } => Some(RunStatus::Completed),
            RunEventKind::RunCancelled { .. } => Some(RunStatus::Cancelled),
            RunEventKind::RunError { .. } => Some(RunStatus::Errored),
            _ => None,
        }
    }

    pub fn log(level: &str, message: impl Into<String>) -> Self {
        RunEventKind::RunLog {
            level: level.to_string(),
            message: message.into(),
        }
    }
}

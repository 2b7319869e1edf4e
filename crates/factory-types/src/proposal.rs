use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change a file entry represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// A candidate edit submitted to `propose_changes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedChange {
    /// Project-relative path
    pub path: String,
    pub status: ChangeKind,
    /// Required for added/modified, ignored for deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
}

impl ProposedChange {
    pub fn added(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: ChangeKind::Added,
            new_content: Some(content.into()),
        }
    }

    pub fn modified(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: ChangeKind::Modified,
            new_content: Some(content.into()),
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: ChangeKind::Deleted,
            new_content: None,
        }
    }
}

/// One contiguous block of a unified diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    /// Lines prefixed with ' ', '+' or '-'
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    /// Full unified diff text including headers
    pub unified: String,
    pub hunks: Vec<DiffHunk>,
}

/// Per-file review decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileReview {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    pub status: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    /// Absent for deletions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<FileDiff>,
    #[serde(default)]
    pub review: FileReview,
}

/// Overall proposal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Staged,
    Partial,
    Accepted,
    Rejected,
}

impl ProposalState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalState::Staged => "staged",
            ProposalState::Partial => "partial",
            ProposalState::Accepted => "accepted",
            ProposalState::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub files: Vec<FileEntry>,
    pub state: ProposalState,
    pub created_at: DateTime<Utc>,
    /// Set once the proposal has been finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

impl Proposal {
    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts::from_files(&self.files)
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn accepted_files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files
            .iter()
            .filter(|f| f.review == FileReview::Accepted)
    }

    /// Finalized or fully rejected proposals no longer own their staged paths.
    pub fn is_live(&self) -> bool {
        self.commit_sha.is_none() && self.state != ProposalState::Rejected
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub total: usize,
}

impl ChangeCounts {
    pub fn from_files(files: &[FileEntry]) -> Self {
        let mut counts = ChangeCounts::default();
        for file in files {
            match file.status {
                ChangeKind::Added => counts.added += 1,
                ChangeKind::Modified => counts.modified += 1,
                ChangeKind::Deleted => counts.deleted += 1,
            }
        }
        counts.total = files.len();
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalSummary {
    pub proposal_id: String,
    pub state: ProposalState,
    pub counts: ChangeCounts,
    pub accepted: usize,
    pub rejected: usize,
}

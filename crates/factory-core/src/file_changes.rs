use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use factory_types::{
    new_id, ChangeKind, DiffPayload, FileEntry, FileReview, Proposal, ProposalState, ProposalSummary,
    ProposedChange,
};

use crate::diff::unified_diff;
use crate::error::{FactoryError, Result};
use crate::sandbox::{normalize_relative, resolve_in_root};

/// Outcome of a review transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub proposal_id: String,
    pub state: ProposalState,
    /// All files currently accepted / rejected
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    /// Files whose review decision changed in this call
    pub changed: Vec<String>,
}

/// Builds proposals from candidate edits and tracks their review state.
#[derive(Default)]
pub struct FileChangeManager {
    proposals: RwLock<HashMap<String, Proposal>>,
    /// Proposals with a finalize in flight. Locked after `proposals`.
    finalizing: Mutex<HashSet<String>>,
}

async fn read_current(target: &Path, rel: &str) -> Option<String> {
    match tokio::fs::read_to_string(target).await {
        Ok(content) => Some(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            tracing::warn!(path = %rel, "could not read current content for diff: {}", err);
            None
        }
    }
}

fn dedupe_keep_last(changes: Vec<ProposedChange>) -> Result<Vec<ProposedChange>> {
    let mut out: Vec<ProposedChange> = Vec::with_capacity(changes.len());
    for mut change in changes {
        change.path = normalize_relative(&change.path)?;
        if change.status != ChangeKind::Deleted && change.new_content.is_none() {
            return Err(FactoryError::InvalidInput(format!(
                "{} change for `{}` has no content",
                change.status.as_str(),
                change.path
            )));
        }
        out.retain(|existing| existing.path != change.path);
        out.push(change);
    }
    Ok(out)
}

fn derive_state(files: &[FileEntry]) -> ProposalState {
    let rejected = files.iter().filter(|f| f.review == FileReview::Rejected).count();
    let accepted = files.iter().filter(|f| f.review == FileReview::Accepted).count();
    if rejected == files.len() {
        ProposalState::Rejected
    } else if accepted > 0 && accepted + rejected == files.len() {
        ProposalState::Accepted
    } else if accepted > 0 || rejected > 0 {
        ProposalState::Partial
    } else {
        ProposalState::Staged
    }
}

fn paths_with(files: &[FileEntry], review: FileReview) -> Vec<String> {
    files
        .iter()
        .filter(|f| f.review == review)
        .map(|f| f.path.clone())
        .collect()
}

fn ensure_reviewable(proposal: &Proposal) -> Result<()> {
    if proposal.commit_sha.is_some() {
        return Err(FactoryError::InvalidTransition(format!(
            "proposal {} is already finalized",
            proposal.id
        )));
    }
    if proposal.state == ProposalState::Rejected {
        return Err(FactoryError::InvalidTransition(format!(
            "proposal {} was rejected",
            proposal.id
        )));
    }
    Ok(())
}

impl FileChangeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a proposal, diffing each non-deleted file against the current
    /// project content. Duplicate paths keep the last change. A path already
    /// owned by another live proposal of the same run is a conflict.
    pub async fn create_proposal(
        &self,
        run_id: &str,
        project_root: &Path,
        changes: Vec<ProposedChange>,
        title: Option<String>,
    ) -> Result<Proposal> {
        if changes.is_empty() {
            return Err(FactoryError::InvalidInput("no changes proposed".to_string()));
        }
        let changes = dedupe_keep_last(changes)?;

        {
            let proposals = self.proposals.read().await;
            for existing in proposals.values().filter(|p| p.run_id == run_id && p.is_live()) {
                if let Some(clash) = changes
                    .iter()
                    .find(|c| existing.files.iter().any(|f| f.path == c.path))
                {
                    return Err(FactoryError::ProposalConflict(format!(
                        "`{}` is already staged by proposal {}",
                        clash.path, existing.id
                    )));
                }
            }
        }

        let mut files = Vec::with_capacity(changes.len());
        for change in changes {
            let target = resolve_in_root(project_root, &change.path).await?;
            let diff = match change.status {
                ChangeKind::Deleted => None,
                ChangeKind::Added => Some(unified_diff(
                    &change.path,
                    None,
                    change.new_content.as_deref().unwrap_or_default(),
                )),
                ChangeKind::Modified => {
                    let current = read_current(&target, &change.path).await;
                    Some(unified_diff(
                        &change.path,
                        current.as_deref(),
                        change.new_content.as_deref().unwrap_or_default(),
                    ))
                }
            };
            files.push(FileEntry {
                path: change.path,
                status: change.status,
                new_content: match change.status {
                    ChangeKind::Deleted => None,
                    _ => change.new_content,
                },
                diff,
                review: FileReview::Pending,
            });
        }

        let proposal = Proposal {
            id: new_id("prop"),
            run_id: run_id.to_string(),
            title,
            files,
            state: ProposalState::Staged,
            created_at: Utc::now(),
            commit_sha: None,
        };

        let mut proposals = self.proposals.write().await;
        // re-check under the write lock; a concurrent proposal may have won
        for existing in proposals.values().filter(|p| p.run_id == run_id && p.is_live()) {
            if let Some(clash) = proposal
                .files
                .iter()
                .find(|c| existing.files.iter().any(|f| f.path == c.path))
            {
                return Err(FactoryError::ProposalConflict(format!(
                    "`{}` is already staged by proposal {}",
                    clash.path, existing.id
                )));
            }
        }
        proposals.insert(proposal.id.clone(), proposal.clone());
        Ok(proposal)
    }

    /// Forget every proposal of a run. Used when a finished run is evicted.
    pub async fn remove_run(&self, run_id: &str) -> usize {
        let mut proposals = self.proposals.write().await;
        let before = proposals.len();
        proposals.retain(|_, p| p.run_id != run_id);
        before - proposals.len()
    }

    pub async fn get(&self, proposal_id: &str) -> Result<Proposal> {
        self.proposals
            .read()
            .await
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| FactoryError::ProposalNotFound(proposal_id.to_string()))
    }

    pub async fn list_for_run(&self, run_id: &str) -> Vec<Proposal> {
        let mut out: Vec<Proposal> = self
            .proposals
            .read()
            .await
            .values()
            .filter(|p| p.run_id == run_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn list_proposal_files(&self, proposal_id: &str) -> Result<Vec<FileEntry>> {
        Ok(self.get(proposal_id).await?.files)
    }

    pub async fn get_summary(&self, proposal_id: &str) -> Result<ProposalSummary> {
        let proposal = self.get(proposal_id).await?;
        Ok(ProposalSummary {
            proposal_id: proposal.id.clone(),
            state: proposal.state,
            counts: proposal.counts(),
            accepted: paths_with(&proposal.files, FileReview::Accepted).len(),
            rejected: paths_with(&proposal.files, FileReview::Rejected).len(),
        })
    }

    pub async fn get_proposal_diff(&self, proposal_id: &str) -> Result<Vec<DiffPayload>> {
        let proposal = self.get(proposal_id).await?;
        Ok(proposal
            .files
            .iter()
            .map(|f| DiffPayload {
                path: f.path.clone(),
                status: f.status,
                diff: f.diff.as_ref().map(|d| d.unified.clone()).unwrap_or_default(),
            })
            .collect())
    }

    async fn transition<F>(&self, proposal_id: &str, apply: F) -> Result<Transition>
    where
        F: FnOnce(&mut Proposal) -> Result<Vec<String>>,
    {
        let mut proposals = self.proposals.write().await;
        let proposal = proposals
            .get_mut(proposal_id)
            .ok_or_else(|| FactoryError::ProposalNotFound(proposal_id.to_string()))?;
        ensure_reviewable(proposal)?;
        if self.finalizing.lock().await.contains(proposal_id) {
            return Err(FactoryError::InvalidTransition(format!(
                "proposal {proposal_id} is being finalized"
            )));
        }
        let changed = apply(proposal)?;
        proposal.state = derive_state(&proposal.files);
        Ok(Transition {
            proposal_id: proposal.id.clone(),
            state: proposal.state,
            accepted: paths_with(&proposal.files, FileReview::Accepted),
            rejected: paths_with(&proposal.files, FileReview::Rejected),
            changed,
        })
    }

    /// Accept every file that has not been rejected.
    pub async fn accept_all(&self, proposal_id: &str) -> Result<Transition> {
        self.transition(proposal_id, |proposal| {
            let mut changed = Vec::new();
            for file in proposal.files.iter_mut() {
                if file.review == FileReview::Pending {
                    file.review = FileReview::Accepted;
                    changed.push(file.path.clone());
                }
            }
            Ok(changed)
        })
        .await
    }

    /// Accept a subset. Naming a rejected file is an invalid transition.
    pub async fn accept_files(&self, proposal_id: &str, paths: &[String]) -> Result<Transition> {
        let targets = normalize_targets(paths)?;
        self.transition(proposal_id, |proposal| {
            resolve_targets(proposal, &targets)?;
            if let Some(file) = proposal
                .files
                .iter()
                .find(|f| targets.contains(&f.path) && f.review == FileReview::Rejected)
            {
                return Err(FactoryError::InvalidTransition(format!(
                    "`{}` was rejected and cannot be accepted",
                    file.path
                )));
            }
            let mut changed = Vec::new();
            for file in proposal.files.iter_mut().filter(|f| targets.contains(&f.path)) {
                if file.review == FileReview::Pending {
                    file.review = FileReview::Accepted;
                    changed.push(file.path.clone());
                }
            }
            Ok(changed)
        })
        .await
    }

    /// Reject the whole proposal, including files accepted earlier.
    pub async fn reject_all(&self, proposal_id: &str) -> Result<Transition> {
        self.transition(proposal_id, |proposal| {
            let mut changed = Vec::new();
            for file in proposal.files.iter_mut() {
                if file.review != FileReview::Rejected {
                    file.review = FileReview::Rejected;
                    changed.push(file.path.clone());
                }
            }
            Ok(changed)
        })
        .await
    }

    /// Reject a subset. Rejected files are excluded from later acceptance.
    pub async fn reject_files(&self, proposal_id: &str, paths: &[String]) -> Result<Transition> {
        let targets = normalize_targets(paths)?;
        self.transition(proposal_id, |proposal| {
            resolve_targets(proposal, &targets)?;
            let mut changed = Vec::new();
            for file in proposal.files.iter_mut().filter(|f| targets.contains(&f.path)) {
                if file.review != FileReview::Rejected {
                    file.review = FileReview::Rejected;
                    changed.push(file.path.clone());
                }
            }
            Ok(changed)
        })
        .await
    }

    /// Reserve a proposal with accepted files for commit. A second caller
    /// fails until the reservation is released or the commit is recorded,
    /// and review transitions are refused meanwhile.
    pub async fn begin_finalize(&self, proposal_id: &str) -> Result<Proposal> {
        let proposals = self.proposals.write().await;
        let proposal = proposals
            .get(proposal_id)
            .ok_or_else(|| FactoryError::ProposalNotFound(proposal_id.to_string()))?;
        if proposal.commit_sha.is_some() {
            return Err(FactoryError::InvalidTransition(format!(
                "proposal {proposal_id} is already finalized"
            )));
        }
        if !matches!(proposal.state, ProposalState::Accepted | ProposalState::Partial)
            || proposal.accepted_files().next().is_none()
        {
            return Err(FactoryError::InvalidTransition(format!(
                "proposal {proposal_id} is {} and has no accepted files",
                proposal.state.as_str()
            )));
        }
        if !self.finalizing.lock().await.insert(proposal_id.to_string()) {
            return Err(FactoryError::InvalidTransition(format!(
                "proposal {proposal_id} is being finalized"
            )));
        }
        Ok(proposal.clone())
    }

    /// Drop a reservation after a failed finalize.
    pub async fn release_finalize(&self, proposal_id: &str) {
        let _proposals = self.proposals.write().await;
        self.finalizing.lock().await.remove(proposal_id);
    }

    pub async fn mark_committed(&self, proposal_id: &str, commit_sha: &str) -> Result<()> {
        let mut proposals = self.proposals.write().await;
        let proposal = proposals
            .get_mut(proposal_id)
            .ok_or_else(|| FactoryError::ProposalNotFound(proposal_id.to_string()))?;
        proposal.commit_sha = Some(commit_sha.to_string());
        self.finalizing.lock().await.remove(proposal_id);
        Ok(())
    }
}

fn normalize_targets(paths: &[String]) -> Result<Vec<String>> {
    if paths.is_empty() {
        return Err(FactoryError::InvalidInput("no files named".to_string()));
    }
    paths.iter().map(|p| normalize_relative(p)).collect()
}

fn resolve_targets(proposal: &Proposal, targets: &[String]) -> Result<()> {
    match targets
        .iter()
        .find(|t| !proposal.files.iter().any(|f| &f.path == *t))
    {
        Some(missing) => Err(FactoryError::InvalidInput(format!(
            "`{}` is not part of proposal {}",
            missing, proposal.id
        ))),
        None => Ok(()),
    }
}

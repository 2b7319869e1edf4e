use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use factory_types::{ChangeCounts, ChangeKind, Proposal, RunEventKind};

use crate::error::{FactoryError, Result};
use crate::file_changes::Transition;
use crate::history::CommitRecord;
use crate::orchestrator::{RunContext, RunOrchestrator};
use crate::sandbox::StagedFile;

/// Review workflow over a run's proposals: accept or reject files, then
/// finalize accepted files into a commit.
#[derive(Clone)]
pub struct ReviewService {
    orchestrator: RunOrchestrator,
}

impl ReviewService {
    pub(crate) fn new(orchestrator: RunOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Resolve the run and make sure the proposal belongs to it.
    async fn scoped(&self, run_id: &str, proposal_id: &str) -> Result<Arc<RunContext>> {
        let ctx = self.orchestrator.context(run_id)?;
        let proposal = self.orchestrator.file_changes.get(proposal_id).await?;
        if proposal.run_id != run_id {
            return Err(FactoryError::ProposalNotFound(format!(
                "{proposal_id} does not belong to run {run_id}"
            )));
        }
        Ok(ctx)
    }

    pub async fn accept_all(&self, run_id: &str, proposal_id: &str) -> Result<Transition> {
        let ctx = self.scoped(run_id, proposal_id).await?;
        let transition = self.orchestrator.file_changes.accept_all(proposal_id).await?;
        self.promote(&ctx, &transition).await;
        Ok(self.announce(&ctx, transition))
    }

    pub async fn accept_files(&self, run_id: &str, proposal_id: &str, paths: &[String]) -> Result<Transition> {
        let ctx = self.scoped(run_id, proposal_id).await?;
        let transition = self
            .orchestrator
            .file_changes
            .accept_files(proposal_id, paths)
            .await?;
        self.promote(&ctx, &transition).await;
        Ok(self.announce(&ctx, transition))
    }

    pub async fn reject_all(&self, run_id: &str, proposal_id: &str) -> Result<Transition> {
        let ctx = self.scoped(run_id, proposal_id).await?;
        let transition = self.orchestrator.file_changes.reject_all(proposal_id).await?;
        self.discard(&ctx, &transition).await;
        Ok(self.announce(&ctx, transition))
    }

    pub async fn reject_files(&self, run_id: &str, proposal_id: &str, paths: &[String]) -> Result<Transition> {
        let ctx = self.scoped(run_id, proposal_id).await?;
        let transition = self
            .orchestrator
            .file_changes
            .reject_files(proposal_id, paths)
            .await?;
        self.discard(&ctx, &transition).await;
        Ok(self.announce(&ctx, transition))
    }

    async fn promote(&self, ctx: &RunContext, transition: &Transition) {
        if transition.changed.is_empty() {
            return;
        }
        if let Err(err) = ctx.overlay.accept_files(&transition.changed).await {
            tracing::warn!(run_id = %ctx.run_id(), proposal_id = %transition.proposal_id, "overlay accept failed: {}", err);
        }
    }

    async fn discard(&self, ctx: &RunContext, transition: &Transition) {
        if transition.changed.is_empty() {
            return;
        }
        if let Err(err) = ctx.overlay.discard(&transition.changed).await {
            tracing::warn!(run_id = %ctx.run_id(), proposal_id = %transition.proposal_id, "overlay discard failed: {}", err);
        }
    }

    fn announce(&self, ctx: &RunContext, transition: Transition) -> Transition {
        ctx.bus.publish(RunEventKind::ProposalStateChanged {
            proposal_id: transition.proposal_id.clone(),
            state: transition.state,
            accepted: transition.accepted.clone(),
            rejected: transition.rejected.clone(),
        });
        transition
    }

    /// Apply the accepted files of a proposal to the run's branch and commit
    /// them. Requires at least one accepted file; pending and rejected files
    /// are left out. Concurrent calls for one proposal commit at most once.
    pub async fn finalize(&self, run_id: &str, proposal_id: &str, message: Option<&str>) -> Result<CommitRecord> {
        let ctx = self.scoped(run_id, proposal_id).await?;
        let proposal = self.orchestrator.file_changes.begin_finalize(proposal_id).await?;
        let result = self.commit_reserved(&ctx, &proposal, message).await;
        if result.is_err() {
            self.orchestrator.file_changes.release_finalize(proposal_id).await;
        }
        result
    }

    async fn commit_reserved(&self, ctx: &RunContext, proposal: &Proposal, message: Option<&str>) -> Result<CommitRecord> {
        let run_id = ctx.run_id();
        let proposal_id = proposal.id.as_str();
        let accepted: Vec<_> = proposal.accepted_files().cloned().collect();
        let paths: Vec<String> = accepted.iter().map(|f| f.path.clone()).collect();

        // overlay content when still staged, proposal content otherwise
        let staged: HashMap<String, StagedFile> = match ctx.overlay.accepted_files(&paths).await {
            Ok(files) => files.into_iter().map(|f| (f.path.clone(), f)).collect(),
            Err(err) => {
                tracing::warn!(run_id, proposal_id, "overlay read failed, using proposal content: {}", err);
                HashMap::new()
            }
        };
        let files: Vec<StagedFile> = accepted
            .iter()
            .map(|entry| {
                staged.get(&entry.path).cloned().unwrap_or_else(|| StagedFile {
                    path: entry.path.clone(),
                    content: match entry.status {
                        ChangeKind::Deleted => None,
                        _ => entry.new_content.clone(),
                    },
                })
            })
            .collect();

        let branch = self.branch_for(ctx);
        let message = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Accept proposal {proposal_id}"));
        let cancel = self.orchestrator.shutdown.child_token();

        ctx.git
            .apply_proposal_to_branch(proposal_id, &branch, &files, &cancel)
            .await?;
        let outcome = ctx
            .git
            .commit_proposal(proposal_id, &message, &paths, &cancel)
            .await?;
        self.orchestrator
            .file_changes
            .mark_committed(proposal_id, &outcome.commit_sha)
            .await?;
        if let Err(err) = ctx.overlay.discard(&paths).await {
            tracing::warn!(run_id, proposal_id, "failed to release committed files from overlay: {}", err);
        }

        ctx.bus.publish(RunEventKind::GitCommit {
            proposal_id: proposal_id.to_string(),
            commit_sha: outcome.commit_sha.clone(),
            branch: branch.clone(),
            message: message.clone(),
            files: paths.clone(),
            created: outcome.created,
        });
        tracing::info!(run_id, proposal_id, branch = %branch, commit = %outcome.commit_sha, "proposal finalized");

        let record = CommitRecord {
            proposal_id: proposal_id.to_string(),
            run_id: run_id.to_string(),
            commit_sha: outcome.commit_sha,
            branch,
            message,
            files: paths,
            counts: ChangeCounts::from_files(&accepted),
            created: outcome.created,
            created_at: Utc::now(),
        };
        if let Some(history) = &self.orchestrator.history {
            if let Err(err) = history.append_commit(&record) {
                tracing::warn!(run_id, proposal_id, "failed to record commit: {}", err);
            }
        }
        Ok(record)
    }

    fn branch_for(&self, ctx: &RunContext) -> String {
        match &ctx.scope().task_id {
            Some(task_id) => format!("{}{}", self.orchestrator.config.git.branch_prefix, task_id),
            None => format!("factory/{}", ctx.run_id()),
        }
    }
}

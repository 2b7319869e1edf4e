use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use factory_observability::{emit_event, ObservabilityEvent, ProcessKind};
use factory_providers::CompletionSource;
use factory_types::{
    new_id, ChangeKind, LlmMeta, ProposedChange, RunEvent, RunEventKind, RunRecord, RunScope, RunStatus, UsageDelta,
    UsageStats,
};

use crate::agent::{AgentLoop, AgentOutcome};
use crate::config::FactoryConfig;
use crate::error::{FactoryError, Result};
use crate::event_bus::EventBus;
use crate::file_changes::FileChangeManager;
use crate::git::{cli_git_factory, GitCredentials, GitFactory, GitService, PushOutcome};
use crate::history::HistoryStore;
use crate::project::{ProjectStore, WorkStatus};
use crate::review::ReviewService;
use crate::sandbox::SandboxOverlay;
use crate::usage::{PricingTable, UsageGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Run context and registry
// ============================================================================

/// Everything one run owns. Shared between the control surface, the
/// pipeline task, the snapshot timer and the lifecycle listener.
pub struct RunContext {
    run_id: String,
    scope: RunScope,
    project_root: PathBuf,
    started_at: DateTime<Utc>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) overlay: Arc<SandboxOverlay>,
    pub(crate) usage: UsageGuard,
    pub(crate) git: Arc<dyn GitService>,
    /// Run abort signal; child of the orchestrator shutdown token
    pub(crate) abort: CancellationToken,
    timer_stop: CancellationToken,
    cleanup_done: CancellationToken,
    terminal: AtomicBool,
    cleaned: AtomicBool,
    /// Usage changed since the run record was last written
    usage_dirty: AtomicBool,
    status: Mutex<RunStatus>,
    message: Mutex<Option<String>>,
    llm: Mutex<LlmMeta>,
    progress: Mutex<Option<f64>>,
    /// Work-item status override, e.g. a blocked agent outcome
    outcome: Mutex<Option<(WorkStatus, Option<String>)>>,
}

impl RunContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn scope(&self) -> &RunScope {
        &self.scope
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn status(&self) -> RunStatus {
        *lock(&self.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    pub fn usage(&self) -> UsageStats {
        self.usage.snapshot()
    }

    pub(crate) fn progress(&self) -> Option<f64> {
        *lock(&self.progress)
    }

    pub(crate) fn set_progress(&self, value: f64) {
        *lock(&self.progress) = Some(value.clamp(0.0, 0.99));
    }

    pub(crate) fn set_outcome(&self, status: WorkStatus, note: Option<String>) {
        *lock(&self.outcome) = Some((status, note));
    }

    pub(crate) fn llm_meta(&self) -> LlmMeta {
        lock(&self.llm).clone()
    }

    fn record(&self) -> RunRecord {
        let llm = self.llm_meta();
        RunRecord {
            run_id: self.run_id.clone(),
            scope: self.scope.clone(),
            status: self.status(),
            message: lock(&self.message).clone(),
            usage: self.usage.snapshot(),
            budget_usd: self.usage.budget_usd(),
            provider: llm.provider,
            model: llm.model,
            started_at: self.started_at,
            updated_at: Utc::now(),
        }
    }
}

/// Live runs addressed by id. Each orchestrator owns one; tests may share
/// or inspect it through [`RunOrchestrator::with_registry`].
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunContext>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, ctx: Arc<RunContext>) {
        if let Ok(mut runs) = self.runs.write() {
            runs.insert(ctx.run_id.clone(), ctx);
        }
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunContext>> {
        self.runs.read().ok()?.get(run_id).cloned()
    }

    fn remove(&self, run_id: &str) -> Option<Arc<RunContext>> {
        self.runs.write().ok()?.remove(run_id)
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.runs
            .read()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().map(|runs| runs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Default)]
pub struct StartRunParams {
    pub project_id: String,
    pub task_id: Option<String>,
    pub feature_id: Option<String>,
    pub budget_usd: Option<f64>,
    /// `None` runs the pipeline without any model interaction
    pub completion: Option<CompletionSource>,
    /// Overrides the project store lookup
    pub project_root: Option<PathBuf>,
    /// Extra context appended to the agent prompt
    pub instructions: Option<String>,
}

/// Returned by the start operations. `events` was subscribed before
/// `run/started` was emitted, so it observes the whole run.
pub struct RunHandle {
    pub run_id: String,
    pub started: RunEvent,
    pub events: broadcast::Receiver<RunEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    #[serde(flatten)]
    pub scope: RunScope,
    pub status: RunStatus,
    pub usage: UsageStats,
    pub budget_usd: Option<f64>,
    pub project_root: PathBuf,
    pub cleaned_up: bool,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives agent runs and exposes the control surface addressed by run id.
#[derive(Clone)]
pub struct RunOrchestrator {
    registry: Arc<RunRegistry>,
    pub(crate) file_changes: Arc<FileChangeManager>,
    projects: Arc<dyn ProjectStore>,
    pub(crate) history: Option<Arc<HistoryStore>>,
    git_factory: GitFactory,
    pub(crate) config: Arc<FactoryConfig>,
    pub(crate) pricing: Arc<PricingTable>,
    pub(crate) shutdown: CancellationToken,
}

impl RunOrchestrator {
    pub fn new(config: FactoryConfig, projects: Arc<dyn ProjectStore>) -> Self {
        let state_dir = config.resolved_state_dir();
        let history = match HistoryStore::new(&state_dir) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                tracing::warn!(state_dir = %state_dir.display(), "run history disabled: {}", err);
                None
            }
        };
        let git_factory = cli_git_factory(GitCredentials::from_env(), config.git_timeout());
        Self {
            registry: Arc::new(RunRegistry::new()),
            file_changes: Arc::new(FileChangeManager::new()),
            projects,
            history,
            git_factory,
            pricing: Arc::new(config.pricing_table()),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_git_factory(mut self, factory: GitFactory) -> Self {
        self.git_factory = factory;
        self
    }

    pub fn with_history(mut self, history: Option<Arc<HistoryStore>>) -> Self {
        self.history = history;
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn history(&self) -> Option<&Arc<HistoryStore>> {
        self.history.as_ref()
    }

    pub fn file_changes(&self) -> &Arc<FileChangeManager> {
        &self.file_changes
    }

    pub fn review(&self) -> ReviewService {
        ReviewService::new(self.clone())
    }

    fn overlays_dir(&self) -> PathBuf {
        self.config.resolved_state_dir().join("overlays")
    }

    pub(crate) fn context(&self, run_id: &str) -> Result<Arc<RunContext>> {
        self.registry
            .get(run_id)
            .ok_or_else(|| FactoryError::UnknownRun(run_id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------------

    pub async fn start_run(&self, params: StartRunParams) -> Result<RunHandle> {
        let project_id = params.project_id.trim().to_string();
        if project_id.is_empty() {
            return Err(FactoryError::InvalidInput("projectId is required".to_string()));
        }
        let project_root = match params.project_root {
            Some(root) => root,
            None => self
                .projects
                .project_root(&project_id)
                .await
                .ok_or_else(|| FactoryError::InvalidInput(format!("no root directory known for project {project_id}")))?,
        };

        let run_id = new_id("run");
        let scope = RunScope {
            project_id,
            task_id: params.task_id.filter(|t| !t.trim().is_empty()),
            feature_id: params.feature_id.filter(|f| !f.trim().is_empty()),
        };
        let budget_usd = params.budget_usd.or(self.config.budget_usd);
        let abort = self.shutdown.child_token();
        let overlay = Arc::new(SandboxOverlay::new(&run_id, &project_root, &self.overlays_dir()));
        overlay.attach_abort_signal(abort.clone());
        let bus = Arc::new(EventBus::new(&run_id));

        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            scope: scope.clone(),
            git: (self.git_factory)(&project_root),
            project_root,
            started_at: Utc::now(),
            bus: bus.clone(),
            overlay: overlay.clone(),
            usage: UsageGuard::new(budget_usd),
            abort,
            timer_stop: CancellationToken::new(),
            cleanup_done: CancellationToken::new(),
            terminal: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            usage_dirty: AtomicBool::new(false),
            status: Mutex::new(RunStatus::Pending),
            message: Mutex::new(None),
            llm: Mutex::new(LlmMeta::default()),
            progress: Mutex::new(None),
            outcome: Mutex::new(None),
        });

        let listener_rx = bus.subscribe();
        let handle_rx = bus.subscribe();
        self.registry.insert(ctx.clone());
        self.spawn_lifecycle_listener(ctx.clone(), listener_rx);

        {
            let overlay = overlay.clone();
            let bus = bus.clone();
            let abort = ctx.abort.clone();
            tokio::spawn(async move {
                if let Err(err) = overlay.init().await {
                    if abort.is_cancelled() {
                        return;
                    }
                    tracing::warn!(run_id = %overlay.run_id(), "sandbox overlay init failed: {}", err);
                    bus.publish(RunEventKind::log(
                        "warn",
                        format!("Sandbox overlay unavailable, staging disabled: {err}"),
                    ));
                }
            });
        }

        *lock(&ctx.status) = RunStatus::Running;
        let started = bus.publish(RunEventKind::RunStarted {
            project_id: scope.project_id.clone(),
            task_id: scope.task_id.clone(),
            feature_id: scope.feature_id.clone(),
            budget_usd: ctx.usage.budget_usd(),
        });
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.started",
                component: "orchestrator",
                run_id: Some(&run_id),
                project_id: Some(&scope.project_id),
                status: Some("running"),
                ..Default::default()
            },
        );
        self.persist_run(&ctx);

        self.spawn_snapshot_timer(ctx.clone());
        self.spawn_pipeline(ctx, params.completion, params.instructions);

        Ok(RunHandle {
            run_id,
            started,
            events: handle_rx,
        })
    }

    pub async fn start_task_run(
        &self,
        project_id: &str,
        task_id: &str,
        completion: Option<CompletionSource>,
        budget_usd: Option<f64>,
    ) -> Result<RunHandle> {
        if task_id.trim().is_empty() {
            return Err(FactoryError::InvalidInput("taskId is required".to_string()));
        }
        self.start_run(StartRunParams {
            project_id: project_id.to_string(),
            task_id: Some(task_id.to_string()),
            budget_usd,
            completion,
            ..Default::default()
        })
        .await
    }

    pub async fn start_feature_run(
        &self,
        project_id: &str,
        feature_id: &str,
        completion: Option<CompletionSource>,
        budget_usd: Option<f64>,
    ) -> Result<RunHandle> {
        if feature_id.trim().is_empty() {
            return Err(FactoryError::InvalidInput("featureId is required".to_string()));
        }
        self.start_run(StartRunParams {
            project_id: project_id.to_string(),
            feature_id: Some(feature_id.to_string()),
            budget_usd,
            completion,
            ..Default::default()
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------------

    /// Build a proposal, stage its files and announce it. Per-file staging
    /// failures are logged and skipped.
    pub async fn propose_changes(
        &self,
        run_id: &str,
        changes: Vec<ProposedChange>,
        title: Option<String>,
    ) -> Result<String> {
        let ctx = self.context(run_id)?;
        if ctx.is_terminal() {
            return Err(FactoryError::InvalidTransition(format!(
                "run {run_id} is {} and takes no new proposals",
                ctx.status().as_str()
            )));
        }
        let proposal = self
            .file_changes
            .create_proposal(run_id, &ctx.project_root, changes, title)
            .await?;

        for file in &proposal.files {
            let staged = match &file.new_content {
                Some(content) if file.status != ChangeKind::Deleted => {
                    ctx.overlay.write(&file.path, content).await
                }
                _ => ctx.overlay.delete(&file.path).await,
            };
            match staged {
                Ok(true) => {}
                Ok(false) => tracing::debug!(run_id, path = %file.path, "staging skipped, overlay degraded"),
                Err(err) => {
                    tracing::warn!(run_id, path = %file.path, "failed to stage file: {}", err);
                    ctx.bus.publish(RunEventKind::log(
                        "warn",
                        format!("Failed to stage {}: {err}", file.path),
                    ));
                }
            }
        }

        let diffs = self.file_changes.get_proposal_diff(&proposal.id).await?;
        ctx.bus.publish_all(vec![
            RunEventKind::FileProposal {
                proposal_id: proposal.id.clone(),
                title: proposal.title.clone(),
                counts: proposal.counts(),
            },
            RunEventKind::FileDiff {
                proposal_id: proposal.id.clone(),
                files: diffs,
            },
        ]);
        tracing::info!(run_id, proposal_id = %proposal.id, files = proposal.files.len(), "proposal staged");
        Ok(proposal.id)
    }

    pub fn add_usage_to_run(&self, run_id: &str, delta: UsageDelta, llm: Option<LlmMeta>) -> Result<UsageStats> {
        let ctx = self.context(run_id)?;
        let usage = ctx.usage.add(&delta);
        if let Some(meta) = &llm {
            let mut current = lock(&ctx.llm);
            if meta.provider.is_some() {
                current.provider = meta.provider.clone();
            }
            if meta.model.is_some() {
                current.model = meta.model.clone();
            }
        }
        ctx.bus.publish(RunEventKind::RunUsage {
            usage: usage.clone(),
            delta,
            llm,
        });
        // written by the snapshot timer or at cleanup
        ctx.usage_dirty.store(true, Ordering::SeqCst);
        Ok(usage)
    }

    /// Force completion. Returns `false` when the run was already terminal.
    pub fn complete(&self, run_id: &str, payload: Option<Value>) -> Result<bool> {
        let ctx = self.context(run_id)?;
        Ok(self.terminate(&ctx, Vec::new(), RunEventKind::RunCompleted { payload }))
    }

    /// Cancel the run. Returns `false` when the run was already terminal.
    pub fn cancel(&self, run_id: &str, reason: Option<String>) -> Result<bool> {
        let ctx = self.context(run_id)?;
        Ok(self.terminate(&ctx, Vec::new(), RunEventKind::RunCancelled { reason }))
    }

    /// Push the run's project through the git fallback chain. Failures go
    /// to the caller and leave the run untouched.
    pub async fn push(&self, run_id: &str, branch: Option<&str>) -> Result<PushOutcome> {
        let ctx = self.context(run_id)?;
        let cancel = self.shutdown.child_token();
        let outcome = ctx.git.push(branch, &cancel).await?;
        ctx.bus.publish(RunEventKind::log(
            "info",
            format!("Pushed {} ({:?})", outcome.branch, outcome.strategy),
        ));
        Ok(outcome)
    }

    pub fn subscribe(&self, run_id: &str) -> Result<(Vec<RunEvent>, broadcast::Receiver<RunEvent>)> {
        Ok(self.context(run_id)?.bus.subscribe_with_replay())
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunSnapshot> {
        let ctx = self.context(run_id)?;
        Ok(RunSnapshot {
            run_id: ctx.run_id.clone(),
            scope: ctx.scope.clone(),
            status: ctx.status(),
            usage: ctx.usage.snapshot(),
            budget_usd: ctx.usage.budget_usd(),
            project_root: ctx.project_root.clone(),
            cleaned_up: ctx.cleaned.load(Ordering::SeqCst),
        })
    }

    /// Resolves once terminal cleanup for the run has finished.
    pub async fn wait_for_cleanup(&self, run_id: &str) -> Result<()> {
        let ctx = self.context(run_id)?;
        ctx.cleanup_done.cancelled().await;
        Ok(())
    }

    /// Cancel every live run.
    pub fn shutdown(&self) {
        for run_id in self.registry.run_ids() {
            if let Some(ctx) = self.registry.get(&run_id) {
                self.terminate(
                    &ctx,
                    Vec::new(),
                    RunEventKind::RunCancelled {
                        reason: Some("orchestrator shutting down".to_string()),
                    },
                );
            }
        }
        self.shutdown.cancel();
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Claim the single terminal transition of a run and announce it,
    /// preceded by `prelude`, as one uninterrupted batch ending in
    /// `run/complete`.
    pub(crate) fn terminate(&self, ctx: &Arc<RunContext>, prelude: Vec<RunEventKind>, terminal: RunEventKind) -> bool {
        let Some(status) = terminal.terminal_status() else {
            return false;
        };
        if ctx.terminal.swap(true, Ordering::SeqCst) {
            tracing::debug!(run_id = %ctx.run_id, event = terminal.event_type(), "run already terminal");
            return false;
        }
        *lock(&ctx.status) = status;
        *lock(&ctx.message) = match &terminal {
            RunEventKind::RunCancelled { reason } => reason.clone(),
            RunEventKind::RunError { message } => Some(message.clone()),
            _ => None,
        };
        ctx.abort.cancel();

        let mut batch = prelude;
        batch.push(terminal);
        batch.push(RunEventKind::RunComplete { status });
        ctx.bus.publish_all(batch);
        true
    }

    fn spawn_lifecycle_listener(&self, ctx: Arc<RunContext>, mut rx: broadcast::Receiver<RunEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        this.persist_event(&event);
                        if let RunEventKind::RunComplete { status } = event.kind {
                            this.cleanup_once(&ctx, status).await;
                            this.schedule_eviction(&ctx);
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(run_id = %ctx.run_id, skipped, "lifecycle listener lagged");
                        if ctx.is_terminal() {
                            this.cleanup_once(&ctx, ctx.status()).await;
                            this.schedule_eviction(&ctx);
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn cleanup_once(&self, ctx: &Arc<RunContext>, status: RunStatus) {
        if ctx.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        ctx.timer_stop.cancel();
        match ctx.overlay.reject_all().await {
            Ok(0) => {}
            Ok(dropped) => tracing::debug!(run_id = %ctx.run_id, dropped, "discarded unreviewed staged files"),
            Err(err) => tracing::warn!(run_id = %ctx.run_id, "failed to discard unreviewed staged files: {}", err),
        }
        if let Err(err) = ctx.overlay.cleanup().await {
            tracing::warn!(run_id = %ctx.run_id, "sandbox cleanup failed: {}", err);
        }
        ctx.usage_dirty.store(false, Ordering::SeqCst);
        self.persist_run(ctx);
        self.record_work_status(ctx, status).await;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.finished",
                component: "orchestrator",
                run_id: Some(&ctx.run_id),
                project_id: Some(&ctx.scope.project_id),
                status: Some(status.as_str()),
                ..Default::default()
            },
        );
        ctx.cleanup_done.cancel();
    }

    /// Forget a cleaned-up run and its proposals after the retention window.
    /// Review, replay and snapshots keep working until then.
    fn schedule_eviction(&self, ctx: &Arc<RunContext>) {
        let this = self.clone();
        let run_id = ctx.run_id.clone();
        let retention = self.config.finished_run_retention();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            this.evict(&run_id).await;
        });
    }

    async fn evict(&self, run_id: &str) {
        let Some(ctx) = self.registry.remove(run_id) else {
            return;
        };
        let proposals = self.file_changes.remove_run(run_id).await;
        tracing::debug!(run_id, proposals, status = ctx.status().as_str(), "evicted finished run");
    }

    async fn record_work_status(&self, ctx: &RunContext, status: RunStatus) {
        let (work_status, note) = lock(&ctx.outcome).clone().unwrap_or_else(|| {
            let work_status = match status {
                RunStatus::Completed => WorkStatus::Completed,
                RunStatus::Cancelled => WorkStatus::Cancelled,
                _ => WorkStatus::Errored,
            };
            (work_status, lock(&ctx.message).clone())
        });
        self.set_work_status(ctx, work_status, note.as_deref()).await;
    }

    async fn set_work_status(&self, ctx: &RunContext, status: WorkStatus, note: Option<&str>) {
        let scope = &ctx.scope;
        if let Some(task_id) = &scope.task_id {
            if let Err(err) = self
                .projects
                .set_task_status(&scope.project_id, task_id, status, note)
                .await
            {
                tracing::warn!(run_id = %ctx.run_id, task_id, "failed to record task status: {}", err);
            }
        }
        if let Some(feature_id) = &scope.feature_id {
            if let Err(err) = self
                .projects
                .set_feature_status(&scope.project_id, feature_id, status, note)
                .await
            {
                tracing::warn!(run_id = %ctx.run_id, feature_id, "failed to record feature status: {}", err);
            }
        }
    }

    fn spawn_snapshot_timer(&self, ctx: Arc<RunContext>) {
        let this = self.clone();
        let period = self.config.snapshot_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.timer_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if ctx.is_terminal() {
                            break;
                        }
                        ctx.bus.publish(RunEventKind::ProgressSnapshot {
                            progress: ctx.progress(),
                            message: None,
                            usage: ctx.usage.snapshot(),
                        });
                        if ctx.usage_dirty.swap(false, Ordering::SeqCst) {
                            this.persist_run(&ctx);
                        }
                        if let Some((budget_usd, cost_usd)) = ctx.usage.check_budget() {
                            tracing::warn!(run_id = %ctx.run_id, budget_usd, cost_usd, "budget exceeded, cancelling run");
                            this.terminate(
                                &ctx,
                                vec![RunEventKind::BudgetExceeded { budget_usd, cost_usd }],
                                RunEventKind::RunCancelled {
                                    reason: Some(format!("budget of ${budget_usd} exceeded")),
                                },
                            );
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_pipeline(&self, ctx: Arc<RunContext>, completion: Option<CompletionSource>, instructions: Option<String>) {
        let this = self.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(this.run_pipeline(ctx.clone(), completion, instructions)).catch_unwind();
            if run.await.is_err() {
                tracing::error!(run_id = %ctx.run_id, "run pipeline panicked");
                this.terminate(
                    &ctx,
                    Vec::new(),
                    RunEventKind::RunError {
                        message: "internal error: run pipeline panicked".to_string(),
                    },
                );
            }
        });
    }

    /// Top of the per-run task: every failure ends as a `run/error` event.
    async fn run_pipeline(&self, ctx: Arc<RunContext>, completion: Option<CompletionSource>, instructions: Option<String>) {
        ctx.bus.publish(RunEventKind::RunProgress {
            message: "Run pipeline started".to_string(),
        });
        self.set_work_status(&ctx, WorkStatus::Running, None).await;

        let Some(source) = completion else {
            ctx.bus.publish(RunEventKind::log(
                "info",
                "No completion client configured; skipping model interaction",
            ));
            self.terminate(&ctx, Vec::new(), RunEventKind::RunCompleted { payload: None });
            return;
        };

        let outcome = match source.into_client() {
            Ok(client) => {
                let context = self.agent_context(&ctx, instructions).await;
                let mut agent = AgentLoop::new(self.clone(), ctx.clone(), client, context);
                agent
                    .run()
                    .await
                    .map(|outcome| (outcome, agent.proposals().to_vec()))
            }
            Err(err) => Err(err),
        };

        let terminal = match outcome {
            Ok((AgentOutcome::Aborted, _)) => RunEventKind::RunCancelled {
                reason: Some("aborted".to_string()),
            },
            Ok((outcome, proposals)) => {
                match &outcome {
                    AgentOutcome::Blocked { reason } => ctx.set_outcome(WorkStatus::Blocked, Some(reason.clone())),
                    AgentOutcome::TurnsExhausted { turns } => {
                        tracing::warn!(run_id = %ctx.run_id, turns, "agent stopped without finishing");
                        ctx.set_outcome(
                            WorkStatus::Blocked,
                            Some(format!("Stopped after {turns} turns without finishing")),
                        );
                    }
                    _ => {}
                }
                RunEventKind::RunCompleted {
                    payload: Some(outcome.to_payload(&proposals)),
                }
            }
            Err(_) if ctx.abort.is_cancelled() => RunEventKind::RunCancelled {
                reason: Some("aborted".to_string()),
            },
            Err(err) => {
                tracing::error!(run_id = %ctx.run_id, "run pipeline failed: {:#}", err);
                RunEventKind::RunError {
                    message: factory_observability::redact_credentials(&format!("{err:#}")),
                }
            }
        };
        self.terminate(&ctx, Vec::new(), terminal);
    }

    async fn agent_context(&self, ctx: &RunContext, instructions: Option<String>) -> String {
        let scope = &ctx.scope;
        let mut sections = Vec::new();
        if let Some(task_id) = &scope.task_id {
            let description = self
                .projects
                .task_description(&scope.project_id, task_id)
                .await
                .unwrap_or_default();
            sections.push(format!("Task {task_id}: {description}"));
        }
        if let Some(feature_id) = &scope.feature_id {
            let description = self
                .projects
                .feature_description(&scope.project_id, feature_id)
                .await
                .unwrap_or_default();
            sections.push(format!("Feature {feature_id}: {description}"));
        }
        if let Some(extra) = instructions.filter(|s| !s.trim().is_empty()) {
            sections.push(extra);
        }
        sections.join("\n\n")
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    fn persist_run(&self, ctx: &RunContext) {
        if let Some(history) = &self.history {
            if let Err(err) = history.upsert_run(&ctx.record()) {
                tracing::warn!(run_id = %ctx.run_id, "failed to persist run record: {}", err);
            }
        }
    }

    fn persist_event(&self, event: &RunEvent) {
        // streamed token deltas are not persisted
        if matches!(event.kind, RunEventKind::LlmDelta { .. }) {
            return;
        }
        if let Some(history) = &self.history {
            if let Err(err) = history.append_event(event) {
                tracing::warn!(run_id = %event.run_id, "failed to append event log: {}", err);
            }
        }
    }
}

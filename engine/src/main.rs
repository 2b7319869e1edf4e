use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use factory_core::{
    CliGitService, CommitRecord, ConfigStore, FactoryConfig, GitCredentials, GitService, InMemoryProjectStore,
    ProcessGitRunner, RunOrchestrator, StartRunParams,
};
use factory_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use factory_providers::CompletionSource;
use factory_types::{RunEvent, RunEventKind, RunStatus};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

const SUPPORTED_PROVIDER_IDS: [&str; 7] = [
    "openai",
    "openrouter",
    "ollama",
    "groq",
    "mistral",
    "together",
    "mock",
];

#[derive(Parser, Debug)]
#[command(name = "factory-engine")]
#[command(about = "Run coding agents against a project in a sandbox and review their changes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a run and stream its events to stdout as JSON lines
    Run {
        #[arg(long)]
        project_dir: PathBuf,
        #[arg(long, default_value = "local")]
        project_id: String,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        feature: Option<String>,
        /// Extra instructions handed to the agent
        #[arg(long)]
        instructions: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        budget_usd: Option<f64>,
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Accept and commit every proposal once the run completes
        #[arg(long, default_value_t = false)]
        auto_accept: bool,
        #[arg(long)]
        commit_message: Option<String>,
        /// Push the committed branch; requires --auto-accept
        #[arg(long, default_value_t = false)]
        push: bool,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Push a repository using the credential fallback chain
    Push {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            project_dir,
            project_id,
            task,
            feature,
            instructions,
            provider,
            model,
            api_key,
            base_url,
            budget_usd,
            state_dir,
            auto_accept,
            commit_message,
            push,
            config,
        } => {
            let overrides = build_cli_overrides(OverrideFlags {
                provider,
                model,
                api_key,
                base_url,
                budget_usd,
                state_dir,
            })?;
            let config = load_config(config.as_deref(), overrides).await?;
            let _log_guard = init_logging(ProcessKind::Engine, &config)?;
            let options = RunOptions {
                project_dir,
                project_id,
                task,
                feature,
                instructions,
                auto_accept,
                commit_message,
                push,
            };
            let status = run_command(config, options).await?;
            if status != RunStatus::Completed {
                anyhow::bail!("run finished with status {}", status.as_str());
            }
        }
        Command::Push { repo, branch, config } => {
            let config = load_config(config.as_deref(), None).await?;
            let _log_guard = init_logging(ProcessKind::Cli, &config)?;
            let runner = Arc::new(ProcessGitRunner::new(config.git_timeout()));
            let git = CliGitService::new(repo, runner, GitCredentials::from_env());
            let outcome = git.push(branch.as_deref(), &CancellationToken::new()).await?;
            print_line(&json!({ "type": "git/push", "payload": outcome }))?;
        }
    }

    Ok(())
}

#[derive(Debug, Default)]
struct OverrideFlags {
    provider: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    budget_usd: Option<f64>,
    state_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct RunOptions {
    project_dir: PathBuf,
    project_id: String,
    task: Option<String>,
    feature: Option<String>,
    instructions: Option<String>,
    auto_accept: bool,
    commit_message: Option<String>,
    push: bool,
}

async fn load_config(path: Option<&Path>, overrides: Option<Value>) -> anyhow::Result<FactoryConfig> {
    let store = ConfigStore::new(path, overrides)
        .await
        .context("failed to load configuration")?;
    Ok(store.get().await)
}

fn init_logging(
    process: ProcessKind,
    config: &FactoryConfig,
) -> anyhow::Result<WorkerGuard> {
    let logs_dir = canonical_logs_dir_from_root(&config.resolved_state_dir());
    let (guard, log_info) = init_process_logging(process, &logs_dir, config.log_retention_days)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some("jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("logging initialized: {:?}", log_info);
    Ok(guard)
}

async fn run_command(config: FactoryConfig, options: RunOptions) -> anyhow::Result<RunStatus> {
    let project_root = options
        .project_dir
        .canonicalize()
        .with_context(|| format!("project dir {} is not accessible", options.project_dir.display()))?;

    let projects = Arc::new(InMemoryProjectStore::new());
    projects
        .register_project(&options.project_id, project_root.clone())
        .await;
    let description = options.instructions.clone().unwrap_or_default();
    if let Some(task_id) = &options.task {
        projects
            .add_task(&options.project_id, task_id, &description)
            .await?;
    }
    if let Some(feature_id) = &options.feature {
        projects
            .add_feature(&options.project_id, feature_id, &description)
            .await?;
    }

    let completion = config.llm.clone().map(CompletionSource::from);
    let orchestrator = RunOrchestrator::new(config, projects);
    let mut handle = orchestrator
        .start_run(StartRunParams {
            project_id: options.project_id.clone(),
            task_id: options.task.clone(),
            feature_id: options.feature.clone(),
            completion,
            project_root: Some(project_root),
            // scoped runs already carry the instructions as their description
            instructions: match (&options.task, &options.feature) {
                (None, None) => options.instructions.clone(),
                _ => None,
            },
            ..Default::default()
        })
        .await?;
    let run_id = handle.run_id.clone();
    info!(run_id = %run_id, "run started");

    let mut proposals = Vec::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                orchestrator.cancel(&run_id, Some("interrupted".to_string()))?;
            }
            received = handle.events.recv() => match received {
                Ok(event) => {
                    print_event(&event)?;
                    if let RunEventKind::FileProposal { proposal_id, .. } = &event.kind {
                        proposals.push(proposal_id.clone());
                    }
                    if matches!(event.kind, RunEventKind::RunComplete { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %run_id, skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    orchestrator.wait_for_cleanup(&run_id).await?;
    let status = orchestrator.get_run(&run_id)?.status;

    if options.auto_accept && status == RunStatus::Completed {
        let review = orchestrator.review();
        let mut last_commit: Option<CommitRecord> = None;
        for proposal_id in &proposals {
            let transition = match review.accept_all(&run_id, proposal_id).await {
                Ok(transition) => transition,
                Err(err) => {
                    tracing::warn!(run_id = %run_id, proposal_id = %proposal_id, "skipping proposal: {}", err);
                    continue;
                }
            };
            info!(proposal_id = %transition.proposal_id, state = transition.state.as_str(), "proposal accepted");
            let record = review
                .finalize(&run_id, proposal_id, options.commit_message.as_deref())
                .await?;
            last_commit = Some(record);
            drain_pending(&mut handle.events)?;
        }

        if options.push {
            match last_commit {
                Some(record) => {
                    let outcome = orchestrator.push(&run_id, Some(&record.branch)).await?;
                    drain_pending(&mut handle.events)?;
                    print_line(&json!({ "type": "git/push", "payload": outcome }))?;
                }
                None => tracing::warn!(run_id = %run_id, "nothing committed, skipping push"),
            }
        }
    } else if options.push {
        tracing::warn!(run_id = %run_id, "--push needs --auto-accept and a completed run");
    }

    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "cli.run.done",
            component: "engine.main",
            run_id: Some(&run_id),
            status: Some(status.as_str()),
            ..Default::default()
        },
    );
    Ok(status)
}

/// Print events published after the stream reached `run/complete`.
fn drain_pending(events: &mut broadcast::Receiver<RunEvent>) -> anyhow::Result<()> {
    loop {
        match events.try_recv() {
            Ok(event) => print_event(&event)?,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
        }
    }
}

fn print_event(event: &RunEvent) -> anyhow::Result<()> {
    print_line(&serde_json::to_value(event)?)
}

fn print_line(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn build_cli_overrides(flags: OverrideFlags) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(flags.provider)?;
    let mut root = Map::new();

    if let Some(dir) = flags.state_dir {
        root.insert("state_dir".to_string(), Value::String(dir.display().to_string()));
    }
    if let Some(budget) = flags.budget_usd {
        if !budget.is_finite() || budget <= 0.0 {
            anyhow::bail!("--budget-usd must be a positive amount");
        }
        root.insert("budget_usd".to_string(), json!(budget));
    }

    let mut llm = Map::new();
    for (key, value) in [
        ("provider", provider),
        ("model", flags.model),
        ("api_key", flags.api_key),
        ("base_url", flags.base_url),
    ] {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            llm.insert(key.to_string(), Value::String(value));
        }
    }
    if !llm.is_empty() {
        root.insert("llm".to_string(), Value::Object(llm));
    }

    if root.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

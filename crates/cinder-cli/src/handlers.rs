//! Command handlers.

use crate::commands::{EventKind, PlanFormat, RunArgs};
use crate::config::CliConfig;
use anyhow::{Context, bail};
use chrono::Utc;
use cinder_cache::{CacheLimits, FilesystemArtifactStore, FilesystemCacheStore};
use cinder_core::ids::RunId;
use cinder_core::ports::{ArtifactStore, CacheStore, RunRepository, StepRunner};
use cinder_core::run::{FailureReason, JobInstance, JobState, RunRecord, RunStatus, StepState};
use cinder_core::trigger::TriggerEvent;
use cinder_core::workflow::{TriggerKind, WorkflowDefinition};
use cinder_runner::{DryRunner, OutputLine, OutputStream, ShellRunner};
use cinder_scheduler::repository::JsonFileRunRepository;
use cinder_scheduler::{
    Engine, ExecutorConfig, RetryPolicy, Scheduler, SchedulerConfig, StepExecutor, SystemClock,
};
use cinder_secrets::{EnvProvider, FileProvider, SecretManager, SecretManagerConfig};
use console::style;
use dialoguer::Confirm;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Validate a workflow file.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let workflow = load_workflow(path)?;
    let graph = Engine::validate(&workflow)?;

    println!(
        "{} Workflow \"{}\" is valid",
        style("✓").green(),
        workflow.name
    );
    println!("  Triggers: {}", workflow.triggers.len());
    println!("  Jobs: {} ({} instances)", workflow.jobs.len(), graph.len());
    for job in &workflow.jobs {
        let instances = graph.nodes().filter(|n| n.template == job.name).count();
        let mut line = format!("    - {} ({} steps", job.name, job.steps.len());
        if instances > 1 {
            line.push_str(&format!(", {instances} instances"));
        }
        line.push(')');
        if !job.needs.is_empty() {
            line.push_str(&format!(" needs {}", job.needs.join(", ")));
        }
        println!("{line}");
    }
    Ok(())
}

/// Print dispatch waves.
pub fn plan(path: &Path, format: PlanFormat) -> anyhow::Result<()> {
    let workflow = load_workflow(path)?;
    let graph = Engine::validate(&workflow)?;
    let waves = graph.waves();

    match format {
        PlanFormat::Json => {
            let waves: Vec<Vec<serde_json::Value>> = waves
                .iter()
                .map(|wave| {
                    wave.iter()
                        .filter_map(|id| graph.node(id))
                        .map(|node| {
                            serde_json::json!({
                                "id": node.id,
                                "template": node.template,
                                "matrix": node.assignment,
                                "needs": node.needs,
                            })
                        })
                        .collect()
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&waves)?);
        }
        PlanFormat::Text => {
            println!(
                "{} {} ({} instances)",
                style("▶").cyan(),
                style(&workflow.name).bold(),
                graph.len()
            );
            for (i, wave) in waves.iter().enumerate() {
                println!("  Wave {}:", i + 1);
                for id in wave {
                    println!("    - {id}");
                }
            }
        }
    }
    Ok(())
}

/// Print the workflow JSON schema.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(WorkflowDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Build the trigger event described by the command line.
pub fn build_event(args: &RunArgs) -> anyhow::Result<TriggerEvent> {
    let kind = match args.event {
        EventKind::Push => TriggerKind::Push,
        EventKind::PullRequest => TriggerKind::PullRequest,
        EventKind::Schedule => TriggerKind::Schedule,
        EventKind::Manual => TriggerKind::Manual,
        EventKind::WorkflowCall => TriggerKind::WorkflowCall,
    };
    let mut event = TriggerEvent::new(kind, args.git_ref.clone());

    if !args.inputs.is_empty() {
        let mut inputs = serde_json::Map::new();
        for raw in &args.inputs {
            let Some((key, value)) = raw.split_once('=') else {
                bail!("input '{raw}' is not KEY=VALUE");
            };
            inputs.insert(key.trim().to_string(), value.into());
        }
        event = event.with_payload("inputs", inputs.into());
    }
    if !args.changed_paths.is_empty() {
        event = event.with_payload("paths", args.changed_paths.clone().into());
    }
    if let Some(base_ref) = &args.base_ref {
        event = event.with_payload("base_ref", base_ref.clone().into());
    }
    Ok(event)
}

async fn secret_manager(config: &CliConfig, args: &RunArgs) -> anyhow::Result<SecretManager> {
    let mut manager = SecretManager::new(SecretManagerConfig::default());
    let prefix = (!config.secret_env_prefix.is_empty()).then(|| config.secret_env_prefix.clone());
    manager.register_provider(Arc::new(EnvProvider::new(prefix)));
    if let Some(path) = args.secrets_file.as_ref().or(config.secrets_file.as_ref()) {
        let provider = FileProvider::load(path).await?;
        manager.register_provider(Arc::new(provider));
    }
    Ok(manager)
}

fn print_output(line: &OutputLine) {
    let prefix = format!("[{} / {}]", line.instance, line.step);
    match line.stream {
        OutputStream::Stdout => println!("{} {}", style(prefix).dim(), line.content),
        OutputStream::Stderr => eprintln!("{} {}", style(prefix).dim(), line.content),
    }
}

/// Run a workflow locally. Returns whether every started run succeeded.
pub async fn run(config: &CliConfig, args: RunArgs) -> anyhow::Result<bool> {
    let workflow = Arc::new(load_workflow(&args.path)?);
    let event = build_event(&args)?;

    let runner: Arc<dyn StepRunner> = if args.dry_run {
        Arc::new(DryRunner::new())
    } else {
        Arc::new(ShellRunner::default())
    };

    let cache = Arc::new(
        FilesystemCacheStore::new(config.cache_dir()?)
            .with_compression(config.cache_compression)
            .with_limits(CacheLimits {
                max_total_bytes: Some(config.cache_max_bytes),
                max_entries: None,
                ttl: Some(chrono::Duration::days(i64::from(config.cache_ttl_days))),
            }),
    );
    let artifacts = Arc::new(FilesystemArtifactStore::new(config.artifacts_dir()?));

    let mut executor_config = ExecutorConfig {
        keep_workspaces: args.keep_workspaces,
        retry: RetryPolicy {
            max_attempts: config.step_attempts.max(1),
            ..RetryPolicy::default()
        },
        ..ExecutorConfig::default()
    };
    if let Some(root) = args.workspace.as_ref().or(config.workspace_dir.as_ref()) {
        executor_config.workspace_root = root.clone();
    }
    let mut executor = StepExecutor::new(runner, executor_config)
        .with_cache(cache.clone())
        .with_artifacts(artifacts.clone());
    if args.stream && !args.dry_run {
        let (tx, mut rx) = mpsc::channel::<OutputLine>(1024);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                print_output(&line);
            }
        });
        executor = executor.with_observer(tx);
    }

    let mut scheduler_config = SchedulerConfig::default();
    if let Some(n) = args.max_parallel.or(config.max_parallel) {
        scheduler_config.max_parallel = n.max(1);
    }
    let scheduler = Scheduler::new(Arc::new(executor), scheduler_config)
        .with_repository(Arc::new(JsonFileRunRepository::new(config.runs_dir()?)));
    let engine = Engine::new(Arc::new(scheduler))
        .with_secrets(Arc::new(secret_manager(config, &args).await?));

    let handles = engine.handle_event(workflow.clone(), &event, &SystemClock::new())?;
    if handles.is_empty() {
        println!(
            "{} No trigger of \"{}\" matches a {} event on {}",
            style("i").blue(),
            workflow.name,
            event.kind,
            event.git_ref
        );
        return Ok(true);
    }

    let tokens: Vec<_> = handles.iter().map(|h| h.cancellation_token()).collect();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} Cancelling...", style("!").yellow());
            for token in tokens {
                token.cancel();
            }
        }
    });

    let mut all_succeeded = true;
    for handle in handles {
        println!(
            "{} Running {} ({})",
            style("▶").cyan(),
            style(&workflow.name).bold(),
            style(handle.run_id()).dim()
        );
        let record = handle.wait().await?;
        print_record(&record, false);
        all_succeeded &= record.status == RunStatus::Succeeded;
    }

    match artifacts.purge_expired(Utc::now()).await {
        Ok(purged) if !purged.is_empty() => info!(count = purged.len(), "Purged expired artifacts"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Artifact purge failed"),
    }
    if let Err(e) = cache.evict(Utc::now()).await {
        warn!(error = %e, "Cache eviction failed");
    }

    Ok(all_succeeded)
}

fn describe_failure(reason: &FailureReason) -> String {
    match reason {
        FailureReason::ExitCode { code } => format!("exit code {code}"),
        FailureReason::Timeout { after_secs } => format!("timed out after {after_secs}s"),
        FailureReason::Infrastructure { message } => message.clone(),
    }
}

fn job_summary(job: &JobInstance) -> String {
    let duration = match (job.started_at, job.completed_at) {
        (Some(start), Some(end)) => {
            format!(" {:.1}s", (end - start).num_milliseconds() as f64 / 1000.0)
        }
        _ => String::new(),
    };
    let detail = job
        .steps
        .iter()
        .find(|step| step.state == StepState::Failed)
        .map(|step| {
            let reason = step
                .failure
                .as_ref()
                .map(describe_failure)
                .unwrap_or_else(|| "failed".to_string());
            format!(" step \"{}\": {reason}", step.name)
        })
        .or_else(|| job.error.as_ref().map(|e| format!(" {e}")))
        .unwrap_or_default();
    format!("{}{}{}", job.id, style(duration).dim(), detail)
}

pub fn print_record(record: &RunRecord, logs: bool) {
    for job in &record.jobs {
        let marker = match job.state {
            JobState::Succeeded => style("✓").green(),
            JobState::Failed => style("✗").red(),
            JobState::Cancelled => style("⊘").yellow(),
            JobState::Skipped => style("-").dim(),
            _ => style("?").dim(),
        };
        println!("  {marker} {}", job_summary(job));
        if logs {
            for step in &job.steps {
                println!("      {} [{}]", style(&step.name).bold(), step.state.as_str());
                for line in step.log.lines() {
                    println!("        {line}");
                }
            }
        }
    }

    let status = match record.status {
        RunStatus::Succeeded => style("succeeded").green(),
        RunStatus::Failed => style("failed").red(),
        RunStatus::Cancelled => style("cancelled").yellow(),
        RunStatus::Running => style("running").cyan(),
    };
    let duration = record
        .duration_ms
        .map(|ms| format!(" in {:.1}s", ms as f64 / 1000.0))
        .unwrap_or_default();
    println!("Run {} {status}{duration}", record.id);
}

pub async fn list_runs(config: &CliConfig, limit: usize) -> anyhow::Result<()> {
    let runs = JsonFileRunRepository::new(config.runs_dir()?).list().await?;
    if runs.is_empty() {
        println!("{} No runs recorded", style("i").blue());
        return Ok(());
    }
    for record in runs.into_iter().take(limit) {
        println!(
            "{}  {:<24} {:<10} {}",
            record.id,
            record.workflow,
            format!("{:?}", record.status).to_lowercase(),
            record.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn show_run(config: &CliConfig, run_id: &str, logs: bool) -> anyhow::Result<()> {
    let id: RunId = run_id
        .parse()
        .with_context(|| format!("invalid run id: {run_id}"))?;
    let Some(record) = JsonFileRunRepository::new(config.runs_dir()?).get(id).await? else {
        bail!("run {run_id} not found");
    };
    println!(
        "{} {} on {} ({})",
        style(&record.workflow).bold(),
        record.trigger,
        record.git_ref,
        record.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    print_record(&record, logs);
    Ok(())
}

fn open_cache(config: &CliConfig) -> anyhow::Result<FilesystemCacheStore> {
    Ok(FilesystemCacheStore::new(config.cache_dir()?).with_compression(config.cache_compression))
}

pub async fn list_cache(config: &CliConfig, prefix: Option<&str>) -> anyhow::Result<()> {
    let entries = open_cache(config)?.list(prefix).await?;
    if entries.is_empty() {
        println!("{} No cache entries", style("i").blue());
        return Ok(());
    }
    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    for entry in &entries {
        println!(
            "{:<48} {:>10}  {}  hits {}",
            entry.key,
            format_bytes(entry.size_bytes),
            entry.last_accessed_at.format("%Y-%m-%d %H:%M"),
            entry.access_count
        );
    }
    println!("{} entries, {}", entries.len(), format_bytes(total));
    Ok(())
}

pub async fn clear_cache(config: &CliConfig, prefix: Option<&str>, yes: bool) -> anyhow::Result<()> {
    let cache = open_cache(config)?;
    let entries = cache.list(prefix).await?;
    if entries.is_empty() {
        println!("{} No cache entries", style("i").blue());
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Remove {} cache entries?", entries.len()))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("{} Cancelled", style("!").yellow());
            return Ok(());
        }
    }

    let removed = match prefix {
        Some(_) => {
            for entry in &entries {
                cache.delete(&entry.key).await?;
            }
            entries.len()
        }
        None => cache.clear().await?.len(),
    };
    println!("{} Removed {removed} cache entries", style("✓").green());
    Ok(())
}

pub async fn evict_cache(config: &CliConfig) -> anyhow::Result<()> {
    let cache = open_cache(config)?.with_limits(CacheLimits {
        max_total_bytes: Some(config.cache_max_bytes),
        max_entries: None,
        ttl: Some(chrono::Duration::days(i64::from(config.cache_ttl_days))),
    });
    let evicted = cache.evict(Utc::now()).await?;
    for (entry, reason) in &evicted {
        println!("  - {} ({reason:?})", entry.key);
    }
    println!("{} Evicted {} cache entries", style("✓").green(), evicted.len());
    Ok(())
}

pub fn show_config(config: &CliConfig) -> anyhow::Result<()> {
    println!("Current configuration:");
    print!("{}", serde_yaml::to_string(config)?);
    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }
    if let Ok(dir) = config.data_dir() {
        println!("Data directory: {}", dir.display());
    }
    Ok(())
}

pub fn set_config(config_path: Option<&Path>, key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load(config_path)?;
    config.set(key, value)?;
    let path = config.save(config_path)?;
    println!("{} Set {key} = {value} ({})", style("✓").green(), path.display());
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn args(event: EventKind) -> RunArgs {
        RunArgs {
            path: PathBuf::from("cinder.yaml"),
            event,
            git_ref: "refs/heads/main".to_string(),
            inputs: Vec::new(),
            changed_paths: Vec::new(),
            base_ref: None,
            max_parallel: None,
            dry_run: false,
            secrets_file: None,
            workspace: None,
            keep_workspaces: false,
            stream: false,
        }
    }

    #[test]
    fn test_build_event_payload() {
        let mut run = args(EventKind::PullRequest);
        run.inputs = vec!["env=staging".into(), "note=a=b".into()];
        run.changed_paths = vec!["src/lib.rs".into()];
        run.base_ref = Some("main".into());

        let event = build_event(&run).unwrap();
        assert_eq!(event.kind, TriggerKind::PullRequest);
        assert_eq!(event.inputs().get("env").map(String::as_str), Some("staging"));
        assert_eq!(event.inputs().get("note").map(String::as_str), Some("a=b"));
        assert_eq!(event.changed_paths(), Some(vec!["src/lib.rs".to_string()]));
        assert_eq!(event.payload["base_ref"], serde_json::json!("main"));
    }

    #[test]
    fn test_build_event_rejects_bad_input() {
        let mut run = args(EventKind::Manual);
        run.inputs = vec!["novalue".into()];
        assert!(build_event(&run).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_load_and_validate_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.yaml");
        std::fs::write(
            &path,
            "name: ci\ntriggers:\n  - on: push\njobs:\n  - name: lint\n    steps:\n      - name: check\n        run: cargo fmt --check\n",
        )
        .unwrap();

        let workflow = load_workflow(&path).unwrap();
        assert_eq!(workflow.jobs.len(), 1);
        validate(&path).unwrap();
        plan(&path, PlanFormat::Json).unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_records_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.yaml");
        std::fs::write(
            &path,
            "name: ci\ntriggers:\n  - on: manual\njobs:\n  - name: build\n    steps:\n      - name: compile\n        run: make\n  - name: test\n    needs: [build]\n    steps:\n      - name: unit\n        run: make test\n",
        )
        .unwrap();

        let config = CliConfig {
            data_dir: Some(dir.path().join("data")),
            workspace_dir: Some(dir.path().join("work")),
            ..CliConfig::default()
        };
        let mut run_args = args(EventKind::Manual);
        run_args.path = path;
        run_args.dry_run = true;

        assert!(run(&config, run_args).await.unwrap());

        let runs = JsonFileRunRepository::new(config.runs_dir().unwrap())
            .list()
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(runs[0].jobs.len(), 2);
    }
}

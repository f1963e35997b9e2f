use anyhow::{Context, Result};
use aof_core::{AofError, Executor, ExecutorResult, OrgChart, TaskContext, Workflow};
use aof_engine::Scheduler;
use aof_protocol::ProtocolRouter;
use aof_service::notify::{NotificationRule, RuleSet, Severity, TracingAdapter};
use aof_service::{
    config::OrchestratorConfig,
    notify::NotificationPolicy,
    service::OrchestrationService,
    telemetry::{init_telemetry, log_shutdown_info, log_startup_info},
};
use aof_store::{EventLogger, TaskStore};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "aofd")]
#[command(about = "AOF orchestration daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Project root directory holding tasks/ and events/
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Project scope identifier
    #[arg(long, env = "PROJECT_ID")]
    project: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Plan polls without executing them
    #[arg(long)]
    dry_run: bool,
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(config_file) => {
            info!("Loading configuration from file: {}", config_file);
            OrchestratorConfig::from_file(config_file)?
        }
        None => OrchestratorConfig::from_env()?,
    };

    if let Some(ref data_dir) = cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(ref project) = cli.project {
        config.project_id = project.clone();
    }
    if let Some(ref log_level) = cli.log_level {
        config.logging.level = log_level.clone();
    }
    if cli.dry_run {
        config.dry_run = true;
    }

    Ok(config)
}

/// Placeholder executor until a transport is wired in: accepts every
/// dispatch and logs it. Agents are expected to watch the task tree.
struct LoggingExecutor;

#[async_trait]
impl Executor for LoggingExecutor {
    async fn spawn(&self, ctx: TaskContext) -> ExecutorResult {
        info!(
            task_id = %ctx.task_id,
            agent = %ctx.agent,
            task_relpath = %ctx.task_relpath,
            "Dispatching task"
        );
        ExecutorResult::ok()
    }
}

async fn load_workflow(config: &OrchestratorConfig) -> Result<Option<Workflow>> {
    let Some(path) = &config.workflow_file else {
        return Ok(None);
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading workflow file {}", path.display()))?;
    let workflow: Workflow = serde_yaml::from_str(&text)
        .map_err(|e| AofError::Validation(format!("workflow file: {e}")))
        .context("parsing workflow file")?;
    workflow
        .validate()
        .context("validating workflow file")?;
    Ok(Some(workflow))
}

async fn load_org(config: &OrchestratorConfig) -> Result<OrgChart> {
    let Some(path) = &config.org_file else {
        return Ok(OrgChart::default());
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading org chart file {}", path.display()))?;
    let org: OrgChart = serde_yaml::from_str(&text)
        .map_err(|e| AofError::Validation(format!("org chart file: {e}")))
        .context("parsing org chart file")?;
    Ok(org)
}

/// Built-in rules covering the operator-facing failure surface
fn default_rules() -> Vec<NotificationRule> {
    let rule = |event_type: &str, severity: Severity, template: &str| NotificationRule {
        matcher: aof_service::notify::RuleMatch {
            event_type: event_type.to_string(),
            payload: Default::default(),
        },
        severity,
        channel: "operators".to_string(),
        dedupe_window_ms: None,
        never_suppress: severity == Severity::Critical,
        template: template.to_string(),
    };

    vec![
        rule(
            "sla.violation",
            Severity::Critical,
            "SLA violation on {taskId}: {payload.detail}",
        ),
        rule(
            "gate_timeout_escalation",
            Severity::Critical,
            "Gate {payload.gate} on {taskId} escalated from {payload.fromRole} to {payload.toRole}",
        ),
        rule(
            "gate_timeout",
            Severity::Warning,
            "Gate {payload.gate} on {taskId} exceeded its timeout",
        ),
        rule(
            "scheduler_action_failed",
            Severity::Warning,
            "Scheduler action {payload.kind} failed on {taskId}: {payload.error}",
        ),
        rule(
            "lease.expired",
            Severity::Warning,
            "Lease for {taskId} expired (agent {payload.agent})",
        ),
        rule(
            "task.stuck",
            Severity::Info,
            "{taskId} has been ready for {payload.ageMs}ms",
        ),
        rule(
            "concurrency.platformLimit",
            Severity::Warning,
            "Platform limit {payload.detectedLimit} lowered the dispatch cap to {payload.effectiveCap}",
        ),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_telemetry(&config.logging)?;
    config.validate().context("Configuration validation failed")?;
    log_startup_info(&config);

    let store = Arc::new(
        TaskStore::open(&config.data_dir)
            .await
            .context("Opening task store")?,
    );
    let logger = Arc::new(
        EventLogger::new(config.data_dir.join("events")).context("Opening event journal")?,
    );

    let workflow = load_workflow(&config).await?;
    let org = load_org(&config).await?;

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        logger.clone(),
        Arc::new(LoggingExecutor),
        org,
        workflow.clone(),
        config.scheduler_config(),
    ));
    let router = Arc::new(ProtocolRouter::new(
        store.clone(),
        logger.clone(),
        workflow,
    ));
    let policy = Arc::new(NotificationPolicy::new(
        RuleSet::compile(default_rules()).context("Compiling notification rules")?,
        Arc::new(TracingAdapter),
        config.dedupe_window_ms,
        config.storm.window_ms,
        config.storm.threshold,
    ));

    let service = OrchestrationService::new(
        scheduler,
        Some(router),
        logger,
        policy,
        &config,
    );

    service.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for shutdown signal")?;
    info!("Shutdown signal received");

    service.stop().await;
    log_shutdown_info();
    Ok(())
}

//! Steward binary: builds every component at a single construction site
//! and runs the worker loops until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use steward::approval::{run_approval, ApprovalController};
use steward::audit::{self, AuditStream};
use steward::autonomy::actions::ActionRegistry;
use steward::autonomy::runner::{run_autonomy, AutonomyLoop, AutonomyWorker};
use steward::config::{Config, RuntimePaths};
use steward::docwriter;
use steward::domain::{run_router, DomainRouter};
use steward::logging;
use steward::manager::{run_manager, Manager};
use steward::mcp::{run_health_loop, McpRouter};
use steward::memory::MemoryLog;
use steward::planner::{run_planner, Planner};
use steward::resilience::{run_monitor, ResilienceController};
use steward::sched::{actions::builtin_actions, run_scheduler, Scheduler, SchedulerCtx};
use steward::skills;
use steward::store::TaskStore;
use steward::types::AgentPriority;
use steward::validator::{run_validator, Validator};

/// Filesystem-driven multi-agent orchestration runtime.
#[derive(Debug, Parser)]
#[command(name = "steward", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run all pipeline workers (default).
    Start {
        /// Vault root directory (overrides config and environment).
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Create the directory layout and default files, then exit.
    Init {
        /// Vault root directory.
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Init { root }) => {
            logging::init_tool();
            let paths = resolve_paths(root)?;
            paths.ensure().await.context("failed to create layout")?;
            docwriter::generate_all(&paths).await?;
            info!(root = %paths.root.display(), "layout initialised");
            Ok(())
        }
        Some(Command::Start { root }) => run(root).await,
        None => run(None).await,
    }
}

fn resolve_paths(override_root: Option<PathBuf>) -> Result<RuntimePaths> {
    let config = Config::load()?;
    let root = override_root.unwrap_or_else(|| config.root_dir());
    Ok(RuntimePaths::resolve(&root))
}

async fn run(override_root: Option<PathBuf>) -> Result<()> {
    let config = Config::load()?;
    let root = override_root.unwrap_or_else(|| config.root_dir());
    let paths = RuntimePaths::resolve(&root);
    paths.ensure().await.context("failed to create layout")?;

    let _logging_guard =
        logging::init_daemon(&paths.logs).context("failed to initialise logging")?;
    info!(root = %paths.root.display(), "steward starting");

    // Audit stream: one construction site, explicit dependency for
    // every component.
    let session_id = audit::new_session_id(chrono::Utc::now());
    let (audit_stream, audit_rx) = AuditStream::channel(&session_id);

    let store = TaskStore;
    let resilience =
        Arc::new(ResilienceController::open(&paths.logs, audit_stream.clone()).await);
    for (agent, priority) in [
        ("domain_router", AgentPriority::Normal),
        ("planner", AgentPriority::Normal),
        ("manager", AgentPriority::High),
        ("approval", AgentPriority::Normal),
        ("autonomy", AgentPriority::Critical),
        ("validator", AgentPriority::Normal),
        ("scheduler", AgentPriority::Normal),
        ("mcp_router", AgentPriority::High),
        ("resilience", AgentPriority::High),
    ] {
        resilience.register_agent(agent, priority).await;
    }

    let mcp = Arc::new(McpRouter::new(audit_stream.clone()));
    for service in config.mcp_services() {
        mcp.register(service).await;
    }

    let registry = Arc::new(skills::default_registry(Arc::clone(&mcp)));
    let approval = Arc::new(ApprovalController::new(
        store.clone(),
        paths.clone(),
        audit_stream.clone(),
        Arc::clone(&resilience),
    ));
    let manager = Arc::new(Manager::new(
        store.clone(),
        paths.clone(),
        audit_stream.clone(),
        Arc::clone(&resilience),
        Arc::clone(&registry),
        Arc::clone(&approval),
    ));
    manager.register_requeue_handlers().await;

    let router = Arc::new(DomainRouter::new(
        store.clone(),
        paths.clone(),
        audit_stream.clone(),
        Arc::clone(&resilience),
    ));
    let planner = Arc::new(Planner::new(
        store.clone(),
        paths.clone(),
        audit_stream.clone(),
        Arc::clone(&resilience),
    ));

    let mut actions = ActionRegistry::with_builtins();
    actions.register_skills(&registry);
    let autonomy = Arc::new(AutonomyWorker::new(
        AutonomyLoop::new(actions, &paths.autonomy_states, audit_stream.clone()),
        store.clone(),
        paths.clone(),
        audit_stream.clone(),
        Arc::clone(&resilience),
    ));

    let memory = Arc::new(MemoryLog::open(&paths).await);
    let validator = Arc::new(Validator::new(
        store.clone(),
        paths.clone(),
        audit_stream.clone(),
        Arc::clone(&resilience),
        Arc::clone(&memory),
    ));

    let scheduler = Arc::new(
        Scheduler::open(
            SchedulerCtx {
                paths: paths.clone(),
                audit: audit_stream.clone(),
                resilience: Arc::clone(&resilience),
            },
            builtin_actions(),
        )
        .await,
    );

    audit_stream.system(
        "startup",
        "steward",
        serde_json::json!({
            "root": paths.root.display().to_string(),
            "skills": registry.ids(),
        }),
    );

    // Workers share one shutdown signal; each observes it at its next
    // poll boundary, finishes its unit of work, and exits. The audit
    // writer instead runs until every producer handle is dropped, so it
    // drains everything the exiting workers queued.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let intervals = &config.workers;
    let writer = tokio::spawn(audit::run_writer(
        paths.audit.clone(),
        audit_rx,
        session_id.clone(),
    ));
    let mut handles = Vec::new();
    handles.push(tokio::spawn(run_monitor(
        Arc::clone(&resilience),
        Duration::from_secs(intervals.monitor_secs),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_health_loop(
        Arc::clone(&mcp),
        Duration::from_secs(intervals.mcp_health_secs),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_router(
        router,
        Duration::from_secs(intervals.router_secs),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_planner(
        planner,
        Duration::from_secs(intervals.planner_secs),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_manager(
        manager,
        Duration::from_secs(intervals.manager_secs),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_approval(
        approval,
        Duration::from_secs(intervals.approval_secs),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_autonomy(
        autonomy,
        Duration::from_secs(intervals.autonomy_secs),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_validator(
        validator,
        Duration::from_secs(intervals.validator_secs),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_scheduler(
        scheduler,
        Duration::from_secs(intervals.scheduler_secs),
        shutdown_rx.clone(),
    )));

    info!("steward ready, all workers running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    audit_stream.system("shutdown", "steward", serde_json::json!({}));

    if shutdown_tx.send(true).is_err() {
        warn!("no workers listening for shutdown");
    }
    for handle in handles {
        let _ = handle.await;
    }
    // Everything still held here carries an audit handle (directly or
    // through the skill registry); dropping them closes the channel and
    // lets the writer drain and exit.
    drop(audit_stream);
    drop((resilience, mcp, registry, memory));
    let _ = writer.await;
    info!("steward stopped");
    Ok(())
}

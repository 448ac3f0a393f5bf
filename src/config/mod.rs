//! Configuration loading and runtime path resolution.
//!
//! Configuration comes from `./steward.toml` (or `$STEWARD_CONFIG_PATH`);
//! a missing file means defaults. Environment variables override file
//! values; file values override defaults. The only inputs consumed are
//! directory roots, worker intervals, and MCP service endpoints; no
//! credentials.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::{BUSINESS_CATEGORIES, PERSONAL_CATEGORIES};
use crate::mcp::ServiceConfig;
use crate::types::Domain;

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the task vault. Defaults to `./vault`.
    pub root: Option<PathBuf>,
    /// Worker poll intervals.
    pub workers: WorkerIntervals,
    /// MCP service registrations. Empty means the default five local
    /// backends.
    pub mcp: Vec<ServiceConfig>,
}

/// Per-worker poll intervals, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerIntervals {
    /// Inbox scan interval.
    pub router_secs: u64,
    /// Planner scan interval.
    pub planner_secs: u64,
    /// Manager scan interval.
    pub manager_secs: u64,
    /// Approval artifact scan interval.
    pub approval_secs: u64,
    /// Autonomy task scan interval.
    pub autonomy_secs: u64,
    /// Validator scan interval.
    pub validator_secs: u64,
    /// Scheduler tick.
    pub scheduler_secs: u64,
    /// Resilience monitor tick.
    pub monitor_secs: u64,
    /// MCP health probe interval.
    pub mcp_health_secs: u64,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            router_secs: 5,
            planner_secs: 5,
            manager_secs: 5,
            approval_secs: 5,
            autonomy_secs: 5,
            validator_secs: 5,
            scheduler_secs: 30,
            monitor_secs: 10,
            mcp_health_secs: 60,
        }
    }
}

impl Config {
    /// Load with precedence: env vars > TOML file > defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = std::env::var("STEWARD_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("steward.toml"));
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                toml::from_str(&contents).context("failed to parse config TOML")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Apply environment overrides. Takes a resolver function so tests
    /// avoid mutating the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(root) = env("STEWARD_ROOT") {
            self.root = Some(PathBuf::from(root));
        }
        if let Some(v) = env("STEWARD_SCHEDULER_SECS") {
            match v.parse() {
                Ok(n) => self.workers.scheduler_secs = n,
                Err(_) => tracing::warn!(
                    var = "STEWARD_SCHEDULER_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STEWARD_MONITOR_SECS") {
            match v.parse() {
                Ok(n) => self.workers.monitor_secs = n,
                Err(_) => tracing::warn!(
                    var = "STEWARD_MONITOR_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Resolved vault root.
    pub fn root_dir(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| PathBuf::from("vault"))
    }

    /// MCP registrations: configured set, or the default local backends.
    pub fn mcp_services(&self) -> Vec<ServiceConfig> {
        if self.mcp.is_empty() {
            crate::mcp::default_services()
        } else {
            self.mcp.clone()
        }
    }
}

// ── Runtime paths ───────────────────────────────────────────────

/// Every directory of the filesystem layout, resolved from the root.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Vault root.
    pub root: PathBuf,
    /// `Inbox/`: received tasks.
    pub inbox: PathBuf,
    /// `Domains/`: classified tasks.
    pub domains: PathBuf,
    /// `Needs_Approval/`: pending approvals plus artifacts.
    pub needs_approval: PathBuf,
    /// `Done/`: terminal tasks.
    pub done: PathBuf,
    /// `Logs/`: state files and human-readable logs.
    pub logs: PathBuf,
    /// `Audit/`: append-only event partitions.
    pub audit: PathBuf,
    /// `Docs/`: derived documentation.
    pub docs: PathBuf,
    /// `Logs/autonomy_states/`: execution checkpoints.
    pub autonomy_states: PathBuf,
    /// `schedule.md`: declarative schedule.
    pub schedule_file: PathBuf,
    /// `Dashboard.md`: rendered metrics.
    pub dashboard: PathBuf,
}

impl RuntimePaths {
    /// Resolve all paths under `root` without touching the filesystem.
    pub fn resolve(root: &Path) -> Self {
        let logs = root.join("Logs");
        Self {
            root: root.to_path_buf(),
            inbox: root.join("Inbox"),
            domains: root.join("Domains"),
            needs_approval: root.join("Needs_Approval"),
            done: root.join("Done"),
            autonomy_states: logs.join("autonomy_states"),
            audit: root.join("Audit"),
            docs: root.join("Docs"),
            schedule_file: root.join("schedule.md"),
            dashboard: root.join("Dashboard.md"),
            logs,
        }
    }

    /// Directory of one domain category.
    pub fn domain_category_dir(&self, domain: Domain, category: &str) -> PathBuf {
        self.domains.join(domain.dir_name()).join(category)
    }

    /// All known domain category directories.
    pub fn all_domain_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for (categories, domain) in [
            (PERSONAL_CATEGORIES, Domain::Personal),
            (BUSINESS_CATEGORIES, Domain::Business),
        ] {
            for (category, _) in categories {
                dirs.push(self.domain_category_dir(domain, category));
            }
            dirs.push(self.domain_category_dir(domain, "general"));
            dirs.push(self.domain_category_dir(domain, "explicit"));
            dirs.push(self.domain_category_dir(domain, "default"));
        }
        dirs
    }

    /// Create the full directory layout.
    pub async fn ensure(&self) -> std::io::Result<()> {
        let mut dirs = vec![
            self.inbox.clone(),
            self.needs_approval.clone(),
            self.done.clone(),
            self.logs.clone(),
            self.audit.clone(),
            self.docs.clone(),
            self.autonomy_states.clone(),
            self.logs.join("resilience"),
            self.logs.join("failure_queue"),
            self.logs.join("failure_queue/dead_letter"),
        ];
        dirs.extend(self.all_domain_dirs());
        for dir in dirs {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

//! Resilience controller: heartbeats, retry-with-fallback, failure queue,
//! and system health grading.
//!
//! Core principle: the process must never crash. Every external operation
//! runs through [`ResilienceController::execute_with_resilience`], which
//! retries with backoff and jitter, falls back per the declared fallback
//! map, queues jobs to disk when the fallback contract says so, and
//! always returns a well-typed degraded result instead of an error. The
//! monitor loop itself is guard-wrapped: a failing tick is logged and the
//! loop resumes.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::audit::AuditStream;
use crate::fsutil;
use crate::retry::RetryPolicy;
use crate::types::{AgentPriority, AgentState, FailureKind, HealthGrade};

/// Bounded failure-queue re-attempts before dead-lettering.
const MAX_QUEUE_RETRIES: u32 = 3;

/// History records kept in state.
const HISTORY_LIMIT: usize = 100;

// ── Records ─────────────────────────────────────────────────────

/// Health record for one monitored agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent identifier (worker or skill name).
    pub agent_id: String,
    /// Last observed liveness state.
    pub status: AgentState,
    /// Most recent heartbeat, if any.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Most recent error message (truncated).
    pub last_error: Option<String>,
    /// Lifetime error count.
    pub error_count: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Most recent successful operation.
    pub last_success: Option<DateTime<Utc>>,
    /// Priority class governing thresholds and retry budgets.
    pub priority: AgentPriority,
}

impl AgentHealth {
    fn new(agent_id: &str, priority: AgentPriority) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            status: AgentState::Unknown,
            last_heartbeat: None,
            last_error: None,
            error_count: 0,
            consecutive_failures: 0,
            last_success: None,
            priority,
        }
    }
}

/// Declared fallback behavior for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSpec {
    /// Primary operation name.
    pub primary: String,
    /// Fallback operation name.
    pub fallback: String,
    /// Degradation level entered when the fallback engages.
    pub degradation_level: u8,
    /// Persist the job to the on-disk failure queue when the fallback
    /// path is taken.
    pub queue_on_fail: bool,
    /// Whether the owner should be notified.
    pub notify: bool,
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Failing agent.
    pub agent_id: String,
    /// Failure kind.
    pub kind: FailureKind,
    /// Error message (truncated to 500 chars).
    pub error: String,
    /// Attempt number at the time of failure.
    pub retry_attempt: u32,
    /// Fallback engaged for this failure, if any.
    pub fallback_used: Option<String>,
    /// Whether a later success resolved it.
    pub resolved: bool,
}

/// Aggregate metrics persisted with the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceMetrics {
    /// Controller start time.
    pub start_time: DateTime<Utc>,
    /// Seconds since start, refreshed each monitor tick.
    pub uptime_secs: u64,
    /// Lifetime failure count.
    pub total_failures: u64,
    /// Currently active failures.
    pub active_failures: usize,
}

impl Default for ResilienceMetrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            uptime_secs: 0,
            total_failures: 0,
            active_failures: 0,
        }
    }
}

/// Whole-system resilience state, persisted via temp + rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    /// Current health grade.
    pub health: HealthGrade,
    /// Per-agent health records.
    pub agents: BTreeMap<String, AgentHealth>,
    /// Failures not yet resolved by a success.
    pub active_failures: Vec<FailureRecord>,
    /// Bounded failure history.
    pub failure_history: Vec<FailureRecord>,
    /// When the system last left healthy.
    pub degraded_since: Option<DateTime<Utc>>,
    /// When recovery back to healthy began.
    pub recovery_started: Option<DateTime<Utc>>,
    /// Aggregate counters.
    pub metrics: ResilienceMetrics,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            health: HealthGrade::Healthy,
            agents: BTreeMap::new(),
            active_failures: Vec::new(),
            failure_history: Vec::new(),
            degraded_since: None,
            recovery_started: None,
            metrics: ResilienceMetrics::default(),
        }
    }
}

/// Queued job awaiting re-attempt after primary and fallback both failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Owning agent.
    pub agent_id: String,
    /// Priority it was running at.
    pub priority: AgentPriority,
    /// When it was queued.
    pub queued_at: DateTime<Utc>,
    /// Re-attempts so far.
    pub retry_count: u32,
    /// Last re-attempt time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry: Option<DateTime<Utc>>,
    /// Opaque job context for the requeue handler (e.g. the task path).
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Handler invoked for queued jobs of one agent. Returning `true`
/// re-admits the job and removes it from the queue.
#[async_trait]
pub trait RequeueHandler: Send + Sync {
    /// Attempt to re-admit a queued job.
    async fn requeue(&self, job: &QueuedJob) -> bool;
}

// ── Controller ──────────────────────────────────────────────────

/// Process-wide resilience state with single-writer discipline: all
/// mutation goes through this controller.
pub struct ResilienceController {
    state_path: PathBuf,
    queue_dir: PathBuf,
    degraded_log: PathBuf,
    audit: AuditStream,
    state: Mutex<SystemState>,
    fallbacks: HashMap<String, FallbackSpec>,
    safe_defaults: HashMap<String, serde_json::Value>,
    requeue: RwLock<HashMap<String, Arc<dyn RequeueHandler>>>,
}

fn fallback_spec(primary: &str, fallback: &str, level: u8) -> FallbackSpec {
    FallbackSpec {
        primary: primary.to_owned(),
        fallback: fallback.to_owned(),
        degradation_level: level,
        queue_on_fail: true,
        notify: false,
    }
}

fn default_fallback_map() -> HashMap<String, FallbackSpec> {
    let entries = [
        fallback_spec("email", "log_only", 1),
        fallback_spec("linkedin_marketing", "content_generate", 1),
        fallback_spec("accounting", "local_record", 2),
        fallback_spec("social_media", "draft_only", 1),
        fallback_spec("automation", "manual_queue", 2),
    ];
    entries
        .into_iter()
        .map(|spec| (spec.primary.clone(), spec))
        .collect()
}

fn default_safe_defaults() -> HashMap<String, serde_json::Value> {
    HashMap::from([
        (
            "email".to_owned(),
            serde_json::json!({"success": false, "queued": true}),
        ),
        (
            "linkedin_marketing".to_owned(),
            serde_json::json!({"success": false, "draft_saved": true}),
        ),
        (
            "accounting".to_owned(),
            serde_json::json!({"success": false, "local_record": true}),
        ),
        (
            "social_media".to_owned(),
            serde_json::json!({"success": false, "draft_saved": true}),
        ),
    ])
}

impl ResilienceController {
    /// Open the controller, loading persisted state from
    /// `<logs_dir>/resilience/system_state.json` when present.
    pub async fn open(logs_dir: &std::path::Path, audit: AuditStream) -> Self {
        let state_dir = logs_dir.join("resilience");
        let state_path = state_dir.join("system_state.json");
        let queue_dir = logs_dir.join("failure_queue");
        let degraded_log = logs_dir.join("degraded_mode_log.md");

        let mut state = match tokio::fs::read_to_string(&state_path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => SystemState::default(),
        };
        state.metrics.start_time = Utc::now();
        info!(health = %state.health, "resilience state loaded");

        Self {
            state_path,
            queue_dir,
            degraded_log,
            audit,
            state: Mutex::new(state),
            fallbacks: default_fallback_map(),
            safe_defaults: default_safe_defaults(),
            requeue: RwLock::new(HashMap::new()),
        }
    }

    /// Register an agent for heartbeat monitoring.
    pub async fn register_agent(&self, agent_id: &str, priority: AgentPriority) {
        let mut state = self.state.lock().await;
        state
            .agents
            .entry(agent_id.to_owned())
            .or_insert_with(|| AgentHealth::new(agent_id, priority));
        info!(agent = agent_id, priority = %priority, "agent registered");
    }

    /// Record a heartbeat. Unknown agents are auto-registered at normal
    /// priority.
    pub async fn heartbeat(&self, agent_id: &str) {
        self.heartbeat_at(agent_id, Utc::now()).await;
    }

    /// Heartbeat with an explicit timestamp (testing seam).
    pub async fn heartbeat_at(&self, agent_id: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let entry = state
            .agents
            .entry(agent_id.to_owned())
            .or_insert_with(|| AgentHealth::new(agent_id, AgentPriority::Normal));
        entry.last_heartbeat = Some(at);
        entry.status = AgentState::Running;
    }

    /// Record a failure: update the agent record, the active set, the
    /// history, and the derived health grade, then persist and audit.
    pub async fn record_failure(
        &self,
        agent_id: &str,
        kind: FailureKind,
        error: &str,
        correlation_id: Option<&str>,
    ) {
        let error: String = error.chars().take(500).collect();
        {
            let mut state = self.state.lock().await;
            let attempt = {
                let entry = state
                    .agents
                    .entry(agent_id.to_owned())
                    .or_insert_with(|| AgentHealth::new(agent_id, AgentPriority::Normal));
                entry.last_error = Some(error.clone());
                entry.error_count = entry.error_count.saturating_add(1);
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.status = AgentState::Failed;
                entry.consecutive_failures
            };
            let record = FailureRecord {
                timestamp: Utc::now(),
                agent_id: agent_id.to_owned(),
                kind,
                error: error.clone(),
                retry_attempt: attempt,
                fallback_used: None,
                resolved: false,
            };
            state.active_failures.push(record.clone());
            state.failure_history.push(record);
            let excess = state.failure_history.len().saturating_sub(HISTORY_LIMIT);
            if excess > 0 {
                state.failure_history.drain(..excess);
            }
            state.metrics.total_failures = state.metrics.total_failures.saturating_add(1);
            state.metrics.active_failures = state.active_failures.len();
            self.update_health(&mut state).await;
        }
        self.save_state().await;
        self.audit.failure(
            agent_id,
            kind,
            &error,
            correlation_id,
            serde_json::json!({}),
        );
        warn!(agent = agent_id, kind = %kind, "failure recorded");
    }

    /// Record a success: reset the failure streak and resolve the
    /// agent's active failures.
    pub async fn record_success(&self, agent_id: &str) {
        {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let entry = state
                .agents
                .entry(agent_id.to_owned())
                .or_insert_with(|| AgentHealth::new(agent_id, AgentPriority::Normal));
            entry.status = AgentState::Running;
            entry.last_success = Some(now);
            entry.last_heartbeat = Some(now);
            entry.consecutive_failures = 0;
            state.active_failures.retain(|f| f.agent_id != agent_id);
            state.metrics.active_failures = state.active_failures.len();
            self.update_health(&mut state).await;
        }
        self.save_state().await;
    }

    /// Re-derive the health grade from active failures; on transition,
    /// log, stamp the degraded/recovery timestamps, append the degraded
    /// log, and emit a system audit event.
    async fn update_health(&self, state: &mut SystemState) {
        let critical = state
            .active_failures
            .iter()
            .filter(|f| {
                state
                    .agents
                    .get(&f.agent_id)
                    .map(|a| a.priority == AgentPriority::Critical)
                    .unwrap_or(false)
            })
            .count();
        let high = state
            .active_failures
            .iter()
            .filter(|f| {
                state
                    .agents
                    .get(&f.agent_id)
                    .map(|a| a.priority == AgentPriority::High)
                    .unwrap_or(false)
            })
            .count();
        let total = state.active_failures.len();

        let new_health = if critical > 0 {
            HealthGrade::Degraded3
        } else if high > 0 || total > 3 {
            HealthGrade::Degraded2
        } else if total > 0 {
            HealthGrade::Degraded1
        } else if matches!(
            state.health,
            HealthGrade::Degraded1 | HealthGrade::Degraded2 | HealthGrade::Degraded3
        ) {
            HealthGrade::Recovery
        } else {
            HealthGrade::Healthy
        };

        if new_health != state.health {
            info!(from = %state.health, to = %new_health, "system health changed");
            if state.health == HealthGrade::Healthy && new_health != HealthGrade::Healthy {
                state.degraded_since = Some(Utc::now());
                self.append_degraded_log(state, new_health).await;
            }
            if new_health == HealthGrade::Recovery {
                state.recovery_started = Some(Utc::now());
            }
            if new_health == HealthGrade::Healthy {
                state.degraded_since = None;
            }
            self.audit.system(
                "health_changed",
                "resilience",
                serde_json::json!({
                    "from": state.health.as_str(),
                    "to": new_health.as_str(),
                    "active_failures": state.active_failures.len(),
                }),
            );
            state.health = new_health;
        } else if new_health == HealthGrade::Recovery {
            // One grading pass after recovery settles back to healthy.
            state.health = HealthGrade::Healthy;
            state.degraded_since = None;
        }
    }

    async fn append_degraded_log(&self, state: &SystemState, grade: HealthGrade) {
        let stamp = Local::now().format(crate::store::TIMESTAMP_FMT);
        let mut entry = format!(
            "\n---\n\n## Degraded Mode Entry\n\n**Time:** {stamp}\n**Level:** {}\n**Active Failures:** {}\n\n### Active Issues\n\n",
            grade.as_str().to_uppercase(),
            state.active_failures.len()
        );
        for failure in state.active_failures.iter().rev().take(10) {
            let head: String = failure.error.chars().take(100).collect();
            entry.push_str(&format!(
                "- **{}**: {} - {}\n",
                failure.agent_id, failure.kind, head
            ));
        }
        if !self.degraded_log.exists() {
            entry = format!("# Degraded Mode Log\n{entry}");
        }
        if let Err(e) = fsutil::append_to_file(&self.degraded_log, &entry).await {
            warn!(error = %e, "failed to append degraded mode log");
        }
    }

    /// Record heartbeat misses for every registered agent whose silence
    /// exceeds its priority threshold. Agents already marked failed are
    /// not re-reported each tick.
    pub async fn check_heartbeats(&self, now: DateTime<Utc>) {
        let overdue: Vec<(String, i64, u64)> = {
            let state = self.state.lock().await;
            state
                .agents
                .values()
                .filter(|a| a.status != AgentState::Failed)
                .filter_map(|a| {
                    let last = a.last_heartbeat?;
                    let threshold = a.priority.heartbeat_threshold_secs();
                    let elapsed = (now - last).num_seconds();
                    (elapsed > threshold as i64)
                        .then(|| (a.agent_id.clone(), elapsed, threshold))
                })
                .collect()
        };
        for (agent_id, elapsed, threshold) in overdue {
            self.record_failure(
                &agent_id,
                FailureKind::HeartbeatMiss,
                &format!("no heartbeat for {elapsed}s (threshold: {threshold}s)"),
                None,
            )
            .await;
        }
    }

    // ── Resilient execution ──

    /// Run `op` with the full resilience contract: per-attempt timeout,
    /// retry with backoff and jitter, fallback bookkeeping, optional
    /// queueing, and a declared safe default on total failure. The
    /// caller never observes an error.
    pub async fn execute_with_resilience<F, Fut>(
        &self,
        agent_id: &str,
        priority: AgentPriority,
        correlation_id: Option<&str>,
        queue_payload: Option<serde_json::Value>,
        op: F,
    ) -> serde_json::Value
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
    {
        let policy = RetryPolicy::for_priority(priority);
        let mut attempt = 0u32;

        while attempt < policy.max_attempts {
            attempt += 1;
            match tokio::time::timeout(policy.timeout(), op()).await {
                Ok(Ok(value)) => {
                    self.record_success(agent_id).await;
                    debug!(agent = agent_id, attempt, "operation successful");
                    if attempt > 1 {
                        self.audit.retry(
                            agent_id,
                            agent_id,
                            attempt,
                            policy.max_attempts,
                            0.0,
                            "succeeded after retry",
                            "success",
                            correlation_id,
                        );
                    }
                    return value;
                }
                Ok(Err(e)) => {
                    self.record_failure(
                        agent_id,
                        FailureKind::Exception,
                        &e.to_string(),
                        correlation_id,
                    )
                    .await;
                }
                Err(_) => {
                    self.record_failure(
                        agent_id,
                        FailureKind::Timeout,
                        &format!("timeout after {:.0}s", policy.timeout_secs),
                        correlation_id,
                    )
                    .await;
                }
            }

            if attempt < policy.max_attempts {
                let delay = policy.jittered_delay(attempt, rand::random::<f64>());
                self.audit.retry(
                    agent_id,
                    agent_id,
                    attempt,
                    policy.max_attempts,
                    delay.as_secs_f64(),
                    "attempt failed",
                    "pending",
                    correlation_id,
                );
                info!(
                    agent = agent_id,
                    attempt,
                    max = policy.max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }

        // All attempts exhausted: engage the declared fallback path.
        warn!(agent = agent_id, "all retries exhausted, degrading");
        let spec = self.fallbacks.get(agent_id).cloned();
        if let Some(spec) = &spec {
            {
                let mut state = self.state.lock().await;
                if let Some(last) = state
                    .active_failures
                    .iter_mut()
                    .rev()
                    .find(|f| f.agent_id == agent_id)
                {
                    last.fallback_used = Some(spec.fallback.clone());
                }
            }
            self.save_state().await;
            self.audit.agent_decision(
                "fallback_used",
                agent_id,
                correlation_id,
                &spec.fallback,
                "primary exhausted all retries",
                1.0,
                serde_json::json!({"degradation_level": spec.degradation_level}),
            );
            if spec.queue_on_fail {
                if let Some(payload) = queue_payload {
                    self.queue_for_later(agent_id, priority, payload).await;
                }
            }
        }
        self.safe_default(agent_id)
    }

    /// Declared safe default for an agent, so callers observe a
    /// well-typed degraded result.
    pub fn safe_default(&self, agent_id: &str) -> serde_json::Value {
        self.safe_defaults
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"success": false, "degraded": true}))
    }

    // ── Failure queue ──

    /// Persist a failed job for later re-attempt.
    pub async fn queue_for_later(
        &self,
        agent_id: &str,
        priority: AgentPriority,
        payload: serde_json::Value,
    ) {
        let job = QueuedJob {
            agent_id: agent_id.to_owned(),
            priority,
            queued_at: Utc::now(),
            retry_count: 0,
            last_retry: None,
            payload,
        };
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let path = self.queue_dir.join(format!("queue_{agent_id}_{epoch}.json"));
        match serde_json::to_string_pretty(&job) {
            Ok(json) => {
                if let Err(e) = fsutil::replace_file(&path, &json).await {
                    error!(agent = agent_id, error = %e, "failed to persist queued job");
                } else {
                    info!(agent = agent_id, file = %path.display(), "job queued for later");
                }
            }
            Err(e) => error!(agent = agent_id, error = %e, "failed to serialize queued job"),
        }
    }

    /// Register the re-admission handler for an agent's queued jobs.
    pub async fn register_requeue_handler(&self, agent_id: &str, handler: Arc<dyn RequeueHandler>) {
        self.requeue
            .write()
            .await
            .insert(agent_id.to_owned(), handler);
    }

    /// Re-attempt queued jobs; after [`MAX_QUEUE_RETRIES`] the job moves
    /// to the dead-letter directory and a queue-exhaustion failure is
    /// recorded.
    pub async fn process_failure_queue(&self) -> std::io::Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.queue_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("queue_") || !name.ends_with(".json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            let mut job: QueuedJob = match serde_json::from_str(&content) {
                Ok(job) => job,
                Err(e) => {
                    warn!(file = %name, error = %e, "unreadable queue item, dead-lettering");
                    self.dead_letter(&path, &name, serde_json::json!({"reason": "unparseable"}))
                        .await?;
                    continue;
                }
            };

            if job.retry_count >= MAX_QUEUE_RETRIES {
                let mut detail = serde_json::to_value(&job).unwrap_or_default();
                if let Some(map) = detail.as_object_mut() {
                    map.insert(
                        "reason".to_owned(),
                        serde_json::json!("max_queue_retries_exceeded"),
                    );
                    map.insert("dead_letter_at".to_owned(), serde_json::json!(Utc::now()));
                }
                self.dead_letter(&path, &name, detail).await?;
                self.record_failure(
                    &job.agent_id,
                    FailureKind::QueueExhaustion,
                    &format!("queued job exceeded {MAX_QUEUE_RETRIES} re-attempts"),
                    None,
                )
                .await;
                continue;
            }

            job.retry_count += 1;
            job.last_retry = Some(Utc::now());
            let handler = self.requeue.read().await.get(&job.agent_id).cloned();
            let readmitted = match handler {
                Some(handler) => handler.requeue(&job).await,
                None => false,
            };
            if readmitted {
                info!(agent = %job.agent_id, file = %name, "queued job re-admitted");
                tokio::fs::remove_file(&path).await?;
            } else {
                debug!(
                    agent = %job.agent_id,
                    attempt = job.retry_count,
                    "queued job re-attempt recorded"
                );
                if let Ok(json) = serde_json::to_string_pretty(&job) {
                    fsutil::replace_file(&path, &json).await?;
                }
            }
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        path: &std::path::Path,
        name: &str,
        detail: serde_json::Value,
    ) -> std::io::Result<()> {
        let dead_dir = self.queue_dir.join("dead_letter");
        let json = serde_json::to_string_pretty(&detail).unwrap_or_else(|_| "{}".to_owned());
        fsutil::replace_file(&dead_dir.join(name), &json).await?;
        tokio::fs::remove_file(path).await?;
        warn!(file = name, "moved to dead letter");
        Ok(())
    }

    // ── State & status ──

    async fn save_state(&self) {
        let snapshot = { self.state.lock().await.clone() };
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = fsutil::replace_file(&self.state_path, &json).await {
                    warn!(error = %e, "failed to persist resilience state");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize resilience state"),
        }
    }

    /// Current health grade.
    pub async fn health(&self) -> HealthGrade {
        self.state.lock().await.health
    }

    /// Snapshot of overall status for dashboards and health reports.
    pub async fn status_snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        serde_json::json!({
            "health": state.health.as_str(),
            "agents": state
                .agents
                .values()
                .map(|a| {
                    serde_json::json!({
                        "agent_id": a.agent_id,
                        "status": a.status,
                        "priority": a.priority.as_str(),
                        "consecutive_failures": a.consecutive_failures,
                        "last_heartbeat": a.last_heartbeat,
                    })
                })
                .collect::<Vec<_>>(),
            "active_failures": state.active_failures.len(),
            "degraded_since": state.degraded_since,
            "metrics": {
                "total_failures": state.metrics.total_failures,
                "uptime_secs": state.metrics.uptime_secs,
            },
        })
    }

    /// One guarded monitor tick: heartbeat sweep, failure-queue pass,
    /// metric refresh, state persist.
    pub async fn monitor_tick(&self) {
        self.check_heartbeats(Utc::now()).await;
        if let Err(e) = self.process_failure_queue().await {
            error!(error = %e, "failure queue pass failed");
        }
        {
            let mut state = self.state.lock().await;
            let uptime = (Utc::now() - state.metrics.start_time).num_seconds();
            state.metrics.uptime_secs = uptime.max(0) as u64;
            state.metrics.active_failures = state.active_failures.len();
        }
        self.save_state().await;
    }
}

/// Monitor worker: ticks every `interval`, never exits on error. Any
/// problem inside a tick is logged and the loop resumes after a short
/// sleep.
pub async fn run_monitor(
    controller: Arc<ResilienceController>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "resilience monitor started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.heartbeat("resilience").await;
                controller.monitor_tick().await;
                let health = controller.health().await;
                if health != HealthGrade::Healthy {
                    info!(health = %health, "system degraded");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    controller.monitor_tick().await;
    info!("resilience monitor stopped");
}

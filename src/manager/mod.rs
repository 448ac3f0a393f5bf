//! Manager: decides which skill runs, enforces the approval gate, and
//! dispatches to the skill handler.
//!
//! Skill resolution priority: execution plan > header `skill` > content
//! indicators > the `task_processor` default. Unknown skills fail the
//! task immediately. Sensitive skills (registry flag, or urgent/critical
//! priority) divert to the approval controller until a grant appears.
//! Dispatch runs under the resilience wrapper, so handler failures
//! degrade into queued retries instead of crashing the worker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::approval::{detect_sensitive, ApprovalController, ApprovalError, SensitiveAction};
use crate::audit::AuditStream;
use crate::config::RuntimePaths;
use crate::planner::parse_plan;
use crate::resilience::{QueuedJob, RequeueHandler, ResilienceController};
use crate::skills::{SkillInput, SkillOutcome, SkillRegistry};
use crate::store::{format_timestamp, StoreError, TaskDocument, TaskStore};
use crate::types::{FailureKind, TaskStatus};

/// Dispatch ceiling before a task stops being re-queued.
const MAX_DISPATCH_ATTEMPTS: u32 = 3;

/// Content indicators for content-based skill classification, checked
/// in order.
pub const SKILL_INDICATORS: &[(&str, &[&str])] = &[
    ("email", &["send email", "skill: email", "smtp"]),
    ("linkedin_marketing", &["linkedin", "skill: linkedin"]),
    ("coding", &["code", "function", "api", ".py", ".js"]),
    ("research", &["research", "analyze", "compare"]),
    ("documentation", &["document", "readme", "guide"]),
    ("planner", &["plan", "roadmap", "timeline"]),
    ("approval", &["approval", "approve"]),
];

/// Default skill when nothing else applies.
pub const DEFAULT_SKILL: &str = "task_processor";

/// What the manager did with one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Skill ran and succeeded; task marked done.
    Completed,
    /// Skill ran and failed; task marked failed.
    Failed,
    /// Task sent to the approval directory.
    Diverted,
    /// Results already present; nothing dispatched.
    ShortCircuited,
}

/// In-memory record of one dispatch, surfaced in status output.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    /// When the dispatch finished.
    pub timestamp: chrono::DateTime<Utc>,
    /// Skill invoked.
    pub skill: String,
    /// Task title.
    pub task: String,
    /// Whether the handler succeeded.
    pub success: bool,
}

/// Resolve the skill for a task: plan, then header, then content
/// indicators, then the default.
pub fn resolve_skill(doc: &TaskDocument) -> String {
    if let Some(skill) = parse_plan(&doc.body).and_then(|p| p.skill) {
        return skill;
    }
    if let Some(skill) = doc.header.get("skill") {
        if !skill.trim().is_empty() {
            return skill.trim().to_owned();
        }
    }
    let content = format!(
        "{} {}",
        doc.header.get("title").unwrap_or(""),
        doc.body
    )
    .to_lowercase();
    for (skill, indicators) in SKILL_INDICATORS {
        if indicators.iter().any(|needle| content.contains(needle)) {
            info!(skill, "classified by content indicators");
            return (*skill).to_owned();
        }
    }
    DEFAULT_SKILL.to_owned()
}

// ── Manager ─────────────────────────────────────────────────────

/// Skill dispatcher over the domain directories.
pub struct Manager {
    store: TaskStore,
    paths: RuntimePaths,
    audit: AuditStream,
    resilience: Arc<ResilienceController>,
    registry: Arc<SkillRegistry>,
    approval: Arc<ApprovalController>,
    dispatch_log: Mutex<Vec<DispatchRecord>>,
}

impl Manager {
    /// New manager.
    pub fn new(
        store: TaskStore,
        paths: RuntimePaths,
        audit: AuditStream,
        resilience: Arc<ResilienceController>,
        registry: Arc<SkillRegistry>,
        approval: Arc<ApprovalController>,
    ) -> Self {
        Self {
            store,
            paths,
            audit,
            resilience,
            registry,
            approval,
            dispatch_log: Mutex::new(Vec::new()),
        }
    }

    /// Register the failure-queue re-admission handler for every skill,
    /// so queued dispatches re-enter via `status: retry`.
    pub async fn register_requeue_handlers(&self) {
        let handler: Arc<dyn RequeueHandler> = Arc::new(TaskRequeue {
            store: self.store.clone(),
        });
        for skill_id in self.registry.ids() {
            self.resilience
                .register_requeue_handler(&skill_id, Arc::clone(&handler))
                .await;
        }
    }

    /// Process one planned task through the decision procedure.
    pub async fn process_task(&self, path: &Path) -> Result<Dispatch, StoreError> {
        let correlation = stem(path);
        let doc = match self.store.read(path).await {
            Ok(doc) => doc,
            Err(e) => {
                self.resilience
                    .record_failure(
                        "manager",
                        FailureKind::MalformedTask,
                        &e.to_string(),
                        Some(&correlation),
                    )
                    .await;
                self.store
                    .quarantine(path, &self.paths.done, &e.to_string())
                    .await?;
                return Ok(Dispatch::Failed);
            }
        };

        // Idempotent re-run: results already recorded means nothing to
        // dispatch; at most the status gets normalized.
        if doc.has_section("Execution Results") {
            info!(file = %path.display(), "results already present, short-circuiting");
            if doc.header.status() != Some(TaskStatus::Done) {
                let mut doc = doc;
                doc.header.set("status", TaskStatus::Done.as_str());
                if !doc.header.contains("completed") {
                    doc.header.set("completed", format_timestamp(Local::now()));
                }
                self.store.write(path, &doc).await?;
            }
            return Ok(Dispatch::ShortCircuited);
        }

        // 1. Resolve the skill.
        let skill_id = resolve_skill(&doc);
        info!(file = %path.display(), skill = %skill_id, "skill resolved");

        // 2. Unknown skills fail fast.
        let Some(entry) = self.registry.get(&skill_id) else {
            warn!(skill = %skill_id, available = ?self.registry.ids(), "unknown skill");
            self.audit.agent_decision(
                "skill_selection",
                "manager",
                Some(&correlation),
                &skill_id,
                "skill not in registry",
                0.0,
                serde_json::json!({"available": self.registry.ids()}),
            );
            self.resilience
                .record_failure(
                    "manager",
                    FailureKind::UnknownSkill,
                    &format!("unknown skill: {skill_id}"),
                    Some(&correlation),
                )
                .await;
            self.fail_task(path, &format!("unknown skill: {skill_id}"), &correlation)
                .await?;
            return Ok(Dispatch::Failed);
        };
        let entry = entry.clone();

        // 3. Approval gate.
        let needs_approval =
            entry.requires_approval || doc.header.priority().forces_approval();
        if needs_approval && !doc.header.is_approved() {
            let action = detect_sensitive(&doc.body, &skill_id).unwrap_or(SensitiveAction::Other);
            match self.approval.divert(path, &skill_id, action).await {
                Ok(_) => return Ok(Dispatch::Diverted),
                Err(ApprovalError::AlreadyDiverted(_)) => {
                    self.fail_task(
                        path,
                        "task re-entered approval without an intervening decision",
                        &correlation,
                    )
                    .await?;
                    return Ok(Dispatch::Failed);
                }
                Err(ApprovalError::Store(e)) => return Err(e),
            }
        }

        // 4. Dispatch under the resilience wrapper.
        self.store.set_status(path, TaskStatus::InProgress).await?;
        self.audit.task_lifecycle(
            "task_started",
            "manager",
            &correlation,
            serde_json::json!({"skill": skill_id}),
        );

        let input = SkillInput {
            title: doc.header.title_or_stem(path),
            priority: doc.header.priority(),
            body: doc.body.clone(),
            header: doc.header.clone(),
            path: path.to_path_buf(),
        };
        let dispatch_attempts: u32 = doc
            .header
            .get("dispatch_attempts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let queue_payload = (dispatch_attempts < MAX_DISPATCH_ATTEMPTS)
            .then(|| serde_json::json!({"task_path": path.to_string_lossy()}));

        let handler = Arc::clone(&entry.handler);
        let outcome_value = self
            .resilience
            .execute_with_resilience(
                &skill_id,
                entry.priority,
                Some(&correlation),
                queue_payload,
                move || {
                    let handler = Arc::clone(&handler);
                    let input = input.clone();
                    async move {
                        let outcome = handler.execute(&input).await;
                        if outcome.success {
                            Ok(outcome.to_value())
                        } else {
                            anyhow::bail!(
                                outcome
                                    .error
                                    .unwrap_or_else(|| "skill reported failure".to_owned())
                            )
                        }
                    }
                },
            )
            .await;
        let outcome = SkillOutcome::from_value(&outcome_value);

        self.dispatch_log.lock().await.push(DispatchRecord {
            timestamp: Utc::now(),
            skill: skill_id.clone(),
            task: doc.header.title_or_stem(path),
            success: outcome.success,
        });

        // 5. Record the result.
        if outcome.success {
            self.record_results(path, &skill_id, &outcome).await?;
            self.audit.task_lifecycle(
                "task_completed",
                "manager",
                &correlation,
                serde_json::json!({"skill": skill_id}),
            );
            Ok(Dispatch::Completed)
        } else {
            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| "skill execution failed".to_owned());
            self.store
                .set_header_field(
                    path,
                    "dispatch_attempts",
                    &(dispatch_attempts + 1).to_string(),
                )
                .await?;
            self.fail_task(path, &error, &correlation).await?;
            Ok(Dispatch::Failed)
        }
    }

    /// Append the results section (exactly once) and mark the task done.
    async fn record_results(
        &self,
        path: &Path,
        skill_id: &str,
        outcome: &SkillOutcome,
    ) -> Result<(), StoreError> {
        let doc = self.store.read(path).await?;
        if !doc.has_section("Execution Results") {
            let stamp = format_timestamp(Local::now());
            let mut content = format!("**Skill:** {skill_id}\n**Completed:** {stamp}\n");
            if let Some(output) = &outcome.output {
                content.push_str(&format!("\n{output}\n"));
            }
            if !outcome.deliverables.is_empty() {
                content.push_str("\n### Deliverables Generated\n\n");
                for deliverable in &outcome.deliverables {
                    content.push_str(&format!("- [x] {deliverable}\n"));
                }
            }
            self.store
                .append_section(path, "Execution Results", &content)
                .await?;
        }
        let mut doc = self.store.read(path).await?;
        doc.header.set("status", TaskStatus::Done.as_str());
        if !doc.header.contains("completed") {
            doc.header.set("completed", format_timestamp(Local::now()));
        }
        self.store.write(path, &doc).await
    }

    /// Append an error section and mark the task failed.
    async fn fail_task(
        &self,
        path: &Path,
        error: &str,
        correlation: &str,
    ) -> Result<(), StoreError> {
        let stamp = format_timestamp(Local::now());
        self.store
            .append_section(
                path,
                "Error",
                &format!("**Time:** {stamp}\n**Error:** {error}\n\n**Status:** FAILED"),
            )
            .await?;
        self.store.set_status(path, TaskStatus::Failed).await?;
        self.audit.task_lifecycle(
            "task_failed",
            "manager",
            correlation,
            serde_json::json!({"error": error}),
        );
        Ok(())
    }

    /// Dispatches recorded this session.
    pub async fn dispatch_log(&self) -> Vec<DispatchRecord> {
        self.dispatch_log.lock().await.clone()
    }

    /// One scan pass: dispatch every actionable single-shot task.
    pub async fn scan_once(&self) {
        for dir in self.paths.all_domain_dirs() {
            let files = match self.store.list_pending(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "manager scan failed");
                    continue;
                }
            };
            for file in files {
                let Ok(doc) = self.store.read(&file).await else {
                    // Unreadable files in a domain directory get the
                    // malformed-task treatment on the next pass through
                    // process_task.
                    if let Err(e) = self.process_task(&file).await {
                        error!(file = %file.display(), error = %e, "dispatch failed");
                    }
                    continue;
                };
                let actionable = matches!(
                    doc.header.status(),
                    Some(
                        TaskStatus::Planned
                            | TaskStatus::Approved
                            | TaskStatus::Received
                            | TaskStatus::Retry
                    )
                );
                if !actionable
                    || crate::autonomy::is_multistep(&doc.body, doc.header.get("skill"))
                {
                    continue;
                }
                if let Err(e) = self.process_task(&file).await {
                    error!(file = %file.display(), error = %e, "dispatch failed");
                }
            }
        }
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Re-admission handler: a queued dispatch re-enters by flipping its
/// task file back to `status: retry`.
struct TaskRequeue {
    store: TaskStore,
}

#[async_trait]
impl RequeueHandler for TaskRequeue {
    async fn requeue(&self, job: &QueuedJob) -> bool {
        let Some(task_path) = job.payload.get("task_path").and_then(|v| v.as_str()) else {
            return false;
        };
        let path = std::path::PathBuf::from(task_path);
        if !path.exists() {
            return false;
        }
        match self.store.set_status(&path, TaskStatus::Retry).await {
            Ok(_) => {
                info!(task = %path.display(), "queued dispatch re-admitted");
                true
            }
            Err(e) => {
                warn!(task = %path.display(), error = %e, "re-admission failed");
                false
            }
        }
    }
}

/// Manager worker loop.
pub async fn run_manager(
    manager: Arc<Manager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "manager started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.resilience.heartbeat("manager").await;
                manager.scan_once().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("manager stopped");
}

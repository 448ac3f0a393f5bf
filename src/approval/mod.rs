//! Approval controller: gates sensitive actions behind a human decision
//! artifact.
//!
//! Diverting a task creates a companion `approval_<name>.md` artifact in
//! the approval directory with a risk level, an expiry, and decision
//! instructions, and relocates the task beside it. A separate scan loop
//! watches artifacts for a decision line; approval writes the grant into
//! the task header and returns it to its domain directory, rejection
//! (explicit or by expiry) terminates the task. The earliest decision
//! token in the artifact wins.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditStream;
use crate::config::RuntimePaths;
use crate::resilience::ResilienceController;
use crate::store::{format_timestamp, StoreError, TaskStore, TIMESTAMP_FMT};
use crate::types::{FailureKind, TaskStatus};

// ── Sensitive actions & risk ────────────────────────────────────

/// Action classes that require human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitiveAction {
    Email,
    SocialPost,
    Payment,
    DatabaseChange,
    ProductionDeploy,
    CredentialAccess,
    DataExport,
    Other,
}

impl SensitiveAction {
    /// Detection order; the first class with a keyword hit wins.
    pub const ALL: [SensitiveAction; 7] = [
        Self::Email,
        Self::SocialPost,
        Self::Payment,
        Self::DatabaseChange,
        Self::ProductionDeploy,
        Self::CredentialAccess,
        Self::DataExport,
    ];

    /// Lowercase identifier written into artifacts.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::SocialPost => "social_post",
            Self::Payment => "payment",
            Self::DatabaseChange => "database_change",
            Self::ProductionDeploy => "production_deploy",
            Self::CredentialAccess => "credential_access",
            Self::DataExport => "data_export",
            Self::Other => "other",
        }
    }

    /// Keywords marking this action class.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::Email => &[
                "send email", "email blast", "mass email", "newsletter", "skill: email", "smtp",
            ],
            Self::SocialPost => &[
                "linkedin", "twitter", "facebook", "social media", "publish post", "post to",
                "skill: linkedin", "skill: social",
            ],
            Self::Payment => &[
                "payment", "invoice", "transfer", "wire", "purchase", "charge", "refund",
                "billing", "credit card", "bank",
            ],
            Self::DatabaseChange => &[
                "database", "sql", "migrate", "schema", "drop table", "alter table",
                "delete from", "truncate",
            ],
            Self::ProductionDeploy => &[
                "deploy", "production", "live site", "release", "push to prod", "go live",
            ],
            Self::CredentialAccess => &[
                "api key", "secret", "credential", "password", "token", "private key",
            ],
            Self::DataExport => &[
                "export data", "download data", "data dump", "extract data", "data export",
            ],
            Self::Other => &[],
        }
    }

    /// Risk level shown to the approver.
    pub fn risk_level(self) -> RiskLevel {
        match self {
            Self::Email => RiskLevel::Medium,
            Self::SocialPost => RiskLevel::Low,
            Self::Payment => RiskLevel::High,
            Self::DatabaseChange => RiskLevel::High,
            Self::ProductionDeploy => RiskLevel::Critical,
            Self::CredentialAccess => RiskLevel::High,
            Self::DataExport => RiskLevel::Medium,
            Self::Other => RiskLevel::Medium,
        }
    }

    /// Whether the action is reversible once executed.
    pub fn reversible(self) -> bool {
        matches!(self, Self::Email | Self::SocialPost)
    }
}

/// Risk level attached to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Detect the sensitive action class of a task, if any. The skill name
/// is checked alongside the content so skill-declared tasks classify
/// even with a terse body.
pub fn detect_sensitive(content: &str, skill: &str) -> Option<SensitiveAction> {
    let haystack = format!("{} skill: {}", content.to_lowercase(), skill.to_lowercase());
    SensitiveAction::ALL
        .into_iter()
        .find(|action| action.keywords().iter().any(|k| haystack.contains(k)))
}

// ── Decisions ───────────────────────────────────────────────────

/// Outcome of scanning an artifact for a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// `APPROVED: YES` found; approver extracted.
    Approved {
        /// Name after `Approved by:`, or "Unknown".
        approver: String,
    },
    /// `APPROVED: NO` or `REJECTED: YES` found; reason extracted.
    Rejected {
        /// Text after `Reason:`, or a default.
        reason: String,
    },
    /// A request for more information.
    NeedsInfo,
    /// No decision yet.
    Pending,
}

/// Scan artifact text for a decision. The earliest match in the
/// document wins, which pins behavior when several tokens appear.
pub fn parse_decision(content: &str) -> Decision {
    let yes = Regex::new(r"(?i)APPROVED:\s*YES").ok();
    let no = Regex::new(r"(?i)APPROVED:\s*NO").ok();
    let rejected = Regex::new(r"(?i)REJECTED:\s*YES").ok();
    let info = Regex::new(r"(?i)NEEDS INFO|NEEDS_MORE_INFO|MORE INFORMATION").ok();

    let pos = |re: &Option<Regex>| re.as_ref().and_then(|re| re.find(content)).map(|m| m.start());
    let yes_pos = pos(&yes);
    let reject_pos = [pos(&no), pos(&rejected)].into_iter().flatten().min();
    let info_pos = pos(&info);

    let mut candidates: Vec<(usize, u8)> = Vec::new();
    if let Some(p) = yes_pos {
        candidates.push((p, 0));
    }
    if let Some(p) = reject_pos {
        candidates.push((p, 1));
    }
    if let Some(p) = info_pos {
        candidates.push((p, 2));
    }
    let Some((_, tag)) = candidates.into_iter().min() else {
        return Decision::Pending;
    };

    match tag {
        0 => {
            let approver = Regex::new(r"Approved by:\s*([^\n]+)")
                .ok()
                .and_then(|re| re.captures(content))
                .map(|c| c[1].trim().to_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Unknown".to_owned());
            Decision::Approved { approver }
        }
        1 => {
            let reason = Regex::new(r"Reason:\s*([^\n]+)")
                .ok()
                .and_then(|re| re.captures(content))
                .map(|c| c[1].trim().to_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "No reason provided".to_owned());
            Decision::Rejected { reason }
        }
        _ => Decision::NeedsInfo,
    }
}

/// Parse an `expires` header value in the store timestamp format.
pub fn parse_expiry(value: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FMT).ok()?;
    Local.from_local_datetime(&naive).single()
}

// ── Errors ──────────────────────────────────────────────────────

/// Approval flow errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A task was diverted a second time without an intervening
    /// approval.
    #[error("task already in an approval cycle: {0}")]
    AlreadyDiverted(PathBuf),
}

// ── Controller ──────────────────────────────────────────────────

/// Creates approval artifacts, watches for decisions, and re-admits or
/// terminates tasks.
pub struct ApprovalController {
    store: TaskStore,
    paths: RuntimePaths,
    audit: AuditStream,
    resilience: Arc<ResilienceController>,
}

impl ApprovalController {
    /// New controller.
    pub fn new(
        store: TaskStore,
        paths: RuntimePaths,
        audit: AuditStream,
        resilience: Arc<ResilienceController>,
    ) -> Self {
        Self {
            store,
            paths,
            audit,
            resilience,
        }
    }

    /// Divert a task into the approval directory with a companion
    /// artifact. Fails when the task is already mid-cycle.
    pub async fn divert(
        &self,
        task_path: &Path,
        skill: &str,
        action: SensitiveAction,
    ) -> Result<PathBuf, ApprovalError> {
        let mut doc = self.store.read(task_path).await?;
        if doc.header.contains("approval_requested") && !doc.header.is_approved() {
            return Err(ApprovalError::AlreadyDiverted(task_path.to_path_buf()));
        }

        let file_name = task_path
            .file_name()
            .ok_or_else(|| StoreError::MalformedHeader(task_path.to_path_buf()))?
            .to_string_lossy()
            .into_owned();
        let stem = task_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let title = doc.header.title_or_stem(task_path);
        let now = Local::now();
        let expires = end_of_day(now);

        // Remember where to return the task on approval.
        let origin = task_path
            .parent()
            .and_then(|p| p.strip_prefix(&self.paths.root).ok())
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let request_id = Uuid::new_v4();
        let artifact = render_artifact(ArtifactContext {
            request_id,
            title: &title,
            original_task: &file_name,
            skill,
            action,
            priority: doc.header.get("priority").unwrap_or("standard"),
            summary: &doc.body,
            created: now,
            expires,
        });
        let artifact_path = self.paths.needs_approval.join(format!("approval_{stem}.md"));
        crate::store::write_atomic(&artifact_path, &artifact).await?;

        doc.header.set("status", TaskStatus::PendingApproval.as_str());
        doc.header.set("approval_requested", format_timestamp(now));
        if !origin.is_empty() {
            doc.header.set("origin", &origin);
        }
        self.store.write(task_path, &doc).await?;
        self.store
            .move_task(task_path, &self.paths.needs_approval)
            .await?;

        info!(task = %file_name, skill, action = action.as_str(), "task diverted to approval");
        self.audit.agent_decision(
            "approval_required",
            "manager",
            Some(&stem),
            action.as_str(),
            &format!("{skill} is a sensitive skill"),
            1.0,
            serde_json::json!({
                "risk_level": action.risk_level().as_str(),
                "request_id": request_id.to_string(),
            }),
        );
        self.audit.task_lifecycle(
            "task_waiting_approval",
            "approval",
            &stem,
            serde_json::json!({"skill": skill, "risk_level": action.risk_level().as_str()}),
        );
        Ok(artifact_path)
    }

    /// Process one artifact: detect a decision (or expiry) and carry out
    /// the resulting transition. Returns the decision observed.
    pub async fn process_artifact(
        &self,
        artifact_path: &Path,
        now: DateTime<Local>,
    ) -> Result<Decision, ApprovalError> {
        let raw = tokio::fs::read_to_string(artifact_path)
            .await
            .map_err(|e| StoreError::Io {
                path: artifact_path.to_path_buf(),
                source: e,
            })?;
        let artifact = self.store.read(artifact_path).await?;
        let correlation = artifact
            .header
            .get("original_task")
            .map(|t| t.trim_end_matches(".md").to_owned())
            .unwrap_or_default();

        let mut decision = parse_decision(&raw);
        if decision == Decision::Pending {
            let expired = artifact
                .header
                .get("expires")
                .and_then(parse_expiry)
                .map(|deadline| now > deadline)
                .unwrap_or(false);
            if expired {
                warn!(artifact = %artifact_path.display(), "approval expired without decision");
                self.resilience
                    .record_failure(
                        "approval",
                        FailureKind::ApprovalExpired,
                        "no decision before deadline",
                        Some(&correlation),
                    )
                    .await;
                decision = Decision::Rejected {
                    reason: "timeout".to_owned(),
                };
            }
        }

        match &decision {
            Decision::Pending => {}
            Decision::NeedsInfo => {
                self.audit.task_lifecycle(
                    "task_needs_info",
                    "approval",
                    &correlation,
                    serde_json::json!({}),
                );
            }
            Decision::Approved { approver } => {
                self.admit_approved(&artifact, artifact_path, approver).await?;
            }
            Decision::Rejected { reason } => {
                self.finish_rejected(&artifact, artifact_path, reason).await?;
            }
        }
        Ok(decision)
    }

    /// Grant: stamp the task header, return it to its domain directory,
    /// and retire the artifact.
    async fn admit_approved(
        &self,
        artifact: &crate::store::TaskDocument,
        artifact_path: &Path,
        approver: &str,
    ) -> Result<(), ApprovalError> {
        let Some(original) = artifact.header.get("original_task") else {
            warn!(artifact = %artifact_path.display(), "artifact missing original_task");
            self.store.move_task(artifact_path, &self.paths.done).await?;
            return Ok(());
        };
        let correlation = original.trim_end_matches(".md").to_owned();
        let task_path = self.paths.needs_approval.join(original);

        if task_path.exists() {
            let mut doc = self.store.read(&task_path).await?;
            let now = format_timestamp(Local::now());
            doc.header.set("approved", "true");
            doc.header.set("approved_by", approver);
            doc.header.set("approved_at", &now);
            doc.header.set("status", TaskStatus::Approved.as_str());
            let dest_dir = doc
                .header
                .get("origin")
                .map(|origin| self.paths.root.join(origin))
                .unwrap_or_else(|| self.paths.inbox.clone());
            self.store.write(&task_path, &doc).await?;
            self.store.move_task(&task_path, &dest_dir).await?;
            info!(task = original, approver, "task approved and re-admitted");
        } else {
            warn!(task = original, "approved task copy missing");
            self.resilience
                .record_failure(
                    "approval",
                    FailureKind::StateStale,
                    "approved artifact references a missing task",
                    Some(&correlation),
                )
                .await;
        }

        self.store.move_task(artifact_path, &self.paths.done).await?;
        self.audit.task_lifecycle(
            "task_approved",
            "approval",
            &correlation,
            serde_json::json!({"approved_by": approver}),
        );
        self.log_event(original, "APPROVED", approver).await;
        Ok(())
    }

    /// Reject: append the reason as an error section, terminate the
    /// task, and retire both files.
    async fn finish_rejected(
        &self,
        artifact: &crate::store::TaskDocument,
        artifact_path: &Path,
        reason: &str,
    ) -> Result<(), ApprovalError> {
        if let Some(original) = artifact.header.get("original_task") {
            let correlation = original.trim_end_matches(".md").to_owned();
            let task_path = self.paths.needs_approval.join(original);
            if task_path.exists() {
                self.store
                    .append_section(
                        &task_path,
                        "Error",
                        &format!(
                            "**Status:** REJECTED\n**Reason:** {reason}\n\nThis task was rejected during the approval process and will not be executed."
                        ),
                    )
                    .await?;
                self.store.set_status(&task_path, TaskStatus::Failed).await?;
                self.store.move_task(&task_path, &self.paths.done).await?;
                info!(task = original, reason, "task rejected");
            }
            self.audit.task_lifecycle(
                "task_rejected",
                "approval",
                &correlation,
                serde_json::json!({"reason": reason}),
            );
            self.log_event(original, "REJECTED", reason).await;
        }
        self.store.move_task(artifact_path, &self.paths.done).await?;
        Ok(())
    }

    async fn log_event(&self, request: &str, decision: &str, details: &str) {
        let log_file = self.paths.logs.join("approval_log.md");
        let stamp = format_timestamp(Local::now());
        let mut entry = String::new();
        if !log_file.exists() {
            entry.push_str("# Approval Log\n\n");
            entry.push_str("| Timestamp | Request | Decision | Details |\n");
            entry.push_str("|-----------|---------|----------|--------|\n");
        }
        entry.push_str(&format!("| {stamp} | {request} | {decision} | {details} |\n"));
        if let Err(e) = crate::fsutil::append_to_file(&log_file, &entry).await {
            error!(error = %e, "failed to append approval log");
        }
    }

    /// Scan the approval directory for artifacts and process each.
    pub async fn scan_once(&self, now: DateTime<Local>) {
        let mut entries = match tokio::fs::read_dir(&self.paths.needs_approval).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "approval directory scan failed");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("approval_") || !name.ends_with(".md") {
                continue;
            }
            match self.process_artifact(&path, now).await {
                Ok(Decision::Pending) => {}
                Ok(decision) => info!(artifact = %name, ?decision, "artifact processed"),
                Err(e) => error!(artifact = %name, error = %e, "artifact processing failed"),
            }
        }
    }
}

// ── Artifact rendering ──────────────────────────────────────────

struct ArtifactContext<'a> {
    request_id: Uuid,
    title: &'a str,
    original_task: &'a str,
    skill: &'a str,
    action: SensitiveAction,
    priority: &'a str,
    summary: &'a str,
    created: DateTime<Local>,
    expires: DateTime<Local>,
}

/// End-of-day deadline for a request created at `now`.
fn end_of_day(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .and_hms_opt(23, 59, 59)
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .unwrap_or(now)
}

/// Render the approval request artifact. The instruction examples use
/// `<YES or NO>` placeholders so they can never satisfy the decision
/// grammar themselves.
fn render_artifact(ctx: ArtifactContext<'_>) -> String {
    let stamp = format_timestamp(ctx.created);
    let expires = format_timestamp(ctx.expires);
    let risk = ctx.action.risk_level().as_str();
    let action_title = ctx.action.as_str().replace('_', " ");
    let summary: String = ctx.summary.chars().take(500).collect();
    let ellipsis = if ctx.summary.chars().count() > 500 { "..." } else { "" };
    format!(
        "---\ntitle: Approval Request: {title}\nrequest_id: {request_id}\noriginal_task: {original}\nskill: {skill}\nrequest_type: {action}\nrisk_level: {risk}\nstatus: pending_approval\ncreated: {stamp}\nexpires: {expires}\n---\n\n# Approval Request\n\n**Original Task:** `{original}`\n\n**Action Type:** {action_title}\n\n**Risk Level:** {risk}\n\n---\n\n## Task Summary\n\n**Title:** {title}\n\n**Priority:** {priority}\n\n**Description:**\n```\n{summary}{ellipsis}\n```\n\n---\n\n## Risk Assessment\n\n| Factor | Assessment |\n|--------|------------|\n| **Action Type** | {action_title} |\n| **Risk Level** | {risk} |\n| **Reversible** | {reversible} |\n\n---\n\n## Approval Instructions\n\nReview the task above, then add a `## Decision` section at the bottom\nof this file containing the line `APPROVED: <YES or NO>` along with\n`Approved by: <your name>` (or `Reason: <why>` when rejecting), and\nsave. The runtime detects the decision automatically.\n\n## Timeout\n\nThis request expires at **{expires}**. Without a decision by then, the\ntask is rejected automatically.\n",
        request_id = ctx.request_id,
        title = ctx.title,
        original = ctx.original_task,
        skill = ctx.skill,
        action = ctx.action.as_str(),
        priority = ctx.priority,
        reversible = if ctx.action.reversible() { "Yes" } else { "No/Partial" },
    )
}

/// Approval worker loop.
pub async fn run_approval(
    controller: Arc<ApprovalController>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "approval controller started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.resilience.heartbeat("approval").await;
                controller.scan_once(Local::now()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("approval controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Domain;

    // ── Detection & risk ──

    #[test]
    fn test_detect_email() {
        assert_eq!(
            detect_sensitive("please send email to the team", ""),
            Some(SensitiveAction::Email)
        );
        assert_eq!(detect_sensitive("body", "email"), Some(SensitiveAction::Email));
    }

    #[test]
    fn test_detect_payment_risk_high() {
        let action = detect_sensitive("wire the payment to the vendor", "").expect("detected");
        assert_eq!(action, SensitiveAction::Payment);
        assert_eq!(action.risk_level(), RiskLevel::High);
    }

    #[test]
    fn test_detect_deploy_critical() {
        let action = detect_sensitive("push to prod tonight", "").expect("detected");
        assert_eq!(action, SensitiveAction::ProductionDeploy);
        assert_eq!(action.risk_level(), RiskLevel::Critical);
    }

    #[test]
    fn test_detect_none() {
        assert_eq!(detect_sensitive("water the plants", ""), None);
    }

    // ── Decision grammar ──

    #[test]
    fn test_decision_approved() {
        let decision = parse_decision("## Decision\n\nAPPROVED: YES\n\nApproved by: Ada\n");
        assert_eq!(
            decision,
            Decision::Approved {
                approver: "Ada".to_owned()
            }
        );
    }

    #[test]
    fn test_decision_case_insensitive() {
        assert!(matches!(
            parse_decision("approved:   yes"),
            Decision::Approved { .. }
        ));
    }

    #[test]
    fn test_decision_rejected_with_reason() {
        let decision = parse_decision("APPROVED: NO\nReason: too risky\n");
        assert_eq!(
            decision,
            Decision::Rejected {
                reason: "too risky".to_owned()
            }
        );
    }

    #[test]
    fn test_decision_rejected_token() {
        assert!(matches!(
            parse_decision("REJECTED: YES\n"),
            Decision::Rejected { .. }
        ));
    }

    #[test]
    fn test_decision_needs_info() {
        assert_eq!(parse_decision("NEEDS MORE INFORMATION please"), Decision::NeedsInfo);
    }

    #[test]
    fn test_decision_pending() {
        assert_eq!(parse_decision("nothing decided"), Decision::Pending);
    }

    #[test]
    fn test_decision_first_match_wins() {
        // Both tokens present: the earlier one in the document decides.
        let yes_first = "APPROVED: YES\nlater someone wrote APPROVED: NO\n";
        assert!(matches!(parse_decision(yes_first), Decision::Approved { .. }));
        let no_first = "APPROVED: NO\nReason: no\nthen APPROVED: YES\n";
        assert!(matches!(parse_decision(no_first), Decision::Rejected { .. }));
    }

    #[test]
    fn test_fresh_artifact_is_pending() {
        // The rendered instructions must not satisfy the grammar.
        let artifact = render_artifact(ArtifactContext {
            request_id: Uuid::new_v4(),
            title: "Announce Launch",
            original_task: "announce.md",
            skill: "email",
            action: SensitiveAction::Email,
            priority: "standard",
            summary: "Send the launch email.",
            created: Local::now(),
            expires: end_of_day(Local::now()),
        });
        assert_eq!(parse_decision(&artifact), Decision::Pending);
        assert!(artifact.contains("risk_level: MEDIUM"));
    }

    #[test]
    fn test_expiry_parse() {
        assert!(parse_expiry("2026-08-01 23:59:59").is_some());
        assert!(parse_expiry("tomorrow-ish").is_none());
    }

    // ── Full flow ──

    struct Fixture {
        _tmp: tempfile::TempDir,
        paths: RuntimePaths,
        controller: ApprovalController,
        task_path: PathBuf,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let paths = RuntimePaths::resolve(tmp.path());
        paths.ensure().await.expect("dirs");
        let resilience = Arc::new(
            ResilienceController::open(&paths.logs, AuditStream::disconnected()).await,
        );
        let controller = ApprovalController::new(
            TaskStore,
            paths.clone(),
            AuditStream::disconnected(),
            resilience,
        );
        let task_path = paths
            .domain_category_dir(Domain::Business, "marketing")
            .join("announce_launch.md");
        tokio::fs::write(
            &task_path,
            "---\ntitle: Announce Launch\nstatus: planned\nskill: email\npriority: standard\n---\nSend email to launch@example.com.\n",
        )
        .await
        .expect("seed");
        Fixture {
            _tmp: tmp,
            paths,
            controller,
            task_path,
        }
    }

    #[tokio::test]
    async fn test_divert_creates_artifact_and_moves_task() {
        let fx = fixture().await;
        let artifact = fx
            .controller
            .divert(&fx.task_path, "email", SensitiveAction::Email)
            .await
            .expect("divert");
        assert!(artifact.exists());
        assert!(!fx.task_path.exists());
        let moved = fx.paths.needs_approval.join("announce_launch.md");
        assert!(moved.exists());
        let doc = TaskStore.read(&moved).await.expect("read");
        assert_eq!(doc.header.status(), Some(TaskStatus::PendingApproval));
        assert_eq!(
            doc.header.get("origin"),
            Some("Domains/Business/marketing")
        );
    }

    #[tokio::test]
    async fn test_second_divert_rejected() {
        let fx = fixture().await;
        fx.controller
            .divert(&fx.task_path, "email", SensitiveAction::Email)
            .await
            .expect("first divert");
        let moved = fx.paths.needs_approval.join("announce_launch.md");
        let err = fx
            .controller
            .divert(&moved, "email", SensitiveAction::Email)
            .await
            .expect_err("second divert must fail");
        assert!(matches!(err, ApprovalError::AlreadyDiverted(_)));
    }

    #[tokio::test]
    async fn test_approval_readmits_task() {
        let fx = fixture().await;
        let artifact = fx
            .controller
            .divert(&fx.task_path, "email", SensitiveAction::Email)
            .await
            .expect("divert");

        // Human appends the decision.
        crate::fsutil::append_to_file(
            &artifact,
            "\n## Decision\n\nAPPROVED: YES\n\nApproved by: Ada\n",
        )
        .await
        .expect("decide");

        let decision = fx
            .controller
            .process_artifact(&artifact, Local::now())
            .await
            .expect("process");
        assert!(matches!(decision, Decision::Approved { .. }));

        // Task returned to its origin with the grant recorded.
        let returned = fx
            .paths
            .domain_category_dir(Domain::Business, "marketing")
            .join("announce_launch.md");
        let doc = TaskStore.read(&returned).await.expect("read");
        assert_eq!(doc.header.status(), Some(TaskStatus::Approved));
        assert!(doc.header.is_approved());
        assert_eq!(doc.header.get("approved_by"), Some("Ada"));
        assert!(doc.header.contains("approved_at"));

        // Artifact retired to Done.
        assert!(fx.paths.done.join("approval_announce_launch.md").exists());
    }

    #[tokio::test]
    async fn test_rejection_terminates_task() {
        let fx = fixture().await;
        let artifact = fx
            .controller
            .divert(&fx.task_path, "email", SensitiveAction::Email)
            .await
            .expect("divert");
        crate::fsutil::append_to_file(&artifact, "\nAPPROVED: NO\nReason: wrong audience\n")
            .await
            .expect("decide");

        let decision = fx
            .controller
            .process_artifact(&artifact, Local::now())
            .await
            .expect("process");
        assert!(matches!(decision, Decision::Rejected { .. }));

        let done_task = fx.paths.done.join("announce_launch.md");
        let doc = TaskStore.read(&done_task).await.expect("read");
        assert_eq!(doc.header.status(), Some(TaskStatus::Failed));
        assert!(doc.has_section("Error"));
        assert!(doc.body.contains("wrong audience"));
    }

    #[tokio::test]
    async fn test_expired_artifact_times_out() {
        let fx = fixture().await;
        let artifact = fx
            .controller
            .divert(&fx.task_path, "email", SensitiveAction::Email)
            .await
            .expect("divert");

        // Evaluate well past the end-of-day expiry.
        let tomorrow = Local::now() + chrono::Duration::days(2);
        let decision = fx
            .controller
            .process_artifact(&artifact, tomorrow)
            .await
            .expect("process");
        assert_eq!(
            decision,
            Decision::Rejected {
                reason: "timeout".to_owned()
            }
        );
        let done_task = fx.paths.done.join("announce_launch.md");
        let doc = TaskStore.read(&done_task).await.expect("read");
        assert!(doc.body.contains("timeout"));
    }
}

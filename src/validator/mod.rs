//! Validator: confirms completion, verifies deliverables, and moves
//! tasks to the terminal directory.
//!
//! A task marked done must carry an `## Execution Results` section and
//! its deliverable checklist should be checked off. Fully verified
//! tasks move to `Done/`; partially verified ones move too but are
//! flagged for manual review; tasks with unmet checks are recommended
//! for retry and left in place.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::AuditStream;
use crate::config::RuntimePaths;
use crate::memory::{ExecutionRecord, MemoryLog};
use crate::resilience::ResilienceController;
use crate::store::{StoreError, TaskDocument, TaskStore};
use crate::types::TaskStatus;

/// Completion criteria by skill; used when the task declares no
/// deliverable checklist of its own.
pub const COMPLETION_CRITERIA: &[(&str, &[&str])] = &[
    ("coding", &["Working code", "Tests", "Documentation"]),
    ("research", &["Research report", "Comparison matrix", "Recommendation"]),
    ("documentation", &["Documentation file", "Examples", "Cross-references"]),
    ("planner", &["Project plan", "Task breakdown", "Timeline"]),
];

/// Expected deliverables for a skill, when the task itself declares
/// none.
pub fn completion_criteria(skill: Option<&str>) -> &'static [&'static str] {
    let skill = skill.unwrap_or("");
    COMPLETION_CRITERIA
        .iter()
        .find(|(name, _)| *name == skill)
        .map(|(_, items)| *items)
        .unwrap_or(&["Deliverable completed"])
}

/// Validation verdict for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Passed,
    Partial,
    Failed,
    Pending,
}

/// What the validator recommends doing with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Complete,
    Retry,
    ManualReview,
}

/// Result of validating one task.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Verdict.
    pub status: ValidationStatus,
    /// Checks that passed.
    pub checks_passed: usize,
    /// Total checks evaluated.
    pub checks_total: usize,
    /// Deliverables found checked off.
    pub deliverables_verified: Vec<String>,
    /// Deliverables still open.
    pub missing_items: Vec<String>,
    /// Follow-up recommendation.
    pub recommendation: Recommendation,
}

/// Deliverable checkboxes in the document: (checked, open).
fn deliverable_boxes(body: &str) -> (Vec<String>, Vec<String>) {
    let checked_re = Regex::new(r"(?m)^- \[[xX]\] (.+)$");
    let open_re = Regex::new(r"(?m)^- \[ \] (.+)$");
    let collect = |re: Result<Regex, regex::Error>| -> Vec<String> {
        re.map(|re| {
            re.captures_iter(body)
                .map(|c| c[1].trim().to_owned())
                .collect()
        })
        .unwrap_or_default()
    };
    (collect(checked_re), collect(open_re))
}

/// Validate one task document.
pub fn validate_document(doc: &TaskDocument) -> ValidationReport {
    // Single-shot dispatch records an Execution Results section; the
    // autonomy loop records an Execution Summary. Either counts.
    let has_results =
        doc.has_section("Execution Results") || doc.has_section("Execution Summary");
    let has_error = doc.has_section("Error");
    let (checked, mut open) = deliverable_boxes(&doc.body);
    // An item checked anywhere (e.g. under "Deliverables Generated")
    // satisfies the matching open plan checkbox.
    open.retain(|item| !checked.contains(item));
    // No checklist at all: fall back to the skill's declared criteria,
    // crediting items the results happen to name.
    if checked.is_empty() && open.is_empty() && has_results {
        for item in completion_criteria(doc.header.get("skill")) {
            open.push((*item).to_owned());
        }
        open.retain(|item| !doc.body.contains(item.as_str()));
    }

    let mut checks_total = 2;
    let mut checks_passed = 0;
    if has_results {
        checks_passed += 1;
    }
    if !has_error {
        checks_passed += 1;
    }
    checks_total += open.len() + checked.len();
    checks_passed += checked.len();

    let (status, recommendation) = if has_error {
        (ValidationStatus::Failed, Recommendation::Retry)
    } else if !has_results {
        (ValidationStatus::Pending, Recommendation::Retry)
    } else if open.is_empty() {
        (ValidationStatus::Passed, Recommendation::Complete)
    } else {
        (ValidationStatus::Partial, Recommendation::ManualReview)
    };

    ValidationReport {
        status,
        checks_passed,
        checks_total,
        deliverables_verified: checked,
        missing_items: open,
        recommendation,
    }
}

// ── Worker ──────────────────────────────────────────────────────

/// Moves verified tasks into the terminal directory and records their
/// executions.
pub struct Validator {
    store: TaskStore,
    paths: RuntimePaths,
    audit: AuditStream,
    resilience: Arc<ResilienceController>,
    memory: Arc<MemoryLog>,
}

impl Validator {
    /// New validator.
    pub fn new(
        store: TaskStore,
        paths: RuntimePaths,
        audit: AuditStream,
        resilience: Arc<ResilienceController>,
        memory: Arc<MemoryLog>,
    ) -> Self {
        Self {
            store,
            paths,
            audit,
            resilience,
            memory,
        }
    }

    /// Validate one finished task and move it when appropriate.
    pub async fn process_file(&self, path: &Path) -> Result<(), StoreError> {
        let doc = self.store.read(path).await?;
        let correlation = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let status = doc.header.status();

        match status {
            Some(TaskStatus::Failed) => {
                // Terminal business failure: ends in the done directory
                // with its error section.
                self.record(&doc, path, "failed").await;
                self.store.move_task(path, &self.paths.done).await?;
                self.audit.task_lifecycle(
                    "task_failed",
                    "validator",
                    &correlation,
                    serde_json::json!({"moved_to": "Done"}),
                );
                info!(file = %correlation, "failed task archived");
            }
            Some(TaskStatus::Done) => {
                let report = validate_document(&doc);
                match report.recommendation {
                    Recommendation::Complete => {
                        self.record(&doc, path, "success").await;
                        self.store.move_task(path, &self.paths.done).await?;
                        self.audit.task_lifecycle(
                            "task_completed",
                            "validator",
                            &correlation,
                            serde_json::json!({
                                "checks_passed": report.checks_passed,
                                "checks_total": report.checks_total,
                            }),
                        );
                        info!(file = %correlation, "task verified and archived");
                    }
                    Recommendation::ManualReview => {
                        self.record(&doc, path, "partial").await;
                        self.store.move_task(path, &self.paths.done).await?;
                        self.audit.task_lifecycle(
                            "task_completed",
                            "validator",
                            &correlation,
                            serde_json::json!({
                                "verdict": "partial",
                                "missing": report.missing_items,
                            }),
                        );
                        warn!(
                            file = %correlation,
                            missing = ?report.missing_items,
                            "task archived with open deliverables"
                        );
                    }
                    Recommendation::Retry => {
                        // Marked done but results are missing or an
                        // error section is present: hand it back.
                        self.store.set_status(path, TaskStatus::Retry).await?;
                        self.audit.task_lifecycle(
                            "task_retried",
                            "validator",
                            &correlation,
                            serde_json::json!({"reason": "completion checks failed"}),
                        );
                        warn!(file = %correlation, "done task failed validation, re-queued");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn record(&self, doc: &TaskDocument, path: &Path, status: &str) {
        let record = ExecutionRecord {
            task_name: doc.header.title_or_stem(path),
            skill_used: doc
                .header
                .get("skill")
                .unwrap_or("task_processor")
                .to_owned(),
            started_at: doc.header.get("routed_at").map(str::to_owned),
            completed_at: doc.header.get("completed").map(str::to_owned),
            status: status.to_owned(),
            deliverables: deliverable_boxes(&doc.body).0,
            retries: doc
                .header
                .get("dispatch_attempts")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        };
        self.memory.record_execution(record).await;
    }

    /// One scan pass over the domain directories.
    pub async fn scan_once(&self) {
        for dir in self.paths.all_domain_dirs() {
            let files = match self.store.list_pending(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "validator scan failed");
                    continue;
                }
            };
            for file in files {
                if let Err(e) = self.process_file(&file).await {
                    error!(file = %file.display(), error = %e, "validation failed");
                }
            }
        }
    }
}

/// Validator worker loop.
pub async fn run_validator(
    validator: Arc<Validator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "validator started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                validator.resilience.heartbeat("validator").await;
                validator.scan_once().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("validator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::parse_document;
    use crate::types::Domain;

    fn doc(content: &str) -> TaskDocument {
        parse_document(Path::new("t.md"), content).expect("parse")
    }

    // ── Pure validation ──

    #[test]
    fn test_passed_when_results_and_all_checked() {
        let d = doc(
            "---\nstatus: done\n---\n## Execution Results\n\n- [x] Report\n- [x] Summary\n",
        );
        let report = validate_document(&d);
        assert_eq!(report.status, ValidationStatus::Passed);
        assert_eq!(report.recommendation, Recommendation::Complete);
        assert_eq!(report.deliverables_verified.len(), 2);
        assert!(report.missing_items.is_empty());
    }

    #[test]
    fn test_partial_with_open_boxes() {
        let d = doc(
            "---\nstatus: done\n---\n## Execution Plan\n\n- [ ] Report\n\n## Execution Results\n\ndone-ish\n",
        );
        let report = validate_document(&d);
        assert_eq!(report.status, ValidationStatus::Partial);
        assert_eq!(report.recommendation, Recommendation::ManualReview);
        assert_eq!(report.missing_items, vec!["Report".to_owned()]);
    }

    #[test]
    fn test_checked_elsewhere_satisfies_plan_box() {
        let d = doc(
            "---\nstatus: done\n---\n## Execution Plan\n\n- [ ] Report\n\n## Execution Results\n\n### Deliverables Generated\n\n- [x] Report\n",
        );
        let report = validate_document(&d);
        assert_eq!(report.status, ValidationStatus::Passed);
    }

    #[test]
    fn test_no_checklist_falls_back_to_skill_criteria() {
        let d = doc(
            "---\nstatus: done\nskill: research\n---\n## Execution Results\n\nDelivered the Research report and Recommendation, plus a Comparison matrix.\n",
        );
        let report = validate_document(&d);
        assert_eq!(report.status, ValidationStatus::Passed);

        let d = doc(
            "---\nstatus: done\nskill: research\n---\n## Execution Results\n\nDid something vague.\n",
        );
        let report = validate_document(&d);
        assert_eq!(report.status, ValidationStatus::Partial);
        assert!(report.missing_items.contains(&"Research report".to_owned()));
    }

    #[test]
    fn test_pending_without_results() {
        let d = doc("---\nstatus: done\n---\nno results yet\n");
        let report = validate_document(&d);
        assert_eq!(report.status, ValidationStatus::Pending);
        assert_eq!(report.recommendation, Recommendation::Retry);
    }

    #[test]
    fn test_failed_with_error_section() {
        let d = doc("---\nstatus: done\n---\n## Execution Results\n\nx\n\n## Error\n\nboom\n");
        let report = validate_document(&d);
        assert_eq!(report.status, ValidationStatus::Failed);
    }

    // ── Worker ──

    struct Fixture {
        _tmp: tempfile::TempDir,
        paths: RuntimePaths,
        validator: Validator,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let paths = RuntimePaths::resolve(tmp.path());
        paths.ensure().await.expect("dirs");
        let resilience = Arc::new(
            ResilienceController::open(&paths.logs, AuditStream::disconnected()).await,
        );
        let memory = Arc::new(MemoryLog::open(&paths).await);
        let validator = Validator::new(
            TaskStore,
            paths.clone(),
            AuditStream::disconnected(),
            resilience,
            memory,
        );
        Fixture {
            _tmp: tmp,
            paths,
            validator,
        }
    }

    #[tokio::test]
    async fn test_done_task_moves_to_done_dir() {
        let fx = fixture().await;
        let path = fx
            .paths
            .domain_category_dir(Domain::Business, "reporting")
            .join("finished.md");
        tokio::fs::write(
            &path,
            "---\ntitle: Finished\nstatus: done\nskill: research\ncompleted: 2026-08-01 10:00:00\n---\n## Execution Results\n\n- [x] Report\n",
        )
        .await
        .expect("seed");

        fx.validator.process_file(&path).await.expect("validate");
        assert!(!path.exists());
        assert!(fx.paths.done.join("finished.md").exists());
        // Execution recorded in memory.
        let history = tokio::fs::read_to_string(fx.paths.logs.join("execution_history.json"))
            .await
            .expect("history");
        assert!(history.contains("Finished"));
    }

    #[tokio::test]
    async fn test_failed_task_archived() {
        let fx = fixture().await;
        let path = fx
            .paths
            .domain_category_dir(Domain::Personal, "notes")
            .join("broken.md");
        tokio::fs::write(
            &path,
            "---\ntitle: Broken\nstatus: failed\n---\n## Error\n\nboom\n",
        )
        .await
        .expect("seed");
        fx.validator.process_file(&path).await.expect("validate");
        assert!(fx.paths.done.join("broken.md").exists());
    }

    #[tokio::test]
    async fn test_done_without_results_requeued() {
        let fx = fixture().await;
        let path = fx
            .paths
            .domain_category_dir(Domain::Personal, "notes")
            .join("premature.md");
        tokio::fs::write(&path, "---\ntitle: Premature\nstatus: done\n---\nno results\n")
            .await
            .expect("seed");
        fx.validator.process_file(&path).await.expect("validate");
        assert!(path.exists(), "stays in place");
        let doc = TaskStore.read(&path).await.expect("read");
        assert_eq!(doc.header.status(), Some(TaskStatus::Retry));
    }
}

//! Planner: enriches classified tasks with an execution plan section,
//! a skill hint, and a complexity estimate.
//!
//! The planner never executes anything. It categorizes the task by
//! keyword, maps the category to a skill, and appends a category-specific
//! step template plus a deliverables checklist. Emitted plans are
//! machine-parseable: step ids are positional and dependencies are
//! sequential, so parsing a written plan yields the same ids, names, and
//! dependencies every time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use regex::Regex;
use tokio::sync::watch;
use tracing::{error, info};

use crate::audit::AuditStream;
use crate::config::RuntimePaths;
use crate::resilience::ResilienceController;
use crate::store::{extract_section, format_timestamp, TaskDocument, TaskStore};
use crate::types::TaskStatus;

/// Name of the plan section appended to task bodies.
pub const PLAN_SECTION: &str = "Execution Plan";

// ── Categories ──────────────────────────────────────────────────

/// Plan category, selecting the step template and suggested skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanCategory {
    Coding,
    Research,
    Documentation,
    Planning,
    Communication,
    Review,
}

impl PlanCategory {
    /// All categories in scoring order.
    pub const ALL: [PlanCategory; 6] = [
        Self::Coding,
        Self::Research,
        Self::Documentation,
        Self::Planning,
        Self::Communication,
        Self::Review,
    ];

    /// Category name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Research => "research",
            Self::Documentation => "documentation",
            Self::Planning => "planning",
            Self::Communication => "communication",
            Self::Review => "review",
        }
    }

    /// Keywords voting for this category.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::Coding => &[
                "code", "function", "api", "script", "implement", "build", "develop", "refactor",
                "debug", "test", "endpoint", "module", ".py", ".js", ".ts", ".java", ".cpp", ".sh",
            ],
            Self::Research => &[
                "research", "analyze", "investigate", "explore", "compare", "evaluate", "study",
                "find", "search", "survey",
            ],
            Self::Documentation => &[
                "document", "write", "readme", "guide", "tutorial", "explain", "describe",
                "update docs", "manual",
            ],
            Self::Planning => &[
                "plan", "strategy", "roadmap", "design", "architecture", "outline", "structure",
                "organize", "project", "timeline",
            ],
            Self::Communication => &[
                "email", "send", "reply", "message", "reach out", "follow up", "contact",
                "newsletter",
            ],
            Self::Review => &[
                "review", "feedback", "assess", "audit", "critique", "proofread",
            ],
        }
    }

    /// Declared category → skill mapping.
    pub fn suggested_skill(self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Research | Self::Review => "research",
            Self::Documentation => "documentation",
            Self::Planning => "planner",
            Self::Communication => "email",
        }
    }

    /// Step template for the generated plan.
    pub fn steps(self) -> &'static [&'static str] {
        match self {
            Self::Coding => &[
                "Read and understand requirements",
                "Design solution approach",
                "Implement code",
                "Write tests",
                "Test implementation",
                "Document changes",
                "Verify completion",
            ],
            Self::Research => &[
                "Define research questions",
                "Gather information from sources",
                "Analyze findings",
                "Compare alternatives",
                "Formulate recommendation",
                "Document findings",
                "Verify completion",
            ],
            Self::Documentation => &[
                "Understand target audience",
                "Gather source materials",
                "Create document outline",
                "Write content",
                "Add examples",
                "Review and refine",
                "Verify completion",
            ],
            Self::Planning => &[
                "Clarify goals and objectives",
                "Identify scope and constraints",
                "Break down into tasks",
                "Identify dependencies",
                "Create timeline",
                "Document plan",
                "Verify completion",
            ],
            Self::Communication => &[
                "Identify recipients and intent",
                "Draft the message",
                "Review tone and content",
                "Send via the messaging skill",
                "Record delivery confirmation",
                "Verify completion",
            ],
            Self::Review => &[
                "Collect the material under review",
                "Establish review criteria",
                "Work through the material",
                "Note findings and required changes",
                "Summarize the verdict",
                "Verify completion",
            ],
        }
    }

    /// Deliverables checklist.
    pub fn deliverables(self) -> &'static [&'static str] {
        match self {
            Self::Coding => &["Working code", "Tests", "Documentation"],
            Self::Research => &["Research report", "Comparison matrix", "Recommendation"],
            Self::Documentation => &["Documentation file", "Examples", "Cross-references"],
            Self::Planning => &["Project plan", "Task breakdown", "Timeline"],
            Self::Communication => &["Outbound message", "Delivery confirmation"],
            Self::Review => &["Review notes", "Verdict summary"],
        }
    }

    /// Estimated duration bucket.
    pub fn duration(self) -> &'static str {
        match self {
            Self::Coding => "30-60 minutes",
            Self::Research => "45-90 minutes",
            Self::Documentation => "30-60 minutes",
            Self::Planning => "20-45 minutes",
            Self::Communication => "15-30 minutes",
            Self::Review => "20-45 minutes",
        }
    }
}

/// Complexity bucket derived from body length, code fences, and open
/// checkboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Analysis ────────────────────────────────────────────────────

/// Analysis of one task, sufficient to generate its plan.
#[derive(Debug, Clone)]
pub struct TaskAnalysis {
    /// Task title.
    pub title: String,
    /// Winning category.
    pub category: PlanCategory,
    /// Suggested skill for the manager.
    pub suggested_skill: String,
    /// Complexity bucket.
    pub complexity: Complexity,
}

/// Categorize a task body (with optional skill hint) by keyword score.
pub fn classify_category(body: &str, skill_hint: Option<&str>) -> PlanCategory {
    let body_lower = body.to_lowercase();
    let skill = skill_hint.unwrap_or("").to_lowercase();
    let mut best = PlanCategory::Planning;
    let mut best_score = 0usize;
    for category in PlanCategory::ALL {
        let mut score = 0usize;
        if !skill.is_empty()
            && (skill.contains(category.as_str()) || skill == category.suggested_skill())
        {
            score += 10;
        }
        score += category
            .keywords()
            .iter()
            .filter(|k| body_lower.contains(*k))
            .count();
        if score > best_score {
            best_score = score;
            best = category;
        }
    }
    best
}

/// Estimate complexity from word count, code fences, and checklists.
pub fn estimate_complexity(body: &str) -> Complexity {
    let word_count = body.split_whitespace().count();
    let has_code = body.contains("```");
    let open_boxes = body.matches("- [ ]").count();
    let has_checklist = open_boxes > 0 || body.contains("- [x]");
    if word_count > 500 || (has_code && open_boxes > 3) {
        Complexity::High
    } else if word_count > 200 || has_code || has_checklist {
        Complexity::Medium
    } else {
        Complexity::Low
    }
}

/// Analyze a task document.
pub fn analyze(doc: &TaskDocument, path: &Path) -> TaskAnalysis {
    let category = classify_category(&doc.body, doc.header.get("skill"));
    TaskAnalysis {
        title: doc.header.title_or_stem(path),
        category,
        suggested_skill: category.suggested_skill().to_owned(),
        complexity: estimate_complexity(&doc.body),
    }
}

// ── Plan rendering & parsing ────────────────────────────────────

/// Render the plan section content for an analysis.
pub fn render_plan(analysis: &TaskAnalysis) -> String {
    let stamp = format_timestamp(Local::now());
    let mut out = format!(
        "**Generated:** {stamp}\n\n**Objective:** Complete task: {}\n\n**Skill Required:** {}\n\n**Estimated Duration:** {}\n\n**Complexity:** {}\n\n### Steps\n\n",
        analysis.title,
        analysis.suggested_skill,
        analysis.category.duration(),
        analysis.complexity,
    );
    for (index, step) in analysis.category.steps().iter().enumerate() {
        out.push_str(&format!("{}. {step}\n", index + 1));
    }
    out.push_str("\n### Deliverables\n\n");
    for deliverable in analysis.category.deliverables() {
        out.push_str(&format!("- [ ] {deliverable}\n"));
    }
    out
}

/// One parsed plan step. Ids are positional; each step depends on its
/// predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    /// Positional id, `step_1`…`step_n`.
    pub id: String,
    /// Step text.
    pub name: String,
    /// Predecessor ids (empty for the first step).
    pub dependencies: Vec<String>,
}

/// Parsed plan extracted from a task body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlan {
    /// Objective line.
    pub objective: Option<String>,
    /// Required skill.
    pub skill: Option<String>,
    /// Complexity bucket text.
    pub complexity: Option<String>,
    /// Ordered steps.
    pub steps: Vec<PlanStep>,
    /// Deliverables (checked or not).
    pub deliverables: Vec<String>,
}

/// Parse the plan section of a task body, if present.
pub fn parse_plan(body: &str) -> Option<ParsedPlan> {
    let section = extract_section(body, PLAN_SECTION)?;
    let field = |label: &str| -> Option<String> {
        let re = Regex::new(&format!(r"\*\*{label}:\*\*\s*([^\n]+)")).ok()?;
        re.captures(section)
            .map(|c| c[1].trim().to_owned())
    };
    let step_re = Regex::new(r"(?m)^\s*(\d+)\.\s+(.+)$").ok()?;
    let mut steps = Vec::new();
    for (index, caps) in step_re.captures_iter(section).enumerate() {
        let id = format!("step_{}", index + 1);
        let dependencies = if index == 0 {
            Vec::new()
        } else {
            vec![format!("step_{index}")]
        };
        steps.push(PlanStep {
            id,
            name: caps[2].trim().to_owned(),
            dependencies,
        });
    }
    Some(ParsedPlan {
        objective: field("Objective"),
        skill: field("Skill Required"),
        complexity: field("Complexity"),
        steps,
        deliverables: section_deliverables(section),
    })
}

fn section_deliverables(section: &str) -> Vec<String> {
    let re = match Regex::new(r"(?m)^- \[[ xX]\] (.+)$") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.captures_iter(section)
        .map(|c| c[1].trim().to_owned())
        .collect()
}

/// Deliverables declared in a task body's plan section.
pub fn plan_deliverables(body: &str) -> Vec<String> {
    parse_plan(body).map(|p| p.deliverables).unwrap_or_default()
}

// ── Worker ──────────────────────────────────────────────────────

/// Planner over the domain directories.
pub struct Planner {
    store: TaskStore,
    paths: RuntimePaths,
    audit: AuditStream,
    resilience: Arc<ResilienceController>,
}

impl Planner {
    /// New planner.
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

    /// Plan one classified task. A task that already carries a plan is
    /// left untouched.
    pub async fn process_file(&self, path: &Path) -> Result<bool, crate::store::StoreError> {
        let doc = self.store.read(path).await?;
        if doc.has_section(PLAN_SECTION) {
            return Ok(false);
        }
        let analysis = analyze(&doc, path);
        info!(
            file = %path.display(),
            category = analysis.category.as_str(),
            skill = %analysis.suggested_skill,
            complexity = %analysis.complexity,
            "plan generated"
        );
        let plan = render_plan(&analysis);
        self.store.append_section(path, PLAN_SECTION, &plan).await?;
        self.store.set_status(path, TaskStatus::Planned).await?;

        let correlation = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.audit.agent_decision(
            "skill_selection",
            "planner",
            Some(&correlation),
            &analysis.suggested_skill,
            &format!("category {}", analysis.category.as_str()),
            1.0,
            serde_json::json!({
                "category": analysis.category.as_str(),
                "complexity": analysis.complexity.as_str(),
            }),
        );
        self.audit.task_lifecycle(
            "task_planned",
            "planner",
            &correlation,
            serde_json::json!({"skill": analysis.suggested_skill}),
        );
        Ok(true)
    }

    /// Scan all domain directories for classified tasks lacking a plan.
    pub async fn scan_once(&self) {
        for dir in self.paths.all_domain_dirs() {
            let files = match self.store.list_pending(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "planner scan failed");
                    continue;
                }
            };
            for file in files {
                let status = match self.store.read(&file).await {
                    Ok(doc) => doc.header.status(),
                    Err(_) => continue,
                };
                if status == Some(TaskStatus::Classified) {
                    if let Err(e) = self.process_file(&file).await {
                        error!(file = %file.display(), error = %e, "planning failed");
                    }
                }
            }
        }
    }
}

/// Planner worker loop.
pub async fn run_planner(
    planner: Arc<Planner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "planner started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                planner.resilience.heartbeat("planner").await;
                planner.scan_once().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("planner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::parse_document;
    use std::path::PathBuf;

    fn doc(body: &str) -> TaskDocument {
        let content = format!("---\ntitle: Sample Task\nstatus: classified\n---\n{body}");
        parse_document(Path::new("sample_task.md"), &content).expect("parse")
    }

    // ── Categorization ──

    #[test]
    fn test_coding_category() {
        let d = doc("Implement the API endpoint and debug the module.\n");
        assert_eq!(classify_category(&d.body, None), PlanCategory::Coding);
    }

    #[test]
    fn test_research_category() {
        let d = doc("Research and compare the alternatives, then evaluate.\n");
        assert_eq!(classify_category(&d.body, None), PlanCategory::Research);
    }

    #[test]
    fn test_communication_category() {
        let d = doc("Reply to the newsletter contact and follow up.\n");
        assert_eq!(classify_category(&d.body, None), PlanCategory::Communication);
    }

    #[test]
    fn test_skill_hint_dominates() {
        let d = doc("Nothing indicative here.\n");
        assert_eq!(
            classify_category(&d.body, Some("documentation")),
            PlanCategory::Documentation
        );
    }

    #[test]
    fn test_default_is_planning() {
        assert_eq!(classify_category("nothing at all", None), PlanCategory::Planning);
    }

    // ── Complexity ──

    #[test]
    fn test_complexity_low() {
        assert_eq!(estimate_complexity("short note"), Complexity::Low);
    }

    #[test]
    fn test_complexity_medium_code() {
        assert_eq!(estimate_complexity("```rust\nfn x() {}\n```"), Complexity::Medium);
    }

    #[test]
    fn test_complexity_high_wordcount() {
        let body = "word ".repeat(600);
        assert_eq!(estimate_complexity(&body), Complexity::High);
    }

    #[test]
    fn test_complexity_high_code_and_boxes() {
        let body = "```c\n```\n- [ ] a\n- [ ] b\n- [ ] c\n- [ ] d\n";
        assert_eq!(estimate_complexity(body), Complexity::High);
    }

    // ── Round trip ──

    #[test]
    fn test_plan_roundtrip() {
        let analysis = TaskAnalysis {
            title: "Sample Task".to_owned(),
            category: PlanCategory::Research,
            suggested_skill: "research".to_owned(),
            complexity: Complexity::Medium,
        };
        let body = format!("intro\n\n---\n\n## Execution Plan\n\n{}", render_plan(&analysis));
        let plan = parse_plan(&body).expect("plan parses");
        assert_eq!(plan.skill.as_deref(), Some("research"));
        assert_eq!(plan.complexity.as_deref(), Some("medium"));
        assert_eq!(plan.steps.len(), PlanCategory::Research.steps().len());
        assert_eq!(plan.steps[0].id, "step_1");
        assert_eq!(plan.steps[0].name, "Define research questions");
        assert!(plan.steps[0].dependencies.is_empty());
        assert_eq!(plan.steps[1].dependencies, vec!["step_1".to_owned()]);
        assert_eq!(
            plan.deliverables,
            vec!["Research report", "Comparison matrix", "Recommendation"]
        );
        // Parsing is stable: same ids, names, and dependencies again.
        assert_eq!(parse_plan(&body), parse_plan(&body));
    }

    #[test]
    fn test_parse_plan_absent() {
        assert!(parse_plan("no plan here").is_none());
    }

    #[test]
    fn test_plan_deliverables_checked_and_open() {
        let body = "## Execution Plan\n\n### Deliverables\n\n- [x] Report\n- [ ] Summary\n";
        assert_eq!(plan_deliverables(body), vec!["Report", "Summary"]);
    }

    // ── Worker behavior ──

    async fn fixture() -> (tempfile::TempDir, RuntimePaths, Planner, PathBuf) {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let paths = RuntimePaths::resolve(tmp.path());
        paths.ensure().await.expect("dirs");
        let resilience = Arc::new(
            ResilienceController::open(&paths.logs, AuditStream::disconnected()).await,
        );
        let planner = Planner::new(
            TaskStore,
            paths.clone(),
            AuditStream::disconnected(),
            resilience,
        );
        let file = paths
            .domain_category_dir(crate::types::Domain::Business, "reporting")
            .join("weekly_report.md");
        tokio::fs::write(
            &file,
            "---\ntitle: Weekly Report\nstatus: classified\n---\nWrite the weekly report summary with metrics.\n",
        )
        .await
        .expect("seed");
        (tmp, paths, planner, file)
    }

    #[tokio::test]
    async fn test_process_appends_plan_and_transitions() {
        let (_tmp, _paths, planner, file) = fixture().await;
        let changed = planner.process_file(&file).await.expect("plan");
        assert!(changed);
        let doc = TaskStore.read(&file).await.expect("read");
        assert_eq!(doc.header.status(), Some(TaskStatus::Planned));
        assert!(doc.has_section(PLAN_SECTION));
        let plan = parse_plan(&doc.body).expect("parse");
        assert!(plan.skill.is_some());
    }

    #[tokio::test]
    async fn test_process_idempotent() {
        let (_tmp, _paths, planner, file) = fixture().await;
        planner.process_file(&file).await.expect("first");
        let before = tokio::fs::read_to_string(&file).await.expect("read");
        let changed = planner.process_file(&file).await.expect("second");
        assert!(!changed, "existing plan left untouched");
        let after = tokio::fs::read_to_string(&file).await.expect("read");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_scan_only_touches_classified() {
        let (_tmp, paths, planner, _file) = fixture().await;
        let done_file = paths
            .domain_category_dir(crate::types::Domain::Business, "reporting")
            .join("already_done.md");
        tokio::fs::write(&done_file, "---\ntitle: x\nstatus: done\n---\nbody\n")
            .await
            .expect("seed");
        planner.scan_once().await;
        let doc = TaskStore.read(&done_file).await.expect("read");
        assert!(!doc.has_section(PLAN_SECTION));
    }
}

//! Autonomy loop: multi-step plan execution with per-step retry and
//! backoff, crash-recovery checkpoints, and bounded iterations.
//!
//! The outer loop repeats plan → execute → validate → recover → retry
//! until the goal completes, blocks, or hits the iteration cap. The
//! checkpoint is written after every iteration and every step
//! transition; a restart resumes any non-terminal checkpoint with its
//! step states intact.

pub mod actions;
pub mod runner;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fsutil;
use crate::retry::{Backoff, RetryPolicy};

/// Safety cap on outer-loop iterations per goal.
pub const MAX_ITERATIONS: u32 = 100;

// ── Step model ──────────────────────────────────────────────────

/// Status of one execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Executing,
    Validating,
    Complete,
    Failed,
    Recovering,
    Retrying,
    Skipped,
    Blocked,
}

/// Goal-level status of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Planning,
    Executing,
    Validating,
    Recovering,
    Retrying,
    Complete,
    Blocked,
    Failed,
}

impl GoalStatus {
    /// Terminal goals are not resumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Blocked | Self::Failed)
    }
}

/// Recovery strategy chosen for a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Alternative,
    Skip,
    Partial,
    Escalate,
}

/// Validation clause applied after a step executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    /// No error and non-empty outputs.
    Default,
    /// A named output key (or any output) must exist.
    OutputExists {
        /// Required key; `None` accepts any non-empty output.
        output: Option<String>,
    },
    /// Named condition evaluated against the outputs.
    Custom {
        /// `true`, or the name of an output key that must be truthy.
        condition: String,
    },
    /// External verification; the core treats the executor's word as
    /// final.
    ApiCheck,
}

impl Default for Validation {
    fn default() -> Self {
        Self::Default
    }
}

/// Static definition of one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique id within the plan.
    pub step_id: String,
    /// Human-readable name.
    pub name: String,
    /// Action to invoke (builtin or skill).
    pub action: String,
    /// Ids of steps that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Optional steps are skipped rather than blocking the goal.
    #[serde(default)]
    pub optional: bool,
    /// Steps sharing a group key run concurrently.
    #[serde(default)]
    pub parallel_group: Option<String>,
    /// Retry policy.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Validation clause.
    #[serde(default)]
    pub validation: Validation,
    /// Alternative action tried after the primary exhausts its retries.
    #[serde(default)]
    pub alternative: Option<String>,
}

impl StepDefinition {
    /// Minimal step with defaults.
    pub fn new(step_id: &str, name: &str, action: &str) -> Self {
        Self {
            step_id: step_id.to_owned(),
            name: name.to_owned(),
            action: action.to_owned(),
            dependencies: Vec::new(),
            optional: false,
            parallel_group: None,
            retry_policy: RetryPolicy::default(),
            validation: Validation::Default,
            alternative: None,
        }
    }
}

/// One recovery decision, kept in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// Step that failed.
    pub step: String,
    /// Attempt number at failure time.
    pub attempt: u32,
    /// Error text.
    pub error: String,
    /// Strategy chosen.
    pub strategy: RecoveryStrategy,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
}

/// Runtime state of one step, persisted in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Step id.
    pub step_id: String,
    /// Current status.
    pub status: StepStatus,
    /// Attempts made so far; monotonic.
    pub attempts: u32,
    /// Outputs of the last successful execution.
    #[serde(default)]
    pub outputs: serde_json::Value,
    /// Error of the last failed execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// First execution start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion (or skip) time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last recovery decision for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryRecord>,
    /// Next execution uses the alternative action.
    #[serde(default)]
    pub use_alternative: bool,
}

impl StepState {
    fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_owned(),
            status: StepStatus::Pending,
            attempts: 0,
            outputs: serde_json::Value::Null,
            error: None,
            started_at: None,
            completed_at: None,
            recovery: None,
            use_alternative: false,
        }
    }
}

/// Aggregate metrics for one goal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalMetrics {
    /// Steps in the plan.
    pub total_steps: usize,
    /// Steps validated complete.
    pub completed_steps: usize,
    /// Steps escalated to blocked.
    pub failed_steps: usize,
    /// Retry transitions taken.
    pub retry_count: u32,
    /// Recovery decisions made.
    pub recovery_count: u32,
    /// Goal start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Goal end (terminal states only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Complete execution state persisted for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Goal text (usually the task title).
    pub goal: String,
    /// Goal-level status.
    pub status: GoalStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Step currently (or last) being executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Per-step runtime state.
    pub steps: BTreeMap<String, StepState>,
    /// Shared variable bag.
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// All recovery decisions, in order.
    #[serde(default)]
    pub recovery_history: Vec<RecoveryRecord>,
    /// Aggregate metrics.
    #[serde(default)]
    pub metrics: GoalMetrics,
}

impl Checkpoint {
    /// Fresh checkpoint for a goal and plan.
    pub fn new(goal: &str, steps: &[StepDefinition]) -> Self {
        let now = Utc::now();
        let mut step_states = BTreeMap::new();
        for step in steps {
            step_states.insert(step.step_id.clone(), StepState::new(&step.step_id));
        }
        Self {
            goal: goal.to_owned(),
            status: GoalStatus::Planning,
            created_at: now,
            updated_at: now,
            current_step: None,
            steps: step_states,
            variables: BTreeMap::new(),
            recovery_history: Vec::new(),
            metrics: GoalMetrics {
                total_steps: steps.len(),
                start_time: Some(now),
                ..GoalMetrics::default()
            },
        }
    }

    /// Steps currently validated complete.
    pub fn completed_count(&self) -> usize {
        self.steps
            .values()
            .filter(|s| s.status == StepStatus::Complete)
            .count()
    }
}

// ── Plan validation ─────────────────────────────────────────────

/// Plan structure errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// Two steps share an id.
    #[error("duplicate step id: {0}")]
    DuplicateId(String),
    /// A dependency names a step that does not exist.
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency {
        /// Dependent step.
        step: String,
        /// Missing dependency id.
        dependency: String,
    },
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving step {0}")]
    Cycle(String),
}

/// Check id uniqueness and acyclicity of the dependency graph.
pub fn validate_plan(steps: &[StepDefinition]) -> Result<(), PlanError> {
    let mut ids = std::collections::HashSet::new();
    for step in steps {
        if !ids.insert(step.step_id.as_str()) {
            return Err(PlanError::DuplicateId(step.step_id.clone()));
        }
    }
    for step in steps {
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    step: step.step_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    // Depth-first cycle check with a three-color marking.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }
    let index: BTreeMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.step_id.as_str(), s)).collect();
    let mut marks: BTreeMap<&str, Mark> =
        steps.iter().map(|s| (s.step_id.as_str(), Mark::White)).collect();

    fn visit<'a>(
        id: &'a str,
        index: &BTreeMap<&'a str, &'a StepDefinition>,
        marks: &mut BTreeMap<&'a str, Mark>,
    ) -> Result<(), PlanError> {
        match marks.get(id) {
            Some(Mark::Black) => return Ok(()),
            Some(Mark::Gray) => return Err(PlanError::Cycle(id.to_owned())),
            _ => {}
        }
        marks.insert(id, Mark::Gray);
        if let Some(step) = index.get(id) {
            for dep in &step.dependencies {
                visit(dep.as_str(), index, marks)?;
            }
        }
        marks.insert(id, Mark::Black);
        Ok(())
    }

    for step in steps {
        visit(step.step_id.as_str(), &index, &mut marks)?;
    }
    Ok(())
}

// ── Step parsing ────────────────────────────────────────────────

/// Parse explicit step blocks from a task body. The grammar is a list of
/// `- step_id:` blocks with indented `key: value` properties:
///
/// ```text
/// - step_id: fetch
///   name: Fetch data
///   action: research
///   dependencies: [prepare]
///   parallel_group: fetchers
///   max_attempts: 3
///   backoff: exponential
///   validation: output_exists
/// ```
pub fn parse_steps(body: &str) -> Vec<StepDefinition> {
    let mut steps: Vec<StepDefinition> = Vec::new();
    let mut current: Option<StepDefinition> = None;

    for line in body.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("- step_id:") {
            if let Some(done) = current.take() {
                steps.push(done);
            }
            let id = rest.trim();
            if !id.is_empty() {
                let mut step = StepDefinition::new(id, id, "noop");
                step.name = id.to_owned();
                current = Some(step);
            }
            continue;
        }
        // Properties are indented lines under the block; anything else
        // at top level closes the current block.
        if !line.starts_with(' ') && !line.starts_with('\t') {
            if let Some(done) = current.take() {
                steps.push(done);
            }
            continue;
        }
        let Some(step) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "name" => step.name = value.to_owned(),
            "action" => step.action = value.to_owned(),
            "dependencies" => {
                step.dependencies = value
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            "optional" => step.optional = value.eq_ignore_ascii_case("true"),
            "parallel_group" => {
                step.parallel_group = (!value.is_empty()).then(|| value.to_owned())
            }
            "alternative" => step.alternative = (!value.is_empty()).then(|| value.to_owned()),
            "max_attempts" => {
                if let Ok(n) = value.parse() {
                    step.retry_policy.max_attempts = n;
                }
            }
            "backoff" => {
                step.retry_policy.backoff = match value {
                    "fixed" => Backoff::Fixed,
                    "linear" => Backoff::Linear,
                    _ => Backoff::Exponential,
                }
            }
            "base_delay" => {
                if let Ok(v) = value.parse() {
                    step.retry_policy.base_delay_secs = v;
                }
            }
            "max_delay" => {
                if let Ok(v) = value.parse() {
                    step.retry_policy.max_delay_secs = v;
                }
            }
            "jitter" => {
                if let Ok(v) = value.parse() {
                    step.retry_policy.jitter = v;
                }
            }
            "timeout" => {
                if let Ok(v) = value.parse() {
                    step.retry_policy.timeout_secs = v;
                }
            }
            "validation" => {
                step.validation = match value {
                    "output_exists" => Validation::OutputExists { output: None },
                    "api_check" => Validation::ApiCheck,
                    other if other.starts_with("custom") => Validation::Custom {
                        condition: other
                            .split_once(':')
                            .map(|(_, c)| c.trim().to_owned())
                            .unwrap_or_else(|| "true".to_owned()),
                    },
                    _ => Validation::Default,
                }
            }
            "validation_output" => {
                step.validation = Validation::OutputExists {
                    output: Some(value.to_owned()),
                }
            }
            _ => debug!(key, "unknown step property ignored"),
        }
    }
    if let Some(done) = current.take() {
        steps.push(done);
    }
    steps
}

/// Default three-step plan for tasks without explicit step blocks:
/// analyze, execute via the task's skill, validate.
pub fn default_steps(skill: Option<&str>) -> Vec<StepDefinition> {
    let skill = skill.filter(|s| !s.is_empty()).unwrap_or("task_processor");
    let mut analyze = StepDefinition::new("step_1_analyze", "Analyze task requirements", "log");
    analyze.retry_policy.max_attempts = 2;
    let mut execute =
        StepDefinition::new("step_2_execute", &format!("Execute {skill} action"), skill);
    execute.dependencies = vec!["step_1_analyze".to_owned()];
    execute.retry_policy.max_attempts = 3;
    execute.retry_policy.backoff = Backoff::Exponential;
    let mut validate = StepDefinition::new("step_3_validate", "Validate completion", "condition");
    validate.dependencies = vec!["step_2_execute".to_owned()];
    validate.retry_policy.max_attempts = 2;
    vec![analyze, execute, validate]
}

/// True when a task should run through the autonomy loop rather than
/// single-shot skill dispatch.
pub fn is_multistep(body: &str, skill: Option<&str>) -> bool {
    skill == Some("autonomy_loop") || body.contains("- step_id:")
}

// ── Checkpoint store ────────────────────────────────────────────

/// Filesystem checkpoint store under `Logs/autonomy_states/`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

/// Derive the state-file slug from a goal string: first 30 chars,
/// punctuation stripped, spaces collapsed to underscores.
pub fn goal_slug(goal: &str) -> String {
    let head: String = goal.chars().take(30).collect();
    let cleaned: String = head
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect();
    cleaned.trim().replace(char::is_whitespace, "_")
}

impl CheckpointStore {
    /// Store rooted at `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Path of the checkpoint file for a goal.
    pub fn path_for(&self, goal: &str) -> PathBuf {
        self.dir.join(format!("state_{}.json", goal_slug(goal)))
    }

    /// Load the checkpoint for a goal, if any.
    pub async fn load(&self, goal: &str) -> Option<Checkpoint> {
        let path = self.path_for(goal);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint ignored");
                None
            }
        }
    }

    /// Persist a checkpoint atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        let path = self.path_for(&checkpoint.goal);
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fsutil::replace_file(&path, &json).await
    }

    /// All non-terminal checkpoints, for resume at startup.
    pub async fn list_incomplete(&self) -> Vec<Checkpoint> {
        let mut found = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return found;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("state_") || !name.ends_with(".json") {
                continue;
            }
            if let Ok(content) = tokio::fs::read_to_string(entry.path()).await {
                if let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&content) {
                    if !checkpoint.status.is_terminal() {
                        found.push(checkpoint);
                    }
                }
            }
        }
        found.sort_by(|a, b| a.goal.cmp(&b.goal));
        found
    }
}

//! The outer autonomy loop and its worker.
//!
//! plan → execute → validate → recover → retry, repeated until the goal
//! completes, blocks, or exhausts the iteration cap. Sequential steps
//! run in listed order; members of a parallel group execute
//! concurrently. Cancellation is cooperative: a shutdown signal lets the
//! current iteration finish writing its checkpoint before returning.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::actions::{ActionRegistry, VariableBag};
use super::{
    default_steps, is_multistep, parse_steps, validate_plan, Checkpoint, CheckpointStore,
    GoalStatus, RecoveryRecord, RecoveryStrategy, StepDefinition, StepState, StepStatus,
    Validation, MAX_ITERATIONS,
};
use crate::audit::AuditStream;
use crate::config::RuntimePaths;
use crate::resilience::ResilienceController;
use crate::store::{format_timestamp, StoreError, TaskStore};
use crate::types::{FailureKind, TaskStatus};

// ── Loop ────────────────────────────────────────────────────────

/// Executes checkpointed goals against the action registry.
pub struct AutonomyLoop {
    actions: ActionRegistry,
    checkpoints: CheckpointStore,
    audit: AuditStream,
}

impl AutonomyLoop {
    /// New loop persisting checkpoints under `checkpoint_dir`.
    pub fn new(actions: ActionRegistry, checkpoint_dir: &Path, audit: AuditStream) -> Self {
        Self {
            actions,
            checkpoints: CheckpointStore::new(checkpoint_dir),
            audit,
        }
    }

    /// Checkpoint store, for resume queries.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run a goal to a terminal state (or until shutdown). The
    /// checkpoint is updated in place and persisted after every
    /// transition, so the caller can resume from whatever state remains.
    pub async fn run_goal(
        &self,
        checkpoint: &mut Checkpoint,
        steps: &[StepDefinition],
        shutdown: Option<watch::Receiver<bool>>,
    ) -> GoalStatus {
        if let Err(e) = validate_plan(steps) {
            error!(goal = %checkpoint.goal, error = %e, "invalid plan");
            checkpoint.status = GoalStatus::Failed;
            checkpoint.metrics.end_time = Some(Utc::now());
            let variables = Arc::new(Mutex::new(checkpoint.variables.clone()));
            self.persist(checkpoint, &variables).await;
            return GoalStatus::Failed;
        }
        // Resumed checkpoints may predate plan edits; make sure every
        // step has a state entry.
        for step in steps {
            checkpoint
                .steps
                .entry(step.step_id.clone())
                .or_insert_with(|| StepState::new(&step.step_id));
        }
        // A crash can leave steps frozen mid-transition; re-arm them so
        // the resumed loop can make progress. Attempt counters are kept.
        for state in checkpoint.steps.values_mut() {
            if matches!(
                state.status,
                StepStatus::Executing
                    | StepStatus::Validating
                    | StepStatus::Recovering
                    | StepStatus::Failed
                    | StepStatus::Ready
            ) {
                state.status = StepStatus::Retrying;
            }
        }
        checkpoint.metrics.total_steps = steps.len();
        let variables: VariableBag = Arc::new(Mutex::new(checkpoint.variables.clone()));

        info!(goal = %checkpoint.goal, steps = steps.len(), "autonomy loop starting");
        let mut iteration = 0u32;
        while iteration < MAX_ITERATIONS {
            iteration += 1;

            if shutdown
                .as_ref()
                .map(|rx| *rx.borrow())
                .unwrap_or(false)
            {
                info!(goal = %checkpoint.goal, "shutdown observed, checkpoint preserved");
                self.persist(checkpoint, &variables).await;
                return checkpoint.status;
            }

            if goal_complete(steps, checkpoint) {
                checkpoint.status = GoalStatus::Complete;
                checkpoint.metrics.end_time = Some(Utc::now());
                self.persist(checkpoint, &variables).await;
                info!(
                    goal = %checkpoint.goal,
                    iterations = iteration,
                    completed = checkpoint.metrics.completed_steps,
                    "goal complete"
                );
                return GoalStatus::Complete;
            }
            if is_blocked(steps, checkpoint) {
                checkpoint.status = GoalStatus::Blocked;
                self.persist(checkpoint, &variables).await;
                warn!(goal = %checkpoint.goal, "execution blocked, intervention required");
                return GoalStatus::Blocked;
            }

            checkpoint.status = GoalStatus::Executing;
            let (sequential, groups) = plan_ready(steps, checkpoint);
            if sequential.is_empty() && groups.is_empty() {
                // Not complete, not blocked, nothing ready: the plan
                // cannot make progress.
                warn!(goal = %checkpoint.goal, "no steps ready, marking blocked");
                checkpoint.status = GoalStatus::Blocked;
                self.persist(checkpoint, &variables).await;
                return GoalStatus::Blocked;
            }

            for step in sequential {
                self.run_step(checkpoint, step, &variables).await;
            }
            for (group, members) in groups {
                debug!(group = %group, members = members.len(), "running parallel group");
                self.run_group(checkpoint, &members, &variables).await;
            }

            self.persist(checkpoint, &variables).await;
            debug!(
                iteration,
                completed = checkpoint.completed_count(),
                total = steps.len(),
                "iteration finished"
            );
        }

        error!(goal = %checkpoint.goal, cap = MAX_ITERATIONS, "iteration cap exceeded");
        checkpoint.status = GoalStatus::Failed;
        checkpoint.metrics.end_time = Some(Utc::now());
        self.persist(checkpoint, &variables).await;
        GoalStatus::Failed
    }

    /// Execute one sequential step through the full
    /// execute/validate/recover/retry cycle.
    async fn run_step(
        &self,
        checkpoint: &mut Checkpoint,
        step: &StepDefinition,
        variables: &VariableBag,
    ) {
        let (inputs, use_alternative) = prepare(checkpoint, step);
        self.persist(checkpoint, variables).await;
        let result = self
            .perform(step, use_alternative, inputs, Arc::clone(variables))
            .await;
        self.settle(checkpoint, step, result, variables).await;
    }

    /// Execute a parallel group: all members run concurrently, then
    /// their results are settled in listed order.
    async fn run_group(
        &self,
        checkpoint: &mut Checkpoint,
        members: &[&StepDefinition],
        variables: &VariableBag,
    ) {
        let mut prepared = Vec::with_capacity(members.len());
        for step in members {
            let (inputs, use_alternative) = prepare(checkpoint, step);
            prepared.push((*step, use_alternative, inputs));
        }
        self.persist(checkpoint, variables).await;

        let futures = prepared.into_iter().map(|(step, use_alternative, inputs)| {
            let vars = Arc::clone(variables);
            async move { (step, self.perform(step, use_alternative, inputs, vars).await) }
        });
        let results = join_all(futures).await;
        for (step, result) in results {
            self.settle(checkpoint, step, result, variables).await;
        }
    }

    /// Invoke the step's action (or its alternative) under the
    /// per-attempt timeout.
    async fn perform(
        &self,
        step: &StepDefinition,
        use_alternative: bool,
        inputs: serde_json::Value,
        variables: VariableBag,
    ) -> Result<serde_json::Value, String> {
        let action_name = if use_alternative {
            step.alternative.as_deref().unwrap_or(step.action.as_str())
        } else {
            step.action.as_str()
        };
        let Some(action) = self.actions.get(action_name) else {
            return Err(format!("unknown action: {action_name}"));
        };
        match tokio::time::timeout(
            step.retry_policy.timeout(),
            action.run(step, inputs, variables),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!(
                "step timed out after {:.0}s",
                step.retry_policy.timeout_secs
            )),
        }
    }

    /// Validate the result and apply the recovery ladder on failure.
    async fn settle(
        &self,
        checkpoint: &mut Checkpoint,
        step: &StepDefinition,
        result: Result<serde_json::Value, String>,
        variables: &VariableBag,
    ) {
        match result {
            Ok(outputs) => {
                if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
                    state.outputs = outputs;
                    state.error = None;
                    state.status = StepStatus::Validating;
                }
                self.persist(checkpoint, variables).await;
                let valid = validate_step(step, checkpoint.steps.get(&step.step_id));
                if valid {
                    if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
                        state.status = StepStatus::Complete;
                        state.completed_at = Some(Utc::now());
                    }
                    checkpoint.metrics.completed_steps = checkpoint.completed_count();
                    info!(step = %step.step_id, "step complete");
                    self.persist(checkpoint, variables).await;
                    return;
                }
                // Executor succeeded but the clause rejected it.
                if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
                    state.status = StepStatus::Failed;
                    state.error = Some("validation failed".to_owned());
                }
                self.audit.failure(
                    "autonomy",
                    FailureKind::StepValidationFailed,
                    &format!("step {} failed validation", step.step_id),
                    Some(&checkpoint.goal),
                    serde_json::json!({"step": step.step_id}),
                );
            }
            Err(e) => {
                if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
                    state.status = StepStatus::Failed;
                    state.error = Some(e);
                }
            }
        }
        self.persist(checkpoint, variables).await;

        let strategy = self.recover(checkpoint, step).await;
        self.apply_retry(checkpoint, step, strategy, variables).await;
    }

    /// Choose a recovery strategy for the failed step and record it.
    async fn recover(&self, checkpoint: &mut Checkpoint, step: &StepDefinition) -> RecoveryStrategy {
        checkpoint.status = GoalStatus::Recovering;
        let (attempts, error, using_alternative) = checkpoint
            .steps
            .get(&step.step_id)
            .map(|s| (s.attempts, s.error.clone().unwrap_or_default(), s.use_alternative))
            .unwrap_or((0, String::new(), false));

        let strategy = if attempts < step.retry_policy.max_attempts {
            RecoveryStrategy::Retry
        } else if step.optional {
            RecoveryStrategy::Skip
        } else if step.alternative.is_some() && !using_alternative {
            RecoveryStrategy::Alternative
        } else {
            RecoveryStrategy::Escalate
        };

        let record = RecoveryRecord {
            step: step.step_id.clone(),
            attempt: attempts,
            error: error.clone(),
            strategy,
            timestamp: Utc::now(),
        };
        checkpoint.recovery_history.push(record.clone());
        if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
            state.recovery = Some(record);
        }
        checkpoint.metrics.recovery_count = checkpoint.metrics.recovery_count.saturating_add(1);

        info!(
            step = %step.step_id,
            attempts,
            max = step.retry_policy.max_attempts,
            strategy = ?strategy,
            "recovery decision"
        );
        self.audit.agent_decision(
            "recovery_action",
            "autonomy",
            Some(&checkpoint.goal),
            &format!("{strategy:?}").to_lowercase(),
            &error,
            1.0,
            serde_json::json!({"step": step.step_id, "attempt": attempts}),
        );
        strategy
    }

    /// Apply the chosen strategy: back off and re-arm, switch to the
    /// alternative, skip, or block.
    async fn apply_retry(
        &self,
        checkpoint: &mut Checkpoint,
        step: &StepDefinition,
        strategy: RecoveryStrategy,
        variables: &VariableBag,
    ) {
        match strategy {
            RecoveryStrategy::Retry => {
                let attempts = checkpoint
                    .steps
                    .get(&step.step_id)
                    .map(|s| s.attempts)
                    .unwrap_or(1);
                let delay = step.retry_policy.jittered_delay(attempts, rand::random::<f64>());
                self.audit.retry(
                    "autonomy",
                    &step.step_id,
                    attempts,
                    step.retry_policy.max_attempts,
                    delay.as_secs_f64(),
                    "step failed",
                    "pending",
                    Some(&checkpoint.goal),
                );
                checkpoint.status = GoalStatus::Retrying;
                if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
                    state.status = StepStatus::Retrying;
                    state.error = None;
                }
                checkpoint.metrics.retry_count =
                    checkpoint.metrics.retry_count.saturating_add(1);
                self.persist(checkpoint, variables).await;
                info!(step = %step.step_id, delay_secs = delay.as_secs_f64(), "backing off");
                tokio::time::sleep(delay).await;
            }
            RecoveryStrategy::Alternative => {
                if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
                    state.use_alternative = true;
                    state.attempts = 0;
                    state.status = StepStatus::Retrying;
                    state.error = None;
                }
                self.persist(checkpoint, variables).await;
            }
            RecoveryStrategy::Skip | RecoveryStrategy::Partial => {
                if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
                    state.status = StepStatus::Skipped;
                    state.completed_at = Some(Utc::now());
                }
                self.persist(checkpoint, variables).await;
            }
            RecoveryStrategy::Escalate => {
                if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
                    state.status = StepStatus::Blocked;
                }
                checkpoint.metrics.failed_steps =
                    checkpoint.metrics.failed_steps.saturating_add(1);
                self.persist(checkpoint, variables).await;
            }
        }
    }

    /// Sync variables back and save the checkpoint.
    async fn persist(&self, checkpoint: &mut Checkpoint, variables: &VariableBag) {
        checkpoint.variables = variables.lock().await.clone();
        checkpoint.updated_at = Utc::now();
        if let Err(e) = self.checkpoints.save(checkpoint).await {
            error!(goal = %checkpoint.goal, error = %e, "checkpoint save failed");
        }
    }
}

// ── Phase helpers ───────────────────────────────────────────────

/// Mark the step executing, bump attempts, and gather inputs from its
/// dependencies' outputs. Returns the inputs plus the alternative flag.
fn prepare(checkpoint: &mut Checkpoint, step: &StepDefinition) -> (serde_json::Value, bool) {
    let mut merged = serde_json::Map::new();
    for dep in &step.dependencies {
        if let Some(dep_state) = checkpoint.steps.get(dep) {
            if let Some(outputs) = dep_state.outputs.as_object() {
                for (key, value) in outputs {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
    }
    checkpoint.current_step = Some(step.step_id.clone());
    let mut use_alternative = false;
    if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
        state.status = StepStatus::Executing;
        state.attempts = state.attempts.saturating_add(1);
        state.started_at.get_or_insert_with(Utc::now);
        use_alternative = state.use_alternative;
    }
    (serde_json::Value::Object(merged), use_alternative)
}

/// Ready steps partitioned into the sequential list and parallel
/// groups, in listed order.
fn plan_ready<'a>(
    steps: &'a [StepDefinition],
    checkpoint: &mut Checkpoint,
) -> (Vec<&'a StepDefinition>, Vec<(String, Vec<&'a StepDefinition>)>) {
    let mut sequential = Vec::new();
    let mut groups: Vec<(String, Vec<&'a StepDefinition>)> = Vec::new();

    for step in steps {
        let runnable = matches!(
            checkpoint.steps.get(&step.step_id).map(|s| s.status),
            Some(StepStatus::Pending | StepStatus::Ready | StepStatus::Retrying)
        );
        if !runnable {
            continue;
        }
        // Skipped optional dependencies satisfy their children; their
        // outputs are simply absent from the gathered inputs.
        let deps_met = step.dependencies.iter().all(|dep| {
            checkpoint
                .steps
                .get(dep)
                .map(|d| matches!(d.status, StepStatus::Complete | StepStatus::Skipped))
                .unwrap_or(false)
        });
        if !deps_met {
            continue;
        }
        if let Some(state) = checkpoint.steps.get_mut(&step.step_id) {
            if state.status == StepStatus::Pending {
                state.status = StepStatus::Ready;
            }
        }
        match &step.parallel_group {
            Some(group) => match groups.iter_mut().find(|(name, _)| name == group) {
                Some((_, members)) => members.push(step),
                None => groups.push((group.clone(), vec![step])),
            },
            None => sequential.push(step),
        }
    }
    (sequential, groups)
}

/// Apply the step's validation clause to its current state.
fn validate_step(step: &StepDefinition, state: Option<&StepState>) -> bool {
    let Some(state) = state else {
        return false;
    };
    if state.error.is_some() {
        return false;
    }
    match &step.validation {
        Validation::Default => !state.outputs.is_null(),
        Validation::OutputExists { output: Some(key) } => state.outputs.get(key).is_some(),
        Validation::OutputExists { output: None } => state
            .outputs
            .as_object()
            .map(|o| !o.is_empty())
            .unwrap_or(!state.outputs.is_null()),
        Validation::Custom { condition } => {
            condition == "true"
                || state
                    .outputs
                    .get(condition)
                    .map(|v| v.as_bool().unwrap_or(!v.is_null()))
                    .unwrap_or(false)
        }
        Validation::ApiCheck => true,
    }
}

/// All non-optional steps complete.
fn goal_complete(steps: &[StepDefinition], checkpoint: &Checkpoint) -> bool {
    steps.iter().filter(|s| !s.optional).all(|s| {
        checkpoint
            .steps
            .get(&s.step_id)
            .map(|state| state.status == StepStatus::Complete)
            .unwrap_or(false)
    })
}

/// A non-optional step is blocked, or a non-optional pending step has a
/// blocked dependency.
fn is_blocked(steps: &[StepDefinition], checkpoint: &Checkpoint) -> bool {
    for step in steps.iter().filter(|s| !s.optional) {
        let Some(state) = checkpoint.steps.get(&step.step_id) else {
            continue;
        };
        if state.status == StepStatus::Blocked {
            return true;
        }
        if state.status == StepStatus::Pending {
            let dep_blocked = step.dependencies.iter().any(|dep| {
                checkpoint
                    .steps
                    .get(dep)
                    .map(|d| d.status == StepStatus::Blocked)
                    .unwrap_or(false)
            });
            if dep_blocked {
                return true;
            }
        }
    }
    false
}

// ── Worker ──────────────────────────────────────────────────────

/// Scans domain directories for multi-step tasks and drives them
/// through the loop, updating the task file with the outcome.
pub struct AutonomyWorker {
    runner: AutonomyLoop,
    store: TaskStore,
    paths: RuntimePaths,
    audit: AuditStream,
    resilience: Arc<ResilienceController>,
}

impl AutonomyWorker {
    /// New worker.
    pub fn new(
        runner: AutonomyLoop,
        store: TaskStore,
        paths: RuntimePaths,
        audit: AuditStream,
        resilience: Arc<ResilienceController>,
    ) -> Self {
        Self {
            runner,
            store,
            paths,
            audit,
            resilience,
        }
    }

    /// Checkpoint store used by this worker's loop.
    pub fn checkpoints(&self) -> &CheckpointStore {
        self.runner.checkpoints()
    }

    /// Drive one task through the loop. Resumes a non-terminal
    /// checkpoint when one exists; a task re-entered with
    /// `status: retry` starts a fresh checkpoint.
    pub async fn process_task(
        &self,
        path: &Path,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<GoalStatus, StoreError> {
        let doc = self.store.read(path).await?;
        let goal = doc.header.title_or_stem(path);
        let correlation = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let task_status = doc.header.status();

        let parsed = parse_steps(&doc.body);
        let steps = if parsed.is_empty() {
            default_steps(doc.header.get("skill"))
        } else {
            parsed
        };

        let mut checkpoint = match self.runner.checkpoints.load(&goal).await {
            Some(existing) if existing.status.is_terminal() => {
                if task_status == Some(TaskStatus::Retry) {
                    info!(goal = %goal, "retry re-entry, starting fresh checkpoint");
                    Checkpoint::new(&goal, &steps)
                } else if existing.status == GoalStatus::Complete
                    && task_status != Some(TaskStatus::Done)
                {
                    // Crashed between completing the goal and stamping
                    // the task file; finish the bookkeeping now.
                    self.finalize(path, &existing, &correlation).await?;
                    return Ok(GoalStatus::Complete);
                } else {
                    // Terminal checkpoint and no retry request: nothing
                    // to do for this file.
                    return Ok(existing.status);
                }
            }
            Some(existing) => {
                info!(goal = %goal, status = ?existing.status, "resuming checkpoint");
                existing
            }
            None => Checkpoint::new(&goal, &steps),
        };

        self.store.set_status(path, TaskStatus::InProgress).await?;
        self.audit.task_lifecycle(
            "task_started",
            "autonomy",
            &correlation,
            serde_json::json!({"goal": goal, "steps": steps.len()}),
        );

        let status = self.runner.run_goal(&mut checkpoint, &steps, shutdown).await;
        match status {
            GoalStatus::Complete => {
                self.finalize(path, &checkpoint, &correlation).await?;
            }
            GoalStatus::Blocked => {
                // Blocked tasks stay in place; only the audit trail
                // records why.
                self.audit.task_lifecycle(
                    "task_blocked",
                    "autonomy",
                    &correlation,
                    serde_json::json!({
                        "blocked_steps": checkpoint
                            .steps
                            .values()
                            .filter(|s| s.status == StepStatus::Blocked)
                            .map(|s| s.step_id.clone())
                            .collect::<Vec<_>>(),
                    }),
                );
                self.append_summary_once(path, &checkpoint).await?;
            }
            GoalStatus::Failed => {
                self.resilience
                    .record_failure(
                        "autonomy",
                        FailureKind::Exception,
                        "goal failed",
                        Some(&correlation),
                    )
                    .await;
                self.append_summary_once(path, &checkpoint).await?;
                self.store
                    .append_section(path, "Error", "Autonomous execution failed; see the execution summary above.")
                    .await?;
                self.store.set_status(path, TaskStatus::Failed).await?;
                self.audit.task_lifecycle(
                    "task_failed",
                    "autonomy",
                    &correlation,
                    serde_json::json!({}),
                );
            }
            // Shutdown mid-goal: checkpoint preserved, file untouched.
            _ => {}
        }
        Ok(status)
    }

    /// Mark the task done and record the execution summary.
    async fn finalize(
        &self,
        path: &Path,
        checkpoint: &Checkpoint,
        correlation: &str,
    ) -> Result<(), StoreError> {
        self.append_summary_once(path, checkpoint).await?;
        let mut doc = self.store.read(path).await?;
        doc.header.set("status", TaskStatus::Done.as_str());
        if !doc.header.contains("completed") {
            doc.header.set("completed", format_timestamp(Local::now()));
        }
        self.store.write(path, &doc).await?;
        self.audit.task_lifecycle(
            "task_completed",
            "autonomy",
            correlation,
            serde_json::json!({
                "completed_steps": checkpoint.metrics.completed_steps,
                "retries": checkpoint.metrics.retry_count,
            }),
        );
        Ok(())
    }

    async fn append_summary_once(
        &self,
        path: &Path,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        let doc = self.store.read(path).await?;
        if doc.has_section("Execution Summary") {
            return Ok(());
        }
        self.store
            .append_section(path, "Execution Summary", &render_summary(checkpoint))
            .await
    }

    /// One scan pass over every domain directory.
    pub async fn scan_once(&self, shutdown: Option<&watch::Receiver<bool>>) {
        for dir in self.paths.all_domain_dirs() {
            let files = match self.store.list_pending(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "autonomy scan failed");
                    continue;
                }
            };
            for file in files {
                let Ok(doc) = self.store.read(&file).await else {
                    continue;
                };
                let actionable = matches!(
                    doc.header.status(),
                    Some(
                        TaskStatus::Planned
                            | TaskStatus::Approved
                            | TaskStatus::Received
                            | TaskStatus::Retry
                            | TaskStatus::InProgress
                    )
                );
                if !actionable || !is_multistep(&doc.body, doc.header.get("skill")) {
                    continue;
                }
                if let Err(e) = self.process_task(&file, shutdown.cloned()).await {
                    error!(file = %file.display(), error = %e, "autonomy task failed");
                }
            }
        }
    }
}

/// Render the execution summary section body.
fn render_summary(checkpoint: &Checkpoint) -> String {
    let status_line = match checkpoint.status {
        GoalStatus::Complete => "Complete".to_owned(),
        other => format!("{other:?}"),
    };
    let mut out = format!(
        "**Status:** {status_line}\n**Steps:** {}/{}\n**Retries:** {}\n**Recoveries:** {}\n\n### Step Results\n\n",
        checkpoint.metrics.completed_steps,
        checkpoint.metrics.total_steps,
        checkpoint.metrics.retry_count,
        checkpoint.metrics.recovery_count,
    );
    for (step_id, state) in &checkpoint.steps {
        let mark = if state.status == StepStatus::Complete {
            "x"
        } else {
            " "
        };
        out.push_str(&format!(
            "- [{mark}] {step_id}: {:?} (attempts: {})\n",
            state.status, state.attempts
        ));
    }
    out
}

/// Autonomy worker loop.
pub async fn run_autonomy(
    worker: Arc<AutonomyWorker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "autonomy worker started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                worker.resilience.heartbeat("autonomy").await;
                worker.scan_once(Some(&shutdown)).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("autonomy worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autonomy::actions::StepAction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Action that fails a configured number of times, then succeeds.
    struct FlakyAction {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepAction for FlakyAction {
        async fn run(
            &self,
            _step: &StepDefinition,
            _inputs: serde_json::Value,
            _variables: VariableBag,
        ) -> Result<serde_json::Value, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(format!("transient failure #{}", n + 1))
            } else {
                Ok(serde_json::json!({"ok": true, "call": n + 1}))
            }
        }
    }

    /// Action that always fails.
    struct DoomedAction;

    #[async_trait]
    impl StepAction for DoomedAction {
        async fn run(
            &self,
            _step: &StepDefinition,
            _inputs: serde_json::Value,
            _variables: VariableBag,
        ) -> Result<serde_json::Value, String> {
            Err("permanently broken".to_owned())
        }
    }

    /// Action recording which steps executed, for ordering checks.
    struct RecordingAction {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StepAction for RecordingAction {
        async fn run(
            &self,
            step: &StepDefinition,
            _inputs: serde_json::Value,
            _variables: VariableBag,
        ) -> Result<serde_json::Value, String> {
            self.seen.lock().await.push(step.step_id.clone());
            Ok(serde_json::json!({"ran": step.step_id}))
        }
    }

    fn runner(tmp: &tempfile::TempDir, registry: ActionRegistry) -> AutonomyLoop {
        AutonomyLoop::new(registry, tmp.path(), AuditStream::disconnected())
    }

    fn fast(step: &mut StepDefinition) {
        step.retry_policy.base_delay_secs = 0.01;
        step.retry_policy.max_delay_secs = 0.01;
        step.retry_policy.jitter = 0.0;
    }

    // ── Happy path ──

    #[tokio::test]
    async fn test_simple_goal_completes() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let runner = runner(&tmp, ActionRegistry::with_builtins());
        let steps = default_steps(None);
        // The default execute step targets a skill action that is not
        // registered here; swap it for a builtin.
        let steps: Vec<StepDefinition> = steps
            .into_iter()
            .map(|mut s| {
                if s.action == "task_processor" {
                    s.action = "noop".to_owned();
                }
                s
            })
            .collect();
        let mut checkpoint = Checkpoint::new("simple goal", &steps);
        let status = runner.run_goal(&mut checkpoint, &steps, None).await;
        assert_eq!(status, GoalStatus::Complete);
        assert_eq!(checkpoint.metrics.completed_steps, 3);
        assert!(checkpoint.metrics.end_time.is_some());
    }

    // ── Retry then success (fails twice, succeeds on third attempt) ──

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let mut registry = ActionRegistry::with_builtins();
        registry.register(
            "flaky",
            Arc::new(FlakyAction {
                failures: 2,
                calls: AtomicU32::new(0),
            }),
        );
        let runner = runner(&tmp, registry);

        let mut s1 = StepDefinition::new("step_1", "prepare", "log");
        fast(&mut s1);
        let mut s2 = StepDefinition::new("step_2", "flaky work", "flaky");
        s2.dependencies = vec!["step_1".to_owned()];
        s2.retry_policy.max_attempts = 3;
        fast(&mut s2);
        let mut s3 = StepDefinition::new("step_3", "wrap up", "log");
        s3.dependencies = vec!["step_2".to_owned()];
        fast(&mut s3);
        let steps = vec![s1, s2, s3];

        let mut checkpoint = Checkpoint::new("retry goal", &steps);
        let status = runner.run_goal(&mut checkpoint, &steps, None).await;
        assert_eq!(status, GoalStatus::Complete);

        let step2 = &checkpoint.steps["step_2"];
        assert_eq!(step2.attempts, 3);
        assert_eq!(step2.status, StepStatus::Complete);
        assert!(checkpoint.metrics.retry_count >= 2);
    }

    // ── Recovery ladder ──

    #[tokio::test(start_paused = true)]
    async fn test_required_step_escalates_to_blocked() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let mut registry = ActionRegistry::with_builtins();
        registry.register("doomed", Arc::new(DoomedAction));
        let runner = runner(&tmp, registry);

        let mut s1 = StepDefinition::new("step_1", "doomed", "doomed");
        s1.retry_policy.max_attempts = 2;
        fast(&mut s1);
        let mut s2 = StepDefinition::new("step_2", "after", "log");
        s2.dependencies = vec!["step_1".to_owned()];
        let steps = vec![s1, s2];

        let mut checkpoint = Checkpoint::new("blocked goal", &steps);
        let status = runner.run_goal(&mut checkpoint, &steps, None).await;
        assert_eq!(status, GoalStatus::Blocked);
        assert_eq!(checkpoint.steps["step_1"].status, StepStatus::Blocked);
        assert_eq!(checkpoint.steps["step_1"].attempts, 2);
        assert_eq!(checkpoint.metrics.failed_steps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_step_skipped() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let mut registry = ActionRegistry::with_builtins();
        registry.register("doomed", Arc::new(DoomedAction));
        let runner = runner(&tmp, registry);

        let mut s1 = StepDefinition::new("step_1", "nice to have", "doomed");
        s1.optional = true;
        s1.retry_policy.max_attempts = 1;
        fast(&mut s1);
        let mut s2 = StepDefinition::new("step_2", "essential", "log");
        s2.dependencies = vec!["step_1".to_owned()];
        fast(&mut s2);
        let steps = vec![s1, s2];

        let mut checkpoint = Checkpoint::new("skip goal", &steps);
        let status = runner.run_goal(&mut checkpoint, &steps, None).await;
        assert_eq!(status, GoalStatus::Complete);
        assert_eq!(checkpoint.steps["step_1"].status, StepStatus::Skipped);
        assert_eq!(checkpoint.steps["step_2"].status, StepStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alternative_action_used() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let mut registry = ActionRegistry::with_builtins();
        registry.register("doomed", Arc::new(DoomedAction));
        let runner = runner(&tmp, registry);

        let mut s1 = StepDefinition::new("step_1", "primary then alt", "doomed");
        s1.retry_policy.max_attempts = 1;
        s1.alternative = Some("noop".to_owned());
        fast(&mut s1);
        let steps = vec![s1];

        let mut checkpoint = Checkpoint::new("alt goal", &steps);
        let status = runner.run_goal(&mut checkpoint, &steps, None).await;
        assert_eq!(status, GoalStatus::Complete);
        assert!(checkpoint.steps["step_1"].use_alternative);
    }

    #[tokio::test]
    async fn test_unknown_action_blocks() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let runner = runner(&tmp, ActionRegistry::with_builtins());
        let mut s1 = StepDefinition::new("step_1", "mystery", "not_registered");
        s1.retry_policy.max_attempts = 1;
        fast(&mut s1);
        let steps = vec![s1];
        let mut checkpoint = Checkpoint::new("unknown action goal", &steps);
        let status = runner.run_goal(&mut checkpoint, &steps, None).await;
        assert_eq!(status, GoalStatus::Blocked);
    }

    // ── Parallel groups ──

    #[tokio::test]
    async fn test_parallel_group_runs_all_members() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::with_builtins();
        registry.register(
            "record",
            Arc::new(RecordingAction {
                seen: Arc::clone(&seen),
            }),
        );
        let runner = runner(&tmp, registry);

        let prepare = StepDefinition::new("prepare", "prepare", "record");
        let mut a = StepDefinition::new("fetch_a", "fetch a", "record");
        a.dependencies = vec!["prepare".to_owned()];
        a.parallel_group = Some("fetchers".to_owned());
        let mut b = StepDefinition::new("fetch_b", "fetch b", "record");
        b.dependencies = vec!["prepare".to_owned()];
        b.parallel_group = Some("fetchers".to_owned());
        let mut merge = StepDefinition::new("merge", "merge", "record");
        merge.dependencies = vec!["fetch_a".to_owned(), "fetch_b".to_owned()];
        let steps = vec![prepare, a, b, merge];

        let mut checkpoint = Checkpoint::new("parallel goal", &steps);
        let status = runner.run_goal(&mut checkpoint, &steps, None).await;
        assert_eq!(status, GoalStatus::Complete);

        let order = seen.lock().await.clone();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "prepare");
        assert_eq!(order[3], "merge");
        // The two fetchers ran between, in either order.
        assert!(order[1..3].contains(&"fetch_a".to_owned()));
        assert!(order[1..3].contains(&"fetch_b".to_owned()));
    }

    // ── Crash recovery ──

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActionRegistry::with_builtins();
        registry.register(
            "record",
            Arc::new(RecordingAction {
                seen: Arc::clone(&seen),
            }),
        );
        let runner = runner(&tmp, registry);

        let s1 = StepDefinition::new("step_1", "one", "record");
        let mut s2 = StepDefinition::new("step_2", "two", "record");
        s2.dependencies = vec!["step_1".to_owned()];
        let mut s3 = StepDefinition::new("step_3", "three", "record");
        s3.dependencies = vec!["step_2".to_owned()];
        let steps = vec![s1, s2, s3];

        // Simulate a crash after steps 1 and 2 completed.
        let mut checkpoint = Checkpoint::new("crash goal", &steps);
        for id in ["step_1", "step_2"] {
            let state = checkpoint.steps.get_mut(id).expect("state");
            state.status = StepStatus::Complete;
            state.attempts = 1;
            state.outputs = serde_json::json!({"ran": id});
        }
        checkpoint.status = GoalStatus::Executing;
        checkpoint.metrics.completed_steps = 2;
        runner.checkpoints.save(&checkpoint).await.expect("save");

        // Resume: only step_3 executes.
        let mut resumed = runner.checkpoints.load("crash goal").await.expect("load");
        let status = runner.run_goal(&mut resumed, &steps, None).await;
        assert_eq!(status, GoalStatus::Complete);
        assert_eq!(seen.lock().await.as_slice(), ["step_3"]);
        assert_eq!(resumed.steps["step_1"].attempts, 1, "not re-executed");
    }

    #[tokio::test]
    async fn test_identical_checkpoint_same_plan_phase() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let steps = {
            let s1 = StepDefinition::new("a", "a", "noop");
            let mut s2 = StepDefinition::new("b", "b", "noop");
            s2.dependencies = vec!["a".to_owned()];
            vec![s1, s2]
        };
        let _ = runner(&tmp, ActionRegistry::with_builtins());
        let mut first = Checkpoint::new("plan phase goal", &steps);
        let mut second = first.clone();
        let (seq1, par1) = plan_ready(&steps, &mut first);
        let (seq2, par2) = plan_ready(&steps, &mut second);
        let ids = |v: &Vec<&StepDefinition>| v.iter().map(|s| s.step_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&seq1), ids(&seq2));
        assert_eq!(par1.len(), par2.len());
        assert_eq!(first, second);
    }

    // ── Validation clauses ──

    #[tokio::test]
    async fn test_output_exists_validation_failure() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let runner = runner(&tmp, ActionRegistry::with_builtins());
        let mut s1 = StepDefinition::new("step_1", "check", "noop");
        s1.validation = Validation::OutputExists {
            output: Some("missing_key".to_owned()),
        };
        s1.retry_policy.max_attempts = 1;
        fast(&mut s1);
        let steps = vec![s1];
        let mut checkpoint = Checkpoint::new("validation goal", &steps);
        let status = runner.run_goal(&mut checkpoint, &steps, None).await;
        assert_eq!(status, GoalStatus::Blocked);
    }

    #[test]
    fn test_validate_step_clauses() {
        let mut state = StepState::new("s");
        state.outputs = serde_json::json!({"value": 1});
        let mut step = StepDefinition::new("s", "s", "noop");
        assert!(validate_step(&step, Some(&state)));

        step.validation = Validation::OutputExists {
            output: Some("value".to_owned()),
        };
        assert!(validate_step(&step, Some(&state)));

        step.validation = Validation::Custom {
            condition: "value".to_owned(),
        };
        assert!(validate_step(&step, Some(&state)));

        step.validation = Validation::ApiCheck;
        assert!(validate_step(&step, Some(&state)));

        state.error = Some("boom".to_owned());
        assert!(!validate_step(&step, Some(&state)));
    }
}

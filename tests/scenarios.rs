//! End-to-end pipeline scenarios driven through the filesystem, from
//! inbox arrival to the terminal directory.

use std::sync::Arc;

use steward::approval::{ApprovalController, Decision};
use steward::audit::AuditStream;
use steward::autonomy::actions::ActionRegistry;
use steward::autonomy::runner::{AutonomyLoop, AutonomyWorker};
use steward::autonomy::{Checkpoint, GoalStatus, StepStatus};
use steward::config::RuntimePaths;
use steward::domain::DomainRouter;
use steward::manager::{Dispatch, Manager};
use steward::mcp::McpRouter;
use steward::memory::MemoryLog;
use steward::planner::Planner;
use steward::resilience::ResilienceController;
use steward::skills;
use steward::store::TaskStore;
use steward::types::{Domain, TaskStatus};
use steward::validator::Validator;

/// Everything a pipeline test needs, wired like the binary does it.
struct Pipeline {
    _tmp: tempfile::TempDir,
    paths: RuntimePaths,
    store: TaskStore,
    router: DomainRouter,
    planner: Planner,
    manager: Manager,
    approval: Arc<ApprovalController>,
    validator: Validator,
    autonomy: AutonomyWorker,
}

async fn pipeline() -> Pipeline {
    let tmp = tempfile::TempDir::new().expect("tmpdir");
    let paths = RuntimePaths::resolve(tmp.path());
    paths.ensure().await.expect("layout");
    let audit = AuditStream::disconnected();
    let store = TaskStore;
    let resilience =
        Arc::new(ResilienceController::open(&paths.logs, audit.clone()).await);

    // MCP backends are unreachable in tests; routing falls back to the
    // declared degraded responses, which still satisfy the skill
    // contract.
    let mcp = Arc::new(McpRouter::new(audit.clone()));
    for service in steward::mcp::default_services() {
        mcp.register(service).await;
    }
    let registry = Arc::new(skills::default_registry(Arc::clone(&mcp)));

    let approval = Arc::new(ApprovalController::new(
        store.clone(),
        paths.clone(),
        audit.clone(),
        Arc::clone(&resilience),
    ));
    let manager = Manager::new(
        store.clone(),
        paths.clone(),
        audit.clone(),
        Arc::clone(&resilience),
        Arc::clone(&registry),
        Arc::clone(&approval),
    );
    let router = DomainRouter::new(
        store.clone(),
        paths.clone(),
        audit.clone(),
        Arc::clone(&resilience),
    );
    let planner = Planner::new(
        store.clone(),
        paths.clone(),
        audit.clone(),
        Arc::clone(&resilience),
    );
    let memory = Arc::new(MemoryLog::open(&paths).await);
    let validator = Validator::new(
        store.clone(),
        paths.clone(),
        audit.clone(),
        Arc::clone(&resilience),
        Arc::clone(&memory),
    );
    let mut actions = ActionRegistry::with_builtins();
    actions.register_skills(&registry);
    let autonomy = AutonomyWorker::new(
        AutonomyLoop::new(actions, &paths.autonomy_states, audit.clone()),
        store.clone(),
        paths.clone(),
        audit.clone(),
        resilience,
    );

    Pipeline {
        _tmp: tmp,
        paths,
        store,
        router,
        planner,
        manager,
        approval,
        validator,
        autonomy,
    }
}

const LAUNCH_TASK: &str = "---\ntitle: Announce Launch\nstatus: needs_action\nskill: email\npriority: standard\n---\n\nSend the launch announcement email to customers for the marketing\ncampaign. Recipient: customers@example.com\n";

/// Scenario: an email task flows inbox → classification → plan →
/// approval divert → human grant → dispatch → terminal directory.
#[tokio::test]
async fn test_email_requires_approval_end_to_end() {
    let p = pipeline().await;

    // Arrival.
    let inbox_file = p.paths.inbox.join("announce_launch.md");
    tokio::fs::write(&inbox_file, LAUNCH_TASK).await.expect("seed");

    // Classification: Business/marketing.
    let routed = p.router.process_file(&inbox_file).await.expect("route");
    assert!(routed.starts_with(p.paths.domain_category_dir(Domain::Business, "marketing")));
    let doc = p.store.read(&routed).await.expect("read");
    assert_eq!(doc.header.status(), Some(TaskStatus::Classified));

    // Planning.
    p.planner.process_file(&routed).await.expect("plan");
    let doc = p.store.read(&routed).await.expect("read");
    assert_eq!(doc.header.status(), Some(TaskStatus::Planned));
    assert!(doc.has_section("Execution Plan"));

    // Dispatch diverts to approval; the artifact carries MEDIUM risk.
    let dispatch = p.manager.process_task(&routed).await.expect("dispatch");
    assert_eq!(dispatch, Dispatch::Diverted);
    let artifact = p.paths.needs_approval.join("approval_announce_launch.md");
    let artifact_text = tokio::fs::read_to_string(&artifact).await.expect("artifact");
    assert!(artifact_text.contains("risk_level: MEDIUM"));

    // Human decision.
    steward::fsutil::append_to_file(
        &artifact,
        "\n## Decision\n\nAPPROVED: YES\n\nApproved by: Ada\n",
    )
    .await
    .expect("decide");
    let decision = p
        .approval
        .process_artifact(&artifact, chrono::Local::now())
        .await
        .expect("process artifact");
    assert_eq!(
        decision,
        Decision::Approved {
            approver: "Ada".to_owned()
        }
    );

    // Re-admitted to its domain directory with the grant recorded.
    let returned = p
        .paths
        .domain_category_dir(Domain::Business, "marketing")
        .join("announce_launch.md");
    let doc = p.store.read(&returned).await.expect("read");
    assert!(doc.header.is_approved());
    assert_eq!(doc.header.get("approved_by"), Some("Ada"));

    // Second dispatch runs the email skill (offline MCP answers with
    // its queued fallback, which satisfies the handler contract).
    let dispatch = p.manager.process_task(&returned).await.expect("dispatch");
    assert_eq!(dispatch, Dispatch::Completed);
    let doc = p.store.read(&returned).await.expect("read");
    assert_eq!(doc.header.status(), Some(TaskStatus::Done));
    assert!(doc.header.contains("completed"));
    assert!(doc.has_section("Execution Results"));

    // Validation archives it.
    p.validator.process_file(&returned).await.expect("validate");
    assert!(p.paths.done.join("announce_launch.md").exists());
}

/// Scenario: re-running a completed task appends nothing; the results
/// section appears exactly once.
#[tokio::test]
async fn test_idempotent_rerun() {
    let p = pipeline().await;
    let inbox_file = p.paths.inbox.join("note_task.md");
    tokio::fs::write(
        &inbox_file,
        "---\ntitle: Research comparison\nstatus: needs_action\nskill: research\n---\n\nResearch and compare the journal options.\n",
    )
    .await
    .expect("seed");

    let routed = p.router.process_file(&inbox_file).await.expect("route");
    p.planner.process_file(&routed).await.expect("plan");
    let dispatch = p.manager.process_task(&routed).await.expect("dispatch");
    assert_eq!(dispatch, Dispatch::Completed);

    // Re-place as actionable, as the scenario prescribes.
    p.store
        .set_header_field(&routed, "status", "needs_action")
        .await
        .expect("reset");
    let rerun = p.manager.process_task(&routed).await.expect("re-dispatch");
    assert_eq!(rerun, Dispatch::ShortCircuited);

    let doc = p.store.read(&routed).await.expect("read");
    assert_eq!(doc.body.matches("## Execution Results").count(), 1);
    assert_eq!(doc.header.status(), Some(TaskStatus::Done));
}

const MULTI_STEP_TASK: &str = "---\ntitle: Three step goal\nstatus: planned\n---\n\n- step_id: step_one\n  name: First\n  action: log\n\n- step_id: step_two\n  name: Second\n  action: log\n  dependencies: [step_one]\n\n- step_id: step_three\n  name: Third\n  action: log\n  dependencies: [step_two]\n";

/// Scenario: killed between steps 2 and 3, the loop resumes from the
/// checkpoint without re-executing the finished steps.
#[tokio::test]
async fn test_crash_mid_plan_resumes() {
    let p = pipeline().await;
    let path = p
        .paths
        .domain_category_dir(Domain::Personal, "notes")
        .join("three_step_goal.md");
    tokio::fs::write(&path, MULTI_STEP_TASK).await.expect("seed");

    // Simulate the pre-crash checkpoint: steps one and two complete.
    let steps = steward::autonomy::parse_steps(MULTI_STEP_TASK);
    let mut checkpoint = Checkpoint::new("Three step goal", &steps);
    for id in ["step_one", "step_two"] {
        let state = checkpoint.steps.get_mut(id).expect("state");
        state.status = StepStatus::Complete;
        state.attempts = 1;
        state.outputs = serde_json::json!({"logged": id});
    }
    checkpoint.status = GoalStatus::Executing;
    checkpoint.metrics.completed_steps = 2;
    p.autonomy
        .checkpoints()
        .save(&checkpoint)
        .await
        .expect("save checkpoint");

    // Restart: the worker resumes and finishes only step three.
    let status = p.autonomy.process_task(&path, None).await.expect("resume");
    assert_eq!(status, GoalStatus::Complete);

    let resumed = p
        .autonomy
        .checkpoints()
        .load("Three step goal")
        .await
        .expect("checkpoint");
    assert_eq!(resumed.steps["step_one"].attempts, 1, "not re-run");
    assert_eq!(resumed.steps["step_two"].attempts, 1, "not re-run");
    assert_eq!(resumed.steps["step_three"].attempts, 1);

    let doc = p.store.read(&path).await.expect("read");
    assert_eq!(doc.header.status(), Some(TaskStatus::Done));
    assert!(doc.has_section("Execution Summary"));
}

/// A malformed inbox file ends up quarantined, never lost.
#[tokio::test]
async fn test_malformed_inbox_file_quarantined() {
    let p = pipeline().await;
    let inbox_file = p.paths.inbox.join("not_a_task.md");
    tokio::fs::write(&inbox_file, "just some prose").await.expect("seed");
    let dest = p.router.process_file(&inbox_file).await.expect("quarantine");
    assert!(dest.starts_with(&p.paths.done));
    let content = tokio::fs::read_to_string(&dest).await.expect("read");
    assert!(content.contains("status: failed"));
    assert!(content.contains("## Error"));
}

/// Stage uniqueness: through the whole approval round-trip the task
/// file exists in exactly one stage directory at a time.
#[tokio::test]
async fn test_stage_uniqueness_through_approval() {
    let p = pipeline().await;
    let inbox_file = p.paths.inbox.join("announce_launch.md");
    tokio::fs::write(&inbox_file, LAUNCH_TASK).await.expect("seed");

    let count_copies = |paths: &RuntimePaths| {
        let mut locations = Vec::new();
        for dir in [
            paths.inbox.clone(),
            paths.needs_approval.clone(),
            paths.done.clone(),
        ]
        .into_iter()
        .chain(paths.all_domain_dirs())
        {
            let candidate = dir.join("announce_launch.md");
            if candidate.exists() {
                locations.push(candidate);
            }
        }
        locations
    };

    let routed = p.router.process_file(&inbox_file).await.expect("route");
    assert_eq!(count_copies(&p.paths).len(), 1);

    p.planner.process_file(&routed).await.expect("plan");
    p.manager.process_task(&routed).await.expect("divert");
    assert_eq!(count_copies(&p.paths).len(), 1, "only the approval copy");

    let artifact = p.paths.needs_approval.join("approval_announce_launch.md");
    steward::fsutil::append_to_file(&artifact, "\nAPPROVED: YES\nApproved by: Ada\n")
        .await
        .expect("decide");
    p.approval
        .process_artifact(&artifact, chrono::Local::now())
        .await
        .expect("process");
    assert_eq!(count_copies(&p.paths).len(), 1, "back in its domain dir");
}

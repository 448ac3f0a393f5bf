//! Documentation writer: derives architecture and lessons documents
//! from the runtime's own layout and audit data.

use std::path::PathBuf;

use chrono::{Local, Utc};

use crate::audit;
use crate::config::RuntimePaths;
use crate::fsutil;
use crate::store::format_timestamp;

/// Components documented in the architecture overview, in data-flow
/// order.
const COMPONENTS: &[(&str, &str)] = &[
    ("Domain Router", "classifies inbox tasks into a domain and category"),
    ("Planner", "appends an execution plan and skill hint"),
    ("Manager", "resolves the skill, gates sensitive work, dispatches handlers"),
    ("Approval Controller", "creates decision artifacts and re-admits approved tasks"),
    ("Autonomy Loop", "executes multi-step plans with retries and checkpoints"),
    ("Validator", "verifies completion and archives terminal tasks"),
    ("Memory", "aggregates execution history into the dashboard"),
    ("Scheduler", "emits recurring tasks from schedule.md"),
    ("Resilience Controller", "heartbeats, retry-with-fallback, failure queue"),
    ("MCP Router", "proxies action calls to backend services with fallbacks"),
    ("Audit Stream", "append-only event log partitioned by category and month"),
];

/// Write `Docs/architecture.md`: component inventory, data flow, and
/// directory layout.
pub async fn generate_architecture(paths: &RuntimePaths) -> std::io::Result<PathBuf> {
    let mut out = format!(
        "# Architecture\n\n**Generated:** {}\n\nMarkdown files are the durable task records; worker loops move each\nfile through classification, planning, approval, dispatch, and\nvalidation, while cross-cutting controllers keep the pipeline alive\nand observable.\n\n## Components\n\n| Component | Responsibility |\n|-----------|----------------|\n",
        format_timestamp(Local::now()),
    );
    for (name, responsibility) in COMPONENTS {
        out.push_str(&format!("| {name} | {responsibility} |\n"));
    }
    out.push_str(
        "\n## Data Flow\n\nInbox → Domain Router → Domains/<domain>/<category> → Planner →\nManager (→ Needs_Approval → back) → Skill Handler → Validator → Done.\nMulti-step plans detour through the Autonomy Loop, which checkpoints\nunder Logs/autonomy_states so a restart resumes mid-plan.\n\n## Directory Layout\n\n```\nInbox/            received tasks\nDomains/          classified tasks by domain and category\nNeeds_Approval/   pending approvals and decision artifacts\nDone/             terminal tasks\nLogs/             state files, queues, human-readable logs\nAudit/            append-only event partitions\nDocs/             this documentation\n```\n",
    );
    let path = paths.docs.join("architecture.md");
    fsutil::replace_file(&path, &out).await?;
    Ok(path)
}

/// Write `Docs/lessons.md`: the most frequent failure kinds mined from
/// the audit stream, with standing mitigations.
pub async fn generate_lessons(paths: &RuntimePaths) -> std::io::Result<PathBuf> {
    let patterns = audit::mine_failure_patterns(&paths.audit, Utc::now(), 10).await;
    let mut out = format!(
        "# Lessons\n\n**Generated:** {}\n\nFailure patterns observed over the last month, most frequent first.\n\n",
        format_timestamp(Local::now()),
    );
    if patterns.is_empty() {
        out.push_str("No failures recorded in the last month.\n");
    } else {
        out.push_str("| Failure kind | Occurrences | Standing mitigation |\n");
        out.push_str("|--------------|-------------|--------------------|\n");
        for (kind, count) in &patterns {
            out.push_str(&format!(
                "| {kind} | {count} | {} |\n",
                mitigation_for(kind)
            ));
        }
    }
    let path = paths.docs.join("lessons.md");
    fsutil::replace_file(&path, &out).await?;
    Ok(path)
}

fn mitigation_for(kind: &str) -> &'static str {
    match kind {
        "timeout" => "retry with backoff; raise the per-priority timeout if persistent",
        "upstream" => "MCP fallback responses; job queued for replay when health returns",
        "heartbeat_miss" => "agent restarted by its supervisor; check the worker logs",
        "malformed_task" => "quarantined with an error section; fix the producer",
        "unknown_skill" => "task failed fast; register the skill or fix the header",
        "approval_expired" => "auto-rejected at the deadline; resubmit if still wanted",
        "step_validation_failed" => "recovery ladder retried or escalated the step",
        "queue_exhaustion" => "dead-lettered after bounded re-attempts; inspect manually",
        _ => "recorded for review",
    }
}

/// Regenerate all derived documentation.
pub async fn generate_all(paths: &RuntimePaths) -> std::io::Result<()> {
    generate_architecture(paths).await?;
    generate_lessons(paths).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_all_writes_docs() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let paths = RuntimePaths::resolve(tmp.path());
        paths.ensure().await.expect("dirs");
        generate_all(&paths).await.expect("generate");

        let architecture = tokio::fs::read_to_string(paths.docs.join("architecture.md"))
            .await
            .expect("architecture");
        assert!(architecture.contains("| Domain Router |"));
        assert!(architecture.contains("Needs_Approval"));

        let lessons = tokio::fs::read_to_string(paths.docs.join("lessons.md"))
            .await
            .expect("lessons");
        assert!(lessons.contains("No failures recorded"));
    }
}

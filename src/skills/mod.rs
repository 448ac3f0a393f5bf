//! Skill handler contract and registry.
//!
//! Skills are the only extension point of the pipeline: a closed,
//! declared registry maps skill ids to handler references, populated at
//! a single construction site. Unknown ids fail fast. Handler bodies
//! (actual email sending, publishing, accounting) live outside the core;
//! this module ships the contract plus two generic adapters: one that
//! routes through the MCP layer and one that produces a local draft
//! result used for content-only skills and as a test double.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::mcp::McpRouter;
use crate::planner;
use crate::store::Header;
use crate::types::{AgentPriority, TaskPriority};

// ── Contract ────────────────────────────────────────────────────

/// Normalized input handed to every skill handler.
#[derive(Debug, Clone)]
pub struct SkillInput {
    /// Task title.
    pub title: String,
    /// Task priority.
    pub priority: TaskPriority,
    /// Full markdown body.
    pub body: String,
    /// Parsed header fields.
    pub header: Header,
    /// Path of the task file (for idempotence keys; handlers must not
    /// rewrite it; writes into the task file are append-only and go
    /// through the manager).
    pub path: PathBuf,
}

/// Handler result. `success` decides the task's terminal status;
/// `output` and `deliverables` are appended to the task file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillOutcome {
    /// Whether the skill completed its work.
    pub success: bool,
    /// Free-form result text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Deliverables produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SkillOutcome {
    /// Lenient decode from a JSON value (resilience safe defaults and
    /// MCP responses both satisfy the `{success, error?}` shape).
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
            success: value.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
            output: None,
            deliverables: Vec::new(),
            error: Some("unrecognized handler response".to_owned()),
        })
    }

    /// Encode for transport through the resilience wrapper.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"success": false}))
    }
}

/// A named capability. Handlers must be idempotent with respect to
/// repeated calls for the same task identity.
#[async_trait]
pub trait SkillHandler: Send + Sync {
    /// Execute the skill for one task.
    async fn execute(&self, input: &SkillInput) -> SkillOutcome;
}

/// Registry entry for one skill.
#[derive(Clone)]
pub struct SkillEntry {
    /// Skill identifier (the `skill` header value).
    pub skill_id: String,
    /// Whether dispatch must pass the approval gate first.
    pub requires_approval: bool,
    /// Priority class used for retry budgets and monitoring.
    pub priority: AgentPriority,
    /// Handler reference.
    pub handler: Arc<dyn SkillHandler>,
}

impl std::fmt::Debug for SkillEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillEntry")
            .field("skill_id", &self.skill_id)
            .field("requires_approval", &self.requires_approval)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Closed skill registry, populated once at startup.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    entries: HashMap<String, SkillEntry>,
}

impl SkillRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill. Later registrations replace earlier ones.
    pub fn register(&mut self, entry: SkillEntry) {
        info!(
            skill = %entry.skill_id,
            requires_approval = entry.requires_approval,
            "skill registered"
        );
        self.entries.insert(entry.skill_id.clone(), entry);
    }

    /// Look up a skill.
    pub fn get(&self, skill_id: &str) -> Option<&SkillEntry> {
        self.entries.get(skill_id)
    }

    /// True if the skill exists.
    pub fn contains(&self, skill_id: &str) -> bool {
        self.entries.contains_key(skill_id)
    }

    /// Sorted skill ids, for logs and error messages.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ── Adapters ────────────────────────────────────────────────────

/// Handler that forwards the task to an MCP service action and maps the
/// response onto the skill contract.
pub struct McpSkill {
    router: Arc<McpRouter>,
    service: String,
    action: String,
}

impl McpSkill {
    /// New adapter targeting `service/action`.
    pub fn new(router: Arc<McpRouter>, service: &str, action: &str) -> Self {
        Self {
            router,
            service: service.to_owned(),
            action: action.to_owned(),
        }
    }
}

#[async_trait]
impl SkillHandler for McpSkill {
    async fn execute(&self, input: &SkillInput) -> SkillOutcome {
        let correlation = input
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
        let payload = serde_json::json!({
            "title": input.title,
            "priority": input.priority.to_string(),
            "body": input.body,
        });
        match self
            .router
            .route(&self.service, &self.action, &payload, correlation.as_deref())
            .await
        {
            Ok(response) => {
                let success = response
                    .get("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let message = response
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned);
                let error = response
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned);
                SkillOutcome {
                    success,
                    output: message.or_else(|| Some(response.to_string())),
                    deliverables: planner::plan_deliverables(&input.body),
                    error,
                }
            }
            Err(e) => SkillOutcome {
                success: false,
                output: None,
                deliverables: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Handler for content-only skills: records what was produced without
/// touching any external system. Deterministic, append-only, and
/// idempotent by construction.
pub struct LocalSkill {
    label: String,
}

impl LocalSkill {
    /// New local handler labeled with the skill's work product.
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
        }
    }
}

#[async_trait]
impl SkillHandler for LocalSkill {
    async fn execute(&self, input: &SkillInput) -> SkillOutcome {
        let deliverables = planner::plan_deliverables(&input.body);
        SkillOutcome {
            success: true,
            output: Some(format!("{} completed for task: {}", self.label, input.title)),
            deliverables,
            error: None,
        }
    }
}

/// Build the default closed registry: the declared skill set with its
/// approval flags and priorities. MCP-backed skills share the router.
pub fn default_registry(router: Arc<McpRouter>) -> SkillRegistry {
    let mut registry = SkillRegistry::new();
    registry.register(SkillEntry {
        skill_id: "email".to_owned(),
        requires_approval: true,
        priority: AgentPriority::High,
        handler: Arc::new(McpSkill::new(Arc::clone(&router), "email", "send")),
    });
    registry.register(SkillEntry {
        skill_id: "linkedin_marketing".to_owned(),
        requires_approval: true,
        priority: AgentPriority::Normal,
        handler: Arc::new(McpSkill::new(
            Arc::clone(&router),
            "linkedin",
            "generate-and-publish",
        )),
    });
    registry.register(SkillEntry {
        skill_id: "coding".to_owned(),
        requires_approval: false,
        priority: AgentPriority::Normal,
        handler: Arc::new(LocalSkill::new("Implementation")),
    });
    registry.register(SkillEntry {
        skill_id: "research".to_owned(),
        requires_approval: false,
        priority: AgentPriority::Normal,
        handler: Arc::new(LocalSkill::new("Research")),
    });
    registry.register(SkillEntry {
        skill_id: "documentation".to_owned(),
        requires_approval: false,
        priority: AgentPriority::Normal,
        handler: Arc::new(LocalSkill::new("Documentation")),
    });
    registry.register(SkillEntry {
        skill_id: "planner".to_owned(),
        requires_approval: false,
        priority: AgentPriority::Normal,
        handler: Arc::new(LocalSkill::new("Planning")),
    });
    registry.register(SkillEntry {
        skill_id: "approval".to_owned(),
        requires_approval: false,
        priority: AgentPriority::Normal,
        handler: Arc::new(LocalSkill::new("Approval review")),
    });
    registry.register(SkillEntry {
        skill_id: "task_processor".to_owned(),
        requires_approval: false,
        priority: AgentPriority::Normal,
        handler: Arc::new(LocalSkill::new("Task processing")),
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStream;

    fn input() -> SkillInput {
        SkillInput {
            title: "Write summary".to_owned(),
            priority: TaskPriority::Standard,
            body: "Summarize the findings.\n".to_owned(),
            header: Header::new(),
            path: PathBuf::from("write_summary.md"),
        }
    }

    #[test]
    fn test_registry_closed_set() {
        let router = Arc::new(McpRouter::new(AuditStream::disconnected()));
        let registry = default_registry(router);
        assert!(registry.contains("email"));
        assert!(registry.contains("task_processor"));
        assert!(!registry.contains("teleportation"));
        assert_eq!(registry.ids().len(), 8);
    }

    #[test]
    fn test_approval_flags() {
        let router = Arc::new(McpRouter::new(AuditStream::disconnected()));
        let registry = default_registry(router);
        assert!(registry.get("email").expect("email").requires_approval);
        assert!(
            registry
                .get("linkedin_marketing")
                .expect("linkedin")
                .requires_approval
        );
        assert!(!registry.get("research").expect("research").requires_approval);
    }

    #[tokio::test]
    async fn test_local_skill_succeeds() {
        let skill = LocalSkill::new("Research");
        let outcome = skill.execute(&input()).await;
        assert!(outcome.success);
        assert!(outcome.output.expect("output").contains("Write summary"));
    }

    #[test]
    fn test_outcome_value_roundtrip() {
        let outcome = SkillOutcome {
            success: true,
            output: Some("done".to_owned()),
            deliverables: vec!["Report".to_owned()],
            error: None,
        };
        let back = SkillOutcome::from_value(&outcome.to_value());
        assert!(back.success);
        assert_eq!(back.output.as_deref(), Some("done"));
        assert_eq!(back.deliverables, vec!["Report".to_owned()]);
    }

    #[test]
    fn test_outcome_from_safe_default() {
        // Resilience safe default shape decodes without error.
        let value = serde_json::json!({"success": false, "queued": true});
        let outcome = SkillOutcome::from_value(&value);
        assert!(!outcome.success);
    }
}

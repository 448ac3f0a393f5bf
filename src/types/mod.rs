// Closed core vocabularies shared across the pipeline. Code outside this
// crate must not add variants: the lifecycle, failure, and health sets are
// part of the on-disk contract.

use serde::{Deserialize, Serialize};

/// Task lifecycle status carried in the `status` header field.
///
/// The containing stage directory and this field jointly encode state.
/// Transitions are monotonic except the approval divert/return round-trip
/// and an explicit retry re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Freshly observed in the inbox; no domain header yet.
    Received,
    /// Routed into a domain/category directory.
    Classified,
    /// Body contains an execution plan.
    Planned,
    /// Diverted to the approval directory; companion artifact exists.
    PendingApproval,
    /// Human approval recorded; ready for dispatch.
    Approved,
    /// A skill handler or the autonomy loop is working on it.
    InProgress,
    /// Terminal success; `completed` timestamp present.
    Done,
    /// Terminal failure; body contains an error section.
    Failed,
    /// Explicit re-entry after a failure; picked up again by dispatch.
    Retry,
}

impl TaskStatus {
    /// Canonical lowercase form written to task headers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classified => "classified",
            Self::Planned => "planned",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Retry => "retry",
        }
    }

    /// True for states the pipeline will never move again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    /// Parse a status value. `needs_action` is accepted as a legacy alias
    /// for [`TaskStatus::Received`]: external producers write it and the
    /// pipeline rewrites to canonical states as files advance.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "received" | "needs_action" => Ok(Self::Received),
            "classified" => Ok(Self::Classified),
            "planned" => Ok(Self::Planned),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "retry" => Ok(Self::Retry),
            other => Err(anyhow::anyhow!("unknown task status: {other}")),
        }
    }
}

/// Task priority from the `priority` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Standard,
    Urgent,
    Critical,
}

impl TaskPriority {
    /// Urgent and critical tasks always require human approval.
    pub fn forces_approval(self) -> bool {
        matches!(self, Self::Urgent | Self::Critical)
    }

    /// Parse leniently: anything unrecognized is treated as standard,
    /// matching how the header field has always been consumed.
    pub fn parse_or_standard(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" => Self::Low,
            "urgent" => Self::Urgent,
            "critical" => Self::Critical,
            _ => Self::Standard,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Standard => "standard",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Priority class of a monitored agent, governing retry budgets and
/// heartbeat thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl AgentPriority {
    /// Seconds of heartbeat silence tolerated before a miss is recorded.
    pub fn heartbeat_threshold_secs(self) -> u64 {
        match self {
            Self::Critical => 30,
            Self::High => 60,
            Self::Normal => 120,
            Self::Low => 300,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for AgentPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness status of a monitored agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Running,
    Stopped,
    Failed,
    Unknown,
}

/// Task domain. Classification always lands on one of the two concrete
/// domains; cross-domain tasks record the runner-up separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    Personal,
    Business,
}

impl Domain {
    /// Directory name under `Domains/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Personal => "Personal",
            Self::Business => "Business",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Personal => Self::Business,
            Self::Business => Self::Personal,
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl std::str::FromStr for Domain {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        if lower.contains("personal") {
            Ok(Self::Personal)
        } else if lower.contains("business") {
            Ok(Self::Business)
        } else {
            Err(anyhow::anyhow!("unknown domain: {s}"))
        }
    }
}

/// Kinds of failure the runtime records. The set is closed; every failure
/// event names exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Header unparseable or a required field missing.
    MalformedTask,
    /// Requested skill not in the registry.
    UnknownSkill,
    /// No approval decision before the artifact deadline.
    ApprovalExpired,
    /// Executor succeeded but the validation clause rejected the output.
    StepValidationFailed,
    /// A single attempt exceeded its bound.
    Timeout,
    /// External call returned an error or was unreachable.
    Upstream,
    /// Expected liveness signal absent.
    HeartbeatMiss,
    /// Failure-queue retries exhausted; item dead-lettered.
    QueueExhaustion,
    /// Checkpoint references objects that no longer exist.
    StateStale,
    /// An operation raised an error that fits no narrower kind.
    Exception,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedTask => "malformed_task",
            Self::UnknownSkill => "unknown_skill",
            Self::ApprovalExpired => "approval_expired",
            Self::StepValidationFailed => "step_validation_failed",
            Self::Timeout => "timeout",
            Self::Upstream => "upstream",
            Self::HeartbeatMiss => "heartbeat_miss",
            Self::QueueExhaustion => "queue_exhaustion",
            Self::StateStale => "state_stale",
            Self::Exception => "exception",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System health grade derived from the set of active failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Healthy,
    /// One low-impact failure.
    Degraded1,
    /// Multiple failures, or a high-priority agent failing.
    Degraded2,
    /// A critical-priority agent is failing.
    Degraded3,
    /// Transitioning back to healthy.
    Recovery,
}

impl HealthGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded1 => "degraded_1",
            Self::Degraded2 => "degraded_2",
            Self::Degraded3 => "degraded_3",
            Self::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of a registered MCP backend service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Online,
    Offline,
    Degraded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Received,
            TaskStatus::Classified,
            TaskStatus::Planned,
            TaskStatus::PendingApproval,
            TaskStatus::Approved,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Retry,
        ] {
            let parsed = TaskStatus::from_str(status.as_str()).expect("roundtrip");
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_status_needs_action_alias() {
        assert_eq!(
            TaskStatus::from_str("needs_action").expect("alias"),
            TaskStatus::Received
        );
    }

    #[test]
    fn test_status_unknown_rejected() {
        assert!(TaskStatus::from_str("bogus").is_err());
        assert!(TaskStatus::from_str("").is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
    }

    #[test]
    fn test_priority_forces_approval() {
        assert!(TaskPriority::Urgent.forces_approval());
        assert!(TaskPriority::Critical.forces_approval());
        assert!(!TaskPriority::Standard.forces_approval());
        assert!(!TaskPriority::Low.forces_approval());
    }

    #[test]
    fn test_priority_lenient_parse() {
        assert_eq!(TaskPriority::parse_or_standard("URGENT"), TaskPriority::Urgent);
        assert_eq!(TaskPriority::parse_or_standard("whatever"), TaskPriority::Standard);
        assert_eq!(TaskPriority::parse_or_standard(""), TaskPriority::Standard);
    }

    #[test]
    fn test_heartbeat_thresholds() {
        assert_eq!(AgentPriority::Critical.heartbeat_threshold_secs(), 30);
        assert_eq!(AgentPriority::High.heartbeat_threshold_secs(), 60);
        assert_eq!(AgentPriority::Normal.heartbeat_threshold_secs(), 120);
        assert_eq!(AgentPriority::Low.heartbeat_threshold_secs(), 300);
    }

    #[test]
    fn test_domain_parse() {
        assert_eq!(Domain::from_str("Personal").expect("ok"), Domain::Personal);
        assert_eq!(Domain::from_str("business").expect("ok"), Domain::Business);
        assert!(Domain::from_str("shared").is_err());
    }

    #[test]
    fn test_failure_kind_serde_names() {
        let json = serde_json::to_string(&FailureKind::HeartbeatMiss).expect("serialize");
        assert_eq!(json, "\"heartbeat_miss\"");
        let back: FailureKind = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, FailureKind::HeartbeatMiss);
    }

    #[test]
    fn test_health_grade_names() {
        assert_eq!(HealthGrade::Degraded2.as_str(), "degraded_2");
        assert_eq!(HealthGrade::Recovery.as_str(), "recovery");
    }
}

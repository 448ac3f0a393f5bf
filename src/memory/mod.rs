//! Memory: persistent execution history, activity log, and dashboard.
//!
//! Every verified execution is appended to
//! `Logs/execution_history.json`, mirrored as a line in
//! `Logs/activity_log.md`, and aggregated into `Dashboard.md`.

use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::RuntimePaths;
use crate::fsutil;
use crate::store::format_timestamp;

/// One recorded task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Task title.
    pub task_name: String,
    /// Skill that handled it.
    pub skill_used: String,
    /// When work started (routed timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// When it completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// `success`, `partial`, or `failed`.
    pub status: String,
    /// Deliverables verified.
    #[serde(default)]
    pub deliverables: Vec<String>,
    /// Dispatch retries consumed.
    #[serde(default)]
    pub retries: u32,
}

/// Aggregated execution history with dashboard rendering.
pub struct MemoryLog {
    paths: RuntimePaths,
    history: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryLog {
    /// Open the log, loading any existing history file.
    pub async fn open(paths: &RuntimePaths) -> Self {
        let history_path = paths.logs.join("execution_history.json");
        let history = match tokio::fs::read_to_string(&history_path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        info!(records = history.len(), "execution history loaded");
        Self {
            paths: paths.clone(),
            history: Mutex::new(history),
        }
    }

    /// Record one execution: history file, activity log, dashboard.
    pub async fn record_execution(&self, record: ExecutionRecord) {
        {
            let mut history = self.history.lock().await;
            history.push(record.clone());
            let json = serde_json::to_string_pretty(&*history)
                .unwrap_or_else(|_| "[]".to_owned());
            if let Err(e) = fsutil::replace_file(
                &self.paths.logs.join("execution_history.json"),
                &json,
            )
            .await
            {
                warn!(error = %e, "failed to persist execution history");
            }
        }
        self.append_activity(&record).await;
        self.render_dashboard().await;
    }

    async fn append_activity(&self, record: &ExecutionRecord) {
        let log_path = self.paths.logs.join("activity_log.md");
        let stamp = format_timestamp(Local::now());
        let mut entry = String::new();
        if !log_path.exists() {
            entry.push_str("# Activity Log\n\n");
        }
        entry.push_str(&format!(
            "- [{stamp}] {} ({}) - {}\n",
            record.task_name, record.skill_used, record.status
        ));
        if let Err(e) = fsutil::append_to_file(&log_path, &entry).await {
            warn!(error = %e, "failed to append activity log");
        }
    }

    /// Render `Dashboard.md` from the current history.
    pub async fn render_dashboard(&self) {
        let history = self.history.lock().await;
        let total = history.len();
        let succeeded = history.iter().filter(|r| r.status == "success").count();
        let partial = history.iter().filter(|r| r.status == "partial").count();
        let failed = history.iter().filter(|r| r.status == "failed").count();
        let retries: u32 = history.iter().map(|r| r.retries).sum();

        let mut out = format!(
            "# Dashboard\n\n**Updated:** {}\n\n## Totals\n\n| Metric | Count |\n|--------|-------|\n| Executions | {total} |\n| Succeeded | {succeeded} |\n| Partial | {partial} |\n| Failed | {failed} |\n| Retries | {retries} |\n\n## Recent Executions\n\n",
            format_timestamp(Local::now()),
        );
        if history.is_empty() {
            out.push_str("Nothing recorded yet.\n");
        } else {
            out.push_str("| Task | Skill | Status | Completed |\n|------|-------|--------|-----------|\n");
            for record in history.iter().rev().take(10) {
                out.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    record.task_name,
                    record.skill_used,
                    record.status,
                    record.completed_at.as_deref().unwrap_or("-"),
                ));
            }
        }
        if let Err(e) = fsutil::replace_file(&self.paths.dashboard, &out).await {
            warn!(error = %e, "failed to render dashboard");
        }
    }

    /// Number of records held.
    pub async fn len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// True when no executions have been recorded.
    pub async fn is_empty(&self) -> bool {
        self.history.lock().await.is_empty()
    }
}

/// Shared handle type used by the validator.
pub type SharedMemory = Arc<MemoryLog>;

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, status: &str) -> ExecutionRecord {
        ExecutionRecord {
            task_name: name.to_owned(),
            skill_used: "research".to_owned(),
            started_at: None,
            completed_at: Some("2026-08-01 10:00:00".to_owned()),
            status: status.to_owned(),
            deliverables: vec!["Report".to_owned()],
            retries: 1,
        }
    }

    #[tokio::test]
    async fn test_record_persists_and_renders() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let paths = RuntimePaths::resolve(tmp.path());
        paths.ensure().await.expect("dirs");
        let memory = MemoryLog::open(&paths).await;
        memory.record_execution(record("Quarterly report", "success")).await;
        memory.record_execution(record("Broken thing", "failed")).await;

        assert_eq!(memory.len().await, 2);

        let dashboard = tokio::fs::read_to_string(&paths.dashboard)
            .await
            .expect("dashboard");
        assert!(dashboard.contains("| Executions | 2 |"));
        assert!(dashboard.contains("| Succeeded | 1 |"));
        assert!(dashboard.contains("Quarterly report"));

        let activity = tokio::fs::read_to_string(paths.logs.join("activity_log.md"))
            .await
            .expect("activity");
        assert_eq!(activity.matches("- [").count(), 2);
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let paths = RuntimePaths::resolve(tmp.path());
        paths.ensure().await.expect("dirs");
        {
            let memory = MemoryLog::open(&paths).await;
            memory.record_execution(record("First", "success")).await;
        }
        let memory = MemoryLog::open(&paths).await;
        assert_eq!(memory.len().await, 1);
        assert!(!memory.is_empty().await);
    }
}

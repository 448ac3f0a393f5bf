//! Append-only audit stream.
//!
//! Every lifecycle transition, agent decision, MCP call, failure, and
//! retry is recorded as one JSON object per line under
//! `Audit/<category>/<YYYY-MM>/<category>.log`. Events are queued on an
//! in-memory channel and flushed in batches by a dedicated writer worker;
//! once written, a record is never modified. The stream handle is an
//! explicit dependency passed to each component, constructed once in
//! `main`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::fsutil;
use crate::types::FailureKind;

/// Maximum events written per flush batch.
const BATCH_SIZE: usize = 100;

/// Counter snapshot cadence, in written events.
const SNAPSHOT_EVERY: u64 = 100;

// ── Categories ──────────────────────────────────────────────────

/// Audit log category; doubles as the directory and file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    TaskLifecycle,
    AgentDecision,
    McpCall,
    Failure,
    Retry,
    System,
}

impl AuditCategory {
    /// All categories, for iteration.
    pub const ALL: [AuditCategory; 6] = [
        Self::TaskLifecycle,
        Self::AgentDecision,
        Self::McpCall,
        Self::Failure,
        Self::Retry,
        Self::System,
    ];

    /// Directory/file name under the audit root.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskLifecycle => "task_lifecycle",
            Self::AgentDecision => "agent_decision",
            Self::McpCall => "mcp_call",
            Self::Failure => "failure",
            Self::Retry => "retry",
            Self::System => "system",
        }
    }

    /// Retention period in days, enforced by month-directory pruning.
    pub fn retention_days(self) -> i64 {
        match self {
            Self::McpCall => 30,
            Self::TaskLifecycle | Self::AgentDecision | Self::Retry => 90,
            Self::Failure => 180,
            Self::System => 365,
        }
    }
}

impl std::fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Events ──────────────────────────────────────────────────────

/// A single immutable audit record. Serialized as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Category, selecting the log partition.
    pub category: AuditCategory,
    /// Event name (e.g. `task_completed`, `mcp_call`, `retry`).
    pub event: String,
    /// Component that produced the event.
    pub agent_id: String,
    /// Correlates all events of one task (usually the file stem).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Process session identifier.
    pub session_id: String,
    /// Category-specific payload.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEvent {
    /// Serialize to a JSON line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a JSON line back into an event.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Session identifier for this process start.
pub fn new_session_id(now: DateTime<Utc>) -> String {
    format!("session_{}", now.format("%Y%m%d_%H%M%S"))
}

// ── Stream handle ───────────────────────────────────────────────

/// Cloneable producer handle. Emission never blocks and never fails the
/// caller: if the writer is gone, the event is dropped with a warning.
#[derive(Debug, Clone)]
pub struct AuditStream {
    tx: mpsc::UnboundedSender<AuditEvent>,
    session_id: Arc<str>,
}

impl AuditStream {
    /// Create the stream and its consumer end.
    pub fn channel(session_id: &str) -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                session_id: Arc::from(session_id),
            },
            rx,
        )
    }

    /// Stream whose events go nowhere. For tests and tools that do not
    /// run the writer.
    pub fn disconnected() -> Self {
        let (stream, _rx) = Self::channel("session_test");
        stream
    }

    /// Session id carried on every event.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue a fully built event.
    pub fn emit(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            warn!("audit writer gone; event dropped");
        }
    }

    fn emit_parts(
        &self,
        category: AuditCategory,
        event: &str,
        agent_id: &str,
        correlation_id: Option<&str>,
        details: serde_json::Value,
    ) {
        self.emit(AuditEvent {
            timestamp: Utc::now(),
            category,
            event: event.to_owned(),
            agent_id: agent_id.to_owned(),
            correlation_id: correlation_id.map(str::to_owned),
            session_id: self.session_id.to_string(),
            details,
        });
    }

    /// Record a task lifecycle transition.
    pub fn task_lifecycle(
        &self,
        event: &str,
        agent_id: &str,
        correlation_id: &str,
        details: serde_json::Value,
    ) {
        self.emit_parts(
            AuditCategory::TaskLifecycle,
            event,
            agent_id,
            Some(correlation_id),
            details,
        );
    }

    /// Record an agent decision (skill selection, routing, approval
    /// requirement, fallback, recovery).
    pub fn agent_decision(
        &self,
        decision_type: &str,
        agent_id: &str,
        correlation_id: Option<&str>,
        selected: &str,
        rationale: &str,
        confidence: f64,
        mut details: serde_json::Value,
    ) {
        if let Some(map) = details.as_object_mut() {
            map.insert("selected".to_owned(), serde_json::json!(selected));
            map.insert("rationale".to_owned(), serde_json::json!(rationale));
            map.insert("confidence".to_owned(), serde_json::json!(confidence));
        }
        self.emit_parts(
            AuditCategory::AgentDecision,
            decision_type,
            agent_id,
            correlation_id,
            details,
        );
    }

    /// Record an MCP call with latency and success flag.
    pub fn mcp_call(
        &self,
        service: &str,
        action: &str,
        success: bool,
        latency_ms: f64,
        error: Option<&str>,
        correlation_id: Option<&str>,
    ) {
        let event = if success { "mcp_call" } else { "mcp_error" };
        self.emit_parts(
            AuditCategory::McpCall,
            event,
            "mcp_router",
            correlation_id,
            serde_json::json!({
                "mcp_name": service,
                "action": action,
                "success": success,
                "latency_ms": latency_ms,
                "error": error,
            }),
        );
    }

    /// Record a failure with its kind and context.
    pub fn failure(
        &self,
        agent_id: &str,
        kind: FailureKind,
        message: &str,
        correlation_id: Option<&str>,
        context: serde_json::Value,
    ) {
        // Long messages are truncated; the full text lives in the task
        // file or the component log.
        let message: String = message.chars().take(500).collect();
        self.emit_parts(
            AuditCategory::Failure,
            "failure",
            agent_id,
            correlation_id,
            serde_json::json!({
                "error_type": kind.as_str(),
                "error_message": message,
                "context": context,
            }),
        );
    }

    /// Record a retry attempt and its outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn retry(
        &self,
        agent_id: &str,
        operation: &str,
        attempt: u32,
        max_attempts: u32,
        backoff_seconds: f64,
        reason: &str,
        outcome: &str,
        correlation_id: Option<&str>,
    ) {
        self.emit_parts(
            AuditCategory::Retry,
            "retry",
            agent_id,
            correlation_id,
            serde_json::json!({
                "operation": operation,
                "attempt": attempt,
                "max_attempts": max_attempts,
                "backoff_seconds": backoff_seconds,
                "reason": reason,
                "outcome": outcome,
            }),
        );
    }

    /// Record a system-level event (startup, shutdown, degradation).
    pub fn system(&self, event: &str, agent_id: &str, details: serde_json::Value) {
        self.emit_parts(AuditCategory::System, event, agent_id, None, details);
    }
}

// ── Paths ───────────────────────────────────────────────────────

fn month_key(ts: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

/// Log file for a category and `YYYY-MM` month key.
pub fn log_path(root: &Path, category: AuditCategory, month: &str) -> PathBuf {
    root.join(category.as_str())
        .join(month)
        .join(format!("{}.log", category.as_str()))
}

// ── Writer worker ───────────────────────────────────────────────

/// Persistent writer counters, snapshotted to `audit_state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditState {
    /// Total events written across sessions.
    pub events_written: u64,
    /// Per-category written counts.
    #[serde(default)]
    pub by_category: BTreeMap<String, u64>,
    /// Session that last wrote the snapshot.
    #[serde(default)]
    pub session_id: String,
    /// Snapshot time.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl AuditState {
    /// Load a previous snapshot, defaulting when absent or unreadable.
    pub async fn load(root: &Path) -> Self {
        let path = root.join("audit_state.json");
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    async fn save(&self, root: &Path) {
        let path = root.join("audit_state.json");
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fsutil::replace_file(&path, &json).await {
                    warn!(error = %e, "failed to snapshot audit state");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize audit state"),
        }
    }
}

/// Run the audit writer until every producer handle is gone. Shutdown
/// is therefore orderly by construction: workers finish their unit of
/// work, drop their stream handles, and the writer drains whatever they
/// queued before exiting.
pub async fn run_writer(
    root: PathBuf,
    mut rx: mpsc::UnboundedReceiver<AuditEvent>,
    session_id: String,
) {
    let mut state = AuditState::load(&root).await;
    state.session_id = session_id;
    let mut last_snapshot = state.events_written;
    info!(events_written = state.events_written, "audit writer started");

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        // Opportunistically drain up to the batch cap.
        while batch.len() < BATCH_SIZE {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        flush_batch(&root, &batch, &mut state).await;
        if state.events_written.saturating_sub(last_snapshot) >= SNAPSHOT_EVERY {
            state.last_updated = Some(Utc::now());
            state.save(&root).await;
            last_snapshot = state.events_written;
        }
    }

    state.last_updated = Some(Utc::now());
    state.save(&root).await;
    info!(events_written = state.events_written, "audit writer stopped");
}

/// Group a batch by (category, month) and append each group's lines.
async fn flush_batch(root: &Path, batch: &[AuditEvent], state: &mut AuditState) {
    if batch.is_empty() {
        return;
    }
    let mut grouped: BTreeMap<(AuditCategory, String), String> = BTreeMap::new();
    for event in batch {
        let line = match event.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "unserializable audit event dropped");
                continue;
            }
        };
        let key = (event.category, month_key(event.timestamp));
        let buf = grouped.entry(key).or_default();
        buf.push_str(&line);
        buf.push('\n');
        state.events_written = state.events_written.saturating_add(1);
        *state
            .by_category
            .entry(event.category.as_str().to_owned())
            .or_insert(0) += 1;
    }
    for ((category, month), chunk) in grouped {
        let path = log_path(root, category, &month);
        if let Err(e) = fsutil::append_to_file(&path, &chunk).await {
            warn!(category = %category, error = %e, "audit append failed");
        }
    }
    debug!(count = batch.len(), "audit batch flushed");
}

// ── Reading, summaries, retention ───────────────────────────────

/// Read all events for a category and month, skipping corrupt lines so
/// one bad record never hides the rest.
pub async fn read_events(
    root: &Path,
    category: AuditCategory,
    month: &str,
) -> Vec<AuditEvent> {
    let path = log_path(root, category, month);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| AuditEvent::from_line(l).ok())
        .collect()
}

/// Count `error_type` frequencies across the last month of failures
/// (current plus previous month partitions), most frequent first.
pub async fn mine_failure_patterns(
    root: &Path,
    now: DateTime<Utc>,
    top_n: usize,
) -> Vec<(String, usize)> {
    let cutoff = now - chrono::Duration::days(30);
    let mut months = vec![month_key(cutoff), month_key(now)];
    months.dedup();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for month in &months {
        for event in read_events(root, AuditCategory::Failure, month).await {
            if event.timestamp < cutoff {
                continue;
            }
            let kind = event
                .details
                .get("error_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_owned();
            *counts.entry(kind).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(top_n);
    ranked
}

/// Write the human-readable daily summary for `date`: per-category event
/// counts plus the top failure kinds. Returns the summary path.
pub async fn write_daily_summary(
    root: &Path,
    date: NaiveDate,
) -> std::io::Result<PathBuf> {
    let month = format!("{:04}-{:02}", date.year(), date.month());
    let mut out = format!("# Daily Audit Summary: {date}\n\n## Event Counts\n\n");
    out.push_str("| Category | Events |\n|----------|--------|\n");
    let mut failure_kinds: BTreeMap<String, usize> = BTreeMap::new();
    for category in AuditCategory::ALL {
        let events = read_events(root, category, &month).await;
        let todays: Vec<&AuditEvent> = events
            .iter()
            .filter(|e| e.timestamp.date_naive() == date)
            .collect();
        out.push_str(&format!("| {} | {} |\n", category, todays.len()));
        if category == AuditCategory::Failure {
            for event in &todays {
                let kind = event
                    .details
                    .get("error_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_owned();
                *failure_kinds.entry(kind).or_insert(0) += 1;
            }
        }
    }
    out.push_str("\n## Top Error Kinds\n\n");
    if failure_kinds.is_empty() {
        out.push_str("No failures recorded.\n");
    } else {
        let mut ranked: Vec<(String, usize)> = failure_kinds.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (kind, count) in ranked.iter().take(10) {
            out.push_str(&format!("- **{kind}**: {count}\n"));
        }
    }
    let path = root
        .join("summary")
        .join(format!("daily_audit_summary_{date}.md"));
    fsutil::replace_file(&path, &out).await?;
    Ok(path)
}

/// Remove month partitions older than each category's retention period.
pub async fn enforce_retention(root: &Path, now: DateTime<Utc>) -> usize {
    let mut removed = 0usize;
    for category in AuditCategory::ALL {
        let dir = root.join(category.as_str());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(month_start) = parse_month(&name) else {
                continue;
            };
            // A partition expires once every record in it is past
            // retention, i.e. measured from the end of that month.
            let month_end = next_month(month_start);
            let age_days = (now.date_naive() - month_end).num_days();
            if age_days > category.retention_days() {
                if tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
                    info!(category = %category, month = %name, "pruned expired audit partition");
                    removed += 1;
                }
            }
        }
    }
    removed
}

fn parse_month(name: &str) -> Option<NaiveDate> {
    let (y, m) = name.split_once('-')?;
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, 1)
}

fn next_month(first_day: NaiveDate) -> NaiveDate {
    let (y, m) = (first_day.year(), first_day.month());
    if m == 12 {
        NaiveDate::from_ymd_opt(y + 1, 1, 1).unwrap_or(first_day)
    } else {
        NaiveDate::from_ymd_opt(y, m + 1, 1).unwrap_or(first_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_event(category: AuditCategory, event: &str) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            category,
            event: event.to_owned(),
            agent_id: "tester".to_owned(),
            correlation_id: Some("task_announce".to_owned()),
            session_id: "session_test".to_owned(),
            details: serde_json::json!({"k": "v"}),
        }
    }

    // ── Round trip ──

    #[test]
    fn test_event_line_roundtrip() {
        let event = test_event(AuditCategory::TaskLifecycle, "task_completed");
        let line = event.to_line().expect("serialize");
        let back = AuditEvent::from_line(&line).expect("parse");
        assert_eq!(event, back);
    }

    #[test]
    fn test_category_names() {
        assert_eq!(AuditCategory::TaskLifecycle.as_str(), "task_lifecycle");
        assert_eq!(AuditCategory::McpCall.retention_days(), 30);
        assert_eq!(AuditCategory::System.retention_days(), 365);
    }

    #[test]
    fn test_session_id_format() {
        let ts = DateTime::parse_from_rfc3339("2026-08-01T12:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(new_session_id(ts), "session_20260801_123000");
    }

    // ── Writer ──

    async fn run_writer_for(root: &Path, events: Vec<AuditEvent>) {
        let (stream, rx) = AuditStream::channel("session_test");
        for event in events {
            stream.emit(event);
        }
        drop(stream);
        run_writer(root.to_path_buf(), rx, "session_test".into()).await;
    }

    #[tokio::test]
    async fn test_writer_appends_by_category() {
        let tmp = TempDir::new().expect("tmpdir");
        let events = vec![
            test_event(AuditCategory::TaskLifecycle, "task_created"),
            test_event(AuditCategory::TaskLifecycle, "task_completed"),
            test_event(AuditCategory::Failure, "failure"),
        ];
        run_writer_for(tmp.path(), events).await;

        let month = month_key(Utc::now());
        let lifecycle = read_events(tmp.path(), AuditCategory::TaskLifecycle, &month).await;
        assert_eq!(lifecycle.len(), 2);
        let failures = read_events(tmp.path(), AuditCategory::Failure, &month).await;
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn test_writer_append_only() {
        let tmp = TempDir::new().expect("tmpdir");
        run_writer_for(
            tmp.path(),
            vec![test_event(AuditCategory::System, "startup")],
        )
        .await;
        let month = month_key(Utc::now());
        let path = log_path(tmp.path(), AuditCategory::System, &month);
        let first = tokio::fs::read_to_string(&path).await.expect("read");

        run_writer_for(
            tmp.path(),
            vec![test_event(AuditCategory::System, "shutdown")],
        )
        .await;
        let second = tokio::fs::read_to_string(&path).await.expect("read");
        // Prior bytes are untouched; new content is strictly appended.
        assert!(second.starts_with(&first));
        assert_eq!(second.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_line_skipped() {
        let tmp = TempDir::new().expect("tmpdir");
        let month = month_key(Utc::now());
        let path = log_path(tmp.path(), AuditCategory::Retry, &month);
        let good = test_event(AuditCategory::Retry, "retry")
            .to_line()
            .expect("line");
        let content = format!("{good}\n{{\"broken\": \n{good}\n");
        fsutil::replace_file(&path, &content).await.expect("seed");
        let events = read_events(tmp.path(), AuditCategory::Retry, &month).await;
        assert_eq!(events.len(), 2);
    }

    // ── Summaries & mining ──

    #[tokio::test]
    async fn test_daily_summary_counts() {
        let tmp = TempDir::new().expect("tmpdir");
        let mut failure = test_event(AuditCategory::Failure, "failure");
        failure.details = serde_json::json!({"error_type": "timeout"});
        run_writer_for(
            tmp.path(),
            vec![
                test_event(AuditCategory::TaskLifecycle, "task_created"),
                failure.clone(),
                failure,
            ],
        )
        .await;

        let path = write_daily_summary(tmp.path(), Utc::now().date_naive())
            .await
            .expect("summary");
        let content = tokio::fs::read_to_string(&path).await.expect("read");
        assert!(content.contains("| task_lifecycle | 1 |"));
        assert!(content.contains("| failure | 2 |"));
        assert!(content.contains("**timeout**: 2"));
    }

    #[tokio::test]
    async fn test_mine_failure_patterns_ranks() {
        let tmp = TempDir::new().expect("tmpdir");
        let mut events = Vec::new();
        for kind in ["timeout", "timeout", "timeout", "upstream", "upstream", "exception"] {
            let mut event = test_event(AuditCategory::Failure, "failure");
            event.details = serde_json::json!({"error_type": kind});
            events.push(event);
        }
        run_writer_for(tmp.path(), events).await;

        let ranked = mine_failure_patterns(tmp.path(), Utc::now(), 2).await;
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0], ("timeout".to_owned(), 3));
        assert_eq!(ranked[1], ("upstream".to_owned(), 2));
    }

    // ── Retention ──

    #[tokio::test]
    async fn test_retention_prunes_old_months() {
        let tmp = TempDir::new().expect("tmpdir");
        // mcp_call retains 30 days; a partition from over a year ago must go.
        let old = log_path(tmp.path(), AuditCategory::McpCall, "2024-01");
        fsutil::append_to_file(&old, "{}\n").await.expect("seed");
        let fresh = log_path(tmp.path(), AuditCategory::McpCall, &month_key(Utc::now()));
        fsutil::append_to_file(&fresh, "{}\n").await.expect("seed");

        let removed = enforce_retention(tmp.path(), Utc::now()).await;
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }
}

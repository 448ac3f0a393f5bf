//! Scheduler: emits recurring tasks from the declarative `schedule.md`.
//!
//! The schedule file uses a strict grammar: top-level `name:` keys, each
//! followed by exactly-two-space-indented `key: value` properties
//! (`schedule`, `type`, `action`, `enabled`, `description`), plus an
//! `exceptions:` block listing `- date:` entries with `action` and
//! `reason`. Headings and `#` comments are ignored; tab indentation is
//! an error. A missing file gets the default schedule. Each tick runs
//! every enabled entry whose `next_run` has arrived, honoring exception
//! dates, then persists state to `Logs/scheduler_state.json`.

pub mod actions;
pub mod cron;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::audit::AuditStream;
use crate::config::RuntimePaths;
use crate::fsutil;
use crate::resilience::ResilienceController;
use crate::store::format_timestamp;
use cron::CronExpr;

// ── Schedule model ──────────────────────────────────────────────

/// How an entry's `schedule` string is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Five-field cron expression.
    Cron,
    /// Interval in seconds.
    Interval,
}

/// One declared scheduled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Entry name (top-level key).
    pub name: String,
    /// Cron expression or interval seconds.
    pub schedule: String,
    /// Interpretation of `schedule`.
    pub kind: ScheduleKind,
    /// Action handler name.
    pub action: String,
    /// Disabled entries never run.
    pub enabled: bool,
    /// Human-readable description.
    pub description: String,
}

/// What to do on an exception date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionAction {
    /// Suppress runs on this date.
    Skip,
    /// Force runs on this date.
    Run,
}

/// One exception date (holiday or override).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionDate {
    /// Affected calendar date.
    pub date: NaiveDate,
    /// Skip or run.
    pub action: ExceptionAction,
    /// Why.
    pub reason: String,
}

/// Parsed schedule file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleFile {
    /// Task entries in declaration order.
    pub entries: Vec<ScheduleEntry>,
    /// Exception dates.
    pub exceptions: Vec<ExceptionDate>,
}

/// Schedule file parse errors. The grammar is strict: anything the
/// parser does not recognize is reported with its line number.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Unparseable line.
    #[error("schedule line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },
    /// An entry is missing a required property.
    #[error("schedule entry '{entry}' missing required property '{property}'")]
    MissingProperty {
        /// Entry name.
        entry: String,
        /// Missing property.
        property: String,
    },
}

const ENTRY_PROPERTIES: &[&str] = &["schedule", "type", "action", "enabled", "description"];

/// Parse a schedule file under the strict grammar.
pub fn parse_schedule(content: &str) -> Result<ScheduleFile, ScheduleError> {
    let mut file = ScheduleFile::default();
    let mut current: Option<(String, BTreeMap<String, String>)> = None;
    let mut in_exceptions = false;
    let mut pending_exception: Option<(Option<NaiveDate>, Option<ExceptionAction>, String)> = None;

    let finish_entry = |current: &mut Option<(String, BTreeMap<String, String>)>,
                        file: &mut ScheduleFile|
     -> Result<(), ScheduleError> {
        if let Some((name, props)) = current.take() {
            file.entries.push(build_entry(&name, &props)?);
        }
        Ok(())
    };

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim_end();
        if line.is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        if line.starts_with('\t') {
            return Err(ScheduleError::Parse {
                line: line_no,
                reason: "tab indentation is not allowed".to_owned(),
            });
        }

        if !line.starts_with(' ') {
            // Top level: either a new entry or the exceptions block.
            finish_entry(&mut current, &mut file)?;
            if let Some((date, action, reason)) = pending_exception.take() {
                push_exception(&mut file, date, action, reason, line_no)?;
            }
            let Some(name) = line.strip_suffix(':') else {
                return Err(ScheduleError::Parse {
                    line: line_no,
                    reason: format!("expected 'name:' at top level, got '{line}'"),
                });
            };
            let name = name.trim();
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(ScheduleError::Parse {
                    line: line_no,
                    reason: format!("invalid entry name '{name}'"),
                });
            }
            if name == "exceptions" {
                in_exceptions = true;
            } else {
                in_exceptions = false;
                current = Some((name.to_owned(), BTreeMap::new()));
            }
            continue;
        }

        let trimmed = line.trim_start();
        if in_exceptions {
            if let Some(rest) = trimmed.strip_prefix("- ") {
                if let Some((date, action, reason)) = pending_exception.take() {
                    push_exception(&mut file, date, action, reason, line_no)?;
                }
                pending_exception = Some((None, None, String::new()));
                apply_exception_property(rest, &mut pending_exception, line_no)?;
            } else {
                apply_exception_property(trimmed, &mut pending_exception, line_no)?;
            }
            continue;
        }

        // Entry property: exactly two spaces of indentation.
        if !line.starts_with("  ") || line.starts_with("   ") {
            return Err(ScheduleError::Parse {
                line: line_no,
                reason: "entry properties must be indented with exactly two spaces".to_owned(),
            });
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            return Err(ScheduleError::Parse {
                line: line_no,
                reason: format!("expected 'key: value', got '{trimmed}'"),
            });
        };
        let key = key.trim();
        if !ENTRY_PROPERTIES.contains(&key) {
            return Err(ScheduleError::Parse {
                line: line_no,
                reason: format!("unknown property '{key}'"),
            });
        }
        let Some((_, props)) = current.as_mut() else {
            return Err(ScheduleError::Parse {
                line: line_no,
                reason: "property outside of an entry".to_owned(),
            });
        };
        props.insert(key.to_owned(), unquote(value));
    }

    finish_entry(&mut current, &mut file)?;
    if let Some((date, action, reason)) = pending_exception.take() {
        push_exception(&mut file, date, action, reason, content.lines().count())?;
    }
    Ok(file)
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_owned()
}

fn apply_exception_property(
    text: &str,
    pending: &mut Option<(Option<NaiveDate>, Option<ExceptionAction>, String)>,
    line_no: usize,
) -> Result<(), ScheduleError> {
    let Some((key, value)) = text.split_once(':') else {
        return Err(ScheduleError::Parse {
            line: line_no,
            reason: format!("expected 'key: value' in exception, got '{text}'"),
        });
    };
    let Some(slot) = pending.as_mut() else {
        return Err(ScheduleError::Parse {
            line: line_no,
            reason: "exception property outside of a '- date:' item".to_owned(),
        });
    };
    let value = unquote(value);
    match key.trim() {
        "date" => {
            let date =
                NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|_| ScheduleError::Parse {
                    line: line_no,
                    reason: format!("bad exception date '{value}'"),
                })?;
            slot.0 = Some(date);
        }
        "action" => {
            slot.1 = Some(match value.as_str() {
                "skip" => ExceptionAction::Skip,
                "run" => ExceptionAction::Run,
                other => {
                    return Err(ScheduleError::Parse {
                        line: line_no,
                        reason: format!("exception action must be skip or run, got '{other}'"),
                    })
                }
            });
        }
        "reason" => slot.2 = value,
        other => {
            return Err(ScheduleError::Parse {
                line: line_no,
                reason: format!("unknown exception property '{other}'"),
            })
        }
    }
    Ok(())
}

fn push_exception(
    file: &mut ScheduleFile,
    date: Option<NaiveDate>,
    action: Option<ExceptionAction>,
    reason: String,
    line_no: usize,
) -> Result<(), ScheduleError> {
    let date = date.ok_or(ScheduleError::Parse {
        line: line_no,
        reason: "exception without a date".to_owned(),
    })?;
    file.exceptions.push(ExceptionDate {
        date,
        action: action.unwrap_or(ExceptionAction::Skip),
        reason,
    });
    Ok(())
}

fn build_entry(
    name: &str,
    props: &BTreeMap<String, String>,
) -> Result<ScheduleEntry, ScheduleError> {
    let require = |property: &str| -> Result<String, ScheduleError> {
        props
            .get(property)
            .cloned()
            .ok_or_else(|| ScheduleError::MissingProperty {
                entry: name.to_owned(),
                property: property.to_owned(),
            })
    };
    let kind = match props.get("type").map(String::as_str) {
        None | Some("cron") => ScheduleKind::Cron,
        Some("interval") => ScheduleKind::Interval,
        Some(other) => {
            return Err(ScheduleError::MissingProperty {
                entry: name.to_owned(),
                property: format!("valid type (got '{other}')"),
            })
        }
    };
    Ok(ScheduleEntry {
        name: name.to_owned(),
        schedule: require("schedule")?,
        kind,
        action: require("action")?,
        enabled: props
            .get("enabled")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true),
        description: props.get("description").cloned().unwrap_or_default(),
    })
}

/// Default schedule written when the file is absent.
pub const DEFAULT_SCHEDULE: &str = r#"# Steward schedule configuration

## Daily tasks

daily_inbox_scan:
  schedule: "0 */2 * * *"
  type: "cron"
  action: "inbox_scan"
  enabled: true
  description: "Scan inbox for new files every 2 hours"

daily_digest:
  schedule: "0 17 * * *"
  type: "cron"
  action: "generate_digest"
  enabled: true
  description: "Generate daily activity digest at 5 PM"

## Weekly tasks

weekly_report:
  schedule: "0 9 * * 1"
  type: "cron"
  action: "weekly_report"
  enabled: true
  description: "Generate weekly report every Monday at 9 AM"

## Interval tasks

health_check:
  schedule: "300"
  type: "interval"
  action: "health_check"
  enabled: true
  description: "Check system health every 5 minutes"
"#;

// ── Actions ─────────────────────────────────────────────────────

/// Context handed to schedule action handlers.
pub struct SchedulerCtx {
    /// Runtime directory layout.
    pub paths: RuntimePaths,
    /// Audit stream.
    pub audit: AuditStream,
    /// Resilience controller, for health snapshots.
    pub resilience: Arc<ResilienceController>,
}

/// One schedule action handler.
#[async_trait]
pub trait ScheduleAction: Send + Sync {
    /// Run the action; the returned string is logged.
    async fn run(&self, ctx: &SchedulerCtx) -> anyhow::Result<String>;
}

// ── State ───────────────────────────────────────────────────────

/// Persisted per-entry run state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryState {
    /// Last execution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Local>>,
    /// Next due time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Local>>,
    /// Successful run count.
    #[serde(default)]
    pub run_count: u64,
    /// Failed run count.
    #[serde(default)]
    pub fail_count: u64,
}

/// Persisted scheduler state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Per-entry state keyed by entry name.
    #[serde(default)]
    pub tasks: BTreeMap<String, EntryState>,
    /// Last state write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Local>>,
}

// ── Scheduler ───────────────────────────────────────────────────

/// Tick-driven scheduler over the parsed schedule file.
pub struct Scheduler {
    ctx: SchedulerCtx,
    actions: HashMap<String, Arc<dyn ScheduleAction>>,
    schedule: Mutex<ScheduleFile>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    /// Open the scheduler: load (or create) the schedule file and any
    /// persisted state, and register the given action handlers.
    pub async fn open(
        ctx: SchedulerCtx,
        actions: HashMap<String, Arc<dyn ScheduleAction>>,
    ) -> Self {
        let schedule_path = ctx.paths.schedule_file.clone();
        let content = match tokio::fs::read_to_string(&schedule_path).await {
            Ok(content) => content,
            Err(_) => {
                info!(path = %schedule_path.display(), "creating default schedule");
                if let Err(e) = fsutil::replace_file(&schedule_path, DEFAULT_SCHEDULE).await {
                    error!(error = %e, "failed to write default schedule");
                }
                DEFAULT_SCHEDULE.to_owned()
            }
        };
        let schedule = match parse_schedule(&content) {
            Ok(schedule) => schedule,
            Err(e) => {
                error!(error = %e, "schedule file invalid, running empty schedule");
                ScheduleFile::default()
            }
        };
        info!(
            entries = schedule.entries.len(),
            exceptions = schedule.exceptions.len(),
            "schedule loaded"
        );

        let state_path = ctx.paths.logs.join("scheduler_state.json");
        let state = match tokio::fs::read_to_string(&state_path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => SchedulerState::default(),
        };

        Self {
            ctx,
            actions,
            schedule: Mutex::new(schedule),
            state: Mutex::new(state),
        }
    }

    /// Compute an entry's next run strictly after `now`.
    fn compute_next_run(
        entry: &ScheduleEntry,
        now: DateTime<Local>,
    ) -> Option<DateTime<Local>> {
        match entry.kind {
            ScheduleKind::Cron => CronExpr::parse(&entry.schedule)
                .ok()
                .and_then(|expr| expr.next_after(&now).ok()),
            ScheduleKind::Interval => {
                let seconds: i64 = entry.schedule.trim().parse().ok()?;
                Some(now + chrono::Duration::seconds(seconds.max(1)))
            }
        }
    }

    /// One scheduler tick at `now`: run every enabled entry that is
    /// due, honoring exception dates, then persist state.
    pub async fn tick(&self, now: DateTime<Local>) {
        let schedule = self.schedule.lock().await.clone();
        for entry in schedule.entries.iter().filter(|e| e.enabled) {
            let due = {
                let mut state = self.state.lock().await;
                let entry_state = state.tasks.entry(entry.name.clone()).or_default();
                if entry_state.next_run.is_none() {
                    entry_state.next_run = Self::compute_next_run(entry, now);
                }
                entry_state.next_run.map(|t| t <= now).unwrap_or(false)
            };
            if !due {
                continue;
            }

            let due_at = {
                let state = self.state.lock().await;
                state
                    .tasks
                    .get(&entry.name)
                    .and_then(|s| s.next_run)
                    .unwrap_or(now)
            };
            let exception = schedule
                .exceptions
                .iter()
                .find(|e| e.date == due_at.date_naive());
            if let Some(exception) = exception {
                if exception.action == ExceptionAction::Skip {
                    info!(
                        task = %entry.name,
                        reason = %exception.reason,
                        "skipping run on exception date"
                    );
                    self.ctx.audit.system(
                        "schedule_exception_skip",
                        "scheduler",
                        serde_json::json!({
                            "task": entry.name,
                            "date": exception.date.to_string(),
                            "reason": exception.reason,
                        }),
                    );
                    let mut state = self.state.lock().await;
                    if let Some(entry_state) = state.tasks.get_mut(&entry.name) {
                        entry_state.next_run = Self::compute_next_run(entry, now);
                    }
                    continue;
                }
            }

            self.run_entry(entry, now).await;
        }

        let mut state = self.state.lock().await;
        state.last_updated = Some(now);
        let json = serde_json::to_string_pretty(&*state).unwrap_or_else(|_| "{}".to_owned());
        drop(state);
        let state_path = self.ctx.paths.logs.join("scheduler_state.json");
        if let Err(e) = fsutil::replace_file(&state_path, &json).await {
            warn!(error = %e, "failed to persist scheduler state");
        }
    }

    async fn run_entry(&self, entry: &ScheduleEntry, now: DateTime<Local>) {
        let Some(handler) = self.actions.get(&entry.action) else {
            warn!(task = %entry.name, action = %entry.action, "unknown action, skipping");
            let mut state = self.state.lock().await;
            if let Some(entry_state) = state.tasks.get_mut(&entry.name) {
                entry_state.next_run = Self::compute_next_run(entry, now);
            }
            return;
        };

        info!(task = %entry.name, action = %entry.action, "executing scheduled task");
        let result = handler.run(&self.ctx).await;
        let mut state = self.state.lock().await;
        let entry_state = state.tasks.entry(entry.name.clone()).or_default();
        entry_state.last_run = Some(now);
        entry_state.run_count += 1;
        match result {
            Ok(output) => {
                info!(task = %entry.name, %output, "scheduled task completed");
                self.log_execution(&entry.name, &entry.action, "COMPLETED").await;
            }
            Err(e) => {
                entry_state.fail_count += 1;
                error!(task = %entry.name, error = %e, "scheduled task failed");
                self.log_execution(&entry.name, &entry.action, "FAILED").await;
            }
        }
        entry_state.next_run = Self::compute_next_run(entry, now);
    }

    async fn log_execution(&self, task: &str, action: &str, status: &str) {
        let log_file = self.ctx.paths.logs.join("scheduler_log.md");
        let stamp = format_timestamp(Local::now());
        let mut chunk = String::new();
        if !log_file.exists() {
            chunk.push_str("# Scheduler Execution Log\n\n");
            chunk.push_str("| Timestamp | Task | Action | Status |\n");
            chunk.push_str("|-----------|------|--------|--------|\n");
        }
        chunk.push_str(&format!("| {stamp} | {task} | {action} | {status} |\n"));
        if let Err(e) = fsutil::append_to_file(&log_file, &chunk).await {
            error!(error = %e, "failed to append scheduler log");
        }
    }

    /// Status summary: entry counts and the next few runs.
    pub async fn status(&self) -> serde_json::Value {
        let schedule = self.schedule.lock().await;
        let state = self.state.lock().await;
        let mut next_runs: Vec<(String, Option<DateTime<Local>>)> = schedule
            .entries
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    state.tasks.get(&e.name).and_then(|s| s.next_run),
                )
            })
            .collect();
        next_runs.sort_by_key(|(_, t)| *t);
        serde_json::json!({
            "tasks_total": schedule.entries.len(),
            "tasks_enabled": schedule.entries.iter().filter(|e| e.enabled).count(),
            "exceptions": schedule.exceptions.len(),
            "next_runs": next_runs
                .iter()
                .take(5)
                .map(|(name, at)| serde_json::json!({"task": name, "next_run": at}))
                .collect::<Vec<_>>(),
        })
    }
}

/// Scheduler worker loop.
pub async fn run_scheduler(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "scheduler started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                scheduler.ctx.resilience.heartbeat("scheduler").await;
                scheduler.tick(Local::now()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ── Grammar ──

    #[test]
    fn test_parse_default_schedule() {
        let file = parse_schedule(DEFAULT_SCHEDULE).expect("default parses");
        assert_eq!(file.entries.len(), 4);
        let digest = &file.entries[1];
        assert_eq!(digest.name, "daily_digest");
        assert_eq!(digest.schedule, "0 17 * * *");
        assert_eq!(digest.kind, ScheduleKind::Cron);
        assert!(digest.enabled);
        let health = &file.entries[3];
        assert_eq!(health.kind, ScheduleKind::Interval);
        assert_eq!(health.schedule, "300");
    }

    #[test]
    fn test_parse_exceptions() {
        let content = "\
report:
  schedule: \"0 9 * * *\"
  type: \"cron\"
  action: \"weekly_report\"

exceptions:
  - date: \"2026-12-25\"
    action: skip
    reason: Christmas
  - date: \"2026-01-01\"
    action: skip
    reason: New year
";
        let file = parse_schedule(content).expect("parses");
        assert_eq!(file.exceptions.len(), 2);
        assert_eq!(
            file.exceptions[0].date,
            NaiveDate::from_ymd_opt(2026, 12, 25).expect("date")
        );
        assert_eq!(file.exceptions[0].action, ExceptionAction::Skip);
        assert_eq!(file.exceptions[0].reason, "Christmas");
    }

    #[test]
    fn test_parse_rejects_tabs() {
        let err = parse_schedule("task:\n\tschedule: \"* * * * *\"\n").expect_err("tabs");
        assert!(matches!(err, ScheduleError::Parse { .. }));
    }

    #[test]
    fn test_parse_rejects_unknown_property() {
        let err =
            parse_schedule("task:\n  schedule: \"* * * * *\"\n  color: blue\n").expect_err("prop");
        assert!(matches!(err, ScheduleError::Parse { .. }));
    }

    #[test]
    fn test_parse_rejects_wrong_indent() {
        let err = parse_schedule("task:\n   schedule: \"* * * * *\"\n").expect_err("indent");
        assert!(matches!(err, ScheduleError::Parse { .. }));
    }

    #[test]
    fn test_parse_requires_schedule_and_action() {
        let err = parse_schedule("task:\n  schedule: \"* * * * *\"\n").expect_err("no action");
        assert_eq!(
            err,
            ScheduleError::MissingProperty {
                entry: "task".to_owned(),
                property: "action".to_owned()
            }
        );
    }

    // ── Scheduler behavior ──

    struct CountingAction {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ScheduleAction for CountingAction {
        async fn run(&self, _ctx: &SchedulerCtx) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("ran".to_owned())
        }
    }

    async fn scheduler_with(
        schedule_content: &str,
        action: Arc<CountingAction>,
    ) -> (tempfile::TempDir, Scheduler) {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let paths = RuntimePaths::resolve(tmp.path());
        paths.ensure().await.expect("dirs");
        tokio::fs::write(&paths.schedule_file, schedule_content)
            .await
            .expect("seed schedule");
        let resilience = Arc::new(
            ResilienceController::open(&paths.logs, AuditStream::disconnected()).await,
        );
        let ctx = SchedulerCtx {
            paths,
            audit: AuditStream::disconnected(),
            resilience,
        };
        let mut actions: HashMap<String, Arc<dyn ScheduleAction>> = HashMap::new();
        actions.insert("count".to_owned(), action);
        (tmp, Scheduler::open(ctx, actions).await)
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("valid local time")
    }

    #[tokio::test]
    async fn test_due_entry_runs_and_reschedules() {
        let action = Arc::new(CountingAction {
            calls: AtomicU32::new(0),
        });
        let content = "nine_am:\n  schedule: \"0 9 * * *\"\n  type: \"cron\"\n  action: \"count\"\n";
        let (_tmp, scheduler) = scheduler_with(content, Arc::clone(&action)).await;

        // First tick seeds next_run; nothing runs yet.
        let before = local(2026, 8, 3, 8, 0);
        scheduler.tick(before).await;
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);

        // At 09:00 the entry is due.
        let at_nine = local(2026, 8, 3, 9, 0);
        scheduler.tick(at_nine).await;
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);

        // Re-ticking the same instant does not double-run.
        scheduler.tick(at_nine).await;
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);

        let status = scheduler.status().await;
        assert_eq!(status["tasks_total"], 1);
    }

    #[tokio::test]
    async fn test_exception_date_skips_run() {
        let action = Arc::new(CountingAction {
            calls: AtomicU32::new(0),
        });
        let content = "\
nine_am:
  schedule: \"0 9 * * *\"
  type: \"cron\"
  action: \"count\"

exceptions:
  - date: \"2026-08-03\"
    action: skip
    reason: Holiday
";
        let (_tmp, scheduler) = scheduler_with(content, Arc::clone(&action)).await;

        scheduler.tick(local(2026, 8, 3, 8, 0)).await;
        scheduler.tick(local(2026, 8, 3, 9, 0)).await;
        // Skipped: no invocation, next run scheduled for tomorrow.
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);

        scheduler.tick(local(2026, 8, 4, 9, 0)).await;
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interval_entry() {
        let action = Arc::new(CountingAction {
            calls: AtomicU32::new(0),
        });
        let content =
            "often:\n  schedule: \"60\"\n  type: \"interval\"\n  action: \"count\"\n";
        let (_tmp, scheduler) = scheduler_with(content, Arc::clone(&action)).await;

        let start = local(2026, 8, 3, 8, 0);
        scheduler.tick(start).await;
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
        scheduler.tick(start + chrono::Duration::seconds(61)).await;
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);
        scheduler.tick(start + chrono::Duration::seconds(125)).await;
        assert_eq!(action.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_action_warned_and_skipped() {
        let action = Arc::new(CountingAction {
            calls: AtomicU32::new(0),
        });
        let content =
            "mystery:\n  schedule: \"60\"\n  type: \"interval\"\n  action: \"nope\"\n";
        let (_tmp, scheduler) = scheduler_with(content, action).await;
        let start = local(2026, 8, 3, 8, 0);
        scheduler.tick(start).await;
        scheduler.tick(start + chrono::Duration::seconds(61)).await;
        // No panic; the entry keeps rescheduling without running.
        let status = scheduler.status().await;
        assert_eq!(status["tasks_enabled"], 1);
    }

    #[tokio::test]
    async fn test_missing_schedule_file_creates_default() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let paths = RuntimePaths::resolve(tmp.path());
        paths.ensure().await.expect("dirs");
        let resilience = Arc::new(
            ResilienceController::open(&paths.logs, AuditStream::disconnected()).await,
        );
        let ctx = SchedulerCtx {
            paths: paths.clone(),
            audit: AuditStream::disconnected(),
            resilience,
        };
        let scheduler = Scheduler::open(ctx, HashMap::new()).await;
        assert!(paths.schedule_file.exists());
        let status = scheduler.status().await;
        assert_eq!(status["tasks_total"], 4);
    }

    #[tokio::test]
    async fn test_state_persisted_between_ticks() {
        let action = Arc::new(CountingAction {
            calls: AtomicU32::new(0),
        });
        let content =
            "often:\n  schedule: \"60\"\n  type: \"interval\"\n  action: \"count\"\n";
        let (tmp, scheduler) = scheduler_with(content, action).await;
        let start = local(2026, 8, 3, 8, 0);
        scheduler.tick(start).await;
        scheduler.tick(start + chrono::Duration::seconds(61)).await;

        let state_raw =
            tokio::fs::read_to_string(tmp.path().join("Logs/scheduler_state.json"))
                .await
                .expect("state file");
        let state: SchedulerState = serde_json::from_str(&state_raw).expect("state json");
        let entry = state.tasks.get("often").expect("entry state");
        assert_eq!(entry.run_count, 1);
        assert!(entry.next_run.is_some());
    }
}

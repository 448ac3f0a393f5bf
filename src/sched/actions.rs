//! Built-in schedule actions.
//!
//! Each action is a small handler registered by name; the schedule file
//! references them in its `action` property. Task-emitting actions drop
//! markdown files into the inbox so scheduled work enters the pipeline
//! at the top, exactly like externally received tasks.

use async_trait::async_trait;
use chrono::{Datelike, Local, Utc};

use super::{ScheduleAction, SchedulerCtx};
use crate::audit;
use crate::docwriter;
use crate::fsutil;
use crate::store::format_timestamp;

/// Register all built-in actions.
pub fn builtin_actions(
) -> std::collections::HashMap<String, std::sync::Arc<dyn ScheduleAction>> {
    let mut actions: std::collections::HashMap<String, std::sync::Arc<dyn ScheduleAction>> =
        std::collections::HashMap::new();
    actions.insert("inbox_scan".to_owned(), std::sync::Arc::new(InboxScan));
    actions.insert("generate_digest".to_owned(), std::sync::Arc::new(GenerateDigest));
    actions.insert("weekly_report".to_owned(), std::sync::Arc::new(WeeklyReport));
    actions.insert("linkedin_post".to_owned(), std::sync::Arc::new(LinkedinPost));
    actions.insert("health_check".to_owned(), std::sync::Arc::new(HealthCheck));
    actions.insert("cleanup_logs".to_owned(), std::sync::Arc::new(CleanupLogs));
    actions.insert("generate_docs".to_owned(), std::sync::Arc::new(GenerateDocs));
    actions
}

/// Report how many tasks wait in the inbox.
struct InboxScan;

#[async_trait]
impl ScheduleAction for InboxScan {
    async fn run(&self, ctx: &SchedulerCtx) -> anyhow::Result<String> {
        let pending = crate::store::TaskStore
            .list_pending(&ctx.paths.inbox)
            .await?;
        Ok(format!("{} task(s) waiting in inbox", pending.len()))
    }
}

/// Produce the daily audit summary.
struct GenerateDigest;

#[async_trait]
impl ScheduleAction for GenerateDigest {
    async fn run(&self, ctx: &SchedulerCtx) -> anyhow::Result<String> {
        let path = audit::write_daily_summary(&ctx.paths.audit, Local::now().date_naive()).await?;
        Ok(format!("daily summary written to {}", path.display()))
    }
}

/// Emit the weekly report task into the inbox.
struct WeeklyReport;

#[async_trait]
impl ScheduleAction for WeeklyReport {
    async fn run(&self, ctx: &SchedulerCtx) -> anyhow::Result<String> {
        let now = Local::now();
        let week = now.iso_week().week();
        let content = format!(
            "---\ntitle: Weekly Report - Week {week}\nstatus: needs_action\nskill: documentation\ngenerated: {}\n---\n\n# Weekly Report\n\n**Week:** {week}\n**Period:** {}\n\n## Summary\n\nReview the activity log and summarize completed and pending work for\nthe week.\n\n## Tasks Completed\n\n- Review activity logs for completed tasks\n- Count tasks moved to the Done folder\n\n## Tasks Pending\n\n- Review domain folders for open tasks\n- Check for blocked tasks\n",
            format_timestamp(now),
            now.format("%Y-%m-%d"),
        );
        let path = ctx
            .paths
            .inbox
            .join(format!("weekly_report_{}.md", now.format("%Y%m%d")));
        fsutil::replace_file(&path, &content).await?;
        Ok(format!("created {}", path.display()))
    }
}

/// Emit the scheduled LinkedIn post task into the inbox.
struct LinkedinPost;

#[async_trait]
impl ScheduleAction for LinkedinPost {
    async fn run(&self, ctx: &SchedulerCtx) -> anyhow::Result<String> {
        let now = Local::now();
        let content = format!(
            "---\ntitle: Scheduled LinkedIn Post - {date}\nstatus: needs_action\nskill: linkedin_marketing\ntopic: Daily Business Update\nscheduled: true\n---\n\n## Content Brief\n\nGenerate and publish a LinkedIn post for today.\n\nKey points:\n- Industry insights\n- Company updates\n- Thought leadership\n",
            date = now.format("%Y-%m-%d"),
        );
        let path = ctx
            .paths
            .inbox
            .join(format!("linkedin_scheduled_{}.md", now.format("%Y%m%d")));
        fsutil::replace_file(&path, &content).await?;
        Ok(format!("created {}", path.display()))
    }
}

/// Write a health report from the resilience snapshot.
struct HealthCheck;

#[async_trait]
impl ScheduleAction for HealthCheck {
    async fn run(&self, ctx: &SchedulerCtx) -> anyhow::Result<String> {
        let snapshot = ctx.resilience.status_snapshot().await;
        let path = ctx.paths.logs.join("health_report.json");
        fsutil::replace_file(&path, &serde_json::to_string_pretty(&snapshot)?).await?;
        let health = snapshot["health"].as_str().unwrap_or("unknown").to_owned();
        Ok(format!("system health: {health}"))
    }
}

/// Prune expired audit partitions.
struct CleanupLogs;

#[async_trait]
impl ScheduleAction for CleanupLogs {
    async fn run(&self, ctx: &SchedulerCtx) -> anyhow::Result<String> {
        let removed = audit::enforce_retention(&ctx.paths.audit, Utc::now()).await;
        Ok(format!("{removed} expired audit partition(s) pruned"))
    }
}

/// Regenerate the derived documentation.
struct GenerateDocs;

#[async_trait]
impl ScheduleAction for GenerateDocs {
    async fn run(&self, ctx: &SchedulerCtx) -> anyhow::Result<String> {
        docwriter::generate_all(&ctx.paths).await?;
        Ok("architecture and lessons docs regenerated".to_owned())
    }
}

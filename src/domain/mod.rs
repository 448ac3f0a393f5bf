//! Domain router: classifies new tasks into a domain and category, tags
//! the header, and relocates the file into the matching
//! `Domains/<domain>/<category>/` directory.
//!
//! Classification uses an explicit header hint when present, otherwise
//! keyword scoring over the lowercased title and body plus a per-skill
//! vote. Ties break on the skill vote; no signal at all falls back to the
//! default domain at confidence 0.5. Tasks matching both keyword sets are
//! marked cross-domain with the runner-up recorded for downstream use.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;
use tracing::{error, info};

use crate::audit::AuditStream;
use crate::config::RuntimePaths;
use crate::fsutil;
use crate::resilience::ResilienceController;
use crate::store::{format_timestamp, StoreError, TaskDocument, TaskStore};
use crate::types::{Domain, FailureKind, TaskStatus};

/// Keywords voting for the personal domain.
pub const PERSONAL_KEYWORDS: &[&str] = &[
    "personal", "learn", "study", "course", "reminder", "appointment", "health", "workout",
    "meal", "family", "friend", "hobby", "journal", "diary", "vacation", "travel personal",
    "shopping", "home personal", "car personal", "insurance personal",
];

/// Keywords voting for the business domain.
pub const BUSINESS_KEYWORDS: &[&str] = &[
    "business", "client", "customer", "invoice", "payment", "marketing", "linkedin", "report",
    "meeting", "project", "deadline", "revenue", "expense", "accounting", "tax business",
    "contract", "proposal", "presentation", "quarterly", "annual", "stakeholder", "investor",
];

/// Skills that vote for the business domain when present in the header.
const BUSINESS_VOTING_SKILLS: &[&str] = &["email", "linkedin_marketing", "approval"];

/// Category keyword tables per domain. The first category whose keyword
/// appears in the body wins; otherwise `general`.
pub const PERSONAL_CATEGORIES: &[(&str, &[&str])] = &[
    ("notes", &["note", "journal", "thought", "idea", "reflection"]),
    ("learning", &["learn", "study", "course", "tutorial", "certificate", "degree"]),
    ("reminders", &["reminder", "appointment", "birthday", "anniversary", "todo"]),
    ("health", &["health", "workout", "exercise", "diet", "meal", "medical", "doctor"]),
];

/// Business category table.
pub const BUSINESS_CATEGORIES: &[(&str, &[&str])] = &[
    ("accounting", &["invoice", "payment", "expense", "receipt", "budget", "tax"]),
    ("marketing", &["marketing", "linkedin", "social", "campaign", "content", "post"]),
    ("reporting", &["report", "analytics", "metrics", "dashboard", "kpi", "summary"]),
    ("projects", &["project", "deliverable", "milestone", "sprint", "client"]),
];

/// Domain used when nothing matches.
const DEFAULT_DOMAIN: Domain = Domain::Personal;

/// Result of classifying one task.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Winning domain.
    pub domain: Domain,
    /// Confidence in [0, 1], rounded to two decimals.
    pub confidence: f64,
    /// Category within the domain.
    pub category: String,
    /// Keywords that matched for the winning domain.
    pub keywords_matched: Vec<String>,
    /// Skill detected from the header, if any.
    pub skill_detected: Option<String>,
    /// Both keyword sets scored nonzero.
    pub cross_domain: bool,
    /// Runner-up domain for cross-domain tasks.
    pub secondary_domain: Option<Domain>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Classify a task document.
pub fn classify(doc: &TaskDocument) -> Classification {
    let body_lower = doc.body.to_lowercase();
    let title_lower = doc
        .header
        .get("title")
        .map(str::to_lowercase)
        .unwrap_or_default();

    // Explicit header hint short-circuits everything.
    if let Some(domain_str) = doc.header.get("domain") {
        if let Ok(domain) = domain_str.parse::<Domain>() {
            return Classification {
                domain,
                confidence: 1.0,
                category: "explicit".to_owned(),
                keywords_matched: vec![format!("domain:{}", domain_str.to_lowercase())],
                skill_detected: doc.header.get("skill").map(str::to_owned),
                cross_domain: false,
                secondary_domain: None,
            };
        }
    }

    let hit = |keyword: &str| body_lower.contains(keyword) || title_lower.contains(keyword);
    let mut personal_matches: Vec<String> = PERSONAL_KEYWORDS
        .iter()
        .filter(|k| hit(k))
        .map(|k| (*k).to_owned())
        .collect();
    let mut business_matches: Vec<String> = BUSINESS_KEYWORDS
        .iter()
        .filter(|k| hit(k))
        .map(|k| (*k).to_owned())
        .collect();

    // Skill vote.
    let skill = doc.header.get("skill").unwrap_or("");
    let skill_detected = (!skill.is_empty()).then(|| skill.to_owned());
    let skill_votes_business = BUSINESS_VOTING_SKILLS.contains(&skill);
    if skill_votes_business {
        business_matches.push(format!("skill:{skill}"));
    } else if matches!(skill, "documentation" | "planner" | "research") {
        personal_matches.push(format!("skill:{skill}"));
    }

    let personal_score = personal_matches.len();
    let business_score = business_matches.len();
    let total = personal_score + business_score;

    if total == 0 {
        return Classification {
            domain: DEFAULT_DOMAIN,
            confidence: 0.5,
            category: "default".to_owned(),
            keywords_matched: Vec::new(),
            skill_detected,
            cross_domain: false,
            secondary_domain: None,
        };
    }

    let (domain, confidence) = if personal_score > business_score {
        (Domain::Personal, round2(personal_score as f64 / total as f64))
    } else if business_score > personal_score {
        (Domain::Business, round2(business_score as f64 / total as f64))
    } else if skill_votes_business {
        (Domain::Business, 0.6)
    } else {
        (Domain::Personal, 0.6)
    };

    let cross_domain = personal_score > 0 && business_score > 0;
    let secondary_domain = cross_domain.then(|| domain.other());
    let category = determine_category(&body_lower, domain);
    let keywords_matched = match domain {
        Domain::Personal => personal_matches,
        Domain::Business => business_matches,
    };

    Classification {
        domain,
        confidence,
        category,
        keywords_matched,
        skill_detected,
        cross_domain,
        secondary_domain,
    }
}

/// First category whose keyword list appears in the body; else `general`.
pub fn determine_category(body_lower: &str, domain: Domain) -> String {
    let table = match domain {
        Domain::Personal => PERSONAL_CATEGORIES,
        Domain::Business => BUSINESS_CATEGORIES,
    };
    for (category, keywords) in table {
        if keywords.iter().any(|k| body_lower.contains(k)) {
            return (*category).to_owned();
        }
    }
    "general".to_owned()
}

// ── Router ──────────────────────────────────────────────────────

/// Routes inbox files into domain directories.
pub struct DomainRouter {
    store: TaskStore,
    paths: RuntimePaths,
    audit: AuditStream,
    resilience: Arc<ResilienceController>,
}

impl DomainRouter {
    /// New router over the resolved runtime paths.
    pub fn new(
        store: TaskStore,
        paths: RuntimePaths,
        audit: AuditStream,
        resilience: Arc<ResilienceController>,
    ) -> Self {
        Self {
            store,
            paths,
            audit,
            resilience,
        }
    }

    /// Classify and route one inbox file. Malformed files are
    /// quarantined so every inbox file either routes or fails visibly.
    pub async fn process_file(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let correlation = file_stem(path);
        let mut doc = match self.store.read(path).await {
            Ok(doc) => doc,
            Err(e) => {
                error!(file = %path.display(), error = %e, "malformed inbox task");
                self.resilience
                    .record_failure(
                        "domain_router",
                        FailureKind::MalformedTask,
                        &e.to_string(),
                        Some(&correlation),
                    )
                    .await;
                return self
                    .store
                    .quarantine(path, &self.paths.done, &e.to_string())
                    .await;
            }
        };

        let classification = classify(&doc);
        info!(
            file = %path.display(),
            domain = %classification.domain,
            category = %classification.category,
            confidence = classification.confidence,
            cross_domain = classification.cross_domain,
            "task classified"
        );

        // Tag the header. Writing the same classification twice yields
        // the same file content.
        let now = format_timestamp(Local::now());
        doc.header.set("domain", classification.domain.dir_name());
        doc.header.set("domain_category", &classification.category);
        doc.header
            .set("domain_confidence", format!("{:.2}", classification.confidence));
        if !doc.header.contains("routed_at") {
            doc.header.set("routed_at", &now);
        }
        if classification.cross_domain {
            doc.header.set("cross_domain", "true");
            if let Some(secondary) = classification.secondary_domain {
                doc.header.set("secondary_domain", secondary.dir_name());
            }
        }
        doc.header.set("status", TaskStatus::Classified.as_str());

        let dest_dir = self
            .paths
            .domain_category_dir(classification.domain, &classification.category);
        let file_name = path
            .file_name()
            .ok_or_else(|| StoreError::MalformedHeader(path.to_path_buf()))?;
        let dest = dest_dir.join(file_name);
        self.store.write(&dest, &doc).await?;
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        self.log_routing(&correlation, &classification).await;
        self.update_domain_memory(&correlation, &classification).await;
        self.audit.agent_decision(
            "domain_routing",
            "domain_router",
            Some(&correlation),
            &format!("{}/{}", classification.domain, classification.category),
            "keyword and skill-vote scoring",
            classification.confidence,
            serde_json::json!({
                "keywords_matched": classification.keywords_matched,
                "cross_domain": classification.cross_domain,
            }),
        );
        self.audit.task_lifecycle(
            "task_classified",
            "domain_router",
            &correlation,
            serde_json::json!({
                "domain": classification.domain.dir_name(),
                "category": classification.category,
            }),
        );

        Ok(dest)
    }

    /// Append one row to the markdown routing log.
    async fn log_routing(&self, task: &str, classification: &Classification) {
        let log_file = self.paths.logs.join("domain_routing_log.md");
        let stamp = format_timestamp(Local::now());
        let mut entry = String::new();
        if !log_file.exists() {
            entry.push_str("# Domain Routing Log\n\n");
            entry.push_str("| Timestamp | Task | Domain | Category | Confidence |\n");
            entry.push_str("|-----------|------|--------|----------|------------|\n");
        }
        entry.push_str(&format!(
            "| {stamp} | {task} | {} | {} | {:.2} |\n",
            classification.domain, classification.category, classification.confidence
        ));
        if let Err(e) = fsutil::append_to_file(&log_file, &entry).await {
            error!(error = %e, "failed to append routing log");
        }
    }

    /// Append a task-history line to the winning domain's memory file.
    async fn update_domain_memory(&self, task: &str, classification: &Classification) {
        let memory_file = self
            .paths
            .domains
            .join(classification.domain.dir_name())
            .join("memory.md");
        let stamp = format_timestamp(Local::now());
        let mut entry = String::new();
        if !memory_file.exists() {
            entry.push_str(&format!(
                "# {} Domain Memory\n\n## Task History\n",
                classification.domain
            ));
        }
        entry.push_str(&format!(
            "\n- [{stamp}] Processed: {task} (Category: {})",
            classification.category
        ));
        if let Err(e) = fsutil::append_to_file(&memory_file, &entry).await {
            error!(error = %e, "failed to update domain memory");
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Router worker: polls the inbox, routing every new file.
pub async fn run_router(
    router: Arc<DomainRouter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "domain router started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                router.resilience.heartbeat("domain_router").await;
                match router.store.list_pending(&router.paths.inbox).await {
                    Ok(files) => {
                        for file in files {
                            if let Err(e) = router.process_file(&file).await {
                                error!(file = %file.display(), error = %e, "routing failed");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "inbox scan failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("domain router stopped");
}

//! MCP routing layer.
//!
//! Backend services register with a name, base endpoint, and declared
//! action list. Agents call [`McpRouter::route`] with a service name,
//! action, and JSON payload; the router forwards to `POST {base}/{action}`
//! and returns the decoded response. Offline services get a health probe
//! (`GET /health`, 200 means online) and, when fallback is enabled, a
//! service-specific degraded response instead of an error. Every call
//! produces an `mcp_call` audit event with latency and success flag.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::audit::AuditStream;
use crate::types::ServiceStatus;

/// Health probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwarded call timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Request-log entries retained in memory.
const REQUEST_LOG_LIMIT: usize = 1000;

// ── Types ───────────────────────────────────────────────────────

/// Registration data for one backend service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name (registry key).
    pub name: String,
    /// Base endpoint, e.g. `http://127.0.0.1:8765`.
    pub base_url: String,
    /// Declared action names proxied by this service.
    pub actions: Vec<String>,
    /// Whether the router may answer with a degraded response when the
    /// service is unreachable.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Registry entry: configuration plus observed health.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceEntry {
    /// Registration data.
    pub config: ServiceConfig,
    /// Last observed status.
    pub status: ServiceStatus,
    /// When the last probe ran.
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Routing errors surfaced to the caller. Backend-reported errors are
/// not errors at this layer; they come back inside the response body.
#[derive(Debug, Error)]
pub enum McpError {
    /// No service registered under this name.
    #[error("MCP service not found: {0}")]
    UnknownService(String),
    /// Service unreachable and fallback disabled.
    #[error("MCP service offline: {0}")]
    Offline(String),
}

/// One entry of the bounded in-memory request log.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
    /// Target service.
    pub service: String,
    /// Action name.
    pub action: String,
    /// Whether the backend handled it successfully.
    pub success: bool,
    /// Whether a degraded fallback response was served.
    pub fallback: bool,
}

// ── Router ──────────────────────────────────────────────────────

/// Central registry and router for MCP backend services. The router is
/// the single writer of the registry and health map; readers take
/// snapshots.
pub struct McpRouter {
    client: reqwest::Client,
    services: RwLock<HashMap<String, ServiceEntry>>,
    request_log: Mutex<VecDeque<RequestLogEntry>>,
    audit: AuditStream,
}

impl McpRouter {
    /// New router with an empty registry.
    pub fn new(audit: AuditStream) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            services: RwLock::new(HashMap::new()),
            request_log: Mutex::new(VecDeque::new()),
            audit,
        }
    }

    /// Register (or replace) a backend service. Services start offline
    /// until the first successful probe.
    pub async fn register(&self, config: ServiceConfig) {
        info!(service = %config.name, base = %config.base_url, "MCP service registered");
        let entry = ServiceEntry {
            status: ServiceStatus::Offline,
            last_health_check: None,
            config,
        };
        self.services
            .write()
            .await
            .insert(entry.config.name.clone(), entry);
    }

    /// Remove a service from the registry.
    pub async fn unregister(&self, name: &str) {
        if self.services.write().await.remove(name).is_some() {
            info!(service = name, "MCP service unregistered");
        }
    }

    /// Snapshot of all registered services.
    pub async fn services(&self) -> Vec<ServiceEntry> {
        let mut list: Vec<ServiceEntry> = self.services.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        list
    }

    /// All routable `service/action` pairs.
    pub async fn registered_actions(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .services
            .read()
            .await
            .values()
            .flat_map(|s| {
                s.config
                    .actions
                    .iter()
                    .map(move |a| format!("{}/{}", s.config.name, a))
            })
            .collect();
        out.sort();
        out
    }

    /// Probe one service's `/health` endpoint and record the result.
    /// Returns true when the service is online.
    pub async fn check_health(&self, name: &str) -> bool {
        let base = match self.services.read().await.get(name) {
            Some(entry) => entry.config.base_url.clone(),
            None => return false,
        };
        let url = format!("{}/health", base.trim_end_matches('/'));
        let probe = self.client.get(&url).timeout(PROBE_TIMEOUT).send().await;
        let status = match probe {
            Ok(resp) if resp.status().as_u16() == 200 => ServiceStatus::Online,
            Ok(_) => ServiceStatus::Degraded,
            Err(e) => {
                warn!(service = name, error = %e, "health probe failed");
                ServiceStatus::Offline
            }
        };
        if let Some(entry) = self.services.write().await.get_mut(name) {
            entry.status = status;
            entry.last_health_check = Some(Utc::now());
        }
        status == ServiceStatus::Online
    }

    /// Probe every registered service.
    pub async fn check_all_health(&self) {
        let names: Vec<String> = self.services.read().await.keys().cloned().collect();
        for name in names {
            self.check_health(&name).await;
        }
    }

    /// Route an action call.
    ///
    /// Unknown services error. Services that are not known online get a
    /// probe first; still-unreachable services answer with the declared
    /// degraded response when fallback is enabled, else
    /// [`McpError::Offline`]. Backend errors come back inside the
    /// returned JSON (`success: false`), never as a Rust error.
    pub async fn route(
        &self,
        service: &str,
        action: &str,
        payload: &serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<serde_json::Value, McpError> {
        let (base_url, status, fallback_enabled) = {
            let services = self.services.read().await;
            let entry = services
                .get(service)
                .ok_or_else(|| McpError::UnknownService(service.to_owned()))?;
            (
                entry.config.base_url.clone(),
                entry.status,
                entry.config.fallback_enabled,
            )
        };

        if status != ServiceStatus::Online && !self.check_health(service).await {
            if fallback_enabled {
                let response = fallback_response(service);
                self.audit.mcp_call(
                    service,
                    action,
                    false,
                    0.0,
                    Some("service offline, fallback served"),
                    correlation_id,
                );
                self.push_log(service, action, false, true).await;
                info!(service, action, "MCP offline, serving fallback");
                return Ok(response);
            }
            self.audit.mcp_call(
                service,
                action,
                false,
                0.0,
                Some("service offline"),
                correlation_id,
            );
            self.push_log(service, action, false, false).await;
            return Err(McpError::Offline(service.to_owned()));
        }

        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            action.trim_start_matches('/')
        );
        let started = Instant::now();
        let outcome = self.client.post(&url).json(payload).send().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(resp) => {
                let http_status = resp.status();
                let body: serde_json::Value = resp
                    .json()
                    .await
                    .unwrap_or_else(|e| serde_json::json!({"success": false, "error": e.to_string()}));
                let success = http_status.is_success()
                    && body.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
                let error = body.get("error").and_then(|v| v.as_str()).map(str::to_owned);
                self.audit.mcp_call(
                    service,
                    action,
                    success,
                    latency_ms,
                    error.as_deref(),
                    correlation_id,
                );
                self.push_log(service, action, success, false).await;
                debug!(service, action, success, latency_ms, "MCP call");
                if http_status.is_success() {
                    Ok(body)
                } else {
                    Ok(serde_json::json!({
                        "success": false,
                        "error": error.unwrap_or_else(|| format!("HTTP {http_status}")),
                        "http_status": http_status.as_u16(),
                    }))
                }
            }
            Err(e) => {
                // Transport failure mid-call: degrade like an offline
                // service when allowed.
                warn!(service, action, error = %e, "MCP call failed");
                self.audit.mcp_call(
                    service,
                    action,
                    false,
                    latency_ms,
                    Some(&e.to_string()),
                    correlation_id,
                );
                if fallback_enabled {
                    self.push_log(service, action, false, true).await;
                    Ok(fallback_response(service))
                } else {
                    self.push_log(service, action, false, false).await;
                    Ok(serde_json::json!({"success": false, "error": e.to_string()}))
                }
            }
        }
    }

    async fn push_log(&self, service: &str, action: &str, success: bool, fallback: bool) {
        let mut log = self.request_log.lock().await;
        log.push_back(RequestLogEntry {
            timestamp: Utc::now(),
            service: service.to_owned(),
            action: action.to_owned(),
            success,
            fallback,
        });
        while log.len() > REQUEST_LOG_LIMIT {
            log.pop_front();
        }
    }

    /// Recent request-log entries, oldest first.
    pub async fn recent_requests(&self, limit: usize) -> Vec<RequestLogEntry> {
        let log = self.request_log.lock().await;
        log.iter().rev().take(limit).rev().cloned().collect()
    }
}

/// Service-specific degraded response served when a backend is offline
/// and fallback is enabled.
pub fn fallback_response(service: &str) -> serde_json::Value {
    match service {
        "email" => serde_json::json!({
            "success": true,
            "message": "Email queued (MCP offline)",
            "fallback": true,
            "queued": true,
        }),
        "linkedin" => serde_json::json!({
            "success": true,
            "message": "Post content generated locally (MCP offline)",
            "fallback": true,
            "generated_content": {
                "text": "Post content will be published when the service returns",
            },
        }),
        "accounting" => serde_json::json!({
            "success": true,
            "message": "Recorded locally (MCP offline)",
            "fallback": true,
            "local_record": true,
        }),
        "social" => serde_json::json!({
            "success": true,
            "message": "Post scheduled locally (MCP offline)",
            "fallback": true,
            "scheduled": true,
        }),
        "automation" => serde_json::json!({
            "success": true,
            "message": "Action logged for later execution (MCP offline)",
            "fallback": true,
            "pending": true,
        }),
        other => serde_json::json!({
            "success": true,
            "message": format!("Fallback executed for {other}"),
            "fallback": true,
        }),
    }
}

/// Default service registrations used when the config file declares
/// none: the five local backends with their action tables.
pub fn default_services() -> Vec<ServiceConfig> {
    let table: [(&str, u16, &[&str]); 5] = [
        ("email", 8765, &["send", "queue_add", "flush"]),
        (
            "linkedin",
            8766,
            &["generate", "publish", "generate-and-publish", "analytics"],
        ),
        (
            "accounting",
            8767,
            &["invoice/create", "expense/add", "reports/summary", "budget/status"],
        ),
        (
            "social",
            8768,
            &["post/schedule", "post/publish", "analytics", "calendar"],
        ),
        (
            "automation",
            8769,
            &["file/copy", "file/move", "transform", "webhook/trigger"],
        ),
    ];
    table
        .into_iter()
        .map(|(name, port, actions)| ServiceConfig {
            name: name.to_owned(),
            base_url: format!("http://127.0.0.1:{port}"),
            actions: actions.iter().map(|s| (*s).to_owned()).collect(),
            fallback_enabled: true,
        })
        .collect()
}

/// Periodic health worker: probes all services on an interval.
pub async fn run_health_loop(
    router: std::sync::Arc<McpRouter>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "MCP health loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => router.check_all_health().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("MCP health loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_service(name: &str, fallback_enabled: bool) -> ServiceConfig {
        ServiceConfig {
            name: name.to_owned(),
            // Unroutable loopback port: probes fail fast.
            base_url: "http://127.0.0.1:1".to_owned(),
            actions: vec!["send".to_owned()],
            fallback_enabled,
        }
    }

    #[tokio::test]
    async fn test_unknown_service_errors() {
        let router = McpRouter::new(AuditStream::disconnected());
        let err = router
            .route("ghost", "send", &serde_json::json!({}), None)
            .await
            .expect_err("unknown service");
        assert!(matches!(err, McpError::UnknownService(_)));
    }

    #[tokio::test]
    async fn test_offline_with_fallback_returns_degraded_response() {
        let router = McpRouter::new(AuditStream::disconnected());
        router.register(offline_service("email", true)).await;
        let response = router
            .route("email", "send", &serde_json::json!({"to": "a@b.c"}), None)
            .await
            .expect("fallback, not error");
        assert_eq!(response["success"], true);
        assert_eq!(response["fallback"], true);
        assert_eq!(response["queued"], true);

        let log = router.recent_requests(10).await;
        assert_eq!(log.len(), 1);
        assert!(log[0].fallback);
        assert!(!log[0].success);
    }

    #[tokio::test]
    async fn test_offline_without_fallback_errors() {
        let router = McpRouter::new(AuditStream::disconnected());
        router.register(offline_service("accounting", false)).await;
        let err = router
            .route("accounting", "invoice/create", &serde_json::json!({}), None)
            .await
            .expect_err("offline");
        assert!(matches!(err, McpError::Offline(_)));
    }

    #[tokio::test]
    async fn test_probe_marks_offline() {
        let router = McpRouter::new(AuditStream::disconnected());
        router.register(offline_service("email", true)).await;
        assert!(!router.check_health("email").await);
        let services = router.services().await;
        assert_eq!(services[0].status, ServiceStatus::Offline);
        assert!(services[0].last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_registered_actions() {
        let router = McpRouter::new(AuditStream::disconnected());
        for config in default_services() {
            router.register(config).await;
        }
        let actions = router.registered_actions().await;
        assert!(actions.contains(&"email/send".to_owned()));
        assert!(actions.contains(&"accounting/invoice/create".to_owned()));
        assert_eq!(
            actions.len(),
            default_services().iter().map(|s| s.actions.len()).sum::<usize>()
        );
    }

    #[tokio::test]
    async fn test_unregister() {
        let router = McpRouter::new(AuditStream::disconnected());
        router.register(offline_service("email", true)).await;
        router.unregister("email").await;
        assert!(router.services().await.is_empty());
    }

    #[test]
    fn test_fallback_responses_are_well_typed() {
        for service in ["email", "linkedin", "accounting", "social", "automation", "other"] {
            let response = fallback_response(service);
            assert_eq!(response["success"], true, "service {service}");
            assert_eq!(response["fallback"], true, "service {service}");
        }
    }
}

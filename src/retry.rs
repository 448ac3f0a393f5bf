//! Retry policies shared by the autonomy loop and the resilience wrapper.
//!
//! Delay for attempt *n*: fixed → base; linear → min(base·n, max);
//! exponential → min(base·2^(n−1), max). A uniform jitter fraction may be
//! added on top; `timeout` bounds a single attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AgentPriority;

/// Backoff curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

/// Retry configuration for one operation or plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Backoff curve.
    pub backoff: Backoff,
    /// Base delay in seconds.
    pub base_delay_secs: f64,
    /// Upper bound on the computed (pre-jitter) delay.
    pub max_delay_secs: f64,
    /// Uniform jitter fraction in [0, 1]; 0 makes delays deterministic.
    pub jitter: f64,
    /// Bound on a single attempt, in seconds.
    pub timeout_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay_secs: 5.0,
            max_delay_secs: 300.0,
            jitter: 0.0,
            timeout_secs: 300.0,
        }
    }
}

impl RetryPolicy {
    /// Policy applied to operations run on behalf of an agent with the
    /// given priority class.
    pub fn for_priority(priority: AgentPriority) -> Self {
        let (max_attempts, max_delay_secs, timeout_secs) = match priority {
            AgentPriority::Critical => (5, 60.0, 300.0),
            AgentPriority::High => (3, 30.0, 180.0),
            AgentPriority::Normal => (3, 20.0, 120.0),
            AgentPriority::Low => (1, 10.0, 60.0),
        };
        Self {
            max_attempts,
            backoff: Backoff::Exponential,
            base_delay_secs: 5.0,
            max_delay_secs,
            jitter: 0.5,
            timeout_secs,
        }
    }

    /// Pre-jitter delay before re-running attempt `attempt` (1-based count
    /// of attempts already made).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let base = self.base_delay_secs;
        let raw = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base * f64::from(n),
            Backoff::Exponential => base * 2f64.powi(n.saturating_sub(1).min(62) as i32),
        };
        Duration::from_secs_f64(raw.min(self.max_delay_secs).max(0.0))
    }

    /// Delay with jitter applied. `unit` must be a sample from [0, 1);
    /// callers pass `rand::random()` in production and a constant in tests.
    pub fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.delay_for_attempt(attempt).as_secs_f64();
        let jitter = base * self.jitter * unit.clamp(0.0, 1.0);
        Duration::from_secs_f64(base + jitter)
    }

    /// Single-attempt timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

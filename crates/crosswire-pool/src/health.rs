//! Rolling-window health metrics per (credential, model).
//!
//! Status is a pure function of the window contents, the configured
//! thresholds, and whether a cooldown is active; nothing here mutates status
//! out of band.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crosswire_common::HealthTrackingConfig;

use crate::credential::CredentialId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout or transient network failure.
    Transient,
    RateLimited,
    /// Upstream 5xx.
    Upstream,
    /// 401/403 that survived a token refresh.
    Auth,
    /// Other 4xx; surfaced to the client unchanged.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success {
        latency: Duration,
    },
    Failure {
        latency: Duration,
        class: ErrorClass,
    },
    /// Excluded from health metrics entirely.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Cooldown,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency_ms: u64,
    success: bool,
}

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<Sample>,
    auth_failed: bool,
    last_touch: Option<Instant>,
}

impl Window {
    fn prune(&mut self, horizon: Duration, now: Instant) {
        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.at) > horizon {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub total: usize,
    pub failures: usize,
    pub failure_rate: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub auth_failed: bool,
}

pub struct HealthTracker {
    config: HealthTrackingConfig,
    windows: RwLock<HashMap<(CredentialId, String), Arc<Mutex<Window>>>>,
}

impl HealthTracker {
    pub fn new(config: HealthTrackingConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthTrackingConfig {
        &self.config
    }

    fn window(&self, credential_id: CredentialId, model: &str) -> Arc<Mutex<Window>> {
        let key = (credential_id, model.to_string());
        if let Ok(windows) = self.windows.read()
            && let Some(window) = windows.get(&key)
        {
            return window.clone();
        }
        let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
        windows.entry(key).or_default().clone()
    }

    pub fn record(&self, credential_id: CredentialId, model: &str, outcome: &RequestOutcome) {
        let (latency, success, auth) = match outcome {
            RequestOutcome::Success { latency } => (*latency, true, false),
            RequestOutcome::Failure { latency, class } => {
                (*latency, false, *class == ErrorClass::Auth)
            }
            RequestOutcome::Cancelled => return,
        };

        let now = Instant::now();
        let window = self.window(credential_id, model);
        let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
        if auth {
            window.auth_failed = true;
        }
        window.samples.push_back(Sample {
            at: now,
            latency_ms: latency.as_millis() as u64,
            success,
        });
        window.last_touch = Some(now);
        window.prune(self.config.window(), now);
    }

    pub fn stats(&self, credential_id: CredentialId, model: &str) -> WindowStats {
        let window = self.window(credential_id, model);
        let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(self.config.window(), Instant::now());

        let total = window.samples.len();
        let failures = window.samples.iter().filter(|s| !s.success).count();
        let mut latencies: Vec<u64> = window.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();

        WindowStats {
            total,
            failures,
            failure_rate: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64
            },
            p50_ms: percentile(&latencies, 50),
            p95_ms: percentile(&latencies, 95),
            p99_ms: percentile(&latencies, 99),
            auth_failed: window.auth_failed,
        }
    }

    /// P95 latency when the window has enough samples to be meaningful.
    pub fn p95(&self, credential_id: CredentialId, model: &str) -> Option<u64> {
        let stats = self.stats(credential_id, model);
        (stats.total >= self.config.min_requests).then_some(stats.p95_ms)
    }

    pub fn classify(
        &self,
        credential_id: CredentialId,
        model: &str,
        cooldown_active: bool,
    ) -> HealthStatus {
        let stats = self.stats(credential_id, model);
        classify_status(&stats, cooldown_active, &self.config)
    }

    /// Drops windows idle for more than twice the rolling window.
    pub fn spawn_cleanup_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.cleanup_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let horizon = self.config.window() * 2;
                let now = Instant::now();
                let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
                let before = windows.len();
                windows.retain(|_, window| {
                    let window = window.lock().unwrap_or_else(|e| e.into_inner());
                    match window.last_touch {
                        Some(touch) => now.duration_since(touch) <= horizon,
                        None => false,
                    }
                });
                let dropped = before - windows.len();
                if dropped > 0 {
                    debug!(dropped, "dropped idle health windows");
                }
            }
        })
    }
}

/// Pure classification; also used directly by `snapshot()`.
pub fn classify_status(
    stats: &WindowStats,
    cooldown_active: bool,
    config: &HealthTrackingConfig,
) -> HealthStatus {
    if stats.auth_failed {
        return HealthStatus::Error;
    }
    if stats.total >= config.min_requests && stats.failure_rate >= config.failure_threshold {
        return HealthStatus::Error;
    }
    if cooldown_active {
        return HealthStatus::Cooldown;
    }
    if stats.total >= config.min_requests && stats.failure_rate >= config.degraded_threshold {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

/// Nearest-rank percentile over sorted input.
fn percentile(sorted: &[u64], p: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len()).div_ceil(100).max(1);
    sorted[rank - 1]
}

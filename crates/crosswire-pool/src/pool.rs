//! The credential pool: typed credentials, in-flight accounting, selection
//! strategies, and cooldown bookkeeping.
//!
//! A single mutex guards the credential table; every operation is O(N) in
//! the credential count, which is bounded. Health windows live in the
//! tracker behind their own per-window locks, so `release` never blocks on
//! metric computation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crosswire_common::{RoutingConfig, SelectionStrategy};

use crate::credential::{Credential, CredentialId, CredentialStatus};
use crate::health::{ErrorClass, HealthStatus, HealthTracker, RequestOutcome};

const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(30);
const UPSTREAM_COOLDOWN: Duration = Duration::from_secs(10);
const AUTH_COOLDOWN: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    ProviderUnknown,
    NoActiveCredentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CooldownReason {
    RateLimit,
    AuthInvalid,
    Upstream5xx,
    Manual,
}

#[derive(Debug)]
struct Entry {
    credential: Credential,
    enabled: bool,
    in_flight: u32,
    cooldown_until: Option<Instant>,
    cooldown_reason: Option<CooldownReason>,
    model_cooldowns: HashMap<String, (Instant, CooldownReason)>,
}

impl Entry {
    fn cooldown_active(&self, model: &str, now: Instant) -> bool {
        if let Some(until) = self.cooldown_until
            && until > now
        {
            return true;
        }
        matches!(self.model_cooldowns.get(model), Some((until, _)) if *until > now)
    }

    /// Lazily clears expired cooldowns; re-entry into the selectable set is
    /// automatic once `now >= cooldown_until`.
    fn expire(&mut self, now: Instant) {
        if let Some(until) = self.cooldown_until
            && until <= now
        {
            self.cooldown_until = None;
            self.cooldown_reason = None;
        }
        self.model_cooldowns.retain(|_, (until, _)| *until > now);
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<CredentialId, Entry>,
    by_provider: HashMap<String, Vec<CredentialId>>,
    cursors: HashMap<String, usize>,
}

/// Introspection row; status is recomputed on every call.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub id: CredentialId,
    pub provider: String,
    pub label: String,
    pub status: CredentialStatus,
    pub in_flight: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub cooldown_reason: Option<CooldownReason>,
}

pub struct CredentialPool {
    state: Mutex<PoolState>,
    tracker: Arc<HealthTracker>,
}

impl CredentialPool {
    pub fn new(tracker: Arc<HealthTracker>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    pub fn insert(&self, credential: Credential) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = credential.id;
        let provider = credential.provider.clone();
        let ids = state.by_provider.entry(provider).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        state
            .entries
            .entry(id)
            .and_modify(|entry| entry.credential = credential.clone())
            .or_insert_with(|| Entry {
                credential,
                enabled: true,
                in_flight: 0,
                cooldown_until: None,
                cooldown_reason: None,
                model_cooldowns: HashMap::new(),
            });
    }

    pub fn update_credential(&self, credential: Credential) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.entries.get_mut(&credential.id) {
            entry.credential = credential;
        }
    }

    pub fn set_enabled(&self, id: CredentialId, enabled: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.enabled = enabled;
        }
    }

    /// Selects a credential, bumps its in-flight counter, and returns a
    /// handle that must be resolved (or dropped, which counts as cancelled).
    pub fn acquire(
        self: &Arc<Self>,
        provider: &str,
        model: &str,
        routing: &RoutingConfig,
    ) -> Result<CredentialLease, AcquireError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let Some(ids) = state.by_provider.get(provider).cloned() else {
            return Err(AcquireError::ProviderUnknown);
        };

        // Round-robin advances on every acquire, selected or skipped.
        let cursor = {
            let slot = state.cursors.entry(provider.to_string()).or_insert(0);
            let cursor = *slot;
            *slot = slot.wrapping_add(1);
            cursor
        };

        for id in &ids {
            if let Some(entry) = state.entries.get_mut(id) {
                entry.expire(now);
            }
        }

        let mut enabled: Vec<CredentialId> = ids
            .iter()
            .copied()
            .filter(|id| matches!(state.entries.get(id), Some(entry) if entry.enabled))
            .collect();
        enabled.sort_unstable();
        if enabled.is_empty() {
            return Err(AcquireError::NoActiveCredentials);
        }

        let mut candidates = enabled.clone();
        if routing.health_aware {
            let available: Vec<CredentialId> = candidates
                .iter()
                .copied()
                .filter(|id| {
                    !matches!(
                        self.status_of(&state, *id, model, now),
                        HealthStatus::Cooldown | HealthStatus::Error
                    )
                })
                .collect();
            // An empty filtered set falls back to the full set; the router
            // owns the retry from there.
            if !available.is_empty() {
                candidates = available;
            }
        }
        if routing.prefer_healthy {
            let statuses: HashMap<CredentialId, HealthStatus> = candidates
                .iter()
                .map(|id| (*id, self.status_of(&state, *id, model, now)))
                .collect();
            if statuses.values().any(|s| *s == HealthStatus::Healthy) {
                candidates.retain(|id| statuses[id] != HealthStatus::Degraded);
            }
        }

        let chosen = self.select(&state, &candidates, model, routing.strategy, cursor);
        let Some(id) = chosen else {
            return Err(AcquireError::NoActiveCredentials);
        };

        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(AcquireError::NoActiveCredentials)?;
        entry.in_flight += 1;
        let credential = entry.credential.clone();

        Ok(CredentialLease {
            pool: Arc::clone(self),
            id,
            model: model.to_string(),
            credential,
            acquired_at: Instant::now(),
            resolved: false,
        })
    }

    fn select(
        &self,
        state: &PoolState,
        candidates: &[CredentialId],
        model: &str,
        strategy: SelectionStrategy,
        cursor: usize,
    ) -> Option<CredentialId> {
        if candidates.is_empty() {
            return None;
        }
        match strategy {
            SelectionStrategy::FillFirst => candidates.iter().min().copied(),
            SelectionStrategy::RoundRobin => Some(candidates[cursor % candidates.len()]),
            SelectionStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[index])
            }
            SelectionStrategy::LeastBusy => candidates
                .iter()
                .copied()
                .min_by_key(|id| {
                    let in_flight = state
                        .entries
                        .get(id)
                        .map(|entry| entry.in_flight)
                        .unwrap_or(u32::MAX);
                    (in_flight, *id)
                }),
            SelectionStrategy::LowestLatency => {
                // Under-sampled credentials rank at the median of observed
                // P95s: neither favored nor starved.
                let observed: Vec<(CredentialId, Option<u64>)> = candidates
                    .iter()
                    .map(|id| (*id, self.tracker.p95(*id, model)))
                    .collect();
                let mut known: Vec<u64> =
                    observed.iter().filter_map(|(_, p95)| *p95).collect();
                known.sort_unstable();
                let median = if known.is_empty() {
                    0
                } else {
                    known[known.len() / 2]
                };
                observed
                    .iter()
                    .min_by_key(|(id, p95)| (p95.unwrap_or(median), *id))
                    .map(|(id, _)| *id)
            }
        }
    }

    fn status_of(
        &self,
        state: &PoolState,
        id: CredentialId,
        model: &str,
        now: Instant,
    ) -> HealthStatus {
        let cooldown_active = state
            .entries
            .get(&id)
            .map(|entry| entry.cooldown_active(model, now))
            .unwrap_or(false);
        self.tracker.classify(id, model, cooldown_active)
    }

    pub fn mark_unavailable(&self, id: CredentialId, duration: Duration, reason: CooldownReason) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.cooldown_until = Some(Instant::now() + duration);
            entry.cooldown_reason = Some(reason);
            debug!(credential_id = id, ?reason, ?duration, "credential cooldown start");
        }
    }

    pub fn mark_model_unavailable(
        &self,
        id: CredentialId,
        model: &str,
        duration: Duration,
        reason: CooldownReason,
    ) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.entries.get_mut(&id) {
            entry
                .model_cooldowns
                .insert(model.to_string(), (Instant::now() + duration, reason));
            debug!(credential_id = id, model, ?reason, "model cooldown start");
        }
    }

    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut rows: Vec<CredentialSnapshot> = state
            .entries
            .values_mut()
            .map(|entry| {
                entry.expire(now);
                let status = if !entry.enabled {
                    CredentialStatus::Disabled
                } else {
                    match (entry.cooldown_until, entry.cooldown_reason) {
                        (Some(_), Some(CooldownReason::AuthInvalid)) => CredentialStatus::Error,
                        (Some(_), _) => CredentialStatus::Cooldown,
                        _ => CredentialStatus::Active,
                    }
                };
                CredentialSnapshot {
                    id: entry.credential.id,
                    provider: entry.credential.provider.clone(),
                    label: entry.credential.label.clone(),
                    status,
                    in_flight: entry.in_flight,
                    cooldown_remaining_ms: entry
                        .cooldown_until
                        .map(|until| until.saturating_duration_since(now).as_millis() as u64),
                    cooldown_reason: entry.cooldown_reason,
                }
            })
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    /// Lease resolution: decrement in-flight, feed the tracker, apply
    /// cooldown policy. Called from lease methods and `Drop`.
    fn finish(
        &self,
        id: CredentialId,
        model: &str,
        outcome: RequestOutcome,
        retry_after: Option<Duration>,
    ) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
            }
        }

        self.tracker.record(id, model, &outcome);

        let RequestOutcome::Failure { class, .. } = outcome else {
            return;
        };
        match class {
            ErrorClass::RateLimited => {
                self.mark_unavailable(
                    id,
                    retry_after.unwrap_or(RATE_LIMIT_FALLBACK),
                    CooldownReason::RateLimit,
                );
            }
            ErrorClass::Auth => {
                self.mark_unavailable(id, AUTH_COOLDOWN, CooldownReason::AuthInvalid);
            }
            ErrorClass::Upstream => {
                // Repeated 5xx above the failure threshold cools the
                // credential down for this model.
                let stats = self.tracker.stats(id, model);
                let config = self.tracker.config();
                if stats.total >= config.min_requests
                    && stats.failure_rate >= config.failure_threshold
                {
                    warn!(credential_id = id, model, "failure rate above threshold");
                    self.mark_model_unavailable(
                        id,
                        model,
                        UPSTREAM_COOLDOWN,
                        CooldownReason::Upstream5xx,
                    );
                }
            }
            ErrorClass::Transient | ErrorClass::Permanent => {}
        }
    }
}

/// A selected credential with its in-flight slot held. Resolving the lease
/// reports the outcome; dropping it unresolved releases the slot as a
/// cancellation, which never touches health metrics.
pub struct CredentialLease {
    pool: Arc<CredentialPool>,
    id: CredentialId,
    model: String,
    credential: Credential,
    acquired_at: Instant,
    resolved: bool,
}

impl CredentialLease {
    pub fn id(&self) -> CredentialId {
        self.id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn latency(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn succeed(mut self) {
        let latency = self.latency();
        self.resolved = true;
        self.pool
            .clone()
            .finish(self.id, &self.model, RequestOutcome::Success { latency }, None);
    }

    pub fn fail(mut self, class: ErrorClass, retry_after: Option<Duration>) {
        let latency = self.latency();
        self.resolved = true;
        self.pool.clone().finish(
            self.id,
            &self.model,
            RequestOutcome::Failure { latency, class },
            retry_after,
        );
    }

    pub fn cancel(mut self) {
        self.resolved = true;
        self.pool
            .clone()
            .finish(self.id, &self.model, RequestOutcome::Cancelled, None);
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if !self.resolved {
            self.pool
                .clone()
                .finish(self.id, &self.model, RequestOutcome::Cancelled, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialMetadata;
    use crosswire_common::HealthTrackingConfig;

    fn pool() -> Arc<CredentialPool> {
        Arc::new(CredentialPool::new(Arc::new(HealthTracker::new(
            HealthTrackingConfig::default(),
        ))))
    }

    fn credential(id: CredentialId) -> Credential {
        Credential {
            id,
            provider: "gemini-cli".to_string(),
            label: format!("cred-{id}"),
            metadata: CredentialMetadata::ApiKey {
                api_key: "k".to_string(),
            },
        }
    }

    fn routing(strategy: SelectionStrategy) -> RoutingConfig {
        RoutingConfig {
            strategy,
            health_aware: true,
            prefer_healthy: false,
        }
    }

    #[test]
    fn fill_first_picks_lowest_id() {
        let pool = pool();
        pool.insert(credential(2));
        pool.insert(credential(1));
        let lease = pool
            .acquire("gemini-cli", "m", &routing(SelectionStrategy::FillFirst))
            .unwrap();
        assert_eq!(lease.id(), 1);
        lease.succeed();
    }

    #[test]
    fn round_robin_rotates() {
        let pool = pool();
        pool.insert(credential(1));
        pool.insert(credential(2));
        let routing = routing(SelectionStrategy::RoundRobin);
        let first = pool.acquire("gemini-cli", "m", &routing).unwrap();
        let second = pool.acquire("gemini-cli", "m", &routing).unwrap();
        assert_ne!(first.id(), second.id());
        first.succeed();
        second.succeed();
    }

    #[test]
    fn least_busy_prefers_idle_credential() {
        let pool = pool();
        pool.insert(credential(1));
        pool.insert(credential(2));
        let routing = routing(SelectionStrategy::LeastBusy);
        let held = pool.acquire("gemini-cli", "m", &routing).unwrap();
        assert_eq!(held.id(), 1);
        let next = pool.acquire("gemini-cli", "m", &routing).unwrap();
        assert_eq!(next.id(), 2);
        held.succeed();
        next.succeed();
    }

    #[test]
    fn unknown_provider_and_disabled_credentials_error() {
        let pool = pool();
        assert_eq!(
            pool.acquire("nope", "m", &routing(SelectionStrategy::FillFirst))
                .err(),
            Some(AcquireError::ProviderUnknown)
        );
        pool.insert(credential(1));
        pool.set_enabled(1, false);
        assert_eq!(
            pool.acquire("gemini-cli", "m", &routing(SelectionStrategy::FillFirst))
                .err(),
            Some(AcquireError::NoActiveCredentials)
        );
    }

    #[test]
    fn rate_limit_failure_starts_cooldown_visible_in_snapshot() {
        let pool = pool();
        pool.insert(credential(1));
        pool.insert(credential(2));
        let routing = routing(SelectionStrategy::FillFirst);

        let lease = pool.acquire("gemini-cli", "m", &routing).unwrap();
        lease.fail(ErrorClass::RateLimited, Some(Duration::from_secs(2)));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].status, CredentialStatus::Cooldown);
        assert_eq!(snapshot[1].status, CredentialStatus::Active);

        // The cooled-down credential is skipped while the cooldown lasts.
        let next = pool.acquire("gemini-cli", "m", &routing).unwrap();
        assert_eq!(next.id(), 2);
        next.succeed();
    }

    #[test]
    fn dropped_lease_releases_in_flight_without_metrics() {
        let pool = pool();
        pool.insert(credential(1));
        let routing = routing(SelectionStrategy::FillFirst);
        {
            let _lease = pool.acquire("gemini-cli", "m", &routing).unwrap();
        }
        assert_eq!(pool.snapshot()[0].in_flight, 0);
        assert_eq!(pool.tracker().stats(1, "m").total, 0);
    }

    #[test]
    fn health_filter_falls_back_to_full_set() {
        let pool = pool();
        pool.insert(credential(1));
        pool.mark_unavailable(1, Duration::from_secs(60), CooldownReason::RateLimit);
        // Only credential is cooling down; the filtered set is empty, so the
        // pool serves from the full set.
        let lease = pool
            .acquire("gemini-cli", "m", &routing(SelectionStrategy::FillFirst))
            .unwrap();
        assert_eq!(lease.id(), 1);
        lease.cancel();
    }
}

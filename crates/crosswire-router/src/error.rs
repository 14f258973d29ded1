use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use crosswire_common::RetryPolicy;
use crosswire_pool::ErrorClass;
use crosswire_transform::TranslateError;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Malformed client request; 400-class, never retried.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Broken mapping invariant; 500-class, never retried.
    #[error("translation failed: {0}")]
    Translation(String),
    #[error("no fallback chain for model {0}")]
    NoRoute(String),
    #[error("no credentials available for provider {0}")]
    NoCredential(String),
    /// Upstream error surfaced to the client, body preserved.
    #[error("upstream returned status {status}")]
    Upstream { status: u16, body: Bytes },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
}

impl RouterError {
    /// Status the HTTP front end should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            RouterError::Validation(_) => 400,
            RouterError::Translation(_) => 500,
            RouterError::NoRoute(_) => 404,
            RouterError::NoCredential(_) => 503,
            RouterError::Upstream { status, .. } => *status,
            RouterError::Transport(_) => 502,
            RouterError::Cancelled => 499,
        }
    }
}

impl From<TranslateError> for RouterError {
    fn from(error: TranslateError) -> Self {
        match error {
            TranslateError::Validation(message) => RouterError::Validation(message),
            TranslateError::Internal(message) => RouterError::Translation(message),
        }
    }
}

/// HTTP status → credential error class.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        401 | 403 => ErrorClass::Auth,
        500..=599 => ErrorClass::Upstream,
        408 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Full-jitter exponential backoff: `rand(0, base * 2^attempt)` capped at
/// the policy maximum.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy
        .base_delay()
        .saturating_mul(1u32 << attempt.min(16));
    let cap = exp.min(policy.max_delay());
    if cap.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..=cap.as_nanos() as u64);
    Duration::from_nanos(nanos)
}

pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes_follow_policy_table() {
        assert_eq!(classify_status(429), ErrorClass::RateLimited);
        assert_eq!(classify_status(401), ErrorClass::Auth);
        assert_eq!(classify_status(503), ErrorClass::Upstream);
        assert_eq!(classify_status(404), ErrorClass::Permanent);
        assert_eq!(classify_status(408), ErrorClass::Transient);
    }

    #[test]
    fn backoff_stays_within_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 250,
        };
        for attempt in 0..8 {
            let delay = backoff_delay(&policy, attempt);
            assert!(delay <= Duration::from_millis(250), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn retry_after_parses_seconds() {
        assert_eq!(parse_retry_after(Some("2")), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(Some("")), None);
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}

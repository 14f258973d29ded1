use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: i64,
    pub output: i64,
    pub reasoning: i64,
    pub cached: i64,
    pub total: i64,
}

/// One request's worth of usage. Immutable after creation; `requested_at` is
/// set before the record enters the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub requested_at: OffsetDateTime,
    pub provider: String,
    pub model: String,
    /// Client-facing API identity; used as the `api` grouping key.
    pub api_key: String,
    pub source: String,
    pub auth_index: String,
    pub failed: bool,
    pub tokens: TokenCounts,
}

impl UsageRecord {
    /// Grouping key for the statistics view.
    pub fn api(&self) -> &str {
        if self.api_key.is_empty() {
            "unknown"
        } else {
            &self.api_key
        }
    }
}

//! In-memory statistics view, rebuilt from the store on startup and fed by
//! the pipeline at runtime.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::record::{TokenCounts, UsageRecord};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModelStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub tokens: TokenCounts,
}

impl ModelStats {
    fn absorb(&mut self, record: &UsageRecord) {
        self.total_requests += 1;
        if record.failed {
            self.failed_requests += 1;
        }
        self.tokens.input += record.tokens.input;
        self.tokens.output += record.tokens.output;
        self.tokens.reasoning += record.tokens.reasoning;
        self.tokens.cached += record.tokens.cached;
        self.tokens.total += record.tokens.total;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub tokens: TokenCounts,
    /// Per (api, model) rollups, sorted by key for stable output.
    pub per_model: Vec<((String, String), ModelStats)>,
}

#[derive(Debug, Default)]
pub struct RequestStatistics {
    inner: Mutex<HashMap<(String, String), ModelStats>>,
}

impl RequestStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: &UsageRecord) {
        let key = (record.api().to_string(), record.model.clone());
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(key).or_default().absorb(record);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut per_model: Vec<((String, String), ModelStats)> = inner
            .iter()
            .map(|(key, stats)| (key.clone(), *stats))
            .collect();
        per_model.sort_by(|a, b| a.0.cmp(&b.0));

        let mut snapshot = StatsSnapshot {
            total_requests: 0,
            failed_requests: 0,
            tokens: TokenCounts::default(),
            per_model,
        };
        for (_, stats) in &snapshot.per_model {
            snapshot.total_requests += stats.total_requests;
            snapshot.failed_requests += stats.failed_requests;
            snapshot.tokens.input += stats.tokens.input;
            snapshot.tokens.output += stats.tokens.output;
            snapshot.tokens.reasoning += stats.tokens.reasoning;
            snapshot.tokens.cached += stats.tokens.cached;
            snapshot.tokens.total += stats.tokens.total;
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn record(api: &str, model: &str, total: i64, failed: bool) -> UsageRecord {
        UsageRecord {
            requested_at: OffsetDateTime::UNIX_EPOCH,
            provider: "gemini-cli".to_string(),
            model: model.to_string(),
            api_key: api.to_string(),
            source: String::new(),
            auth_index: "0".to_string(),
            failed,
            tokens: TokenCounts {
                input: total / 2,
                output: total - total / 2,
                reasoning: 0,
                cached: 0,
                total,
            },
        }
    }

    #[test]
    fn snapshot_aggregates_across_models() {
        let stats = RequestStatistics::new();
        stats.record(&record("key-a", "gemini-2.5-pro", 10, false));
        stats.record(&record("key-a", "gemini-2.5-flash", 4, true));
        stats.record(&record("", "gemini-2.5-pro", 6, false));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.tokens.total, 20);
        assert_eq!(snapshot.per_model.len(), 3);
        // Empty api keys fold into "unknown".
        assert!(snapshot
            .per_model
            .iter()
            .any(|((api, _), _)| api == "unknown"));
    }
}

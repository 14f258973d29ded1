//! Optional response cache, keyed by canonical-request fingerprint.
//!
//! LRU + TTL over complete response bytes. Concurrent misses for the same
//! fingerprint are single-flighted: the second caller waits on the first's
//! result instead of issuing its own upstream call. Streaming requests
//! bypass this entirely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::error::RouterError;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub body: Bytes,
    pub content_type: String,
}

struct Slot {
    value: CachedResponse,
    inserted: Instant,
    last_used: u64,
}

#[derive(Default)]
struct Index {
    slots: HashMap<String, Slot>,
    tick: u64,
}

pub struct ResponseCache {
    capacity: usize,
    ttl: Duration,
    index: Mutex<Index>,
    /// One cell per fingerprint currently being computed.
    in_flight: Mutex<HashMap<String, Arc<OnceCell<CachedResponse>>>>,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            index: Mutex::new(Index::default()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.tick += 1;
        let tick = index.tick;
        let expired =
            matches!(index.slots.get(key), Some(slot) if slot.inserted.elapsed() > self.ttl);
        if expired {
            index.slots.remove(key);
            return None;
        }
        let slot = index.slots.get_mut(key)?;
        slot.last_used = tick;
        Some(slot.value.clone())
    }

    fn insert(&self, key: &str, value: CachedResponse) {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.tick += 1;
        let tick = index.tick;
        index.slots.insert(
            key.to_string(),
            Slot {
                value,
                inserted: Instant::now(),
                last_used: tick,
            },
        );
        while index.slots.len() > self.capacity {
            let Some(oldest) = index
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            index.slots.remove(&oldest);
        }
    }

    /// Fill happens outside the index lock; concurrent callers for the same
    /// key coalesce onto one computation.
    pub async fn get_or_fill<F, Fut>(&self, key: &str, fill: F) -> Result<CachedResponse, RouterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, RouterError>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                let value = fill().await?;
                self.insert(key, value.clone());
                Ok::<_, RouterError>(value)
            })
            .await
            .map(|value| value.clone());

        // Whether the fill succeeded or failed, the flight is over; a failed
        // fingerprint may be retried by the next caller.
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = in_flight.get(key)
            && Arc::ptr_eq(current, &cell)
        {
            in_flight.remove(key);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response(text: &str) -> CachedResponse {
        CachedResponse {
            body: Bytes::from(text.to_string()),
            content_type: "application/json".to_string(),
        }
    }

    #[tokio::test]
    async fn second_caller_waits_on_first_fill() {
        let cache = Arc::new(ResponseCache::new(8, Duration::from_secs(60)));
        let fills = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fills = fills.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fill("fp", || async move {
                        fills.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(response("cached"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().body, Bytes::from("cached"));
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fill_can_be_retried() {
        let cache = ResponseCache::new(8, Duration::from_secs(60));
        let result = cache
            .get_or_fill("fp", || async {
                Err(RouterError::Transport("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        let ok = cache
            .get_or_fill("fp", || async { Ok(response("second")) })
            .await
            .unwrap();
        assert_eq!(ok.body, Bytes::from("second"));
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.insert("a", response("a"));
        cache.insert("b", response("b"));
        assert!(cache.get("a").is_some());
        cache.insert("c", response("c"));
        // "b" was the least recently used entry.
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = ResponseCache::new(2, Duration::from_millis(10));
        cache.insert("a", response("a"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("a").is_none());
    }
}

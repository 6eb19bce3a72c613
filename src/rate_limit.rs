//! Fixed-window rate limiting over named buckets.
//!
//! Counters live behind [`CounterStore`] so several service instances can
//! share one backing store. The in-memory store serialises every
//! check-and-increment under a single lock.
use crate::clock::Clock;
use crate::error::GateError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

pub const GENERAL_BUCKET: &str = "general";
pub const VOTE_BUCKET: &str = "vote";
pub const ADMIN_BUCKET: &str = "admin";
pub const READ_BUCKET: &str = "read";
pub const GLOBAL_IP_BUCKET: &str = "global_ip";

const MAX_COUNTER_ENTRIES: usize = 10_000;

/// Inclusive boundary: a stored count equal to the limit already rejects.
pub fn should_rate_limit(count: u32, limit: u32) -> bool {
    count >= limit
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub limit: u32,
    pub window_ms: i64,
}

impl BucketConfig {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    pub count: u32,
    pub reset_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDecision {
    Allowed { count: u32, reset_at_ms: i64 },
    Limited { reset_at_ms: i64 },
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically checks `key` against `config` and counts the request when
    /// it is allowed.
    async fn check_and_increment(
        &self,
        key: &str,
        config: BucketConfig,
        now_ms: i64,
    ) -> CounterDecision;
}

#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self, key: &str) -> Option<WindowCounter> {
        self.counters.lock().await.get(key).copied()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        config: BucketConfig,
        now_ms: i64,
    ) -> CounterDecision {
        let mut guard = self.counters.lock().await;
        if guard.len() > MAX_COUNTER_ENTRIES {
            guard.retain(|_, c| now_ms < c.reset_at_ms);
        }
        let entry = guard.entry(key.to_string()).or_insert(WindowCounter {
            count: 0,
            reset_at_ms: now_ms + config.window_ms,
        });
        if now_ms >= entry.reset_at_ms {
            entry.count = 0;
            entry.reset_at_ms = now_ms + config.window_ms;
        }
        if should_rate_limit(entry.count, config.limit) {
            return CounterDecision::Limited {
                reset_at_ms: entry.reset_at_ms,
            };
        }
        entry.count += 1;
        CounterDecision::Allowed {
            count: entry.count,
            reset_at_ms: entry.reset_at_ms,
        }
    }
}

pub struct RateLimiter {
    buckets: HashMap<String, BucketConfig>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        buckets: HashMap<String, BucketConfig>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            buckets,
            store,
            clock,
        }
    }

    pub fn bucket(&self, name: &str) -> Option<BucketConfig> {
        self.buckets.get(name).copied()
    }

    /// Counts one request for `identity` in `bucket`, or rejects it with the
    /// number of seconds until the window resets.
    pub async fn check(&self, bucket: &str, identity: &str) -> Result<u32, GateError> {
        let config = self
            .bucket(bucket)
            .ok_or_else(|| anyhow::anyhow!("Unknown rate limit bucket '{}'", bucket))?;
        let now_ms = self.clock.now_ms();
        let key = format!("{bucket}:{identity}");
        match self.store.check_and_increment(&key, config, now_ms).await {
            CounterDecision::Allowed { count, .. } => Ok(count),
            CounterDecision::Limited { reset_at_ms } => {
                let retry_after_secs = retry_after_secs(reset_at_ms, now_ms);
                warn!(
                    bucket = %bucket,
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                Err(GateError::RateLimited {
                    bucket: bucket.to_string(),
                    retry_after_secs,
                })
            }
        }
    }
}

fn retry_after_secs(reset_at_ms: i64, now_ms: i64) -> u64 {
    let remaining = (reset_at_ms - now_ms).max(0) as u64;
    remaining.div_ceil(1000).max(1)
}

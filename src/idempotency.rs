use crate::events::EventType;
use crate::gate::EventOutcome;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Width of an idempotency time bucket.
pub const BUCKET_MS: i64 = 16_000;
const MAX_STORED_KEYS: usize = 50_000;

pub fn time_bucket(now_ms: i64) -> i64 {
    now_ms.div_euclid(BUCKET_MS)
}

/// Deterministic key for one logical submission. Identical inputs inside the
/// same 16s bucket collapse to the same key.
pub fn generate_idempotency_key(
    actor_id: Option<&str>,
    ip_hash: &str,
    subject_id: &str,
    event_type: EventType,
    now_ms: i64,
) -> String {
    let identity = actor_id.filter(|a| !a.is_empty()).unwrap_or(ip_hash);
    format!(
        "{}-{}-{}-{}",
        identity,
        subject_id,
        event_type,
        time_bucket(now_ms)
    )
}

/// "Insert if absent" storage for accepted outcomes, keyed by idempotency key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str, now_ms: i64) -> Option<EventOutcome>;

    /// Stores `outcome` unless the key is already taken, in which case the
    /// stored outcome is returned and nothing changes.
    async fn insert_if_absent(
        &self,
        key: &str,
        outcome: EventOutcome,
        now_ms: i64,
    ) -> Option<EventOutcome>;

    /// Replaces the outcome stored under a key this caller already claimed.
    async fn update(&self, key: &str, outcome: EventOutcome);
}

struct StoredOutcome {
    outcome: EventOutcome,
    stored_at_ms: i64,
}

pub struct InMemoryIdempotencyStore {
    ttl_ms: i64,
    entries: Mutex<HashMap<String, StoredOutcome>>,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_ms: (ttl_secs as i64).saturating_mul(1000),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str, now_ms: i64) -> Option<EventOutcome> {
        let guard = self.entries.lock().await;
        guard
            .get(key)
            .filter(|s| now_ms - s.stored_at_ms <= self.ttl_ms)
            .map(|s| s.outcome.clone())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        outcome: EventOutcome,
        now_ms: i64,
    ) -> Option<EventOutcome> {
        let mut guard = self.entries.lock().await;
        let ttl = self.ttl_ms;
        guard.retain(|_, s| now_ms - s.stored_at_ms <= ttl);
        if guard.len() >= MAX_STORED_KEYS {
            tracing::warn!(
                entries = guard.len(),
                "Idempotency store at capacity, clearing"
            );
            guard.clear();
        }
        if let Some(existing) = guard.get(key) {
            return Some(existing.outcome.clone());
        }
        guard.insert(
            key.to_string(),
            StoredOutcome {
                outcome,
                stored_at_ms: now_ms,
            },
        );
        None
    }

    async fn update(&self, key: &str, outcome: EventOutcome) {
        if let Some(stored) = self.entries.lock().await.get_mut(key) {
            stored.outcome = outcome;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::gate::EventStatus;

    fn outcome(key: &str) -> EventOutcome {
        EventOutcome {
            status: EventStatus::Counted,
            idempotency_key: key.to_string(),
            fingerprint: Fingerprint {
                ip_hash: "ip".into(),
                ua_hash: "ua".into(),
            },
            set_view_marker: false,
        }
    }

    // 2025-01-01T00:00:00Z, a multiple of 16s
    const T0: i64 = 1_735_689_600_000;

    #[test]
    fn same_bucket_same_key() {
        let a = generate_idempotency_key(None, "iphash", "rule-1", EventType::Copy, T0);
        let b = generate_idempotency_key(None, "iphash", "rule-1", EventType::Copy, T0 + 15_000);
        assert_eq!(a, b);
        assert_eq!(a, format!("iphash-rule-1-COPY-{}", T0 / 16_000));
    }

    #[test]
    fn crossing_a_bucket_changes_key() {
        let a = generate_idempotency_key(None, "iphash", "rule-1", EventType::Copy, T0);
        let b = generate_idempotency_key(None, "iphash", "rule-1", EventType::Copy, T0 + 17_000);
        assert_ne!(a, b);

        let edge = generate_idempotency_key(None, "iphash", "rule-1", EventType::Copy, T0 - 1);
        assert_ne!(a, edge);
    }

    #[test]
    fn actor_takes_precedence_over_ip() {
        let key = generate_idempotency_key(Some("user-7"), "iphash", "r", EventType::Vote, T0);
        assert!(key.starts_with("user-7-r-VOTE-"));
        let key = generate_idempotency_key(Some(""), "iphash", "r", EventType::Vote, T0);
        assert!(key.starts_with("iphash-"));
    }

    #[tokio::test]
    async fn first_insert_wins() {
        let store = InMemoryIdempotencyStore::new(600);
        assert!(store.insert_if_absent("k", outcome("k"), T0).await.is_none());

        let mut second = outcome("k");
        second.status = EventStatus::Suppressed;
        let prior = store.insert_if_absent("k", second, T0 + 1).await.unwrap();
        assert_eq!(prior.status, EventStatus::Counted);
        assert_eq!(store.get("k", T0 + 2).await.unwrap().status, EventStatus::Counted);
    }

    #[tokio::test]
    async fn update_replaces_claimed_outcome_only() {
        let store = InMemoryIdempotencyStore::new(600);
        store.insert_if_absent("k", outcome("k"), T0).await;
        let mut settled = outcome("k");
        settled.status = EventStatus::Suppressed;
        store.update("k", settled).await;
        assert_eq!(store.get("k", T0 + 1).await.unwrap().status, EventStatus::Suppressed);

        store.update("unclaimed", outcome("unclaimed")).await;
        assert!(store.get("unclaimed", T0 + 1).await.is_none());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = InMemoryIdempotencyStore::new(10);
        store.insert_if_absent("k", outcome("k"), T0).await;
        assert!(store.get("k", T0 + 10_000).await.is_some());
        assert!(store.get("k", T0 + 10_001).await.is_none());
        assert!(store.insert_if_absent("k", outcome("k"), T0 + 10_001).await.is_none());
        assert_eq!(store.len().await, 1);
    }
}

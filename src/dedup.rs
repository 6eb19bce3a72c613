//! Short-window suppression of repeat views for one viewer and subject.
//!
//! Two layers share the same window: a client-held `view_<hash>` cookie whose
//! value is the epoch-ms of the last counted view, and a server-side
//! recent-viewer record for clients that do not keep cookies. Both are
//! best-effort; the per-IP daily cap in `caps` is the hard backstop.
use crate::clock::Clock;
use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, SameSite};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

const MAX_MARKERS: usize = 100_000;

/// Java-style 31x rolling hash over UTF-16 units, rendered in base 36.
/// Keeps cookie names short; not a security boundary.
pub fn simple_hash(input: &str) -> String {
    let mut hash: i32 = 0;
    for unit in input.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(unit as i32);
    }
    to_base36((hash as i64).unsigned_abs())
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

pub fn cookie_name(subject_id: &str) -> String {
    format!("view_{}", simple_hash(subject_id))
}

/// Marker values are epoch milliseconds; anything else is ignored.
pub fn parse_marker(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupMarker {
    pub last_seen_at_ms: i64,
    pub expires_at_ms: i64,
}

#[async_trait]
pub trait RecentViewStore: Send + Sync {
    async fn get(&self, key: &str, now_ms: i64) -> Option<DedupMarker>;

    async fn put(&self, key: &str, marker: DedupMarker);

    /// Atomic check-then-set: returns the live marker if one exists (leaving
    /// it untouched), otherwise stores `fresh` and returns `None`.
    async fn check_and_put(&self, key: &str, fresh: DedupMarker, now_ms: i64)
        -> Option<DedupMarker>;
}

#[derive(Default)]
pub struct InMemoryRecentViewStore {
    markers: Mutex<HashMap<String, DedupMarker>>,
}

impl InMemoryRecentViewStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecentViewStore for InMemoryRecentViewStore {
    async fn get(&self, key: &str, now_ms: i64) -> Option<DedupMarker> {
        self.markers
            .lock()
            .await
            .get(key)
            .copied()
            .filter(|m| now_ms < m.expires_at_ms)
    }

    async fn put(&self, key: &str, marker: DedupMarker) {
        self.markers.lock().await.insert(key.to_string(), marker);
    }

    async fn check_and_put(
        &self,
        key: &str,
        fresh: DedupMarker,
        now_ms: i64,
    ) -> Option<DedupMarker> {
        let mut guard = self.markers.lock().await;
        if guard.len() > MAX_MARKERS {
            guard.retain(|_, m| now_ms < m.expires_at_ms);
        }
        if let Some(existing) = guard.get(key).filter(|m| now_ms < m.expires_at_ms) {
            return Some(*existing);
        }
        guard.insert(key.to_string(), fresh);
        None
    }
}

pub struct ViewDedupGuard {
    window_minutes: i64,
    store: Arc<dyn RecentViewStore>,
    clock: Arc<dyn Clock>,
}

impl ViewDedupGuard {
    pub fn new(window_minutes: i64, store: Arc<dyn RecentViewStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_minutes,
            store,
            clock,
        }
    }

    fn window_ms(&self) -> i64 {
        self.window_minutes * 60_000
    }

    fn is_fresh(&self, last_seen_ms: i64, now_ms: i64) -> bool {
        now_ms - last_seen_ms < self.window_ms()
    }

    fn store_key(subject_id: &str, viewer: &str) -> String {
        format!("{subject_id}:{viewer}")
    }

    /// True when a client marker value is well formed and inside the window.
    pub fn should_dedupe_marker(&self, marker: Option<&str>) -> bool {
        marker
            .and_then(parse_marker)
            .is_some_and(|ts| self.is_fresh(ts, self.clock.now_ms()))
    }

    /// Marker cookie recording a counted view of `subject_id` now.
    pub fn marker_cookie(&self, subject_id: &str) -> Cookie<'static> {
        let now_ms = self.clock.now_ms();
        let expires =
            OffsetDateTime::from_unix_timestamp((now_ms + self.window_ms()).div_euclid(1000)).ok();
        Cookie::build((cookie_name(subject_id), now_ms.to_string()))
            .path("/")
            .same_site(SameSite::Lax)
            .expires(expires)
            .build()
    }

    pub async fn should_dedupe_view(&self, subject_id: &str, viewer: &str) -> bool {
        let now_ms = self.clock.now_ms();
        self.store
            .get(&Self::store_key(subject_id, viewer), now_ms)
            .await
            .is_some_and(|m| self.is_fresh(m.last_seen_at_ms, now_ms))
    }

    pub async fn set_marker(&self, subject_id: &str, viewer: &str) {
        let now_ms = self.clock.now_ms();
        self.store
            .put(&Self::store_key(subject_id, viewer), self.marker_at(now_ms))
            .await;
    }

    /// Returns true when this view should be suppressed; otherwise records
    /// it as the latest counted view in one atomic step.
    pub async fn check_and_mark(&self, subject_id: &str, viewer: &str) -> bool {
        let now_ms = self.clock.now_ms();
        let key = Self::store_key(subject_id, viewer);
        // live markers expire exactly one window after last_seen
        let existing = self
            .store
            .check_and_put(&key, self.marker_at(now_ms), now_ms)
            .await;
        if existing.is_some() {
            debug!(subject_id = %subject_id, "Repeat view inside dedup window");
        }
        existing.is_some()
    }

    fn marker_at(&self, now_ms: i64) -> DedupMarker {
        DedupMarker {
            last_seen_at_ms: now_ms,
            expires_at_ms: now_ms + self.window_ms(),
        }
    }
}

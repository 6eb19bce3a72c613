//! Ingestion pipeline deciding whether and how an interaction is counted.
use crate::clock::Clock;
use crate::config::Settings;
use crate::dedup::{InMemoryRecentViewStore, RecentViewStore, ViewDedupGuard};
use crate::error::GateError;
use crate::events::{EventType, InboundEvent};
use crate::fingerprint::{
    calculate_entropy, extract_ip, extract_ua, Fingerprint, Fingerprinter, RequestHeaders,
};
use crate::idempotency::{generate_idempotency_key, IdempotencyStore, InMemoryIdempotencyStore};
use crate::metrics::{InMemoryMetricsRepository, MetricsRepository, MetricsTotals};
use crate::rate_limit::{
    CounterStore, InMemoryCounterStore, RateLimiter, GENERAL_BUCKET, GLOBAL_IP_BUCKET,
    VOTE_BUCKET,
};
use crate::trending::TrendingCalculator;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

const LOW_ENTROPY_UA_BITS: f64 = 2.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Counted,
    /// Same idempotency key seen before; the earlier result stands.
    Duplicate,
    /// Repeat view inside the dedup window; accepted but not counted.
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
    pub status: EventStatus,
    pub idempotency_key: String,
    pub fingerprint: Fingerprint,
    /// Whether the caller should hand the client a fresh view marker.
    pub set_view_marker: bool,
}

impl EventOutcome {
    fn replayed(mut self) -> Self {
        self.status = EventStatus::Duplicate;
        self.set_view_marker = false;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub event: InboundEvent,
    pub headers: RequestHeaders,
    /// Authenticated actor, if the upstream auth layer resolved one.
    pub actor_id: Option<String>,
    /// Value of the client's `view_<hash>` marker for this subject.
    pub view_marker: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMetrics {
    pub recent: MetricsTotals,
    pub long: MetricsTotals,
}

/// Shared state backing the gate. Swap in shared implementations to run
/// several instances against one set of limits.
#[derive(Clone)]
pub struct GateStores {
    pub counters: Arc<dyn CounterStore>,
    pub recent_views: Arc<dyn RecentViewStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub metrics: Arc<dyn MetricsRepository>,
}

impl GateStores {
    pub fn in_memory(settings: &Settings) -> Self {
        Self {
            counters: Arc::new(InMemoryCounterStore::new()),
            recent_views: Arc::new(InMemoryRecentViewStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new(settings.idempotency_ttl_secs)),
            metrics: Arc::new(InMemoryMetricsRepository::new(
                settings.caps(),
                settings.metrics_window_long_days as i64,
            )),
        }
    }
}

pub struct EventGate {
    fingerprinter: Fingerprinter,
    limiter: RateLimiter,
    dedup: ViewDedupGuard,
    idempotency: Arc<dyn IdempotencyStore>,
    metrics: Arc<dyn MetricsRepository>,
    trending: TrendingCalculator,
    long_window_days: usize,
    clock: Arc<dyn Clock>,
}

fn bucket_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Vote => VOTE_BUCKET,
        _ => GENERAL_BUCKET,
    }
}

impl EventGate {
    pub fn new(settings: &Settings, stores: GateStores, clock: Arc<dyn Clock>) -> Self {
        Self {
            fingerprinter: Fingerprinter::new(settings.fingerprint_salt.clone()),
            limiter: RateLimiter::new(settings.rate_buckets(), stores.counters, clock.clone()),
            dedup: ViewDedupGuard::new(
                settings.view_dedup_window_min,
                stores.recent_views,
                clock.clone(),
            ),
            idempotency: stores.idempotency,
            metrics: stores.metrics,
            trending: settings.trending(),
            long_window_days: settings.metrics_window_long_days,
            clock,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn dedup(&self) -> &ViewDedupGuard {
        &self.dedup
    }

    /// Rate-limit identity for read endpoints: the actor when known, else the
    /// salted IP hash. Raw addresses never reach the counter store.
    pub fn requester_identity(
        &self,
        actor_id: Option<String>,
        headers: &RequestHeaders,
    ) -> Result<String, GateError> {
        match actor_id {
            Some(actor) => Ok(actor),
            None => self.fingerprinter.hash_ip(&extract_ip(headers)),
        }
    }

    pub async fn submit(&self, req: SubmitRequest) -> Result<EventOutcome, GateError> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        let ip = extract_ip(&req.headers);
        let ua = extract_ua(&req.headers);
        let event = req.event.validate(req.actor_id, ip, ua, now)?;

        let fingerprint = self
            .fingerprinter
            .fingerprint_values(&event.source_ip, &event.user_agent)
            .inspect_err(|e| error!("Failed to fingerprint event: {}", e))?;
        if calculate_entropy(&event.user_agent) < LOW_ENTROPY_UA_BITS {
            debug!(ua_hash = %fingerprint.ua_hash, "Low-entropy user agent");
        }

        let identity = event
            .actor_id
            .clone()
            .unwrap_or_else(|| fingerprint.ip_hash.clone());
        let key = match req.event.idempotency_key.as_deref().map(str::trim) {
            // client keys are scoped to the submitting identity
            Some(client_key) => format!("{identity}:{client_key}"),
            None => generate_idempotency_key(
                event.actor_id.as_deref(),
                &fingerprint.ip_hash,
                &event.subject_id,
                event.event_type,
                now_ms,
            ),
        };

        // Retries replay the stored result without spending quota.
        if let Some(prior) = self.idempotency.get(&key, now_ms).await {
            debug!(idempotency_key = %key, "Duplicate submission");
            return Ok(prior.replayed());
        }

        self.limiter
            .check(GLOBAL_IP_BUCKET, &fingerprint.ip_hash)
            .await?;
        self.limiter
            .check(bucket_for(event.event_type), &identity)
            .await?;

        // Anonymous viewers are keyed on the UA family so a browser update
        // inside the window does not count as a new viewer.
        let viewer = match (event.event_type, event.actor_id.clone()) {
            (EventType::View, Some(actor)) => Some(actor),
            (EventType::View, None) => Some(format!(
                "{}:{}",
                fingerprint.ip_hash,
                self.fingerprinter.hash_ua_family(&event.user_agent)?
            )),
            _ => None,
        };

        let mut outcome = EventOutcome {
            status: EventStatus::Counted,
            idempotency_key: key.clone(),
            fingerprint,
            set_view_marker: false,
        };

        // Claim the key before touching dedup state; only the winner goes on.
        if let Some(prior) = self
            .idempotency
            .insert_if_absent(&key, outcome.clone(), now_ms)
            .await
        {
            debug!(idempotency_key = %key, "Lost idempotent insert race");
            return Ok(prior.replayed());
        }

        if let Some(viewer) = viewer {
            if self.dedup.should_dedupe_marker(req.view_marker.as_deref())
                || self.dedup.check_and_mark(&event.subject_id, &viewer).await
            {
                outcome.status = EventStatus::Suppressed;
            } else {
                outcome.set_view_marker = true;
            }
            self.idempotency.update(&key, outcome.clone()).await;
        }

        match outcome.status {
            EventStatus::Counted => {
                self.metrics
                    .record(&event, &outcome.fingerprint, now.date_naive())
                    .await?;
                info!(
                    subject_id = %event.subject_id,
                    event_type = %event.event_type,
                    "Counted event"
                );
            }
            EventStatus::Suppressed => {
                debug!(subject_id = %event.subject_id, "View suppressed");
            }
            EventStatus::Duplicate => {}
        }

        Ok(outcome)
    }

    /// Scores the subject over the recent window and stores the result on
    /// today's bucket when one exists.
    pub async fn trending_score(&self, subject_id: &str) -> Result<f64, GateError> {
        let today = self.clock.today();
        let window = self
            .metrics
            .window(subject_id, today, self.trending.window_days)
            .await?;
        let score = self.trending.score_buckets(&window);
        self.metrics.set_score(subject_id, today, score).await?;
        Ok(score)
    }

    pub fn recent_window_days(&self) -> usize {
        self.trending.window_days
    }

    pub async fn subject_metrics(&self, subject_id: &str) -> Result<SubjectMetrics, GateError> {
        let today = self.clock.today();
        let long = self
            .metrics
            .window(subject_id, today, self.long_window_days)
            .await?;
        let recent_len = self.trending.window_days.min(long.len());
        Ok(SubjectMetrics {
            recent: MetricsTotals::from_window(&long[..recent_len]),
            long: MetricsTotals::from_window(&long),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fingerprint::hash_ip;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};

    fn settings() -> Settings {
        Settings {
            fingerprint_salt: "salt".to_string(),
            ..Settings::default()
        }
    }

    fn gate_at(clock: Arc<ManualClock>) -> EventGate {
        let settings = settings();
        EventGate::new(&settings, GateStores::in_memory(&settings), clock)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap(),
        ))
    }

    fn request(event_type: &str, subject: &str) -> SubmitRequest {
        SubmitRequest {
            event: InboundEvent {
                event_type: event_type.to_string(),
                subject_id: Some(subject.to_string()),
                ..Default::default()
            },
            headers: RequestHeaders::new()
                .with("x-forwarded-for", "203.0.113.195, 70.41.3.18")
                .with("user-agent", "Mozilla/5.0 (X11; Linux x86_64)"),
            actor_id: None,
            view_marker: None,
        }
    }

    #[tokio::test]
    async fn counts_then_collapses_duplicates() {
        let clock = clock();
        let gate = gate_at(clock.clone());

        let first = gate.submit(request("COPY", "rule-1")).await.unwrap();
        assert_eq!(first.status, EventStatus::Counted);

        clock.advance(Duration::seconds(5));
        let again = gate.submit(request("COPY", "rule-1")).await.unwrap();
        assert_eq!(again.status, EventStatus::Duplicate);
        assert_eq!(again.idempotency_key, first.idempotency_key);

        let m = gate.subject_metrics("rule-1").await.unwrap();
        assert_eq!(m.recent.copies, 1);
    }

    #[tokio::test]
    async fn repeat_views_are_suppressed() {
        let clock = clock();
        let gate = gate_at(clock.clone());

        let first = gate.submit(request("VIEW", "rule-1")).await.unwrap();
        assert_eq!(first.status, EventStatus::Counted);
        assert!(first.set_view_marker);

        clock.advance(Duration::seconds(30));
        let second = gate.submit(request("VIEW", "rule-1")).await.unwrap();
        assert_eq!(second.status, EventStatus::Suppressed);
        assert!(!second.set_view_marker);

        clock.advance(Duration::minutes(10));
        let mut with_marker = request("VIEW", "rule-1");
        with_marker.view_marker = Some((clock.now_ms() - 1_000).to_string());
        let third = gate.submit(with_marker).await.unwrap();
        assert_eq!(third.status, EventStatus::Suppressed);

        assert_eq!(gate.subject_metrics("rule-1").await.unwrap().recent.views, 1);
    }

    #[tokio::test]
    async fn client_keys_are_scoped_and_honoured() {
        let clock = clock();
        let gate = gate_at(clock.clone());
        let mut req = request("SAVE", "rule-1");
        req.event.idempotency_key = Some("retry-1".to_string());
        let first = gate.submit(req.clone()).await.unwrap();
        assert!(first.idempotency_key.ends_with(":retry-1"));

        clock.advance(Duration::minutes(2));
        assert_eq!(
            gate.submit(req).await.unwrap().status,
            EventStatus::Duplicate
        );
    }

    #[tokio::test]
    async fn global_ip_ceiling_applies_before_buckets() {
        let clock = clock();
        let gate = gate_at(clock.clone());
        for i in 0..20 {
            let res = gate.submit(request("COPY", &format!("rule-{i}"))).await;
            assert!(res.is_ok(), "event {i} rejected");
        }
        match gate.submit(request("COPY", "rule-x")).await {
            Err(GateError::RateLimited { bucket, .. }) => assert_eq!(bucket, GLOBAL_IP_BUCKET),
            other => panic!("expected global limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn votes_use_their_own_bucket() {
        let clock = clock();
        let gate = gate_at(clock.clone());
        for i in 0..10 {
            let mut req = request("VOTE", &format!("rule-{i}"));
            req.actor_id = Some("user-1".to_string());
            gate.submit(req).await.unwrap();
        }
        let mut req = request("VOTE", "rule-last");
        req.actor_id = Some("user-1".to_string());
        assert!(matches!(
            gate.submit(req).await,
            Err(GateError::RateLimited { bucket, .. }) if bucket == VOTE_BUCKET
        ));
    }

    #[tokio::test]
    async fn validation_happens_first() {
        let gate = gate_at(clock());
        let mut req = request("VIEW", "rule-1");
        req.event.subject_id = None;
        assert!(matches!(
            gate.submit(req).await,
            Err(GateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn trending_score_reflects_recorded_activity() {
        let clock = clock();
        let gate = gate_at(clock.clone());
        gate.submit(request("COPY", "rule-1")).await.unwrap();
        gate.submit(request("SAVE", "rule-1")).await.unwrap();
        gate.submit(request("VIEW", "rule-1")).await.unwrap();
        // 0.4 + 0.3 + 0.2
        assert_eq!(gate.trending_score("rule-1").await.unwrap(), 0.9);

        clock.advance(Duration::days(1));
        // e^-0.25 * 0.9 = 0.7009...
        assert_eq!(gate.trending_score("rule-1").await.unwrap(), 0.7);
        assert_eq!(gate.trending_score("missing").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn retries_replay_even_when_quota_is_spent() {
        let clock = clock();
        let gate = gate_at(clock.clone());
        for i in 0..19 {
            gate.submit(request("COPY", &format!("rule-{i}"))).await.unwrap();
        }
        let last = gate.submit(request("COPY", "rule-last")).await.unwrap();
        assert_eq!(last.status, EventStatus::Counted);

        clock.advance(Duration::seconds(2));
        let retry = gate.submit(request("COPY", "rule-last")).await.unwrap();
        assert_eq!(retry.status, EventStatus::Duplicate);
        assert_eq!(retry.idempotency_key, last.idempotency_key);

        assert!(matches!(
            gate.submit(request("COPY", "rule-new")).await,
            Err(GateError::RateLimited { bucket, .. }) if bucket == GLOBAL_IP_BUCKET
        ));
    }

    /// Yields before every insert so concurrent submits interleave there.
    struct YieldingStore(InMemoryIdempotencyStore);

    #[async_trait]
    impl IdempotencyStore for YieldingStore {
        async fn get(&self, key: &str, now_ms: i64) -> Option<EventOutcome> {
            self.0.get(key, now_ms).await
        }

        async fn insert_if_absent(
            &self,
            key: &str,
            outcome: EventOutcome,
            now_ms: i64,
        ) -> Option<EventOutcome> {
            tokio::task::yield_now().await;
            self.0.insert_if_absent(key, outcome, now_ms).await
        }

        async fn update(&self, key: &str, outcome: EventOutcome) {
            self.0.update(key, outcome).await
        }
    }

    #[tokio::test]
    async fn simultaneous_identical_views_count_once() {
        let settings = settings();
        let stores = GateStores {
            idempotency: Arc::new(YieldingStore(InMemoryIdempotencyStore::new(600))),
            ..GateStores::in_memory(&settings)
        };
        let gate = EventGate::new(&settings, stores, clock());

        let (a, b) = tokio::join!(
            gate.submit(request("VIEW", "rule-1")),
            gate.submit(request("VIEW", "rule-1"))
        );
        let mut statuses = [a.unwrap().status, b.unwrap().status];
        statuses.sort_by_key(|s| *s as u8);
        assert_eq!(statuses, [EventStatus::Counted, EventStatus::Duplicate]);
        assert_eq!(gate.subject_metrics("rule-1").await.unwrap().recent.views, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_submits_record_once() {
        let gate = Arc::new(gate_at(clock()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.submit(request("VIEW", "rule-1")).await.unwrap().status
            }));
        }
        let mut counted = 0;
        for h in handles {
            match h.await.unwrap() {
                EventStatus::Counted => counted += 1,
                EventStatus::Duplicate => {}
                EventStatus::Suppressed => panic!("duplicate submit was suppressed"),
            }
        }
        assert_eq!(counted, 1);
        assert_eq!(gate.subject_metrics("rule-1").await.unwrap().recent.views, 1);
    }

    #[tokio::test]
    async fn scoring_unknown_subjects_stores_nothing() {
        let clock = clock();
        let gate = gate_at(clock.clone());
        let score = gate.trending_score("never-seen").await.unwrap();
        assert_eq!(score, 0.0);
        assert!(!score.is_sign_negative());
        let window = gate
            .metrics
            .window("never-seen", clock.today(), 1)
            .await
            .unwrap();
        assert!(window[0].is_none());
    }

    #[tokio::test]
    async fn read_identity_hashes_the_address() {
        let gate = gate_at(clock());
        let headers = RequestHeaders::new().with("x-forwarded-for", "203.0.113.195");
        let identity = gate.requester_identity(None, &headers).unwrap();
        assert_eq!(identity, hash_ip("203.0.113.195", "salt").unwrap());
        assert!(!identity.contains("203.0.113.195"));
        assert_eq!(
            gate.requester_identity(Some("user-1".into()), &headers).unwrap(),
            "user-1"
        );
    }
}

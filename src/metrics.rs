use crate::caps::EventCaps;
use crate::events::{DailyMetricBucket, EventType, RawEvent};
use crate::fingerprint::Fingerprint;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;

/// Storage for per-subject daily counters.
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn record(&self, event: &RawEvent, fingerprint: &Fingerprint, day: NaiveDate)
        -> Result<()>;

    /// `days` entries, most recent first, `None` for days without a bucket.
    async fn window(
        &self,
        subject_id: &str,
        today: NaiveDate,
        days: usize,
    ) -> Result<Vec<Option<DailyMetricBucket>>>;

    async fn set_score(&self, subject_id: &str, day: NaiveDate, score: f64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsTotals {
    pub days: usize,
    pub views: u64,
    pub copies: u64,
    pub saves: u64,
    pub forks: u64,
    pub votes: u64,
}

impl MetricsTotals {
    pub fn from_window(window: &[Option<DailyMetricBucket>]) -> Self {
        window.iter().flatten().fold(
            MetricsTotals {
                days: window.len(),
                ..Default::default()
            },
            |mut acc, b| {
                acc.views += b.views;
                acc.copies += b.copies;
                acc.saves += b.saves;
                acc.forks += b.forks;
                acc.votes += b.votes;
                acc
            },
        )
    }
}

type BucketKey = (String, NaiveDate);
type TallyKey = (String, String, NaiveDate);

#[derive(Default)]
struct Tables {
    buckets: HashMap<BucketKey, DailyMetricBucket>,
    // raw views per (ip_hash, subject, day), before capping
    view_tallies: HashMap<TallyKey, u64>,
    pruned_through: Option<NaiveDate>,
}

pub struct InMemoryMetricsRepository {
    caps: EventCaps,
    retention_days: i64,
    tables: Mutex<Tables>,
}

impl InMemoryMetricsRepository {
    pub fn new(caps: EventCaps, retention_days: i64) -> Self {
        Self {
            caps,
            retention_days,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub async fn raw_view_tally(&self, ip_hash: &str, subject_id: &str, day: NaiveDate) -> u64 {
        let key = (ip_hash.to_string(), subject_id.to_string(), day);
        self.tables
            .lock()
            .await
            .view_tallies
            .get(&key)
            .copied()
            .unwrap_or(0)
    }
}

impl Tables {
    fn prune(&mut self, today: NaiveDate, retention_days: i64) {
        let cutoff = today - Duration::days(retention_days);
        if self.pruned_through == Some(cutoff) {
            return;
        }
        self.buckets.retain(|(_, day), _| *day > cutoff);
        self.view_tallies.retain(|(_, _, day), _| *day > cutoff);
        self.pruned_through = Some(cutoff);
    }
}

#[async_trait]
impl MetricsRepository for InMemoryMetricsRepository {
    async fn record(
        &self,
        event: &RawEvent,
        fingerprint: &Fingerprint,
        day: NaiveDate,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.prune(day, self.retention_days);

        if event.event_type == EventType::View {
            let tally = tables
                .view_tallies
                .entry((
                    fingerprint.ip_hash.clone(),
                    event.subject_id.clone(),
                    day,
                ))
                .or_insert(0);
            *tally += 1;
            let capped = self.caps.cap_view_count(*tally);
            if capped.flagged {
                warn!(
                    subject_id = %event.subject_id,
                    ip_hash = %fingerprint.ip_hash,
                    raw = capped.raw,
                    capped = capped.value,
                    "View over per-IP daily cap, not counted toward score"
                );
                return Ok(());
            }
        }

        tables
            .buckets
            .entry((event.subject_id.clone(), day))
            .or_insert_with(|| DailyMetricBucket::new(event.subject_id.clone(), day))
            .apply(event.event_type);
        Ok(())
    }

    async fn window(
        &self,
        subject_id: &str,
        today: NaiveDate,
        days: usize,
    ) -> Result<Vec<Option<DailyMetricBucket>>> {
        let tables = self.tables.lock().await;
        Ok((0..days)
            .map(|offset| {
                let day = today - Duration::days(offset as i64);
                tables.buckets.get(&(subject_id.to_string(), day)).cloned()
            })
            .collect())
    }

    async fn set_score(&self, subject_id: &str, day: NaiveDate, score: f64) -> Result<()> {
        // reads never create buckets
        let mut tables = self.tables.lock().await;
        if let Some(bucket) = tables.buckets.get_mut(&(subject_id.to_string(), day)) {
            bucket.score = score;
        }
        Ok(())
    }
}

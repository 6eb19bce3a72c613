//! Recency-weighted popularity score over daily metric buckets.
use crate::events::DailyMetricBucket;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DECAY_LAMBDA: f64 = 0.25;
pub const DEFAULT_WINDOW_DAYS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendWeights {
    pub views: f64,
    pub copies: f64,
    pub saves: f64,
    pub votes: f64,
}

impl Default for TrendWeights {
    fn default() -> Self {
        Self {
            views: 0.4,
            copies: 0.3,
            saves: 0.2,
            votes: 0.1,
        }
    }
}

/// The subset of a day's counters that feeds the score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DayMetrics {
    pub views: u64,
    pub copies: u64,
    pub saves: u64,
    pub votes: u64,
}

impl From<&DailyMetricBucket> for DayMetrics {
    fn from(b: &DailyMetricBucket) -> Self {
        Self {
            views: b.views,
            copies: b.copies,
            saves: b.saves,
            votes: b.votes,
        }
    }
}

impl TrendWeights {
    pub fn weigh(&self, m: &DayMetrics) -> f64 {
        self.views * m.views as f64
            + self.copies * m.copies as f64
            + self.saves * m.saves as f64
            + self.votes * m.votes as f64
    }
}

pub fn decay_weight(days_ago: u32) -> f64 {
    decay_weight_with(DEFAULT_DECAY_LAMBDA, days_ago)
}

pub fn decay_weight_with(lambda: f64, days_ago: u32) -> f64 {
    (-lambda * days_ago as f64).exp()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendingCalculator {
    pub lambda: f64,
    pub weights: TrendWeights,
    pub window_days: usize,
}

impl Default for TrendingCalculator {
    fn default() -> Self {
        Self {
            lambda: DEFAULT_DECAY_LAMBDA,
            weights: TrendWeights::default(),
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }
}

impl TrendingCalculator {
    /// `days[0]` is today; `None` marks a day with no bucket. Entries past
    /// the window are ignored.
    pub fn score(&self, days: &[Option<DayMetrics>]) -> f64 {
        // `sum` starts at -0.0; an empty window must score +0.0
        let total = days
            .iter()
            .take(self.window_days)
            .enumerate()
            .filter_map(|(d, m)| m.as_ref().map(|m| (d, m)))
            .map(|(d, m)| decay_weight_with(self.lambda, d as u32) * self.weights.weigh(m))
            .fold(0.0_f64, |acc, x| acc + x);
        round2(total)
    }

    pub fn score_buckets(&self, days: &[Option<DailyMetricBucket>]) -> f64 {
        let metrics: Vec<Option<DayMetrics>> = days
            .iter()
            .map(|b| b.as_ref().map(DayMetrics::from))
            .collect();
        self.score(&metrics)
    }
}

pub fn calculate_trending_score(days: &[Option<DayMetrics>]) -> f64 {
    TrendingCalculator::default().score(days)
}

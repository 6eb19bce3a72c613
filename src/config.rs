use crate::caps::EventCaps;
use crate::rate_limit::{BucketConfig, ADMIN_BUCKET, GENERAL_BUCKET, GLOBAL_IP_BUCKET, READ_BUCKET, VOTE_BUCKET};
use crate::trending::{TrendWeights, TrendingCalculator};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Runtime settings. Every field has a fixed default except the salt, which
/// must come from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub metrics_window_recent_days: usize,
    pub metrics_window_long_days: usize,
    pub view_dedup_window_min: i64,
    pub rate_limit_events_per_min: u32,
    pub rate_limit_vote_per_min: u32,
    pub rate_limit_admin_per_min: u32,
    pub rate_limit_read_per_min: u32,
    pub trend_decay_lambda: f64,
    pub trend_weights: TrendWeights,
    pub max_views_per_ip_per_rule_per_day: u64,
    pub max_events_per_ip_per_minute: u32,
    pub idempotency_ttl_secs: u64,
    pub fingerprint_salt: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metrics_window_recent_days: 7,
            metrics_window_long_days: 30,
            view_dedup_window_min: 10,
            rate_limit_events_per_min: 60,
            rate_limit_vote_per_min: 10,
            rate_limit_admin_per_min: 30,
            rate_limit_read_per_min: 120,
            trend_decay_lambda: 0.25,
            trend_weights: TrendWeights::default(),
            max_views_per_ip_per_rule_per_day: 5,
            max_events_per_ip_per_minute: 20,
            idempotency_ttl_secs: 600,
            fingerprint_salt: String::new(),
            port: 3146,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Settings::default();
        let fingerprint_salt = lookup("FINGERPRINT_SALT")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("FINGERPRINT_SALT must be set"))?;

        let trend_weights = match lookup("TREND_WEIGHTS") {
            Some(raw) => serde_json::from_str::<TrendWeights>(&raw)
                .context("TREND_WEIGHTS must be JSON like {\"views\":0.4,\"copies\":0.3,\"saves\":0.2,\"votes\":0.1}")?,
            None => d.trend_weights,
        };

        Ok(Settings {
            metrics_window_recent_days: parse_or(&lookup, "METRICS_WINDOW_RECENT_DAYS", d.metrics_window_recent_days)?,
            metrics_window_long_days: parse_or(&lookup, "METRICS_WINDOW_LONG_DAYS", d.metrics_window_long_days)?,
            view_dedup_window_min: parse_or(&lookup, "VIEW_DEDUP_WINDOW_MIN", d.view_dedup_window_min)?,
            rate_limit_events_per_min: parse_or(&lookup, "RATE_LIMIT_EVENTS_PER_MIN", d.rate_limit_events_per_min)?,
            rate_limit_vote_per_min: parse_or(&lookup, "RATE_LIMIT_VOTE_PER_MIN", d.rate_limit_vote_per_min)?,
            rate_limit_admin_per_min: parse_or(&lookup, "RATE_LIMIT_ADMIN_PER_MIN", d.rate_limit_admin_per_min)?,
            rate_limit_read_per_min: parse_or(&lookup, "RATE_LIMIT_READ_PER_MIN", d.rate_limit_read_per_min)?,
            trend_decay_lambda: parse_or(&lookup, "TREND_DECAY_LAMBDA", d.trend_decay_lambda)?,
            trend_weights,
            max_views_per_ip_per_rule_per_day: parse_or(&lookup, "MAX_VIEWS_PER_IP_PER_RULE_PER_DAY", d.max_views_per_ip_per_rule_per_day)?,
            max_events_per_ip_per_minute: parse_or(&lookup, "MAX_EVENTS_PER_IP_PER_MINUTE", d.max_events_per_ip_per_minute)?,
            idempotency_ttl_secs: parse_or(&lookup, "IDEMPOTENCY_TTL_SECS", d.idempotency_ttl_secs)?,
            fingerprint_salt,
            port: parse_or(&lookup, "PORT", d.port)?,
        })
    }

    pub fn caps(&self) -> EventCaps {
        EventCaps {
            max_views_per_ip_per_subject_per_day: self.max_views_per_ip_per_rule_per_day,
            max_events_per_ip_per_minute: self.max_events_per_ip_per_minute,
        }
    }

    pub fn trending(&self) -> TrendingCalculator {
        TrendingCalculator {
            lambda: self.trend_decay_lambda,
            weights: self.trend_weights,
            window_days: self.metrics_window_recent_days,
        }
    }

    pub fn rate_buckets(&self) -> HashMap<String, BucketConfig> {
        HashMap::from([
            (GENERAL_BUCKET.to_string(), BucketConfig::per_minute(self.rate_limit_events_per_min)),
            (VOTE_BUCKET.to_string(), BucketConfig::per_minute(self.rate_limit_vote_per_min)),
            (ADMIN_BUCKET.to_string(), BucketConfig::per_minute(self.rate_limit_admin_per_min)),
            (READ_BUCKET.to_string(), BucketConfig::per_minute(self.rate_limit_read_per_min)),
            (GLOBAL_IP_BUCKET.to_string(), self.caps().global_ip_bucket()),
        ])
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {key}: '{raw}'")),
        _ => Ok(default),
    }
}

use crate::rate_limit::{self, BucketConfig};
use serde::Serialize;

/// Hard ceilings applied regardless of what the softer gates let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCaps {
    pub max_views_per_ip_per_subject_per_day: u64,
    pub max_events_per_ip_per_minute: u32,
}

impl Default for EventCaps {
    fn default() -> Self {
        Self {
            max_views_per_ip_per_subject_per_day: 5,
            max_events_per_ip_per_minute: 20,
        }
    }
}

/// A clamped count. `flagged` marks over-cap input so it can be audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CappedCount {
    pub raw: u64,
    pub value: u64,
    pub flagged: bool,
}

impl EventCaps {
    pub fn cap_view_count(&self, raw: u64) -> CappedCount {
        let value = raw.min(self.max_views_per_ip_per_subject_per_day);
        CappedCount {
            raw,
            value,
            flagged: raw > value,
        }
    }

    /// Global per-IP ceiling, checked before any endpoint bucket.
    pub fn should_rate_limit(&self, events_this_minute: u32) -> bool {
        rate_limit::should_rate_limit(events_this_minute, self.max_events_per_ip_per_minute)
    }

    pub fn global_ip_bucket(&self) -> BucketConfig {
        BucketConfig::per_minute(self.max_events_per_ip_per_minute)
    }
}

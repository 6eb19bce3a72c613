use crate::error::GateError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_SUBJECT_ID_LEN: usize = 128;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    View,
    Copy,
    Save,
    Fork,
    Vote,
    Comment,
    Donate,
    Claim,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::View => "VIEW",
            EventType::Copy => "COPY",
            EventType::Save => "SAVE",
            EventType::Fork => "FORK",
            EventType::Vote => "VOTE",
            EventType::Comment => "COMMENT",
            EventType::Donate => "DONATE",
            EventType::Claim => "CLAIM",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VIEW" => Ok(EventType::View),
            "COPY" => Ok(EventType::Copy),
            "SAVE" => Ok(EventType::Save),
            "FORK" => Ok(EventType::Fork),
            "VOTE" => Ok(EventType::Vote),
            "COMMENT" => Ok(EventType::Comment),
            "DONATE" => Ok(EventType::Donate),
            "CLAIM" => Ok(EventType::Claim),
            other => Err(GateError::validation(format!(
                "unsupported event type '{other}'"
            ))),
        }
    }
}

/// Event body as posted by clients.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub subject_id: Option<String>,
    pub subject_version_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
}

/// A validated event. Raw IP and UA live here only until fingerprinting.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub event_type: EventType,
    pub subject_id: String,
    pub subject_version_id: Option<String>,
    pub actor_id: Option<String>,
    pub source_ip: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn validate(
        &self,
        actor_id: Option<String>,
        source_ip: String,
        user_agent: String,
        timestamp: DateTime<Utc>,
    ) -> Result<RawEvent, GateError> {
        let event_type: EventType = self.event_type.parse()?;

        let subject_id = self
            .subject_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GateError::validation("subjectId is required"))?;
        if subject_id.len() > MAX_SUBJECT_ID_LEN {
            return Err(GateError::validation("subjectId is too long"));
        }

        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(GateError::validation("idempotencyKey is invalid"));
            }
        }

        let actor_id = actor_id
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        Ok(RawEvent {
            event_type,
            subject_id: subject_id.to_string(),
            subject_version_id: self.subject_version_id.clone(),
            actor_id,
            source_ip,
            user_agent,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyMetricBucket {
    pub date: NaiveDate,
    pub subject_id: String,
    pub views: u64,
    pub copies: u64,
    pub saves: u64,
    pub forks: u64,
    pub votes: u64,
    pub score: f64,
}

impl DailyMetricBucket {
    pub fn new(subject_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            date,
            subject_id: subject_id.into(),
            views: 0,
            copies: 0,
            saves: 0,
            forks: 0,
            votes: 0,
            score: 0.0,
        }
    }

    /// Adds one event to the matching counter. Event types that do not feed
    /// trending leave the bucket untouched.
    pub fn apply(&mut self, event_type: EventType) {
        match event_type {
            EventType::View => self.views += 1,
            EventType::Copy => self.copies += 1,
            EventType::Save => self.saves += 1,
            EventType::Fork => self.forks += 1,
            EventType::Vote => self.votes += 1,
            EventType::Comment | EventType::Donate | EventType::Claim => {}
        }
    }
}

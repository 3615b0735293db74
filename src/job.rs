use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::{DEFAULT_ATTEMPTS, DEFAULT_PRIORITY, MAX_PRIORITY, PRIORITY_MULTIPLIER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
    /// A strategy registered by name on the worker.
    Custom(String),
}

impl BackoffKind {
    pub fn as_str(&self) -> &str {
        match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
            BackoffKind::Custom(name) => name.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "fixed" => BackoffKind::Fixed,
            "exponential" => BackoffKind::Exponential,
            other => BackoffKind::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    pub delay_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatConfig {
    pub every_ms: i64,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct AddJobOptions {
    /// Lower runs first; clamped to `0..=MAX_PRIORITY`. Defaults to 10.
    pub priority: Option<i64>,
    pub delay_ms: Option<i64>,
    pub wait_until: Option<DateTime<Utc>>,
    /// Total attempts before permanent failure. Defaults to 1.
    pub attempts: Option<i64>,
    pub backoff: Option<BackoffConfig>,
    pub repeat: Option<RepeatConfig>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub data: Value,
    pub state: JobState,
    pub priority: i64,
    pub retry_count: i64,
    pub max_attempts: i64,
    pub added_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub error: Option<String>,
    pub progress: Option<i64>,
    pub backoff: Option<BackoffConfig>,
    pub repeat_every: Option<i64>,
    pub repeat_count: i64,
    pub repeat_limit: Option<i64>,
    pub lock_owner: Option<String>,
    pub updated_at: Option<i64>,
    pub delayed_meta: Option<Value>,
    pub delayed_reason: Option<String>,
    pub rate_limit_reset_at: Option<i64>,
}

pub(crate) fn composite_score(priority: i64, scheduled_ms: i64) -> i64 {
    priority * PRIORITY_MULTIPLIER + scheduled_ms
}

pub(crate) fn clamp_priority(priority: i64) -> i64 {
    priority.clamp(0, MAX_PRIORITY)
}

impl Job {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn new(id: &str, data: Value, options: &AddJobOptions, added_at: i64) -> Self {
        Self {
            id: id.to_string(),
            data,
            state: JobState::Waiting,
            priority: clamp_priority(options.priority.unwrap_or(DEFAULT_PRIORITY)),
            retry_count: 0,
            max_attempts: options.attempts.unwrap_or(DEFAULT_ATTEMPTS).max(1),
            added_at,
            started_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
            progress: None,
            backoff: options.backoff.clone(),
            repeat_every: options.repeat.map(|repeat| repeat.every_ms),
            repeat_count: 0,
            repeat_limit: options.repeat.and_then(|repeat| repeat.limit),
            lock_owner: None,
            updated_at: None,
            delayed_meta: None,
            delayed_reason: None,
            rate_limit_reset_at: None,
        }
    }

    pub fn attempts_made(&self) -> i64 {
        self.retry_count + 1
    }

    /// Hash fields written by `add_job`; `state` is set by the script.
    pub(crate) fn to_field_pairs(&self) -> Result<Vec<(String, String)>> {
        let data_json = serde_json::to_string(&self.data)?;
        let mut mapping: Vec<(String, String)> = vec![
            ("id".to_string(), self.id.clone()),
            ("data".to_string(), data_json),
            ("priority".to_string(), self.priority.to_string()),
            ("retry_count".to_string(), self.retry_count.to_string()),
            ("max_attempts".to_string(), self.max_attempts.to_string()),
            ("added_at".to_string(), self.added_at.to_string()),
            ("repeat_count".to_string(), self.repeat_count.to_string()),
        ];
        if let Some(backoff) = self.backoff.as_ref() {
            mapping.push(("backoff_type".to_string(), backoff.kind.as_str().to_string()));
            mapping.push(("backoff_delay".to_string(), backoff.delay_ms.to_string()));
        }
        if let Some(every) = self.repeat_every {
            mapping.push(("repeat_every".to_string(), every.to_string()));
        }
        if let Some(limit) = self.repeat_limit {
            mapping.push(("repeat_limit".to_string(), limit.to_string()));
        }
        Ok(mapping)
    }

    /// Rebuilds a job entity from a flattened hash. A hash without `data` is
    /// corrupt and rejected so fetchers can skip it.
    pub(crate) fn from_hash(fallback_id: &str, raw: &HashMap<String, String>) -> Result<Job> {
        let data_raw = raw
            .get("data")
            .ok_or_else(|| anyhow::anyhow!("job hash missing data field"))?;
        let data: Value = serde_json::from_str(data_raw)
            .map_err(|err| anyhow::anyhow!("job data is not valid JSON: {err}"))?;
        let state = raw
            .get("state")
            .and_then(|value| JobState::parse(value))
            .ok_or_else(|| anyhow::anyhow!("invalid job state"))?;
        let backoff = match (raw.get("backoff_type"), raw.get("backoff_delay")) {
            (Some(kind), Some(delay)) => Some(BackoffConfig {
                kind: BackoffKind::parse(kind),
                delay_ms: delay.parse::<i64>().unwrap_or(0),
            }),
            _ => None,
        };
        let parse_ms = |field: &str| {
            raw.get(field)
                .and_then(|value| value.parse::<i64>().ok())
        };

        Ok(Job {
            id: raw
                .get("id")
                .cloned()
                .unwrap_or_else(|| fallback_id.to_string()),
            data,
            state,
            priority: parse_ms("priority").unwrap_or(0),
            retry_count: parse_ms("retry_count").unwrap_or(0),
            max_attempts: parse_ms("max_attempts").unwrap_or(DEFAULT_ATTEMPTS),
            added_at: parse_ms("added_at").unwrap_or(0),
            started_at: parse_ms("started_at"),
            completed_at: parse_ms("completed_at"),
            failed_at: parse_ms("failed_at"),
            error: raw.get("error").cloned(),
            progress: parse_ms("progress"),
            backoff,
            repeat_every: parse_ms("repeat_every"),
            repeat_count: parse_ms("repeat_count").unwrap_or(0),
            repeat_limit: parse_ms("repeat_limit"),
            lock_owner: raw.get("lock_owner").cloned(),
            updated_at: parse_ms("updated_at"),
            delayed_meta: raw
                .get("delayed_meta")
                .and_then(|value| serde_json::from_str(value).ok()),
            delayed_reason: raw.get("delayed_reason").cloned(),
            rate_limit_reset_at: parse_ms("rate_limit_reset_at"),
        })
    }
}

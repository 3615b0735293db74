use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_LOCK_DURATION_MS, DEFAULT_PREFETCH, DEFAULT_PREFIX,
    DEFAULT_REDIS_URL, DEFAULT_SHUTDOWN_TIMEOUT_MS, MIN_HEARTBEAT_INTERVAL_MS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitMode {
    #[default]
    TokenBucket,
    SlidingWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DenyPolicy {
    Reject,
    #[default]
    Delay,
    // Reserved; currently treated as `reject`.
    Enqueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimiterScope {
    #[default]
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SlidingWindowSettings {
    pub window_ms: i64,
    pub limit: i64,
    pub policy: DenyPolicy,
    pub delay_ms: Option<i64>,
}

impl Default for SlidingWindowSettings {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            limit: 1,
            policy: DenyPolicy::Delay,
            delay_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RateLimiterSettings {
    pub mode: RateLimitMode,
    /// Token-bucket refill rate in tokens per second.
    pub rate: f64,
    /// Token-bucket burst capacity.
    pub capacity: i64,
    pub sliding_window: Option<SlidingWindowSettings>,
    pub scope: LimiterScope,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            mode: RateLimitMode::TokenBucket,
            rate: 1.0,
            capacity: 1,
            sliding_window: None,
            scope: LimiterScope::Queue,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct QueueSettings {
    pub redis_url: String,
    pub prefix: String,
    pub rate_limiter: Option<RateLimiterSettings>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            rate_limiter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// How many jobs a single refill pulls into a slot buffer; may exceed
    /// `concurrency`.
    pub prefetch: usize,
    pub lock_duration_ms: i64,
    pub graceful_shutdown_timeout_ms: u64,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: Option<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            prefetch: DEFAULT_PREFETCH,
            lock_duration_ms: DEFAULT_LOCK_DURATION_MS,
            graceful_shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            heartbeat_enabled: false,
            heartbeat_interval_ms: None,
        }
    }
}

impl WorkerSettings {
    pub fn effective_heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms.unwrap_or_else(|| {
            MIN_HEARTBEAT_INTERVAL_MS.max(self.lock_duration_ms.max(0) as u64 / 2)
        })
    }
}

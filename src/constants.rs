pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";
pub const DEFAULT_PREFIX: &str = "kodiak";

pub const JOBS_SEGMENT: &str = "jobs";
pub const QUEUE_SEGMENT: &str = "queue";
pub const DELAY_TIMER_SEGMENT: &str = "delayed:timer";
pub const RATE_LIMIT_SEGMENT: &str = "ratelimit";

pub const DEFAULT_PRIORITY: i64 = 10;
// Priority lives in the high band of the composite score; the cap keeps
// `priority * PRIORITY_MULTIPLIER + epoch_ms` inside the 2^53 range that
// Redis zset scores represent exactly.
pub const MAX_PRIORITY: i64 = 500;
pub const PRIORITY_MULTIPLIER: i64 = 10_000_000_000_000;

pub const DEFAULT_ATTEMPTS: i64 = 1;
pub const MAX_BACKOFF_EXPONENT: u32 = 30;

pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_PREFETCH: usize = 10;
pub const DEFAULT_LOCK_DURATION_MS: i64 = 30_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

pub const DEFAULT_DELAY_ON_LIMIT_MS: i64 = 500;

pub const PROMOTE_BATCH_LIMIT: usize = 50;
pub const SCHEDULER_TICK_MS: u64 = 5_000;
pub const IDLE_FETCH_DELAY_MS: u64 = 100;
pub const FETCH_ERROR_BACKOFF_CAP_MS: u64 = 30_000;

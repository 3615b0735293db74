use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::MAX_BACKOFF_EXPONENT;
use crate::job::{BackoffKind, Job};

/// A named strategy maps `(attempts_made, base_delay_ms)` to a delay in ms.
pub type BackoffFn = Arc<dyn Fn(i64, i64) -> i64 + Send + Sync>;

#[derive(Default, Clone)]
pub struct BackoffRegistry {
    strategies: HashMap<String, BackoffFn>,
}

impl BackoffRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, strategy: F)
    where
        F: Fn(i64, i64) -> i64 + Send + Sync + 'static,
    {
        self.strategies.insert(name.to_string(), Arc::new(strategy));
    }

    /// Resolves the next-attempt timestamp for a job that just failed, or
    /// `None` to let `fail_job` fall back to its own backoff computation.
    pub fn next_attempt(&self, job: &Job, failed_at: i64) -> Option<i64> {
        let backoff = job.backoff.as_ref()?;
        let attempts_made = job.attempts_made();
        let delay = match &backoff.kind {
            BackoffKind::Fixed => backoff.delay_ms,
            BackoffKind::Exponential => {
                let exponent = (attempts_made - 1).clamp(0, MAX_BACKOFF_EXPONENT as i64) as u32;
                backoff.delay_ms.saturating_mul(1_i64 << exponent)
            }
            BackoffKind::Custom(name) => {
                let strategy = self.strategies.get(name)?;
                strategy(attempts_made, backoff.delay_ms)
            }
        };
        Some(failed_at + delay.max(0))
    }
}

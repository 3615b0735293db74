pub mod backoff;
pub mod constants;
pub mod events;
pub mod job;
pub mod queue;
mod rate_limiter;
pub mod scheduler;
mod scripts;
pub mod settings;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use backoff::{BackoffFn, BackoffRegistry};
pub use events::WorkerEvent;
pub use job::{AddJobOptions, BackoffConfig, BackoffKind, Job, JobState, RepeatConfig};
pub use queue::Queue;
pub use scheduler::DelayScheduler;
pub use settings::{
    DenyPolicy, LimiterScope, QueueSettings, RateLimitMode, RateLimiterSettings,
    SlidingWindowSettings, WorkerSettings,
};
pub use store::{CompletionOutcome, FailureOutcome, QueueStore};
pub use worker::{ActiveJob, Processor, Worker};

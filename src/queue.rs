use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::job::{AddJobOptions, Job, JobState};
use crate::scheduler::DelayScheduler;
use crate::settings::QueueSettings;
use crate::store::QueueStore;

/// A named queue plus its delayed-promotion scheduler. Producers `add` jobs;
/// workers are constructed from `store()` handles.
pub struct Queue {
    name: String,
    store: QueueStore,
    scheduler: Option<DelayScheduler>,
}

impl Queue {
    pub async fn new(name: &str, settings: QueueSettings) -> Result<Self> {
        if name.is_empty() {
            anyhow::bail!("queue name must not be empty");
        }
        let mut store = QueueStore::new(settings, name).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        store.set_delayed_notifier(tx);
        let client = redis::Client::open(store.settings().redis_url.as_str())?;
        let scheduler = DelayScheduler::spawn(store.clone(), client, rx);
        Ok(Self {
            name: name.to_string(),
            store,
            scheduler: Some(scheduler),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle sharing this queue's connection and delayed-scheduled
    /// notifier; used to build workers or issue repository calls directly.
    pub fn store(&self) -> QueueStore {
        self.store.clone()
    }

    /// Enqueues a job. Fails when the id is already in use.
    pub async fn add(&mut self, id: &str, data: Value, options: AddJobOptions) -> Result<Job> {
        if id.is_empty() {
            anyhow::bail!("job id must not be empty");
        }
        if let Some(attempts) = options.attempts
            && attempts < 1
        {
            anyhow::bail!("attempts must be at least 1");
        }
        if let Some(delay_ms) = options.delay_ms
            && delay_ms < 0
        {
            anyhow::bail!("delay must not be negative");
        }
        if let Some(backoff) = options.backoff.as_ref()
            && backoff.delay_ms < 0
        {
            anyhow::bail!("backoff delay must not be negative");
        }
        if let Some(repeat) = options.repeat.as_ref()
            && repeat.every_ms <= 0
        {
            anyhow::bail!("repeat interval must be positive");
        }

        let now = Utc::now().timestamp_millis();
        let mut due_ms = now;
        if let Some(wait_until) = options.wait_until {
            due_ms = due_ms.max(wait_until.timestamp_millis());
        }
        if let Some(delay_ms) = options.delay_ms {
            due_ms = due_ms.max(now + delay_ms);
        }
        let delay_until = (due_ms > now).then_some(due_ms);

        let span = tracing::info_span!(
            "kodiak.add",
            job_id = %id,
            queue = %self.name,
            delayed = delay_until.is_some()
        );
        let _enter = span.enter();

        let mut job = Job::new(id, data, &options, now);
        let scheduled = self.store.add(&job, delay_until).await?;
        if scheduled.is_some() {
            job.state = JobState::Delayed;
        }
        tracing::info!("job enqueued");
        Ok(job)
    }

    /// Stops the scheduler and releases its subscription; safe to call twice.
    pub async fn close(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_ATTEMPTS, DEFAULT_PRIORITY, MAX_PRIORITY};
    use crate::test_support::RedisTestContext;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn add_applies_defaults() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut queue = Queue::new(&ctx.queue_name, ctx.settings.clone())
            .await
            .unwrap();
        let job = queue
            .add("defaults", json!({"k": "v"}), AddJobOptions::default())
            .await
            .unwrap();
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.max_attempts, DEFAULT_ATTEMPTS);
        assert_eq!(job.state, JobState::Waiting);

        let mut store = queue.store();
        let stored = store.job("defaults").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.data, json!({"k": "v"}));
        queue.close().await;
    }

    #[tokio::test]
    async fn add_rejects_duplicates_and_bad_options() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut queue = Queue::new(&ctx.queue_name, ctx.settings.clone())
            .await
            .unwrap();
        queue
            .add("taken", json!(null), AddJobOptions::default())
            .await
            .unwrap();
        let err = queue
            .add("taken", json!(null), AddJobOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let err = queue
            .add(
                "invalid",
                json!(null),
                AddJobOptions {
                    attempts: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("attempts"));

        let err = queue
            .add(
                "invalid",
                json!(null),
                AddJobOptions {
                    delay_ms: Some(-5),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("delay"));
        queue.close().await;
    }

    #[tokio::test]
    async fn add_clamps_priority() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut queue = Queue::new(&ctx.queue_name, ctx.settings.clone())
            .await
            .unwrap();
        let job = queue
            .add(
                "clamped",
                json!(null),
                AddJobOptions {
                    priority: Some(MAX_PRIORITY + 100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.priority, MAX_PRIORITY);
        queue.close().await;
    }

    #[tokio::test]
    async fn delayed_add_becomes_fetchable_after_due() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut queue = Queue::new(&ctx.queue_name, ctx.settings.clone())
            .await
            .unwrap();
        let job = queue
            .add(
                "later",
                json!(null),
                AddJobOptions {
                    delay_ms: Some(300),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Delayed);

        let mut store = queue.store();
        assert!(store.fetch_next(None).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let fetched = store.fetch_next(None).await.unwrap().unwrap();
        assert_eq!(fetched.id, "later");
        queue.close().await;
    }

    #[tokio::test]
    async fn wait_until_schedules_absolute_time() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut queue = Queue::new(&ctx.queue_name, ctx.settings.clone())
            .await
            .unwrap();
        let wait_until = Utc::now() + ChronoDuration::seconds(60);
        queue
            .add(
                "absolute",
                json!(null),
                AddJobOptions {
                    wait_until: Some(wait_until),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut store = queue.store();
        let keys = store.keys().clone();
        let score: Option<f64> = redis::AsyncCommands::zscore(&mut store.conn, &keys.delayed, "absolute")
            .await
            .unwrap();
        assert_eq!(score.unwrap() as i64, wait_until.timestamp_millis());
        queue.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut queue = Queue::new(&ctx.queue_name, ctx.settings.clone())
            .await
            .unwrap();
        queue.close().await;
        queue.close().await;
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde_json::json;
use tokio::sync::mpsc;

use crate::constants::{
    DEFAULT_LOCK_DURATION_MS, DELAY_TIMER_SEGMENT, JOBS_SEGMENT, QUEUE_SEGMENT,
    RATE_LIMIT_SEGMENT,
};
use crate::events::DelayedScheduled;
use crate::job::Job;
use crate::rate_limiter::{Admission, RateLimiter};
use crate::scripts::ScriptSet;
use crate::settings::{DenyPolicy, QueueSettings};

#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    pub waiting: String,
    pub delayed: String,
    pub active: String,
    pub notify: String,
    pub limiter_bucket: String,
    pub limiter_window: String,
    job_prefix: String,
    timer_prefix: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        let queue_base = format!("{prefix}:{QUEUE_SEGMENT}:{queue}");
        Self {
            waiting: format!("{queue_base}:waiting"),
            delayed: format!("{queue_base}:delayed"),
            active: format!("{queue_base}:active"),
            notify: format!("{queue_base}:notify"),
            limiter_bucket: format!("{prefix}:{RATE_LIMIT_SEGMENT}:{queue}"),
            limiter_window: format!("{prefix}:{RATE_LIMIT_SEGMENT}:{queue}:sliding"),
            job_prefix: format!("{prefix}:{JOBS_SEGMENT}:"),
            timer_prefix: format!("{prefix}:{DELAY_TIMER_SEGMENT}:"),
        }
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}{id}", self.job_prefix)
    }

    pub fn timer(&self, id: &str) -> String {
        format!("{}{id}", self.timer_prefix)
    }

    pub fn job_prefix(&self) -> &str {
        &self.job_prefix
    }

    pub fn timer_prefix(&self) -> &str {
        &self.timer_prefix
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    /// The job is recurring and was rescheduled into the delayed set.
    Rescheduled { next_run_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A retry was scheduled into the delayed set.
    Retrying { next_attempt_ms: i64 },
    Failed,
}

/// Owns the key layout and the script set for one queue, and finishes the
/// client-side half of every transition: pipelined hash updates, entity
/// reconstruction, delay-timer installation, and delayed-scheduled
/// notifications for the scheduler.
#[derive(Clone)]
pub struct QueueStore {
    settings: QueueSettings,
    queue: String,
    keys: QueueKeys,
    client: redis::Client,
    pub(crate) conn: MultiplexedConnection,
    blocking_conn: Option<MultiplexedConnection>,
    scripts: Arc<ScriptSet>,
    limiter: Option<RateLimiter>,
    delayed_tx: Option<mpsc::UnboundedSender<DelayedScheduled>>,
}

impl QueueStore {
    pub async fn new(settings: QueueSettings, queue: &str) -> Result<Self> {
        let client = redis::Client::open(settings.redis_url.as_str())
            .with_context(|| "failed to create Redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| "failed to connect to Redis")?;
        Ok(Self::with_connection(settings, queue, client, conn))
    }

    pub(crate) fn with_connection(
        settings: QueueSettings,
        queue: &str,
        client: redis::Client,
        conn: MultiplexedConnection,
    ) -> Self {
        let keys = QueueKeys::new(&settings.prefix, queue);
        let scripts = Arc::new(ScriptSet::new());
        let limiter = settings.rate_limiter.clone().map(|limiter_settings| {
            RateLimiter::new(
                limiter_settings,
                keys.limiter_bucket.clone(),
                keys.limiter_window.clone(),
                scripts.clone(),
            )
        });
        Self {
            settings,
            queue: queue.to_string(),
            keys,
            client,
            conn,
            blocking_conn: None,
            scripts,
            limiter,
            delayed_tx: None,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub(crate) fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub(crate) fn set_delayed_notifier(&mut self, tx: mpsc::UnboundedSender<DelayedScheduled>) {
        self.delayed_tx = Some(tx);
    }

    /// Writes the job hash and inserts the id into waiting or delayed in one
    /// atomic step. Returns the due timestamp for delayed jobs.
    pub async fn add(&mut self, job: &Job, delay_until_ms: Option<i64>) -> Result<Option<i64>> {
        let (score, is_delayed) = match delay_until_ms {
            Some(due_ms) => (due_ms, true),
            None => (
                crate::job::composite_score(job.priority, job.added_at),
                false,
            ),
        };
        let pairs = job.to_field_pairs()?;
        let mut args: Vec<String> = Vec::with_capacity(pairs.len() * 2 + 3);
        args.push(job.id.clone());
        args.push(score.to_string());
        args.push(if is_delayed { "1" } else { "0" }.to_string());
        for (field, value) in pairs {
            args.push(field);
            args.push(value);
        }

        let script = self.scripts.clone();
        let mut invocation = script.add_job.key(&self.keys.waiting);
        invocation.key(&self.keys.delayed);
        invocation.key(self.keys.job(&job.id));
        invocation.key(&self.keys.notify);
        for arg in &args {
            invocation.arg(arg);
        }
        let scheduled: i64 = invocation.invoke_async(&mut self.conn).await?;
        if scheduled == -2 {
            anyhow::bail!("job id already exists: {}", job.id);
        }
        if scheduled >= 0 {
            self.note_delayed(&job.id, scheduled).await;
            return Ok(Some(scheduled));
        }
        Ok(None)
    }

    /// Optimistic-then-blocking single fetch. With a timeout, waits on the
    /// notify list for a wakeup before trying once more.
    pub async fn fetch_next(&mut self, timeout: Option<Duration>) -> Result<Option<Job>> {
        if !self.admit(1).await? {
            return Ok(None);
        }
        if let Some(job) = self.try_move_job(true).await? {
            return Ok(Some(job));
        }
        let Some(timeout) = timeout.filter(|timeout| !timeout.is_zero()) else {
            return Ok(None);
        };

        let notify_key = self.keys.notify.clone();
        let blocking_conn = self.blocking_conn().await?;
        let token: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&notify_key)
            .arg(timeout.as_secs_f64())
            .query_async(blocking_conn)
            .await?;
        if token.is_none() {
            return Ok(None);
        }
        if !self.admit(1).await? {
            return Ok(None);
        }
        self.try_move_job(false).await
    }

    /// Batch fetch: moves up to `count` waiting jobs into active under one
    /// lock expiry, then finishes the hash updates in a single pipeline.
    pub async fn fetch_next_jobs(
        &mut self,
        count: usize,
        lock_duration_ms: i64,
        owner_token: Option<&str>,
    ) -> Result<Vec<Job>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if !self.admit(count as i64).await? {
            return Ok(Vec::new());
        }
        let now = Utc::now().timestamp_millis();
        let lock_expires_at = now + lock_duration_ms.max(0);
        let ids: Vec<String> = self
            .scripts
            .move_to_active
            .key(&self.keys.waiting)
            .key(&self.keys.active)
            .arg(count)
            .arg(lock_expires_at)
            .invoke_async(&mut self.conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let now_value = now.to_string();
        let mut pipe = redis::pipe();
        for id in &ids {
            let job_key = self.keys.job(id);
            let mut fields: Vec<(&str, &str)> = vec![
                ("state", "active"),
                ("started_at", now_value.as_str()),
                ("updated_at", now_value.as_str()),
            ];
            if let Some(token) = owner_token {
                fields.push(("lock_owner", token));
            }
            pipe.hset_multiple(&job_key, &fields).ignore();
            pipe.hgetall(&job_key);
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut self.conn).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        let mut corrupt: Vec<&String> = Vec::new();
        for (id, raw) in ids.iter().zip(maps.iter()) {
            match Job::from_hash(id, raw) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    tracing::debug!(job_id = %id, error = %err, "skipping corrupt job");
                    corrupt.push(id);
                }
            }
        }
        if !corrupt.is_empty() {
            let mut cleanup = redis::pipe();
            cleanup.atomic();
            for id in corrupt {
                cleanup.del(self.keys.job(id)).ignore();
                cleanup.zrem(&self.keys.active, id).ignore();
            }
            cleanup.query_async::<()>(&mut self.conn).await?;
        }
        Ok(jobs)
    }

    /// Removes the job from active and either finalizes it or, for recurring
    /// jobs below their limit, reschedules it into delayed.
    pub async fn mark_completed(&mut self, job: &Job) -> Result<CompletionOutcome> {
        let completed_at = Utc::now().timestamp_millis();
        let outcome: i64 = self
            .scripts
            .complete_job
            .key(&self.keys.active)
            .key(self.keys.job(&job.id))
            .key(&self.keys.delayed)
            .arg(&job.id)
            .arg(completed_at)
            .invoke_async(&mut self.conn)
            .await?;
        if outcome == 0 {
            let next_run_ms = completed_at + job.repeat_every.unwrap_or(0);
            self.note_delayed(&job.id, next_run_ms).await;
            return Ok(CompletionOutcome::Rescheduled { next_run_ms });
        }
        Ok(CompletionOutcome::Completed)
    }

    /// Removes the job from active and schedules a retry or finalizes the
    /// failure, depending on the remaining attempts.
    pub async fn mark_failed(
        &mut self,
        job: &Job,
        error: &str,
        forced_next_attempt_ms: Option<i64>,
    ) -> Result<FailureOutcome> {
        let failed_at = Utc::now().timestamp_millis();
        let next_attempt: i64 = self
            .scripts
            .fail_job
            .key(&self.keys.active)
            .key(self.keys.job(&job.id))
            .key(&self.keys.delayed)
            .arg(&job.id)
            .arg(error)
            .arg(failed_at)
            .arg(forced_next_attempt_ms.unwrap_or(-1))
            .invoke_async(&mut self.conn)
            .await?;
        if next_attempt < 0 {
            return Ok(FailureOutcome::Failed);
        }
        self.note_delayed(&job.id, next_attempt).await;
        Ok(FailureOutcome::Retrying {
            next_attempt_ms: next_attempt,
        })
    }

    /// Moves due delayed jobs back to waiting, rescored by priority.
    pub async fn promote_delayed_jobs(&mut self, limit: usize) -> Result<Vec<String>> {
        let now = Utc::now().timestamp_millis();
        let moved: Vec<String> = self
            .scripts
            .promote_delayed_jobs
            .key(&self.keys.delayed)
            .key(&self.keys.waiting)
            .key(&self.keys.notify)
            .key(self.keys.job_prefix())
            .arg(now)
            .arg(limit.max(1))
            .invoke_async(&mut self.conn)
            .await?;
        if !moved.is_empty() {
            tracing::debug!(queue = %self.queue, count = moved.len(), "promoted delayed jobs");
        }
        Ok(moved)
    }

    /// Requeues jobs whose lock expired, then bumps retry_count and state in
    /// one pipelined batch. Entries without a job hash are dropped instead.
    pub async fn recover_stalled_jobs(&mut self) -> Result<Vec<String>> {
        let now = Utc::now().timestamp_millis();
        let recovered: Vec<String> = self
            .scripts
            .recover_stalled_jobs
            .key(&self.keys.active)
            .key(&self.keys.waiting)
            .arg(now)
            .invoke_async(&mut self.conn)
            .await?;
        if recovered.is_empty() {
            return Ok(recovered);
        }

        let mut exists_pipe = redis::pipe();
        for id in &recovered {
            exists_pipe.exists(self.keys.job(id));
        }
        let exists: Vec<bool> = exists_pipe.query_async(&mut self.conn).await?;

        let now_value = now.to_string();
        let mut update = redis::pipe();
        update.atomic();
        for (id, has_hash) in recovered.iter().zip(exists.iter()) {
            if *has_hash {
                let job_key = self.keys.job(id);
                update.hincr(&job_key, "retry_count", 1).ignore();
                update
                    .hset_multiple(
                        &job_key,
                        &[("state", "waiting"), ("updated_at", now_value.as_str())],
                    )
                    .ignore();
            } else {
                update.zrem(&self.keys.waiting, id).ignore();
            }
        }
        update.query_async::<()>(&mut self.conn).await?;
        tracing::warn!(queue = %self.queue, count = recovered.len(), "recovered stalled jobs");
        Ok(recovered)
    }

    pub async fn extend_lock(
        &mut self,
        id: &str,
        new_expiry_ms: i64,
        owner_token: Option<&str>,
    ) -> Result<bool> {
        let extended: i64 = self
            .scripts
            .extend_lock
            .key(&self.keys.active)
            .key(self.keys.job(id))
            .arg(id)
            .arg(new_expiry_ms)
            .arg(owner_token.unwrap_or(""))
            .invoke_async(&mut self.conn)
            .await?;
        Ok(extended == 1)
    }

    /// Returns false when the job hash no longer exists.
    pub async fn update_progress(&mut self, id: &str, progress: i64) -> Result<bool> {
        let updated: i64 = self
            .scripts
            .update_progress
            .key(self.keys.job(id))
            .arg(progress)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(updated == 0)
    }

    /// Pops the next waiting job into delayed; used when a limiter denial
    /// applies the delay policy. The hash update happens client-side.
    pub async fn move_waiting_to_delayed(
        &mut self,
        next_attempt_ms: i64,
        reason: &str,
        reset_at_ms: Option<i64>,
    ) -> Result<Option<String>> {
        let metadata = json!({ "reason": reason, "reset_at": reset_at_ms }).to_string();
        let moved: Option<Vec<String>> = self
            .scripts
            .move_waiting_to_delayed
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .arg(next_attempt_ms)
            .arg(&metadata)
            .invoke_async(&mut self.conn)
            .await?;
        let Some(reply) = moved else {
            return Ok(None);
        };
        let id = reply
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("move_waiting_to_delayed returned an empty reply"))?;

        let job_key = self.keys.job(&id);
        let exists: bool = self.conn.exists(&job_key).await?;
        if exists {
            let reset_value = reset_at_ms.map(|reset| reset.to_string());
            let mut fields: Vec<(&str, &str)> = vec![
                ("state", "delayed"),
                ("delayed_meta", metadata.as_str()),
                ("delayed_reason", reason),
            ];
            if let Some(reset) = reset_value.as_deref() {
                fields.push(("rate_limit_reset_at", reset));
            }
            self.conn.hset_multiple::<_, _, _, ()>(&job_key, &fields).await?;
        }
        self.note_delayed(&id, next_attempt_ms).await;
        Ok(Some(id))
    }

    pub async fn job(&mut self, id: &str) -> Result<Option<Job>> {
        let raw: HashMap<String, String> = self.conn.hgetall(self.keys.job(id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_hash(id, &raw)?))
    }

    pub async fn waiting_count(&mut self) -> Result<i64> {
        let count: i64 = self.conn.zcard(&self.keys.waiting).await?;
        Ok(count)
    }

    pub async fn delayed_count(&mut self) -> Result<i64> {
        let count: i64 = self.conn.zcard(&self.keys.delayed).await?;
        Ok(count)
    }

    pub async fn active_count(&mut self) -> Result<i64> {
        let count: i64 = self.conn.zcard(&self.keys.active).await?;
        Ok(count)
    }

    async fn try_move_job(&mut self, pop_notify: bool) -> Result<Option<Job>> {
        let now = Utc::now().timestamp_millis();
        let lock_expires_at = now + DEFAULT_LOCK_DURATION_MS;
        let reply: Option<Vec<String>> = self
            .scripts
            .move_job
            .key(&self.keys.waiting)
            .key(&self.keys.active)
            .key(&self.keys.notify)
            .arg(now)
            .arg(self.keys.job_prefix())
            .arg(if pop_notify { "1" } else { "0" })
            .arg(lock_expires_at)
            .invoke_async(&mut self.conn)
            .await?;
        let Some(reply) = reply else {
            return Ok(None);
        };
        let id = reply
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("move_job returned an empty reply"))?;
        if reply.len() < 3 {
            tracing::debug!(job_id = %id, "skipping waiting entry without a job hash");
            return Ok(None);
        }
        let mut raw = HashMap::with_capacity((reply.len() - 1) / 2);
        let mut fields = reply[1..].chunks_exact(2);
        for chunk in &mut fields {
            raw.insert(chunk[0].clone(), chunk[1].clone());
        }
        match Job::from_hash(&id, &raw) {
            Ok(job) => Ok(Some(job)),
            Err(err) => {
                tracing::debug!(job_id = %id, error = %err, "skipping corrupt job");
                let mut cleanup = redis::pipe();
                cleanup.atomic();
                cleanup.del(self.keys.job(&id)).ignore();
                cleanup.zrem(&self.keys.active, &id).ignore();
                cleanup.query_async::<()>(&mut self.conn).await?;
                Ok(None)
            }
        }
    }

    /// Asks the limiter for `requested` admissions. On a delay-policy denial
    /// the next waiting job is parked in delayed; either way a denial means
    /// the fetch returns empty.
    async fn admit(&mut self, requested: i64) -> Result<bool> {
        let Some(limiter) = self.limiter.clone() else {
            return Ok(true);
        };
        match limiter.check(&mut self.conn, requested).await {
            Admission::Allowed => Ok(true),
            Admission::Denied {
                policy: DenyPolicy::Delay,
                delay_ms,
                reset_at,
            } => {
                let next_attempt = Utc::now().timestamp_millis() + delay_ms.max(0);
                self.move_waiting_to_delayed(next_attempt, "rate_limit", reset_at)
                    .await?;
                Ok(false)
            }
            Admission::Denied { .. } => Ok(false),
        }
    }

    /// Installs the PX-TTL delay timer and tells the scheduler. Failures are
    /// reported at debug level; the periodic promoter still bounds the delay.
    async fn note_delayed(&mut self, id: &str, due_ms: i64) {
        let remaining = due_ms - Utc::now().timestamp_millis();
        if remaining > 0 {
            let timer_key = self.keys.timer(id);
            let result: Result<(), redis::RedisError> = redis::cmd("SET")
                .arg(&timer_key)
                .arg(due_ms)
                .arg("PX")
                .arg(remaining)
                .query_async(&mut self.conn)
                .await;
            if let Err(err) = result {
                tracing::debug!(job_id = %id, error = %err, "failed to install delay timer");
            }
        }
        if let Some(tx) = self.delayed_tx.as_ref() {
            let _ = tx.send(DelayedScheduled {
                id: id.to_string(),
                due_ms,
            });
        }
    }

    async fn blocking_conn(&mut self) -> Result<&mut MultiplexedConnection> {
        if self.blocking_conn.is_none() {
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .with_context(|| "failed to open blocking connection")?;
            self.blocking_conn = Some(conn);
        }
        Ok(self.blocking_conn.as_mut().expect("blocking connection set"))
    }

    #[cfg(test)]
    pub(crate) async fn flushdb(&mut self) -> Result<()> {
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut self.conn)
            .await?;
        Ok(())
    }
}

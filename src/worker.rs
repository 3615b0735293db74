use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use rand::Rng;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::Instrument;
use uuid::Uuid;

use crate::backoff::BackoffRegistry;
use crate::constants::{FETCH_ERROR_BACKOFF_CAP_MS, IDLE_FETCH_DELAY_MS};
use crate::events::WorkerEvent;
use crate::job::Job;
use crate::settings::WorkerSettings;
use crate::store::{FailureOutcome, QueueStore};

/// User-supplied job handler. Any error (or panic) counts as a processor
/// failure and routes through the retry resolver.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: ActiveJob) -> Result<()>;
}

/// The entity handed to a processor: the job plus a progress-reporting
/// handle bound to this worker's store and event channel.
pub struct ActiveJob {
    pub job: Job,
    store: QueueStore,
    events: broadcast::Sender<WorkerEvent>,
}

impl ActiveJob {
    pub fn data(&self) -> &serde_json::Value {
        &self.job.data
    }

    pub async fn update_progress(&mut self, progress: i64) -> Result<()> {
        self.store.update_progress(&self.job.id, progress).await?;
        let _ = self.events.send(WorkerEvent::Progress {
            job_id: self.job.id.clone(),
            progress,
        });
        Ok(())
    }
}

struct SlotContext {
    slot: usize,
    owner_token: String,
    store: QueueStore,
    settings: WorkerSettings,
    processor: Arc<dyn Processor>,
    backoff: Arc<BackoffRegistry>,
    events: broadcast::Sender<WorkerEvent>,
    running: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
    fetch_lock: Arc<Mutex<()>>,
}

pub struct Worker {
    store: QueueStore,
    settings: WorkerSettings,
    processor: Arc<dyn Processor>,
    backoff: BackoffRegistry,
    events: broadcast::Sender<WorkerEvent>,
    running: Arc<AtomicBool>,
    worker_token: String,
    slots: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("settings", &self.settings)
            .field("running", &self.running)
            .field("worker_token", &self.worker_token)
            .field("slots", &self.slots)
            .finish()
    }
}

impl Worker {
    pub fn new(
        store: QueueStore,
        processor: Arc<dyn Processor>,
        settings: WorkerSettings,
    ) -> Result<Self> {
        if settings.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if settings.lock_duration_ms <= 0 {
            anyhow::bail!("lock_duration_ms must be positive");
        }
        let worker_token = format!("{}-{}", std::process::id(), Uuid::new_v4());
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            store,
            settings,
            processor,
            backoff: BackoffRegistry::new(),
            events,
            running: Arc::new(AtomicBool::new(false)),
            worker_token,
            slots: Vec::new(),
        })
    }

    /// Registers a named backoff strategy the retry resolver can pick up
    /// from a job's `backoff.kind`.
    pub fn register_backoff_strategy<F>(&mut self, name: &str, strategy: F)
    where
        F: Fn(i64, i64) -> i64 + Send + Sync + 'static,
    {
        self.backoff.register(name, strategy);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("worker already running");
        }
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let fetch_lock = Arc::new(Mutex::new(()));
        let backoff = Arc::new(self.backoff.clone());
        for slot in 0..self.settings.concurrency {
            let context = SlotContext {
                slot,
                owner_token: format!("{}:{}", self.worker_token, slot),
                store: self.store.clone(),
                settings: self.settings.clone(),
                processor: self.processor.clone(),
                backoff: backoff.clone(),
                events: self.events.clone(),
                running: self.running.clone(),
                semaphore: semaphore.clone(),
                fetch_lock: fetch_lock.clone(),
            };
            self.slots.push(tokio::spawn(async move {
                slot_loop(context).await;
            }));
        }
        let _ = self.events.send(WorkerEvent::Started);
        tracing::info!(queue = %self.store.queue_name(), concurrency = self.settings.concurrency, "worker started");
        Ok(())
    }

    /// Signals the slots to finish and waits up to the graceful shutdown
    /// timeout for in-flight processors to drain.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let grace = Duration::from_millis(self.settings.graceful_shutdown_timeout_ms);
        let handles = std::mem::take(&mut self.slots);
        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            tracing::warn!("graceful shutdown timed out, aborting worker slots");
            for abort in aborts {
                abort.abort();
            }
        }
        let _ = self.events.send(WorkerEvent::Stopped);
        tracing::info!(queue = %self.store.queue_name(), "worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn slot_loop(mut context: SlotContext) {
    let mut buffer: VecDeque<Job> = VecDeque::new();
    let mut consecutive_errors: u32 = 0;
    while context.running.load(Ordering::SeqCst) {
        let job = match next_job(&mut context, &mut buffer).await {
            Ok(Some(job)) => {
                consecutive_errors = 0;
                job
            }
            Ok(None) => {
                sleep(jittered_delay(IDLE_FETCH_DELAY_MS)).await;
                continue;
            }
            Err(err) => {
                consecutive_errors += 1;
                let _ = context.events.send(WorkerEvent::Error {
                    message: format!("fetch failed: {err}"),
                });
                tracing::warn!(slot = context.slot, error = %err, "fetch failed, backing off");
                sleep(fetch_error_backoff(consecutive_errors)).await;
                continue;
            }
        };

        // the semaphore gates processor execution, not fetching
        let permit = match context.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        process_one(&mut context, job).await;
        drop(permit);
    }
}

/// Drains the slot buffer first; an empty buffer refills under the shared
/// fetch lock so concurrent empty slots do not double-fetch.
async fn next_job(context: &mut SlotContext, buffer: &mut VecDeque<Job>) -> Result<Option<Job>> {
    if let Some(job) = buffer.pop_front() {
        return Ok(Some(job));
    }
    let fetch_lock = context.fetch_lock.clone();
    let _guard = fetch_lock.lock().await;
    let batch = context
        .store
        .fetch_next_jobs(
            context.settings.prefetch.max(1),
            context.settings.lock_duration_ms,
            Some(&context.owner_token),
        )
        .await?;
    let mut jobs = batch.into_iter();
    let first = jobs.next();
    buffer.extend(jobs);
    Ok(first)
}

async fn process_one(context: &mut SlotContext, job: Job) {
    let span = tracing::info_span!(
        "kodiak.job",
        job_id = %job.id,
        queue = %context.store.queue_name(),
        slot = context.slot,
        attempt = job.attempts_made()
    );

    let heartbeat = if context.settings.heartbeat_enabled {
        Some(spawn_heartbeat(context, job.id.clone()))
    } else {
        None
    };

    let processor = context.processor.clone();
    let active = ActiveJob {
        job: job.clone(),
        store: context.store.clone(),
        events: context.events.clone(),
    };
    let handle =
        tokio::spawn(async move { processor.process(active).await }.instrument(span.clone()));
    let result = match handle.await {
        Ok(result) => result,
        Err(join_error) => Err(anyhow::anyhow!("processor panicked: {join_error}")),
    };

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }

    async {
        match result {
            Ok(()) => match context.store.mark_completed(&job).await {
                Ok(outcome) => {
                    tracing::info!(outcome = ?outcome, "job completed");
                    let _ = context.events.send(WorkerEvent::Completed { job });
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to record completion");
                    let _ = context.events.send(WorkerEvent::Error {
                        message: format!("mark_completed failed: {err}"),
                    });
                }
            },
            Err(processor_error) => {
                let message = processor_error.to_string();
                let failed_at = Utc::now().timestamp_millis();
                let forced = context.backoff.next_attempt(&job, failed_at);
                match context.store.mark_failed(&job, &message, forced).await {
                    Ok(FailureOutcome::Retrying { next_attempt_ms }) => {
                        tracing::warn!(
                            error = %message,
                            next_attempt_ms,
                            "job failed, retry scheduled"
                        );
                        let _ = context.events.send(WorkerEvent::Failed {
                            job,
                            error: message,
                        });
                    }
                    Ok(FailureOutcome::Failed) => {
                        tracing::error!(error = %message, "job failed permanently");
                        let _ = context.events.send(WorkerEvent::Failed {
                            job,
                            error: message,
                        });
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "failed to record failure");
                        let _ = context.events.send(WorkerEvent::Error {
                            message: format!("mark_failed failed: {err}"),
                        });
                    }
                }
            }
        }
    }
    .instrument(span)
    .await;
}

/// Periodically pushes the lock expiry forward while the processor runs.
/// Heartbeat errors are reported but never interrupt processing.
fn spawn_heartbeat(context: &SlotContext, job_id: String) -> JoinHandle<()> {
    let mut store = context.store.clone();
    let owner_token = context.owner_token.clone();
    let lock_duration_ms = context.settings.lock_duration_ms;
    let interval = Duration::from_millis(context.settings.effective_heartbeat_interval_ms());
    let events = context.events.clone();
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            let new_expiry = Utc::now().timestamp_millis() + lock_duration_ms;
            match store
                .extend_lock(&job_id, new_expiry, Some(&owner_token))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(job_id = %job_id, "heartbeat could not extend lock");
                }
                Err(err) => {
                    let _ = events.send(WorkerEvent::Error {
                        message: format!("heartbeat failed for {job_id}: {err}"),
                    });
                }
            }
        }
    })
}

fn jittered_delay(base_ms: u64) -> Duration {
    let base = base_ms as f64;
    let mut rng = rand::rng();
    let delay = rng.random_range(base * 0.5..=base * 1.5);
    Duration::from_millis(delay as u64)
}

fn fetch_error_backoff(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(10);
    let delay_ms = (IDLE_FETCH_DELAY_MS << exponent).min(FETCH_ERROR_BACKOFF_CAP_MS);
    Duration::from_millis(delay_ms)
}

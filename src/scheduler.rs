use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::sleep;

use crate::constants::{PROMOTE_BATCH_LIMIT, SCHEDULER_TICK_MS};
use crate::events::DelayedScheduled;
use crate::store::QueueStore;

/// Drives delayed-to-waiting promotion and stalled recovery for one queue.
/// Three triggers combine: a periodic tick, keyspace-expiration events for
/// the per-job delay timers, and in-process timers registered when the
/// repository schedules a delay. Promotion is idempotent, so overlapping
/// triggers are harmless.
pub struct DelayScheduler {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    timers: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl DelayScheduler {
    pub(crate) fn spawn(
        store: QueueStore,
        client: redis::Client,
        rx: mpsc::UnboundedReceiver<DelayedScheduled>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let recovering = Arc::new(AtomicBool::new(false));
        let timers: Arc<Mutex<HashMap<String, AbortHandle>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut handles = Vec::new();

        {
            let mut store = store.clone();
            let shutdown = shutdown.clone();
            let recovering = recovering.clone();
            handles.push(tokio::spawn(async move {
                periodic_loop(&mut store, &shutdown, &recovering).await;
            }));
        }
        {
            let store = store.clone();
            let timers = timers.clone();
            handles.push(tokio::spawn(async move {
                timer_loop(store, timers, rx).await;
            }));
        }
        {
            let store = store.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                expiration_loop(store, client, shutdown).await;
            }));
        }

        Self {
            shutdown,
            handles,
            timers,
        }
    }

    /// Stops all drivers and clears any pending per-job timers.
    pub async fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        let mut timers = self.timers.lock().await;
        for (_, timer) in timers.drain() {
            timer.abort();
        }
    }
}

async fn promote(store: &mut QueueStore) {
    if let Err(err) = store.promote_delayed_jobs(PROMOTE_BATCH_LIMIT).await {
        tracing::warn!(queue = %store.queue_name(), error = %err, "delayed promotion failed");
    }
}

async fn periodic_loop(
    store: &mut QueueStore,
    shutdown: &Arc<AtomicBool>,
    recovering: &Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        sleep_with_shutdown(shutdown, Duration::from_millis(SCHEDULER_TICK_MS)).await;
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        promote(store).await;
        // recovery must not overlap itself
        if recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Err(err) = store.recover_stalled_jobs().await {
                tracing::warn!(queue = %store.queue_name(), error = %err, "stalled recovery failed");
            }
            recovering.store(false, Ordering::SeqCst);
        }
    }
}

async fn timer_loop(
    store: QueueStore,
    timers: Arc<Mutex<HashMap<String, AbortHandle>>>,
    mut rx: mpsc::UnboundedReceiver<DelayedScheduled>,
) {
    while let Some(event) = rx.recv().await {
        let now = chrono::Utc::now().timestamp_millis();
        let remaining = Duration::from_millis((event.due_ms - now).max(0) as u64);
        let mut timer_store = store.clone();
        let timers_for_task = timers.clone();
        let id = event.id.clone();
        let handle = tokio::spawn(async move {
            sleep(remaining).await;
            promote(&mut timer_store).await;
            timers_for_task.lock().await.remove(&id);
        });

        let mut timers = timers.lock().await;
        if let Some(previous) = timers.insert(event.id, handle.abort_handle()) {
            previous.abort();
        }
    }
}

/// Subscribes to keyspace expiration events so a delay timer expiring on the
/// store side wakes promotion even when no local timer survived. Keyspace
/// notifications are enabled best-effort; losing this driver only widens the
/// promotion latency to the periodic tick.
async fn expiration_loop(store: QueueStore, client: redis::Client, shutdown: Arc<AtomicBool>) {
    let timer_prefix = store.keys().timer_prefix().to_string();
    while !shutdown.load(Ordering::SeqCst) {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                tracing::debug!(error = %err, "expiration subscription unavailable");
                sleep_with_shutdown(&shutdown, Duration::from_secs(1)).await;
                continue;
            }
        };
        {
            let mut store = store.clone();
            let result: Result<(), redis::RedisError> = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Ex")
                .query_async(&mut store.conn)
                .await;
            if let Err(err) = result {
                tracing::debug!(error = %err, "could not enable keyspace notifications");
            }
        }
        if let Err(err) = pubsub.psubscribe("__keyevent@*__:expired").await {
            tracing::debug!(error = %err, "expiration subscribe failed");
            sleep_with_shutdown(&shutdown, Duration::from_secs(1)).await;
            continue;
        }

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let expired_key: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            if expired_key.starts_with(&timer_prefix) {
                let mut store = store.clone();
                promote(&mut store).await;
            }
        }
        // stream ended, resubscribe
        sleep_with_shutdown(&shutdown, Duration::from_millis(500)).await;
    }
}

async fn sleep_with_shutdown(shutdown: &Arc<AtomicBool>, duration: Duration) {
    let mut remaining = duration;
    let step = Duration::from_millis(100);
    while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
        let next = if remaining > step { step } else { remaining };
        sleep(next).await;
        remaining = remaining.saturating_sub(next);
    }
}

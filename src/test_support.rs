use std::sync::OnceLock;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::settings::QueueSettings;
use crate::store::QueueStore;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: QueueSettings,
    pub queue_name: String,
    pub store: QueueStore,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        Self::with_settings(|_| {}).await
    }

    pub async fn with_settings<F>(configure: F) -> Result<Self>
    where
        F: FnOnce(&mut QueueSettings),
    {
        init_tracing();
        let guard = redis_lock().lock().await;
        let mut settings = QueueSettings::default();
        settings.redis_url = std::env::var("KODIAK_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        configure(&mut settings);
        let queue_name = format!("test-queue-{}", Uuid::new_v4());
        let mut store = QueueStore::new(settings.clone(), &queue_name).await?;
        store.flushdb().await?;
        Ok(Self {
            _guard: guard,
            settings,
            queue_name,
            store,
        })
    }
}

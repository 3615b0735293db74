use std::sync::Arc;

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use uuid::Uuid;

use crate::constants::DEFAULT_DELAY_ON_LIMIT_MS;
use crate::scripts::ScriptSet;
use crate::settings::{DenyPolicy, RateLimitMode, RateLimiterSettings};

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed,
    Denied {
        policy: DenyPolicy,
        delay_ms: i64,
        reset_at: Option<i64>,
    },
}

/// Per-queue admission control. Any limiter script or store error fails
/// open: availability of processing wins over rate-limit precision.
#[derive(Clone)]
pub(crate) struct RateLimiter {
    settings: RateLimiterSettings,
    bucket_key: String,
    window_key: String,
    scripts: Arc<ScriptSet>,
}

impl RateLimiter {
    pub fn new(
        settings: RateLimiterSettings,
        bucket_key: String,
        window_key: String,
        scripts: Arc<ScriptSet>,
    ) -> Self {
        Self {
            settings,
            bucket_key,
            window_key,
            scripts,
        }
    }

    pub async fn check(&self, conn: &mut MultiplexedConnection, requested: i64) -> Admission {
        match self.settings.mode {
            RateLimitMode::TokenBucket => self.check_token_bucket(conn, requested).await,
            RateLimitMode::SlidingWindow => self.check_sliding_window(conn, requested).await,
        }
    }

    async fn check_token_bucket(
        &self,
        conn: &mut MultiplexedConnection,
        requested: i64,
    ) -> Admission {
        let now = Utc::now().timestamp_millis();
        let result: Result<i64, redis::RedisError> = self
            .scripts
            .token_bucket
            .key(&self.bucket_key)
            .arg(now)
            .arg(requested)
            .arg(self.settings.rate)
            .arg(self.settings.capacity)
            .invoke_async(conn)
            .await;
        match result {
            Ok(1) => Admission::Allowed,
            Ok(_) => Admission::Denied {
                policy: DenyPolicy::Delay,
                delay_ms: DEFAULT_DELAY_ON_LIMIT_MS,
                reset_at: None,
            },
            Err(err) => {
                tracing::debug!(error = %err, "token bucket check failed, admitting");
                Admission::Allowed
            }
        }
    }

    async fn check_sliding_window(
        &self,
        conn: &mut MultiplexedConnection,
        requested: i64,
    ) -> Admission {
        let window = match self.settings.sliding_window.as_ref() {
            Some(window) => window,
            None => {
                tracing::debug!("sliding window limiter without window settings, admitting");
                return Admission::Allowed;
            }
        };
        let now = Utc::now().timestamp_millis();
        let member_base = format!("{now}-{}", Uuid::new_v4());
        let result: Result<(i64, i64, i64, i64), redis::RedisError> = self
            .scripts
            .sliding_window
            .key(&self.window_key)
            .arg(now)
            .arg(window.window_ms)
            .arg(window.limit)
            .arg(requested)
            .arg(member_base)
            .invoke_async(conn)
            .await;
        match result {
            Ok((1, _, _, _)) => Admission::Allowed,
            Ok((_, _, _, reset_at)) => {
                // `enqueue` is reserved; treat it as reject.
                let policy = match window.policy {
                    DenyPolicy::Delay => DenyPolicy::Delay,
                    DenyPolicy::Reject | DenyPolicy::Enqueue => DenyPolicy::Reject,
                };
                Admission::Denied {
                    policy,
                    delay_ms: window.delay_ms.unwrap_or(DEFAULT_DELAY_ON_LIMIT_MS),
                    reset_at: Some(reset_at),
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "sliding window check failed, admitting");
                Admission::Allowed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SlidingWindowSettings;
    use crate::test_support::RedisTestContext;

    fn limiter(ctx: &RedisTestContext, settings: RateLimiterSettings) -> RateLimiter {
        RateLimiter::new(
            settings,
            format!("{}-bucket", ctx.queue_name),
            format!("{}-window", ctx.queue_name),
            Arc::new(ScriptSet::new()),
        )
    }

    #[tokio::test]
    async fn token_bucket_denies_when_exhausted_and_refills() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let limiter = limiter(
            &ctx,
            RateLimiterSettings {
                mode: RateLimitMode::TokenBucket,
                rate: 20.0,
                capacity: 2,
                ..Default::default()
            },
        );

        assert_eq!(limiter.check(&mut ctx.store.conn, 2).await, Admission::Allowed);
        let denied = limiter.check(&mut ctx.store.conn, 1).await;
        assert!(matches!(
            denied,
            Admission::Denied {
                policy: DenyPolicy::Delay,
                delay_ms: DEFAULT_DELAY_ON_LIMIT_MS,
                ..
            }
        ));

        // 20 tokens/s refills one token within ~50ms
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(limiter.check(&mut ctx.store.conn, 1).await, Admission::Allowed);
    }

    #[tokio::test]
    async fn sliding_window_reports_reset_time() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let limiter = limiter(
            &ctx,
            RateLimiterSettings {
                mode: RateLimitMode::SlidingWindow,
                sliding_window: Some(SlidingWindowSettings {
                    window_ms: 60_000,
                    limit: 1,
                    policy: DenyPolicy::Delay,
                    delay_ms: Some(100),
                }),
                ..Default::default()
            },
        );

        let before = Utc::now().timestamp_millis();
        assert_eq!(limiter.check(&mut ctx.store.conn, 1).await, Admission::Allowed);
        match limiter.check(&mut ctx.store.conn, 1).await {
            Admission::Denied {
                policy,
                delay_ms,
                reset_at,
            } => {
                assert_eq!(policy, DenyPolicy::Delay);
                assert_eq!(delay_ms, 100);
                let reset_at = reset_at.unwrap();
                assert!(reset_at >= before + 60_000);
                assert!(reset_at <= Utc::now().timestamp_millis() + 60_000);
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sliding_window_reject_policy_maps_through() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let limiter = limiter(
            &ctx,
            RateLimiterSettings {
                mode: RateLimitMode::SlidingWindow,
                sliding_window: Some(SlidingWindowSettings {
                    window_ms: 60_000,
                    limit: 0,
                    policy: DenyPolicy::Enqueue,
                    delay_ms: None,
                }),
                ..Default::default()
            },
        );
        match limiter.check(&mut ctx.store.conn, 1).await {
            Admission::Denied { policy, .. } => assert_eq!(policy, DenyPolicy::Reject),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn limiter_fails_open_on_script_error() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let limiter = limiter(
            &ctx,
            RateLimiterSettings {
                mode: RateLimitMode::TokenBucket,
                rate: 0.0,
                capacity: 0,
                ..Default::default()
            },
        );
        // Poison the bucket key with the wrong type so HMGET raises.
        let bucket_key = format!("{}-bucket", ctx.queue_name);
        let _: () = redis::cmd("LPUSH")
            .arg(&bucket_key)
            .arg("x")
            .query_async(&mut ctx.store.conn)
            .await
            .unwrap();

        assert_eq!(limiter.check(&mut ctx.store.conn, 1).await, Admission::Allowed);
        assert_eq!(limiter.check(&mut ctx.store.conn, 1).await, Admission::Allowed);
    }
}

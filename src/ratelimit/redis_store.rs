//! Redis-backed window store.
//!
//! The evaluator runs as a Lua script, so every evaluation is one round trip
//! and executes atomically with respect to every other client of the same
//! Redis instance.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::backend::WindowStore;
use super::script::{WindowInvocation, WindowOutcome, SLIDING_WINDOW_LUA};
use crate::error::{Result, WindowGuardError};

/// A window store backed by a shared Redis instance.
///
/// The connection is multiplexed; clones of the handle share it, so the
/// store can be used from any number of tasks concurrently.
pub struct RedisWindowStore {
    connection: ConnectionManager,
    script: Script,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("script_hash", &self.script.get_hash())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisWindowStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        debug!(url = %url, "Connected to Redis");
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(SLIDING_WINDOW_LUA),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WindowGuardError::StoreClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn evaluate(&self, invocation: &WindowInvocation) -> Result<WindowOutcome> {
        self.ensure_open()?;

        let mut invoke = self.script.prepare_invoke();
        invoke
            .key(&invocation.key)
            .arg(invocation.now_ms)
            .arg(invocation.window_ms)
            .arg(invocation.limit)
            .arg(&invocation.entry_id);

        let mut connection = self.connection.clone();
        let reply: i64 = invoke.invoke_async(&mut connection).await?;
        WindowOutcome::from_reply(reply)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;

        let mut connection = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Redis store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::ratelimit::{ManualClock, WindowLimiter, WindowPolicy};

    const REDIS_URL_VAR: &str = "WINDOWGUARD_TEST_REDIS_URL";

    async fn test_store() -> RedisWindowStore {
        let url = std::env::var(REDIS_URL_VAR)
            .unwrap_or_else(|_| panic!("{} must point at a Redis instance", REDIS_URL_VAR));
        RedisWindowStore::connect(&url).await.expect("redis reachable")
    }

    fn unique_key(name: &str) -> String {
        format!("limit:test:{}:{}", name, uuid::Uuid::new_v4())
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn invocation(key: &str, now_ms: i64, window: Duration, limit: u64) -> WindowInvocation {
        let entry_id = format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple());
        WindowInvocation::new(key, now_ms, window, limit, entry_id)
    }

    async fn pttl(store: &RedisWindowStore, key: &str) -> i64 {
        let mut connection = store.connection.clone();
        redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a live Redis (WINDOWGUARD_TEST_REDIS_URL)"]
    async fn test_redis_ping() {
        let store = test_store().await;
        store.ping().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a live Redis (WINDOWGUARD_TEST_REDIS_URL)"]
    async fn test_redis_quota_and_slide() {
        let store = test_store().await;

        // start from the real time so the key TTL set by PEXPIRE stays sane
        let clock = Arc::new(ManualClock::new(now_ms()));
        let limiter = WindowLimiter::new(
            Arc::new(store),
            WindowPolicy::new(3, Duration::from_secs(1)),
        )
        .with_clock(clock.clone());
        let key = unique_key("slide");

        for i in 0..3 {
            assert!(limiter.allow(&key).await, "request {} should be allowed", i + 1);
        }
        assert!(!limiter.allow(&key).await, "4th request should be blocked");

        clock.advance(Duration::from_secs(2));
        assert!(limiter.allow(&key).await, "request after the window should be allowed");
    }

    #[tokio::test]
    #[ignore = "requires a live Redis (WINDOWGUARD_TEST_REDIS_URL)"]
    async fn test_redis_entry_exactly_one_window_old_is_evicted() {
        let store = test_store().await;
        let key = unique_key("boundary");
        let window = Duration::from_millis(1_000);
        let start = now_ms();

        let first = store.evaluate(&invocation(&key, start, window, 1)).await.unwrap();
        assert_eq!(first, WindowOutcome::Admitted);

        let inside = store.evaluate(&invocation(&key, start + 999, window, 1)).await.unwrap();
        assert_eq!(inside, WindowOutcome::Denied);

        let boundary = store.evaluate(&invocation(&key, start + 1_000, window, 1)).await.unwrap();
        assert_eq!(boundary, WindowOutcome::Admitted);
    }

    #[tokio::test]
    #[ignore = "requires a live Redis (WINDOWGUARD_TEST_REDIS_URL)"]
    async fn test_redis_admission_refreshes_expiry() {
        let store = test_store().await;
        let key = unique_key("expiry");
        let window = Duration::from_secs(60);

        let first = store.evaluate(&invocation(&key, now_ms(), window, 5)).await.unwrap();
        assert_eq!(first, WindowOutcome::Admitted);
        assert!(pttl(&store, &key).await > 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let aged = pttl(&store, &key).await;
        assert!(aged > 0 && aged <= 59_700, "unexpected ttl {}", aged);

        let second = store.evaluate(&invocation(&key, now_ms(), window, 5)).await.unwrap();
        assert_eq!(second, WindowOutcome::Admitted);
        let refreshed = pttl(&store, &key).await;
        assert!(refreshed > aged, "ttl {} not refreshed past {}", refreshed, aged);
        assert!(refreshed <= 60_000);
    }

    #[tokio::test]
    #[ignore = "requires a live Redis (WINDOWGUARD_TEST_REDIS_URL)"]
    async fn test_redis_denial_leaves_expiry_alone() {
        let store = test_store().await;
        let key = unique_key("denied-expiry");
        let window = Duration::from_secs(60);

        store.evaluate(&invocation(&key, now_ms(), window, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let aged = pttl(&store, &key).await;

        let denied = store.evaluate(&invocation(&key, now_ms(), window, 1)).await.unwrap();
        assert_eq!(denied, WindowOutcome::Denied);
        assert!(pttl(&store, &key).await <= aged);
    }

    #[tokio::test]
    #[ignore = "requires a live Redis (WINDOWGUARD_TEST_REDIS_URL)"]
    async fn test_redis_zero_limit() {
        let store = test_store().await;

        let limiter = WindowLimiter::new(
            Arc::new(store),
            WindowPolicy::new(0, Duration::from_secs(1)),
        );
        assert!(!limiter.allow(&unique_key("zero")).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a live Redis (WINDOWGUARD_TEST_REDIS_URL)"]
    async fn test_redis_concurrent_admissions_are_exact() {
        let store = test_store().await;

        let limiter = Arc::new(WindowLimiter::new(
            Arc::new(store),
            WindowPolicy::new(10, Duration::from_secs(30)),
        ));
        let key = unique_key("concurrent");

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.allow(&key).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    #[ignore = "requires a live Redis (WINDOWGUARD_TEST_REDIS_URL)"]
    async fn test_redis_closed_store_refuses_calls() {
        let store = test_store().await;
        store.close().await.unwrap();
        assert!(matches!(store.ping().await, Err(WindowGuardError::StoreClosed)));
    }
}

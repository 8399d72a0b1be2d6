//! Token bucket — per-function admission control
//!
//! A fixed-capacity bucket refilled by a periodic task. `acquire` is
//! non-blocking and linearizable; callers that miss a token are rejected,
//! not parked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;

/// Fixed-capacity token bucket with a periodic refill task
pub struct TokenBucket {
    /// Tokens added on each refill tick
    tokens_per_fill: u64,
    /// Interval between refill ticks
    fill_interval: Duration,
    /// Bucket capacity
    max_tokens: u64,
    /// Current token count; the bucket starts full
    tokens: Arc<AtomicU64>,
    /// Refill task handle, present while started
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenBucket {
    /// Create a bucket from a rate limit config. The bucket starts full
    /// and does not refill until `start` is called.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            tokens_per_fill: config.tokens_per_fill,
            fill_interval: Duration::from_millis(config.fill_interval_ms),
            max_tokens: config.max_tokens,
            tokens: Arc::new(AtomicU64::new(config.max_tokens)),
            refill_task: Mutex::new(None),
        }
    }

    /// Begin periodic refill. Idempotent.
    pub fn start(&self) {
        let mut task = self.refill_task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let tokens = Arc::clone(&self.tokens);
        let per_fill = self.tokens_per_fill;
        let max = self.max_tokens;
        let period = self.fill_interval;
        let first_tick = tokio::time::Instant::now() + period;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(first_tick, period);
            loop {
                interval.tick().await;
                let _ = tokens.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    Some((current + per_fill).min(max))
                });
            }
        }));
    }

    /// Take one token if available. Never blocks.
    pub fn acquire(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current >= 1 {
                    Some(current - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Stop the refill task. Idempotent; `acquire` keeps draining whatever
    /// tokens remain.
    pub fn close(&self) {
        if let Some(task) = self.refill_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Current token count
    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    /// Whether the refill task is running
    #[allow(dead_code)]
    pub fn is_started(&self) -> bool {
        self.refill_task.lock().unwrap().is_some()
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_fill: u64, interval_ms: u64, max: u64) -> RateLimitConfig {
        RateLimitConfig {
            tokens_per_fill: per_fill,
            fill_interval_ms: interval_ms,
            max_tokens: max,
        }
    }

    #[tokio::test]
    async fn test_starts_full() {
        let bucket = TokenBucket::new(&config(1, 1000, 3));
        assert_eq!(bucket.tokens(), 3);
    }

    #[tokio::test]
    async fn test_acquire_drains() {
        let bucket = TokenBucket::new(&config(1, 1000, 2));
        assert!(bucket.acquire());
        assert!(bucket.acquire());
        assert!(!bucket.acquire());
        assert_eq!(bucket.tokens(), 0);
    }

    #[tokio::test]
    async fn test_refill_restores_tokens() {
        tokio::time::pause();
        let bucket = TokenBucket::new(&config(2, 50, 10));
        bucket.start();

        for _ in 0..10 {
            assert!(bucket.acquire());
        }
        assert!(!bucket.acquire());

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert!(bucket.acquire());
        assert!(bucket.acquire());
        assert!(!bucket.acquire());
    }

    #[tokio::test]
    async fn test_refill_caps_at_max() {
        tokio::time::pause();
        let bucket = TokenBucket::new(&config(100, 10, 5));
        bucket.start();

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(bucket.tokens(), 5);
    }

    #[tokio::test]
    async fn test_close_stops_refill() {
        tokio::time::pause();
        let bucket = TokenBucket::new(&config(1, 10, 5));
        bucket.start();
        while bucket.acquire() {}
        bucket.close();

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(bucket.tokens(), 0);
        assert!(!bucket.acquire());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let bucket = TokenBucket::new(&config(1, 1000, 5));
        bucket.start();
        bucket.start();
        assert!(bucket.is_started());
        bucket.close();
        assert!(!bucket.is_started());
        bucket.close();
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_oversells() {
        let bucket = Arc::new(TokenBucket::new(&config(1, 10_000, 100)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = Arc::clone(&bucket);
            handles.push(tokio::spawn(async move {
                let mut granted = 0u64;
                for _ in 0..50 {
                    if b.acquire() {
                        granted += 1;
                    }
                }
                granted
            }));
        }

        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 100);
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_bucket_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TokenBucket>();
    }
}

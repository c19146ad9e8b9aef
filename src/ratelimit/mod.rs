//! Token-bucket rate limiter with bounded waiting.
//!
//! Hand-built from the `tokio::sync` primitive family rather than
//! `std::sync`, since the refill task and waiters all need to cooperate
//! across `.await` points. A background task refills the bucket on a
//! fixed tick and wakes waiters in FIFO order, which is what makes the
//! fair-FIFO-to-within-one-window throughput property hold.

use crate::config::RateLimiterConfig;
use crate::error::IngestError;
use crate::retry::Retryable;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{Duration, Instant};

impl Retryable for IngestError {
    fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transient(_) | IngestError::RateLimitTimeout { .. })
    }
}

struct Waiter {
    notify: oneshot::Sender<()>,
    enqueued_at: Instant,
}

struct Inner {
    tokens: u32,
    capacity: u32,
    queue: VecDeque<Waiter>,
    destroyed: bool,
}

/// A process-local, per-outbound-endpoint token bucket. Not shared across
/// processes — a global budget, if ever required, is achieved by tuning
/// each process's share rather than distributed coordination.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    window: Duration,
    max_wait: Duration,
    acquired_total: AtomicU64,
    timed_out_total: AtomicU64,
    refill_task: tokio::task::JoinHandle<()>,
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.refill_task.abort();
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Arc<Self> {
        let window = Duration::from_millis(config.window_ms);
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let refill_task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(window);
                ticker.tick().await; // first tick fires immediately; discard it
                loop {
                    ticker.tick().await;
                    let Some(limiter) = weak.upgrade() else {
                        break;
                    };
                    limiter.refill().await;
                }
            });

            Self {
                inner: Mutex::new(Inner {
                    tokens: config.max_requests_per_window,
                    capacity: config.max_requests_per_window,
                    queue: VecDeque::new(),
                    destroyed: false,
                }),
                window,
                max_wait: Duration::from_millis(config.max_wait_ms),
                acquired_total: AtomicU64::new(0),
                timed_out_total: AtomicU64::new(0),
                refill_task,
            }
        })
    }

    async fn refill(&self) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        inner.tokens = inner.capacity;
        while inner.tokens > 0 {
            match inner.queue.pop_front() {
                Some(waiter) => {
                    inner.tokens -= 1;
                    let _ = waiter.notify.send(());
                }
                None => break,
            }
        }
    }

    /// Returns when a token is available, or fails with
    /// [`IngestError::RateLimitTimeout`] after `max_wait_ms`, or
    /// [`IngestError::RateLimiterDestroyed`] if `destroy()` was called
    /// while waiting.
    pub async fn acquire(&self) -> Result<(), IngestError> {
        let rx = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(IngestError::RateLimiterDestroyed);
            }
            if inner.tokens > 0 {
                inner.tokens -= 1;
                self.acquired_total.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(Waiter {
                notify: tx,
                enqueued_at: Instant::now(),
            });
            rx
        };

        match tokio::time::timeout(self.max_wait, rx).await {
            Ok(Ok(())) => {
                self.acquired_total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(IngestError::RateLimiterDestroyed),
            Err(_) => {
                self.timed_out_total.fetch_add(1, Ordering::Relaxed);
                Err(IngestError::RateLimitTimeout {
                    waited_ms: self.max_wait.as_millis() as u64,
                })
            }
        }
    }

    /// Rejects all pending waiters and any future `acquire()` calls.
    pub async fn destroy(&self) {
        let mut inner = self.inner.lock().await;
        inner.destroyed = true;
        while let Some(waiter) = inner.queue.pop_front() {
            drop(waiter.notify); // dropping the sender fails the receiver
        }
    }

    pub async fn queue_depth(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub fn acquired_total(&self) -> u64 {
        self.acquired_total.load(Ordering::Relaxed)
    }

    pub fn timed_out_total(&self) -> u64 {
        self.timed_out_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_tokens_up_to_capacity_then_waits() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests_per_window: 2,
            window_ms: 50,
            max_wait_ms: 500,
        });
        assert!(limiter.acquire().await.is_ok());
        assert!(limiter.acquire().await.is_ok());
        // Third caller queues and is granted on the next refill tick.
        let started = Instant::now();
        assert!(limiter.acquire().await.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn times_out_when_wait_budget_exceeded() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests_per_window: 1,
            window_ms: 1_000,
            max_wait_ms: 20,
        });
        assert!(limiter.acquire().await.is_ok());
        let result = limiter.acquire().await;
        assert!(matches!(result, Err(IngestError::RateLimitTimeout { .. })));
    }

    #[tokio::test]
    async fn destroy_rejects_pending_waiters() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests_per_window: 1,
            window_ms: 10_000,
            max_wait_ms: 5_000,
        });
        assert!(limiter.acquire().await.is_ok());
        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        limiter.destroy().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(IngestError::RateLimiterDestroyed)));
    }

    #[tokio::test]
    async fn throughput_does_not_exceed_1_2x_rate_under_hammering() {
        // n concurrent callers, r=2 tokens per 100ms window; expect the
        // achieved throughput to stay within a 1.2x bound over a short
        // burst.
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests_per_window: 2,
            window_ms: 100,
            max_wait_ms: 600,
        });
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        let mut ok = 0u32;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        let elapsed = start.elapsed().as_secs_f64();
        let windows = (elapsed / 0.1).max(1.0);
        let max_allowed = 1.2 * 2.0 * windows;
        assert!(
            (ok as f64) <= max_allowed + 2.0,
            "granted {ok} tokens over ~{windows:.1} windows, bound {max_allowed:.1}"
        );
    }
}

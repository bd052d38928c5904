//! Broker call rate limiting
//!
//! A token bucket shared by every broker call, plus the persisted queue that
//! holds candidates deferred while the bucket is dry in elevated regimes.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Direction, Regime};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket (per-process, cloned handles share tokens)
#[derive(Debug, Clone)]
pub struct TokenBucket {
    state: Arc<Mutex<BucketState>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec: refill_per_sec.max(f64::EPSILON),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a token if one is available
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, without consuming any
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Wait until a token is available, then take it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// A candidate postponed for lack of broker capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredCandidate {
    pub symbol: String,
    pub direction: Direction,
    pub regime: Regime,
    pub deferred_at: DateTime<Utc>,
}

/// Persisted FIFO of deferred candidates, one entry per symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeferredQueue {
    #[serde(default)]
    pub entries: VecDeque<DeferredCandidate>,
}

impl DeferredQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.iter().any(|e| e.symbol == symbol)
    }

    /// Queue a candidate; returns false if the symbol is already queued or
    /// the queue is full
    pub fn push(&mut self, candidate: DeferredCandidate, max_len: usize) -> bool {
        if self.contains(&candidate.symbol) || self.entries.len() >= max_len {
            return false;
        }
        self.entries.push_back(candidate);
        true
    }

    /// Drop entries older than `max_age`; returns how many were dropped
    pub fn expire(&mut self, now: DateTime<Utc>, max_age: ChronoDuration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| now - e.deferred_at <= max_age);
        before - self.entries.len()
    }

    /// Pop up to `limit` entries, oldest first
    pub fn take(&mut self, limit: usize) -> Vec<DeferredCandidate> {
        let n = limit.min(self.entries.len());
        self.entries.drain(..n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn test_bucket_exhausts_and_refills() {
        let bucket = TokenBucket::new(2, 1.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1, 2.0);
        assert!(bucket.try_acquire());

        let mut waiter = task::spawn(bucket.acquire());
        assert_pending!(waiter.poll());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_caps_refill() {
        let bucket = TokenBucket::new(3, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.available() <= 3.0);
    }

    #[test]
    fn test_deferred_queue_dedupes_and_bounds() {
        let now = Utc::now();
        let entry = |symbol: &str| DeferredCandidate {
            symbol: symbol.to_string(),
            direction: Direction::Bullish,
            regime: Regime::Panic,
            deferred_at: now,
        };

        let mut queue = DeferredQueue::default();
        assert!(queue.push(entry("AAPL"), 2));
        assert!(!queue.push(entry("AAPL"), 2));
        assert!(queue.push(entry("MSFT"), 2));
        assert!(!queue.push(entry("NVDA"), 2));

        let taken = queue.take(1);
        assert_eq!(taken[0].symbol, "AAPL");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_deferred_queue_expires_old_entries() {
        let now = Utc::now();
        let mut queue = DeferredQueue::default();
        queue.push(
            DeferredCandidate {
                symbol: "OLD".to_string(),
                direction: Direction::Bearish,
                regime: Regime::RiskOff,
                deferred_at: now - ChronoDuration::hours(2),
            },
            10,
        );
        queue.push(
            DeferredCandidate {
                symbol: "NEW".to_string(),
                direction: Direction::Bullish,
                regime: Regime::RiskOff,
                deferred_at: now,
            },
            10,
        );

        assert_eq!(queue.expire(now, ChronoDuration::minutes(30)), 1);
        assert!(queue.contains("NEW"));
        assert!(!queue.contains("OLD"));
    }
}

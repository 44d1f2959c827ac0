//! Token bucket guarding the classifier's LLM fallback.
//!
//! The bucket is an explicit value owned by whoever builds the classifier
//! (usually one per process, shared through an `Arc`). It never blocks:
//! [`TokenBucket::try_acquire`] either takes a token or reports exhaustion,
//! and the classifier then keeps its offline answer.

use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens, refilled continuously at
    /// `refill_per_sec` tokens per second.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = Instant::now()
            .duration_since(state.last_refill)
            .as_secs_f64();
        (state.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn burst_then_exhausted() {
        let bucket = TokenBucket::new(5, 0.5);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(5, 0.5);
        for _ in 0..5 {
            bucket.try_acquire();
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!bucket.try_acquire());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity() {
        let bucket = TokenBucket::new(2, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.available() <= 2.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }
}

//! Request and token budgets for the remote embedding API.
//!
//! Two independent token buckets (requests/min and tokens/min) refill
//! continuously; `acquire` deducts from both or sleeps for the exact
//! shortfall. Backoff delays are exponential with seedable jitter so tests
//! can pin the sequence.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    available: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn per_minute(limit: u32) -> Self {
        let capacity = f64::from(limit.max(1));
        Self {
            capacity,
            available: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until `cost` is available, or `None` if it already is.
    /// Costs above the bucket capacity are clamped; otherwise an oversized
    /// batch could never be admitted.
    fn wait_for(&self, cost: f64) -> Option<Duration> {
        let cost = cost.min(self.capacity);
        if self.available >= cost {
            return None;
        }
        let deficit = cost - self.available;
        Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }

    fn deduct(&mut self, cost: f64) {
        self.available -= cost.min(self.capacity);
    }
}

/// Dual-bucket rate limiter shared by all embedding workers of a job.
pub struct RateLimiter {
    buckets: Mutex<(Bucket, Bucket)>,
}

impl RateLimiter {
    pub fn new(req_per_min: u32, tok_per_min: u32) -> Self {
        Self {
            buckets: Mutex::new((
                Bucket::per_minute(req_per_min),
                Bucket::per_minute(tok_per_min),
            )),
        }
    }

    /// Block cooperatively until both buckets can cover the cost, then deduct.
    pub async fn acquire(&self, req_cost: u32, tok_cost: u32) {
        let req_cost = f64::from(req_cost);
        let tok_cost = f64::from(tok_cost);
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                buckets.0.refill(now);
                buckets.1.refill(now);
                match (buckets.0.wait_for(req_cost), buckets.1.wait_for(tok_cost)) {
                    (None, None) => {
                        buckets.0.deduct(req_cost);
                        buckets.1.deduct(tok_cost);
                        return;
                    }
                    (a, b) => a.unwrap_or(Duration::ZERO).max(b.unwrap_or(Duration::ZERO)),
                }
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limiter sleeping");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Exponential backoff with symmetric jitter.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    rng: StdRng,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Jitter drawn from a pinned seed, for deterministic tests.
    pub fn with_seed(base: Duration, cap: Duration, jitter: f64, seed: u64) -> Self {
        Self {
            base,
            cap,
            jitter,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `min(cap, base * 2^attempt) * (1 ± jitter)`.
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt.min(31) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let factor = if self.jitter > 0.0 {
            1.0 + self.rng.random_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

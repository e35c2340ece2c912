use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Process-wide token bucket. Exhaustion suspends the caller instead of
/// erroring; the bucket cap is a single token so calls are paced at the
/// configured rate and no 1-second window exceeds it.
pub struct RateLimiter {
    rate_per_second: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64) -> Self {
        Self {
            rate_per_second: rate_per_second.max(0.001),
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut b = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(b.last).as_secs_f64();
                b.tokens = (b.tokens + elapsed * self.rate_per_second).min(1.0);
                b.last = now;
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - b.tokens) / self.rate_per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

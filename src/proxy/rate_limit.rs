use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

// Enforces a minimum spacing between outbound upstream calls sharing one
// limiter. Waiters hold a fair async mutex around the next-free instant, so
// they are released FIFO with at least `min_interval` between releases.
pub struct RateLimiter {
    min_interval: Duration,
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            next_free: Mutex::new(Instant::now()),
        }
    }

    pub fn default_v1_internal() -> Self {
        Self::new(crate::constants::V1_INTERNAL_MIN_INTERVAL_MS)
    }

    // Suspends until at least `min_interval` has elapsed since the previous
    // wait() returned.
    pub async fn wait(&self) {
        let mut next_free = self.next_free.lock().await;
        let now = Instant::now();
        if *next_free > now {
            tokio::time::sleep_until(*next_free).await;
        }
        *next_free = Instant::now() + self.min_interval;
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

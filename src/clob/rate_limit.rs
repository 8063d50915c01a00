// =============================================================================
// Rate Limiter — token bucket gating outbound venue requests
// =============================================================================
//
// One bucket per venue. `acquire` suspends the requester until tokens are
// available rather than rejecting, so a burst of strategy activity queues
// behind the limit instead of erroring out.
// =============================================================================

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with a configurable sustained rate and burst capacity.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate` is tokens per second; `burst` caps how many can accumulate.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate: rate.max(0.001),
            burst: f64::from(burst.max(1)),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst.max(1)),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `tokens` from the bucket, sleeping until they are available.
    pub async fn acquire(&self, tokens: u32) {
        let needed = f64::from(tokens);
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= needed {
                    state.tokens -= needed;
                    return;
                }
                (needed - state.tokens) / self.rate
            };

            debug!(wait_secs = wait, "rate limit reached, waiting for tokens");
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_granted_immediately() {
        let bucket = TokenBucket::new(10.0, 5);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire(1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_suspends_until_refill() {
        let bucket = TokenBucket::new(10.0, 1);
        bucket.acquire(1).await;

        let start = Instant::now();
        bucket.acquire(1).await;
        // One token at 10/s takes ~100 ms of (virtual) time to refill.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_do_not_accumulate_past_burst() {
        let bucket = TokenBucket::new(100.0, 2);
        tokio::time::sleep(Duration::from_secs(10)).await;

        bucket.acquire(2).await;
        let start = Instant::now();
        bucket.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_millis(9));
    }
}

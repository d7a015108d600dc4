use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Global request quota for one exchange.
///
/// Callers block on `acquire` until a token is available rather than failing
/// fast; the refill rate is the exchange's documented request budget.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<Mutex<BucketState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            })),
            capacity: capacity as f64,
            refill_per_sec,
        }
    }

    /// Take one token, waiting for refill when the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.tokens) / self.refill_per_sec,
                    ))
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    debug!("Exchange quota exhausted, waiting {:?}", delay);
                    sleep(delay).await;
                }
            }
        }
    }
}

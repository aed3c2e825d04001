//! Throttled upstream HTTP client
//!
//! All calls to the upstream identity provider (refresh, authorization-code
//! exchange) go through this wrapper: a token bucket bounds request rate, a
//! semaphore bounds concurrency, and transient failures are retried with
//! exponential backoff plus jitter.

use crate::error::{BridgeError, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

/// Throttling configuration for upstream HTTP calls
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Sustained requests per second
    pub rps_limit: f64,
    /// Burst capacity of the token bucket
    pub burst: f64,
    /// Maximum concurrent upstream requests
    pub concurrency_limit: usize,
    /// Per-attempt request timeout
    pub request_timeout: Duration,
    /// Maximum retry attempts for retryable failures
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rps_limit: 10.0,
            burst: 20.0,
            concurrency_limit: 5,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Simple token bucket rate limiter
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket with the given capacity and refill rate
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until one token is available, then consume it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec))
                }
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Try to consume a token without waiting
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// HTTP client wrapper applying rate limiting, concurrency gating and retries
#[derive(Clone)]
pub struct ThrottledClient {
    client: reqwest::Client,
    bucket: Arc<TokenBucket>,
    gate: Arc<Semaphore>,
    config: ThrottleConfig,
}

impl ThrottledClient {
    /// Create a throttled client with the given configuration
    pub fn new(config: ThrottleConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            bucket: Arc::new(TokenBucket::new(config.burst, config.rps_limit)),
            gate: Arc::new(Semaphore::new(config.concurrency_limit)),
            config,
        }
    }

    /// Access the inner reqwest client for request building
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute a request-producing closure with throttling and retries
    ///
    /// The closure is invoked once per attempt so the request body can be
    /// rebuilt. Non-retryable failures return immediately.
    pub async fn execute<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| BridgeError::connection("Upstream concurrency gate closed"))?;

        let mut attempt = 0u32;
        loop {
            self.bucket.acquire().await;

            match build(&self.client).send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!("Upstream request failed after {} attempts: {}", attempt, e);
                        return Err(BridgeError::Http(e));
                    }

                    // Exponential backoff: base * 2^(attempt-1) with up to 25% jitter
                    let base = self.config.retry_base_delay.as_millis() as u64;
                    let backoff = base.saturating_mul(1u64 << (attempt - 1).min(10));
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 4);
                    let delay = Duration::from_millis(backoff + jitter);

                    debug!(
                        "Upstream request attempt {} failed ({}), retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_allows_burst_then_blocks() {
        let bucket = TokenBucket::new(3.0, 1000.0);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        // Burst exhausted; with a fast refill rate the next acquire succeeds soon
        bucket.acquire().await;
    }

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let bucket = TokenBucket::new(1.0, 50.0);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn test_client_construction() {
        let client = ThrottledClient::new(ThrottleConfig::default());
        // Semaphore should expose the configured number of permits
        assert_eq!(client.gate.available_permits(), 5);
    }
}

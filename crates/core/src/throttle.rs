//! Bandwidth throttling with a token bucket
//!
//! One limiter is shared by every read of a cycle's source view, so the
//! cap applies to the aggregate rate rather than per worker.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::error::{Error, Result};

/// Upper bound on tokens replenished per second
const MAX_TOKENS_PER_SEC: u64 = 1_000_000;

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Clone)]
pub struct BandwidthLimiter {
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    bytes_per_token: u64,
    /// Bucket capacity in tokens, one second worth of bytes
    burst: u32,
    max_bytes_per_sec: u64,
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("max_bytes_per_sec", &self.max_bytes_per_sec)
            .finish()
    }
}

impl BandwidthLimiter {
    /// Create a limiter; `max_bytes_per_sec == 0` disables throttling
    pub fn new(max_bytes_per_sec: u64) -> Self {
        if max_bytes_per_sec == 0 {
            return Self::unlimited();
        }

        let bytes_per_token = (max_bytes_per_sec / MAX_TOKENS_PER_SEC).max(1);
        // One token every `bytes_per_token / max_bytes_per_sec` seconds, rounded
        // up to the next nanosecond so the cap is never exceeded
        let period_nanos =
            (bytes_per_token as u128 * NANOS_PER_SEC).div_ceil(max_bytes_per_sec as u128);
        let period = Duration::from_nanos(period_nanos.max(1) as u64);
        let burst = NonZeroU32::new((max_bytes_per_sec / bytes_per_token).clamp(1, u32::MAX as u64) as u32)
            .unwrap_or(NonZeroU32::MIN);

        let limiter = Quota::with_period(period)
            .map(|quota| Arc::new(RateLimiter::direct(quota.allow_burst(burst))));

        Self {
            limiter,
            bytes_per_token,
            burst: burst.get(),
            max_bytes_per_sec,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            bytes_per_token: 0,
            burst: 0,
            max_bytes_per_sec: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limiter.is_none()
    }

    pub fn max_bytes_per_sec(&self) -> u64 {
        self.max_bytes_per_sec
    }

    /// Wait until `bytes` may be transferred
    pub async fn acquire(&self, bytes: u64) -> Result<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        let mut remaining = bytes.div_ceil(self.bytes_per_token).max(1);
        while remaining > 0 {
            // The bucket never holds more than `burst` tokens
            let batch = remaining.min(self.burst as u64) as u32;
            let Some(n) = NonZeroU32::new(batch) else {
                break;
            };
            limiter
                .until_n_ready(n)
                .await
                .map_err(|e| Error::General(format!("bandwidth limiter: {e}")))?;
            remaining -= batch as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_means_unlimited() {
        let limiter = BandwidthLimiter::new(0);
        assert!(limiter.is_unlimited());
        assert_eq!(limiter.max_bytes_per_sec(), 0);
    }

    #[test]
    fn test_limited() {
        let limiter = BandwidthLimiter::new(8 * 1024 * 1024);
        assert!(!limiter.is_unlimited());
        assert_eq!(limiter.bytes_per_token, 8);
        assert_eq!(limiter.burst, 1024 * 1024);
    }

    #[test]
    fn test_huge_cap_is_still_limited() {
        let limiter = BandwidthLimiter::new(u64::MAX / 2);
        assert!(!limiter.is_unlimited());
    }

    /// Drain the one-second burst, then time the next `bytes`
    async fn time_after_burst(cap: u64, bytes: u64) -> Duration {
        let limiter = BandwidthLimiter::new(cap);
        limiter.acquire(cap).await.unwrap();
        let start = std::time::Instant::now();
        limiter.acquire(bytes).await.unwrap();
        start.elapsed()
    }

    #[tokio::test]
    async fn test_small_cap_is_enforced() {
        // 50 bytes at 100 B/s
        let elapsed = time_after_burst(100, 50).await;
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_cap_is_not_rounded_down() {
        // 1000 bytes at 1999 B/s is half a second, not a full one
        let elapsed = time_after_burst(1999, 1000).await;
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(950), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_unlimited_acquire_returns_immediately() {
        let limiter = BandwidthLimiter::unlimited();
        limiter.acquire(u64::MAX).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_within_burst() {
        let limiter = BandwidthLimiter::new(1024 * 1024);
        let start = std::time::Instant::now();
        limiter.acquire(64 * 1024).await.unwrap();
        assert!(start.elapsed() < std::time::Duration::from_millis(500));
    }
}

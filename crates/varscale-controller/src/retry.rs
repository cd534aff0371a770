//! Exponential backoff around resource and metrics-backend calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use varscale_meta::StoreError;

use crate::collector::SourceError;

/// Whether an error may clear up on its own.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        SourceError::is_transient(self)
    }
}

/// `steps` attempts, sleeping `duration * factor^n` (plus up to
/// `jitter * delay`) between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
}

impl Backoff {
    /// Most store reads and writes.
    pub const STANDARD: Backoff = Backoff {
        duration: Duration::from_millis(100),
        factor: 2.0,
        jitter: 0.1,
        steps: 5,
    };

    pub const RECONCILE: Backoff = Backoff {
        duration: Duration::from_millis(500),
        factor: 2.0,
        jitter: 0.0,
        steps: 5,
    };

    /// Start-up connectivity check: 5s, 10s, 20s, 40s, 80s.
    pub const PROMETHEUS: Backoff = Backoff {
        duration: Duration::from_secs(5),
        factor: 2.0,
        jitter: 0.1,
        steps: 6,
    };

    /// Delay after the `attempt`-th failure (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.duration.mul_f64(self.factor.max(1.0).powi(exp))
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }
}

/// Run `op` until it succeeds, fails permanently or runs out of steps.
/// The last error is returned.
pub async fn retry<T, E, F, Fut>(backoff: Backoff, what: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => {
                tracing::debug!(what, error=%e, "permanent error, not retrying");
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= steps {
                    tracing::warn!(what, attempts = attempt, error=%e, "giving up after retries");
                    return Err(e);
                }
                let delay = backoff.delay(attempt - 1);
                tracing::warn!(what, attempt, delay_ms = delay.as_millis() as u64, error=%e, "transient error, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const FAST: Backoff = Backoff {
        duration: Duration::from_millis(1),
        factor: 2.0,
        jitter: 0.1,
        steps: 4,
    };

    #[test]
    fn test_presets() {
        assert_eq!(Backoff::STANDARD.base_delay(0), Duration::from_millis(100));
        assert_eq!(Backoff::STANDARD.base_delay(3), Duration::from_millis(800));
        assert_eq!(Backoff::RECONCILE.base_delay(1), Duration::from_secs(1));
        assert_eq!(Backoff::PROMETHEUS.base_delay(5), Duration::from_secs(160));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = Backoff::STANDARD.delay(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(110));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<u32, StoreError> = retry(FAST, "get", move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(StoreError::Unavailable("down".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<(), StoreError> = retry(FAST, "get", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound("/variants/ns/a".into()))
        })
        .await;
        assert!(matches!(out, Err(StoreError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_steps() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<(), StoreError> = retry(FAST, "get", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".into()))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), FAST.steps);
    }
}

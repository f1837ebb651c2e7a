use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each failure.
    pub factor: u32,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            factor: 2,
            cap: Duration::from_secs(10),
        }
    }

    /// Delay to sleep after the given 1-based failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.cap {
                return self.cap;
            }
        }
        delay.min(self.cap)
    }
}

/// Retry `f` under `policy`, backing off between attempts.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(policy, label, |_| true, &mut f).await
}

/// Retry `f` under `policy`, but only while `retryable` holds for the error.
/// A non-retryable error is returned immediately.
pub async fn retry_if<T, F, Fut, P>(
    policy: RetryPolicy,
    label: &str,
    retryable: P,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let mut last_err = None;

    for attempt in 1..=policy.max_attempts {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !retryable(&e) || attempt == policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_after(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("retry loop exited without error"))
}

/// Transient kernel-namespace errors worth retrying: the device or chain is
/// mid-teardown, or the previous incarnation has not been released yet.
pub fn is_busy_error(err: &anyhow::Error) -> bool {
    let msg = format!("{:#}", err).to_lowercase();
    msg.contains("device or resource busy")
        || msg.contains("resource temporarily unavailable")
        || msg.contains("file exists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            factor: 2,
            cap: Duration::from_millis(8),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry(quick(3), "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = Cell::new(0);
        let result = retry(quick(3), "test", || {
            let c = count.get() + 1;
            count.set(c);
            async move {
                if c < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(c)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let count = Cell::new(0);
        let result: Result<i32> = retry(quick(3), "test", || {
            count.set(count.get() + 1);
            async { anyhow::bail!("always fails") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_non_retryable() {
        let count = Cell::new(0);
        let result: Result<i32> = retry_if(
            quick(5),
            "test",
            |e| e.to_string().contains("busy"),
            || {
                count.set(count.get() + 1);
                async { anyhow::bail!("fatal") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_delay_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(5), Duration::from_secs(10));
        assert_eq!(policy.delay_after(9), Duration::from_secs(10));
    }

    #[test]
    fn test_is_busy_error() {
        assert!(is_busy_error(&anyhow::anyhow!("RTNETLINK: Device or resource busy")));
        assert!(is_busy_error(&anyhow::anyhow!("Resource temporarily unavailable")));
        assert!(is_busy_error(&anyhow::anyhow!("ioctl: File exists")));
        assert!(!is_busy_error(&anyhow::anyhow!("No such device")));
    }
}

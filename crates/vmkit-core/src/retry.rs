use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry a fallible async operation with exponential backoff.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: Produces a fresh future for each attempt (hypervisor poll, registry
///   pull, DNS reload...).
pub async fn retry<F, Fut, T, E>(max_attempts: u32, base_delay: Duration, label: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = base_delay;
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn succeeds_first_try() {
        let result: Result<i32, &str> = retry(3, Duration::from_millis(1), "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let count = Cell::new(0);
        let result: Result<i32, &str> = retry(3, Duration::from_millis(1), "test", || {
            let c = count.get() + 1;
            count.set(c);
            async move { if c < 3 { Err("not yet") } else { Ok(c) } }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn exhausts_all_attempts() {
        let count = Cell::new(0);
        let result: Result<i32, &str> = retry(3, Duration::from_millis(1), "test", || {
            count.set(count.get() + 1);
            async { Err("always fails") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.get(), 3);
    }

    #[tokio::test]
    async fn single_attempt_fails_fast() {
        let result: Result<i32, &str> = retry(1, Duration::from_millis(1), "test", || async { Err("fail") }).await;
        assert!(result.is_err());
    }
}

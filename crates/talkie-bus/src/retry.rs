//! Fixed-delay retry for message-bus sends.
//!
//! A context that is still loading (or restarting) has no listener on the bus
//! port yet, so the first few sends of a freshly opened context routinely fail.
//! [`RetryPolicy`] repeats an operation while it fails with a
//! [retryable](BusError::is_retryable) error, sleeping a constant delay between
//! attempts.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use talkie_types::config::BusConfig;

use crate::error::BusError;

/// Why a retried operation gave up.
#[derive(Debug, Clone)]
pub enum RetryError {
    /// The operation failed in a way retrying cannot fix.
    Fatal(BusError),
    /// Every attempt failed with a retryable error; `last` is the final one.
    Exhausted { attempts: u32, last: BusError },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of tries, including the first one.
    pub attempts: u32,
    /// Pause between two tries.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    /// Run `op` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded on attempt {}/{}", attempt, attempts);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= attempts => {
                    warn!("Giving up after {} attempts: {}", attempts, e);
                    return Err(RetryError::Exhausted { attempts, last: e });
                }
                Err(e) => {
                    debug!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt,
                        attempts,
                        e.as_label(),
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn no_listener() -> BusError {
        BusError::NoListener {
            name: "bus".to_string(),
        }
    }

    #[test]
    fn defaults_are_ten_tries_a_tenth_of_a_second_apart() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 10);
        assert_eq!(policy.delay, Duration::from_millis(100));
        assert_eq!(RetryPolicy::from_config(&BusConfig::default()), policy);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = RetryPolicy::default()
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 4 {
                        Err(no_listener())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::default()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(no_listener()) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        match err {
            RetryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 10);
                assert!(matches!(last, BusError::NoListener { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::default()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(BusError::Timeout {
                        name: "bus".to_string(),
                        timeout: Duration::from_secs(1),
                    })
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Fatal(e) if e.is_timeout()));
    }
}

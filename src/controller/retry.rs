use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::ProviderError;

/// Exponential backoff with a cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Guard around one external collaborator.
///
/// Every call is bounded by `timeout`; a timeout is reported as `ProviderError::Timeout`
/// and retried like any transient failure. Each collaborator owns its own guard, so a
/// slow price service never delays device polling. Rejected credentials latch the guard
/// until `reset` is called.
#[derive(Debug)]
pub struct Collaborator {
    name: &'static str,
    timeout: Duration,
    policy: RetryPolicy,
    auth_latch: Mutex<Option<String>>,
}

impl Collaborator {
    pub fn new(name: &'static str, timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            name,
            timeout,
            policy,
            auth_latch: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reason the collaborator was disabled, if its credentials were rejected
    pub fn disabled_reason(&self) -> Option<String> {
        self.auth_latch.lock().clone()
    }

    pub fn reset(&self) {
        *self.auth_latch.lock() = None;
    }

    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let latched = self.disabled_reason();
        if let Some(reason) = latched {
            return Err(ProviderError::Auth(reason));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.timeout)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth() => {
                    error!(collaborator = self.name, error = %e, "credentials rejected, disabling collaborator");
                    *self.auth_latch.lock() = Some(e.to_string());
                    return Err(e);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        collaborator = self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like `call`, but a command the device refused is sent once more before giving up
    pub async fn command<F, Fut>(&self, mut op: F) -> Result<(), ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ProviderError>>,
    {
        match self.call(&mut op).await {
            Err(ProviderError::CommandRejected { device, reason }) => {
                warn!(collaborator = self.name, %device, %reason, "command rejected, retrying once");
                self.call(&mut op).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let guard = Collaborator::new("prices", Duration::from_secs(1), fast_policy(3));
        let calls = AtomicU32::new(0);
        let result = guard
            .call(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Transient("connection reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_is_not_retried() {
        let guard = Collaborator::new("devices", Duration::from_secs(1), fast_policy(5));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = guard
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Malformed("no devices key".into()))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Malformed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let guard = Collaborator::new("devices", Duration::from_millis(50), fast_policy(2));
        let result: Result<(), _> = guard
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(ProviderError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn test_auth_failure_latches_until_reset() {
        let guard = Collaborator::new("devices", Duration::from_secs(1), fast_policy(3));
        let calls = AtomicU32::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProviderError::Auth("HTTP 401".into()))
        };
        assert!(guard.call(op).await.is_err());
        assert!(guard.call(op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(guard.disabled_reason().is_some());

        guard.reset();
        assert!(guard.call(op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_command_is_retried_once() {
        let guard = Collaborator::new("commands", Duration::from_secs(1), fast_policy(1));
        let calls = AtomicU32::new(0);
        let result = guard
            .command(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::CommandRejected {
                    device: DeviceId::new("zappi-1"),
                    reason: "busy".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(ProviderError::CommandRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

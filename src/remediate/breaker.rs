//! Retry backoff and per-effector circuit breakers

use crate::core::error::{SocError, SocResult};
use crate::core::types::now_secs;
use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retry an effector call with exponential backoff: base 250 ms, factor 2,
/// max 3 attempts. Non-transient errors fail immediately.
pub async fn retry_with_backoff<T, F, Fut>(mut op: F) -> SocResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SocResult<T>>,
{
    let mut delay = Duration::from_millis(250);
    let mut last: Option<SocError> = None;
    for attempt in 0..3 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!("[Retry] attempt {} failed: {}", attempt + 1, err);
                last = Some(err);
                if attempt < 2 {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or(SocError::Shutdown))
}

#[derive(Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    opened_at: Option<i64>,
}

/// Opens after N consecutive failures for a cooldown period, per effector.
pub struct CircuitBreaker {
    entries: DashMap<String, BreakerEntry>,
    failure_threshold: u32,
    cooldown_secs: i64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_secs: u64) -> Self {
        CircuitBreaker {
            entries: DashMap::new(),
            failure_threshold,
            cooldown_secs: cooldown_secs as i64,
        }
    }

    /// May this effector be called right now? An open breaker lets one probe
    /// through after the cooldown.
    pub fn allow(&self, effector: &str) -> bool {
        let mut entry = self.entries.entry(effector.to_string()).or_default();
        match entry.opened_at {
            None => true,
            Some(opened) => {
                if now_secs() - opened >= self.cooldown_secs {
                    // half-open: allow a probe, keep the failure count
                    entry.opened_at = None;
                    info!("[Breaker] '{}' half-open after cooldown", effector);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, effector: &str) {
        if let Some(mut entry) = self.entries.get_mut(effector) {
            entry.consecutive_failures = 0;
            entry.opened_at = None;
        }
    }

    pub fn record_failure(&self, effector: &str) {
        let mut entry = self.entries.entry(effector.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.failure_threshold && entry.opened_at.is_none() {
            entry.opened_at = Some(now_secs());
            warn!(
                "[Breaker] 🔌 '{}' opened after {} consecutive failures",
                effector, entry.consecutive_failures
            );
        }
    }

    pub fn is_open(&self, effector: &str) -> bool {
        self.entries
            .get(effector)
            .map(|e| e.opened_at.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(SocError::Effector {
                    effector: "test".to_string(),
                    reason: "flaky".to_string(),
                })
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: SocResult<()> = retry_with_backoff(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SocError::Effector {
                effector: "test".to_string(),
                reason: "down".to_string(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: SocResult<()> = retry_with_backoff(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SocError::Validation("bad input".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn breaker_opens_at_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(3, 0);
        assert!(breaker.allow("fw"));
        breaker.record_failure("fw");
        breaker.record_failure("fw");
        assert!(!breaker.is_open("fw"));
        breaker.record_failure("fw");
        assert!(breaker.is_open("fw"));

        // cooldown of zero: immediately half-open
        assert!(breaker.allow("fw"));
        breaker.record_success("fw");
        assert!(!breaker.is_open("fw"));
    }
}

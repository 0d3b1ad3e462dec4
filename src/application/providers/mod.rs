//! External data-source providers (C2): per-source circuit breaker plus
//! exponential-backoff retry. Grounded on
//! `application/risk_management/circuit_breaker_service.rs`'s
//! progressive-level pattern, generalized from a 4-level halt ladder down
//! to the spec's 3-state CLOSED/OPEN/HALF_OPEN machine, and on the
//! teacher's `reqwest` + `reqwest-middleware` + `reqwest-retry` stack.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::domain::errors::ProviderError;

pub mod exchange_source;
pub mod http_source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig { failure_threshold: 5, cooldown: Duration::from_secs(60) }
    }
}

struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-provider circuit breaker. `consecutive_failures` trips `Open`;
/// after `cooldown` elapses the next call is allowed through as a single
/// `HalfOpen` probe; a probe success closes the breaker, a probe failure
/// reopens it and restarts the cooldown clock.
pub struct CircuitBreaker {
    source: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerInner>,
}

impl CircuitBreaker {
    pub fn new(source: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            source: source.into(),
            config,
            inner: Mutex::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Must be called before attempting a fetch. Transitions `Open` to
    /// `HalfOpen` once the cooldown elapses; otherwise short-circuits with
    /// `UpstreamUnavailable`.
    pub fn allow_request(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(ProviderError::UpstreamUnavailable { source: self.source.clone() })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker mutex poisoned").state
    }
}

/// `delay = base^attempt` seconds, plus uniform `[0,1)` jitter on 429s
/// only. `attempt` is 1-indexed (first retry after the initial failure).
pub fn backoff_delay(base: f64, attempt: u32, is_rate_limited: bool) -> Duration {
    let mut delay = base.powi(attempt as i32);
    if is_rate_limited {
        delay += rand::rng().random::<f64>();
    }
    Duration::from_secs_f64(delay.max(0.0))
}

pub const MAX_ATTEMPTS: u32 = 5;

/// Runs `fetch` under the circuit breaker, retrying retryable errors with
/// backoff up to `MAX_ATTEMPTS`, surfacing fatal errors immediately.
pub async fn fetch_with_retry<T, F, Fut>(
    breaker: &CircuitBreaker,
    backoff_base: f64,
    mut fetch: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    breaker.allow_request()?;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match fetch().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                let is_rate_limited = matches!(err, ProviderError::RateLimitExceeded { .. });
                tokio::time::sleep(backoff_delay(backoff_base, attempt, is_rate_limited)).await;
            }
            Err(err) => {
                breaker.record_failure();
                return Err(err);
            }
        }
    }
}

/// Tracks a simple failure counter for the operational tripwire's
/// `api_failure_count` predicate, independent of any one provider's
/// circuit breaker.
#[derive(Default)]
pub struct ApiFailureCounter {
    count: AtomicU32,
}

impl ApiFailureCounter {
    pub fn record_failure(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[test]
    fn breaker_trips_open_after_threshold_failures() {
        let breaker = CircuitBreaker::new("funding", CircuitBreakerConfig { failure_threshold: 3, cooldown: Duration::from_secs(60) });
        for _ in 0..2 {
            breaker.allow_request().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.allow_request().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow_request().is_err());
    }

    #[test]
    fn breaker_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new(
            "funding",
            CircuitBreakerConfig { failure_threshold: 1, cooldown: Duration::from_millis(0) },
        );
        breaker.allow_request().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.allow_request().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn breaker_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(
            "funding",
            CircuitBreakerConfig { failure_threshold: 1, cooldown: Duration::from_millis(0) },
        );
        breaker.allow_request().unwrap();
        breaker.record_failure();
        breaker.allow_request().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn backoff_delay_is_exponential_without_jitter_on_non_429() {
        assert_eq!(backoff_delay(2.0, 3, false), Duration::from_secs_f64(8.0));
    }

    #[tokio::test]
    async fn fetch_with_retry_retries_retryable_then_succeeds() {
        let breaker = CircuitBreaker::new("mid", CircuitBreakerConfig::default());
        let attempts = AtomicU32::new(0);
        let result = fetch_with_retry(&breaker, 0.0, || {
            let n = attempts.fetch_add(1, AtomicOrdering::Relaxed);
            async move {
                if n < 2 {
                    Err(ProviderError::Timeout { source: "mid".into() })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(AtomicOrdering::Relaxed), 3);
    }

    #[tokio::test]
    async fn fetch_with_retry_surfaces_fatal_errors_immediately() {
        let breaker = CircuitBreaker::new("mid", CircuitBreakerConfig::default());
        let attempts = AtomicU32::new(0);
        let result: Result<(), ProviderError> = fetch_with_retry(&breaker, 0.0, || {
            attempts.fetch_add(1, AtomicOrdering::Relaxed);
            async { Err(ProviderError::ClientError { source: "mid".into(), status: 404 }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(AtomicOrdering::Relaxed), 1);
    }
}

#![forbid(unsafe_code)]

//! Resilience wrapper for calls that stages make to third-party data sources.
//!
//! A [`ResilientGateway`] composes a [`CircuitBreaker`], a sliding-window
//! [`RateLimiter`] and bounded exponential backoff with jitter. Callers get a
//! typed [`GatewayError`] and are expected to record a degraded decision when
//! the dependency is unavailable.

mod breaker;
mod rate_limit;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use breaker::{Admission, CircuitBreaker, CircuitState};
pub use rate_limit::RateLimiter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub reset_timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub rate_limit: u32,
    pub rate_window_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_ms: 60_000,
            reset_timeout_ms: 30_000,
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            jitter_ms: 1_000,
            rate_limit: 50,
            rate_window_ms: 60_000,
        }
    }
}

impl GatewayConfig {
    /// Delay before retry number `retry` (0-based), jitter excluded.
    #[must_use]
    pub fn backoff_base(&self, retry: u32) -> Duration {
        let factor = 2_u64.saturating_pow(retry);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError<E> {
    #[error("circuit open for {gateway}; retry after {retry_after:?}")]
    CircuitOpen {
        gateway: String,
        retry_after: Duration,
    },
    #[error("rate limit exceeded for {gateway}; retry after {retry_after:?}")]
    RateLimitExceeded {
        gateway: String,
        retry_after: Duration,
    },
    #[error("{gateway} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        gateway: String,
        attempts: u32,
        last_error: E,
    },
}

impl<E> GatewayError<E> {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Exhausted { .. } => "retries_exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayMetrics {
    pub gateway: String,
    pub total_calls: u64,
    pub succeeded_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub success_rate: f64,
    pub circuit_state: CircuitState,
}

#[derive(Debug, Default)]
struct GatewayCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

#[derive(Debug)]
pub struct ResilientGateway {
    name: String,
    config: GatewayConfig,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    counters: GatewayCounters,
}

impl ResilientGateway {
    #[must_use]
    pub fn new(name: impl Into<String>, config: GatewayConfig) -> Self {
        let name = name.into();
        let breaker = CircuitBreaker::new(
            name.clone(),
            config.failure_threshold,
            Duration::from_millis(config.failure_window_ms),
            Duration::from_millis(config.reset_timeout_ms),
        );
        let limiter = RateLimiter::new(
            config.rate_limit,
            Duration::from_millis(config.rate_window_ms),
        );
        Self {
            name,
            config,
            breaker,
            limiter,
            counters: GatewayCounters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run `op` under the breaker, the rate limit and the retry budget.
    ///
    /// # Errors
    /// Returns [`GatewayError::CircuitOpen`] or
    /// [`GatewayError::RateLimitExceeded`] without calling `op`, and
    /// [`GatewayError::Exhausted`] once every attempt failed.
    pub async fn call<T, E, F, Fut>(&self, mut op: F) -> Result<T, GatewayError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0_u32;

        loop {
            attempt += 1;

            let admission = self.breaker.admit();
            if let Admission::Rejected { retry_after } = admission {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(gateway = %self.name, attempt, "call rejected by open circuit");
                return Err(GatewayError::CircuitOpen {
                    gateway: self.name.clone(),
                    retry_after,
                });
            }
            // Frees the probe slot on any exit that records no outcome,
            // including the caller dropping this future mid-call.
            let mut probe = ProbeGuard {
                breaker: &self.breaker,
                armed: admission == Admission::Probe,
            };

            if let Err(retry_after) = self.limiter.try_acquire() {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(gateway = %self.name, ?retry_after, "call rejected by rate limit");
                return Err(GatewayError::RateLimitExceeded {
                    gateway: self.name.clone(),
                    retry_after,
                });
            }

            let outcome = op().await;
            probe.armed = false;
            match outcome {
                Ok(value) => {
                    self.breaker.record_success();
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(gateway = %self.name, attempt, "call succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.record_failure();
                    warn!(gateway = %self.name, attempt, error = %err, "call failed");
                    if attempt >= max_attempts {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        return Err(GatewayError::Exhausted {
                            gateway: self.name.clone(),
                            attempts: attempt,
                            last_error: err,
                        });
                    }
                    tokio::time::sleep(self.retry_delay(attempt - 1)).await;
                }
            }
        }
    }

    fn retry_delay(&self, retry: u32) -> Duration {
        let jitter = if self.config.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.config.jitter_ms)
        };
        self.config.backoff_base(retry) + Duration::from_millis(jitter)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn metrics(&self) -> GatewayMetrics {
        let total_calls = self.counters.total.load(Ordering::Relaxed);
        let succeeded_calls = self.counters.succeeded.load(Ordering::Relaxed);
        let success_rate = if total_calls == 0 {
            1.0
        } else {
            succeeded_calls as f64 / total_calls as f64
        };
        GatewayMetrics {
            gateway: self.name.clone(),
            total_calls,
            succeeded_calls,
            failed_calls: self.counters.failed.load(Ordering::Relaxed),
            rejected_calls: self.counters.rejected.load(Ordering::Relaxed),
            success_rate,
            circuit_state: self.breaker.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn quick_config() -> GatewayConfig {
        GatewayConfig {
            max_attempts: 1,
            ..GatewayConfig::default()
        }
    }

    async fn failing(calls: &AtomicU32) -> Result<u32, String> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err("upstream 503".to_string())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = GatewayConfig::default();
        assert_eq!(config.backoff_base(0), Duration::from_secs(1));
        assert_eq!(config.backoff_base(1), Duration::from_secs(2));
        assert_eq!(config.backoff_base(3), Duration::from_secs(8));
        assert_eq!(config.backoff_base(4), Duration::from_secs(10));
        assert_eq!(config.backoff_base(40), Duration::from_secs(10));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let parsed: GatewayConfig = match serde_json::from_str(r#"{"rate_limit": 5}"#) {
            Ok(value) => value,
            Err(err) => panic!("config must parse: {err}"),
        };
        assert_eq!(parsed.rate_limit, 5);
        assert_eq!(parsed.failure_threshold, 3);
        assert_eq!(parsed.reset_timeout_ms, 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_reports_exhaustion() {
        let gateway = ResilientGateway::new(
            "permits",
            GatewayConfig {
                failure_threshold: 10,
                ..GatewayConfig::default()
            },
        );
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = gateway.call(|| failing(&calls)).await;

        let elapsed = started.elapsed();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
        match result {
            Err(GatewayError::Exhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "upstream 503");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_retry() {
        let gateway = ResilientGateway::new("permits", GatewayConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let result = gateway
            .call(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("timeout".to_string())
                    } else {
                        Ok("payload")
                    }
                }
            })
            .await;
        assert!(matches!(result, Ok("payload")));
        assert_eq!(gateway.circuit_state(), CircuitState::Closed);
        let metrics = gateway.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.succeeded_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_short_circuits_without_calling() {
        let gateway = ResilientGateway::new("permits", quick_config());
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = gateway.call(|| failing(&calls)).await;
        }
        assert_eq!(gateway.circuit_state(), CircuitState::Open);

        let result = gateway.call(|| failing(&calls)).await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = gateway
            .call(|| async { Ok::<_, String>(7_u32) })
            .await;
        assert!(matches!(probe, Ok(7)));
        assert_eq!(gateway.circuit_state(), CircuitState::Closed);

        let metrics = gateway.metrics();
        assert_eq!(metrics.total_calls, 5);
        assert_eq!(metrics.failed_calls, 3);
        assert_eq!(metrics.rejected_calls, 1);
        assert_eq!(metrics.succeeded_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejects_excess_calls() {
        let gateway = ResilientGateway::new(
            "permits",
            GatewayConfig {
                rate_limit: 2,
                ..quick_config()
            },
        );
        for _ in 0..2 {
            assert!(gateway.call(|| async { Ok::<_, String>(()) }).await.is_ok());
        }
        let limited = gateway.call(|| async { Ok::<_, String>(()) }).await;
        match limited {
            Err(err @ GatewayError::RateLimitExceeded { .. }) => {
                assert_eq!(err.kind(), "rate_limit_exceeded");
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(gateway.call(|| async { Ok::<_, String>(()) }).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_half_open_trial_does_not_wedge_the_breaker() {
        let gateway = ResilientGateway::new(
            "permits",
            GatewayConfig {
                failure_threshold: 1,
                max_attempts: 1,
                rate_limit: 1,
                rate_window_ms: 60_000,
                reset_timeout_ms: 30_000,
                ..GatewayConfig::default()
            },
        );
        let calls = AtomicU32::new(0);
        let first = gateway.call(|| failing(&calls)).await;
        assert!(matches!(first, Err(GatewayError::Exhausted { .. })));

        tokio::time::advance(Duration::from_secs(30)).await;
        let limited = gateway.call(|| async { Ok::<_, String>(1_u32) }).await;
        assert!(matches!(limited, Err(GatewayError::RateLimitExceeded { .. })));
        assert_eq!(gateway.circuit_state(), CircuitState::HalfOpen);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let recovered = gateway.call(|| async { Ok::<_, String>(2_u32) }).await;
        assert!(matches!(recovered, Ok(2)), "{recovered:?}");
        assert_eq!(gateway.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_call_frees_the_half_open_slot() {
        let gateway = ResilientGateway::new(
            "permits",
            GatewayConfig {
                failure_threshold: 1,
                ..quick_config()
            },
        );
        let calls = AtomicU32::new(0);
        let _ = gateway.call(|| failing(&calls)).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            gateway.call(std::future::pending::<Result<u32, String>>),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(gateway.circuit_state(), CircuitState::HalfOpen);

        let probe = gateway.call(|| async { Ok::<_, String>(3_u32) }).await;
        assert!(matches!(probe, Ok(3)), "{probe:?}");
        assert_eq!(gateway.circuit_state(), CircuitState::Closed);
    }
}

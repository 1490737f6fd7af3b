//! Circuit breaker guarding one external dependency.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Result of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single trial call admitted while half-open.
    Probe,
    Rejected { retry_after: Duration },
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Opens after `failure_threshold` consecutive failures inside
/// `failure_window`, half-opens after `reset_timeout`, and admits exactly one
/// probe while half-open.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    failure_window: Duration,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        failure_window: Duration,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            failure_window,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Breaker state only guards counters, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    #[must_use]
    pub fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected {
                retry_after: self.remaining_open(&inner, now),
            },
            CircuitState::HalfOpen if inner.probe_in_flight => Admission::Rejected {
                retry_after: Duration::ZERO,
            },
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                debug!(gateway = %self.name, "circuit admitting half-open probe");
                Admission::Probe
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        if inner.state == CircuitState::HalfOpen {
            info!(gateway = %self.name, "circuit closing after successful probe");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                while let Some(oldest) = inner.failures.front().copied() {
                    if now.duration_since(oldest) > self.failure_window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                let failures = inner.failures.len();
                if failures >= self.failure_threshold as usize {
                    warn!(
                        gateway = %self.name,
                        failures,
                        "circuit opening after consecutive failures"
                    );
                    Self::open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(gateway = %self.name, "circuit re-opening after failed probe");
                Self::open(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open probe slot whose call never reported an outcome,
    /// so the next caller can probe instead.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            debug!(gateway = %self.name, "half-open probe released without an outcome");
            inner.probe_in_flight = false;
        }
    }

    fn open(inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.failures.clear();
        inner.probe_in_flight = false;
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map_or(self.reset_timeout, |opened| now.duration_since(opened));
        if elapsed >= self.reset_timeout {
            info!(gateway = %self.name, "circuit half-open after reset timeout");
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }

    fn remaining_open(&self, inner: &BreakerInner, now: Instant) -> Duration {
        inner.opened_at.map_or(Duration::ZERO, |opened| {
            self.reset_timeout.saturating_sub(now.duration_since(opened))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "unit",
            3,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.admit(),
            Admission::Rejected {
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_consecutive_count() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_the_window_do_not_accumulate() {
        let breaker = breaker();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(45)).await;
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(45)).await;
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_probe() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(), Admission::Probe);
        assert!(matches!(breaker.admit(), Admission::Rejected { .. }));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_for_a_full_timeout() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn released_trial_slot_can_be_claimed_again() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.release_probe();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(), Admission::Probe);
    }
}

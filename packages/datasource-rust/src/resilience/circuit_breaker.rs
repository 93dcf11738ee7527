//! Per-adapter circuit breaker.
//!
//! State machine: Closed -> Open -> HalfOpen -> Closed | Open.
//!
//! - Closed trips to Open after `failure_threshold` consecutive failures, or
//!   once the sliding window holds at least `request_volume_threshold` calls
//!   and its failure rate (or slow-call rate, when enabled) reaches the
//!   configured percentage.
//! - Open rejects calls with `CIRCUIT_BREAKER_ERROR` until `timeout_seconds`
//!   have passed since it opened; the next call then moves it to HalfOpen.
//! - HalfOpen admits at most `success_threshold` concurrent trials. That many
//!   successes close the breaker; any trial failure, or exceeding
//!   `max_wait_duration_in_half_open`, re-opens it.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use apex_data_core::{CircuitBreakerConfig, DataSourceError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::adapters::elapsed_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Counters exposed for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub slow_calls: u64,
    pub state_transitions: u64,
    pub consecutive_failures: u32,
    /// Failure percentage over the sliding window.
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    half_open_since: Option<Instant>,
    window: VecDeque<Outcome>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            half_open_since: None,
            window: VecDeque::new(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn rate(&self, pick: impl Fn(&Outcome) -> bool) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let hits = self.window.iter().filter(|o| pick(o)).count();
        hits as f64 * 100.0 / self.window.len() as f64
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    slow_calls: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
            total_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            slow_calls: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. With automatic transition enabled, an expired Open
    /// state is reported (and recorded) as HalfOpen.
    pub fn state(&self) -> CircuitState {
        let mut s = self.inner.lock();
        if self.config.automatic_transition
            && s.state == CircuitState::Open
            && self.open_timeout_elapsed(&s, Instant::now())
        {
            self.transition(&mut s, CircuitState::HalfOpen);
        }
        s.state
    }

    /// Runs `f` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns `CIRCUIT_BREAKER_ERROR` without invoking `f` when the breaker
    /// rejects the call; otherwise returns whatever `f` returns.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire()?;
        let started = Instant::now();
        let result = f().await;
        let elapsed = elapsed_ms(started);
        permit.settled = true;
        match &result {
            Ok(_) => self.on_success(permit.trial, elapsed),
            Err(_) => self.on_failure(permit.trial, elapsed),
        }
        result
    }

    /// Forces the breaker back to Closed and clears the window.
    pub fn reset(&self) {
        let mut s = self.inner.lock();
        if s.state != CircuitState::Closed {
            self.transition(&mut s, CircuitState::Closed);
        }
        *s = BreakerState::closed();
    }

    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state();
        let s = self.inner.lock();
        CircuitBreakerMetrics {
            state,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            slow_calls: self.slow_calls.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            consecutive_failures: s.consecutive_failures,
            failure_rate: s.rate(|o| o.failed),
        }
    }

    // --- internals ---

    fn acquire(&self) -> Result<Permit<'_>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut s = self.inner.lock();

        if s.state == CircuitState::Open {
            if !self.open_timeout_elapsed(&s, now) {
                drop(s);
                return Err(self.reject());
            }
            self.transition(&mut s, CircuitState::HalfOpen);
        }

        if s.state == CircuitState::HalfOpen {
            let waited_too_long = self.config.max_half_open_wait().is_some_and(|max| {
                s.half_open_since
                    .is_some_and(|since| now.duration_since(since) >= max)
            });
            if waited_too_long {
                self.transition(&mut s, CircuitState::Open);
                drop(s);
                return Err(self.reject());
            }
            let max_trials = self.config.success_threshold.max(1);
            if s.half_open_in_flight >= max_trials {
                drop(s);
                return Err(self.reject());
            }
            s.half_open_in_flight += 1;
            return Ok(Permit {
                breaker: self,
                trial: true,
                settled: false,
            });
        }

        Ok(Permit {
            breaker: self,
            trial: false,
            settled: false,
        })
    }

    fn reject(&self) -> DataSourceError {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        DataSourceError::circuit_breaker(format!(
            "Circuit breaker is open for data source: {}",
            self.name
        ))
        .with_source(self.name.clone())
    }

    fn open_timeout_elapsed(&self, s: &BreakerState, now: Instant) -> bool {
        s.opened_at
            .is_none_or(|at| now.duration_since(at) >= self.config.open_timeout())
    }

    fn is_slow(&self, elapsed_ms: u64) -> bool {
        self.config.slow_call_detection_enabled
            && elapsed_ms > self.config.slow_call_duration_threshold
    }

    fn on_success(&self, trial: bool, elapsed_ms: u64) {
        let slow = self.is_slow(elapsed_ms);
        if slow {
            self.slow_calls.fetch_add(1, Ordering::Relaxed);
        }
        let mut s = self.inner.lock();
        match s.state {
            CircuitState::HalfOpen if trial => {
                s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
                s.half_open_successes += 1;
                if s.half_open_successes >= self.config.success_threshold.max(1) {
                    self.transition(&mut s, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                s.consecutive_failures = 0;
                self.push_outcome(&mut s, Outcome { failed: false, slow });
                if self.window_trips(&s) {
                    self.transition(&mut s, CircuitState::Open);
                }
            }
            _ => release_trial(&mut s, trial),
        }
    }

    fn on_failure(&self, trial: bool, elapsed_ms: u64) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let slow = self.is_slow(elapsed_ms);
        if slow {
            self.slow_calls.fetch_add(1, Ordering::Relaxed);
        }
        let mut s = self.inner.lock();
        match s.state {
            CircuitState::HalfOpen if trial => {
                s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
                self.transition(&mut s, CircuitState::Open);
            }
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                self.push_outcome(&mut s, Outcome { failed: true, slow });
                let consecutive_trip = self.config.failure_threshold > 0
                    && s.consecutive_failures >= self.config.failure_threshold;
                if consecutive_trip || self.window_trips(&s) {
                    self.transition(&mut s, CircuitState::Open);
                }
            }
            _ => release_trial(&mut s, trial),
        }
    }

    fn push_outcome(&self, s: &mut BreakerState, outcome: Outcome) {
        let capacity = self.config.sliding_window_size.max(1);
        while s.window.len() >= capacity {
            s.window.pop_front();
        }
        s.window.push_back(outcome);
    }

    fn window_trips(&self, s: &BreakerState) -> bool {
        let volume = self.config.request_volume_threshold as usize;
        if volume == 0 || s.window.len() < volume {
            return false;
        }
        if s.rate(|o| o.failed) >= self.config.failure_rate_threshold {
            return true;
        }
        self.config.slow_call_detection_enabled
            && s.rate(|o| o.slow) >= self.config.slow_call_rate_threshold
    }

    fn transition(&self, s: &mut BreakerState, next: CircuitState) {
        let previous = s.state;
        if previous == next {
            return;
        }
        let now = Instant::now();
        match next {
            CircuitState::Open => {
                s.opened_at = Some(now);
                s.half_open_since = None;
                s.half_open_successes = 0;
                s.half_open_in_flight = 0;
            }
            CircuitState::HalfOpen => {
                s.half_open_since = Some(now);
                s.half_open_successes = 0;
                s.half_open_in_flight = 0;
            }
            CircuitState::Closed => {
                *s = BreakerState::closed();
            }
        }
        s.state = next;
        self.state_transitions.fetch_add(1, Ordering::Relaxed);

        if self.config.log_state_changes {
            if next == CircuitState::Open {
                tracing::warn!(
                    source = %self.name,
                    from = %previous,
                    to = %next,
                    consecutive_failures = s.consecutive_failures,
                    "circuit breaker opened"
                );
            } else {
                tracing::info!(source = %self.name, from = %previous, to = %next, "circuit breaker state change");
            }
        }
    }
}

fn release_trial(s: &mut BreakerState, trial: bool) {
    if trial {
        s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
    }
}

/// Admission ticket for one call. A trial abandoned before it settles (the
/// call future was dropped) gives its HalfOpen slot back.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            release_trial(&mut self.breaker.inner.lock(), true);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    use apex_data_core::ErrorKind;

    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            timeout_seconds: 1,
            success_threshold: 2,
            request_volume_threshold: 100,
            ..CircuitBreakerConfig::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> DataSourceError {
        breaker
            .call(|| async { Err::<(), _>(DataSourceError::execution("backend down")) })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_closed_open_half_open_closed() {
        let breaker = CircuitBreaker::new("db", config());
        let invoked = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            assert_eq!(fail(&breaker).await.kind(), ErrorKind::Execution);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let counter = invoked.clone();
        let err = breaker
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitBreaker);
        assert!(err.is_retryable());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let m = breaker.metrics();
        assert_eq!(m.rejected_calls, 1);
        assert_eq!(m.failed_calls, 3);
        assert_eq!(m.state_transitions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("db", config());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens() {
        let breaker = CircuitBreaker::new("db", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            succeed(&breaker).await.unwrap_err().kind(),
            ErrorKind::CircuitBreaker
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_transition_waits_for_next_call() {
        let cfg = CircuitBreakerConfig {
            automatic_transition: false,
            ..config()
        };
        let breaker = CircuitBreaker::new("db", cfg);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_concurrent_trials() {
        let breaker = Arc::new(CircuitBreaker::new("db", config()));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut slow_trials = Vec::new();
        for _ in 0..2 {
            let b = breaker.clone();
            slow_trials.push(tokio::spawn(async move {
                b.call(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
                .await
            }));
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(
            succeed(&breaker).await.unwrap_err().kind(),
            ErrorKind::CircuitBreaker
        );
        for p in slow_trials {
            p.await.unwrap().unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_in_half_open_reopens() {
        let cfg = CircuitBreakerConfig {
            max_wait_duration_in_half_open: 5,
            success_threshold: 5,
            ..config()
        };
        let breaker = CircuitBreaker::new("db", cfg);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            succeed(&breaker).await.unwrap_err().kind(),
            ErrorKind::CircuitBreaker
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_rate_over_window_trips() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 0,
            request_volume_threshold: 4,
            failure_rate_threshold: 50.0,
            sliding_window_size: 10,
            ..config()
        };
        let breaker = CircuitBreaker::new("db", cfg);
        succeed(&breaker).await.unwrap();
        fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_trip_when_detection_enabled() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 0,
            request_volume_threshold: 2,
            slow_call_detection_enabled: true,
            slow_call_duration_threshold: 50,
            slow_call_rate_threshold: 100.0,
            ..config()
        };
        let breaker = CircuitBreaker::new("db", cfg);
        for _ in 0..2 {
            breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.metrics().slow_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn call_at_the_slow_threshold_is_not_slow() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 0,
            request_volume_threshold: 2,
            slow_call_detection_enabled: true,
            slow_call_duration_threshold: 50,
            slow_call_rate_threshold: 100.0,
            ..config()
        };
        let breaker = CircuitBreaker::new("db", cfg);
        assert!(!breaker.is_slow(50));
        assert!(breaker.is_slow(51));

        for _ in 0..2 {
            breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().slow_calls, 0);
    }

    #[tokio::test]
    async fn reset_closes_the_breaker() {
        let breaker = CircuitBreaker::new("db", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.metrics().consecutive_failures, 0);
    }
}

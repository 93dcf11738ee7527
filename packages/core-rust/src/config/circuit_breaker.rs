use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Thresholds that drive a circuit breaker's state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before letting a trial call through.
    pub timeout_seconds: u64,
    /// Trial successes needed to close a half-open breaker.
    pub success_threshold: u32,
    /// Minimum calls in the window before rates are considered.
    pub request_volume_threshold: u32,
    /// Failure percentage over the window that opens the breaker.
    pub failure_rate_threshold: f64,
    pub sliding_window_size: usize,
    pub slow_call_detection_enabled: bool,
    /// Milliseconds above which a call counts as slow.
    pub slow_call_duration_threshold: u64,
    pub slow_call_rate_threshold: f64,
    #[serde(rename = "automatic-transition-from-open-to-half-open")]
    pub automatic_transition: bool,
    /// Seconds a half-open breaker may wait for trial results. 0 is unbounded.
    pub max_wait_duration_in_half_open: u64,
    pub log_state_changes: bool,
    pub metrics_enabled: bool,
    pub fallback_response: Option<String>,
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    #[must_use]
    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_threshold)
    }

    #[must_use]
    pub fn max_half_open_wait(&self) -> Option<Duration> {
        (self.max_wait_duration_in_half_open > 0)
            .then(|| Duration::from_secs(self.max_wait_duration_in_half_open))
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            timeout_seconds: 60,
            success_threshold: 3,
            request_volume_threshold: 20,
            failure_rate_threshold: 50.0,
            sliding_window_size: 100,
            slow_call_detection_enabled: false,
            slow_call_duration_threshold: 5_000,
            slow_call_rate_threshold: 50.0,
            automatic_transition: true,
            max_wait_duration_in_half_open: 0,
            log_state_changes: true,
            metrics_enabled: true,
            fallback_response: None,
        }
    }
}

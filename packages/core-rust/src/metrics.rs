//! Lock-free request, cache and connection counters for one adapter.
//!
//! Every field is an independent atomic. Concurrent successes and failures
//! are each counted exactly once, but a reader may observe one field updated
//! slightly before another. Derived rates are computed on read.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::clock::now_millis;

/// Running counters for one adapter instance.
#[derive(Debug)]
pub struct DataSourceMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_time: AtomicU64,
    /// `u64::MAX` until the first request is recorded.
    min_response_time: AtomicU64,
    max_response_time: AtomicU64,
    last_request_time: AtomicU64,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,

    connection_attempts: AtomicU64,
    successful_connections: AtomicU64,
    connection_failures: AtomicU64,

    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    records_processed: AtomicU64,

    created_at: u64,
    last_reset_time: AtomicU64,
}

impl DataSourceMetrics {
    #[must_use]
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_response_time: AtomicU64::new(0),
            min_response_time: AtomicU64::new(u64::MAX),
            max_response_time: AtomicU64::new(0),
            last_request_time: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            successful_connections: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            created_at: now,
            last_reset_time: AtomicU64::new(now),
        }
    }

    // --- Recording ---

    pub fn record_successful_request(&self, response_time_ms: u64) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.record_request(response_time_ms);
    }

    pub fn record_failed_request(&self, response_time_ms: u64) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.record_request(response_time_ms);
    }

    fn record_request(&self, response_time_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time
            .fetch_add(response_time_ms, Ordering::Relaxed);
        self.min_response_time
            .fetch_min(response_time_ms, Ordering::Relaxed);
        self.max_response_time
            .fetch_max(response_time_ms, Ordering::Relaxed);
        self.last_request_time.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_successful_connection(&self) {
        self.successful_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_records_processed(&self, count: u64) {
        self.records_processed.fetch_add(count, Ordering::Relaxed);
    }

    /// Zeroes every counter and stamps a new reset time.
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.successful_requests,
            &self.failed_requests,
            &self.total_response_time,
            &self.max_response_time,
            &self.last_request_time,
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_evictions,
            &self.connection_attempts,
            &self.successful_connections,
            &self.connection_failures,
            &self.bytes_read,
            &self.bytes_written,
            &self.records_processed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_response_time.store(u64::MAX, Ordering::Relaxed);
        self.last_reset_time.store(now_millis(), Ordering::Relaxed);
    }

    // --- Raw counters ---

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_response_time(&self) -> u64 {
        self.total_response_time.load(Ordering::Relaxed)
    }

    /// Smallest recorded response time, or 0 before the first request.
    #[must_use]
    pub fn min_response_time(&self) -> u64 {
        match self.min_response_time.load(Ordering::Relaxed) {
            u64::MAX => 0,
            v => v,
        }
    }

    #[must_use]
    pub fn max_response_time(&self) -> u64 {
        self.max_response_time.load(Ordering::Relaxed)
    }

    /// Millis since epoch of the last recorded request, 0 if none.
    #[must_use]
    pub fn last_request_time(&self) -> u64 {
        self.last_request_time.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache_evictions(&self) -> u64 {
        self.cache_evictions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successful_connections(&self) -> u64 {
        self.successful_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_failures(&self) -> u64 {
        self.connection_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[must_use]
    pub fn last_reset_time(&self) -> u64 {
        self.last_reset_time.load(Ordering::Relaxed)
    }

    // --- Derived values ---

    /// Successful requests as a percentage of all requests.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        percentage(self.successful_requests(), self.total_requests())
    }

    /// Failed requests as a percentage of all requests.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        percentage(self.failed_requests(), self.total_requests())
    }

    /// Mean response time in milliseconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_response_time(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.total_response_time() as f64 / total as f64
    }

    /// Cache hits as a percentage of cache lookups.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits();
        percentage(hits, hits + self.cache_misses())
    }

    /// Successful connections as a percentage of connection attempts.
    #[must_use]
    pub fn connection_success_rate(&self) -> f64 {
        percentage(self.successful_connections(), self.connection_attempts())
    }

    /// Point-in-time copy of every counter and derived rate.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            min_response_time: self.min_response_time(),
            max_response_time: self.max_response_time(),
            average_response_time: self.average_response_time(),
            success_rate: self.success_rate(),
            error_rate: self.error_rate(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_evictions: self.cache_evictions(),
            cache_hit_rate: self.cache_hit_rate(),
            connection_attempts: self.connection_attempts(),
            connection_success_rate: self.connection_success_rate(),
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
            records_processed: self.records_processed(),
            last_request_time: self.last_request_time(),
            last_reset_time: self.last_reset_time(),
        }
    }
}

impl Default for DataSourceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_precision_loss)]
fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Serializable copy of a [`DataSourceMetrics`] taken at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub min_response_time: u64,
    pub max_response_time: u64,
    pub average_response_time: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_hit_rate: f64,
    pub connection_attempts: u64,
    pub connection_success_rate: f64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub records_processed: u64,
    pub last_request_time: u64,
    pub last_reset_time: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Batch metrics for the merge and index pipelines
//!
//! Lightweight, thread-safe counters shared (via `Arc`) between an
//! orchestrator and the worker closures it dispatches.
//!
//! # Overview
//!
//! - Batch outcomes: dispatched, succeeded, failed, cancelled
//! - Documents written by merge workers and indexed by index workers
//! - Batch latencies with percentile calculations (p50, p95, p99)
//! - The most recent slow batches
//!
//! # Design Decisions
//!
//! - **Thread-safe**: counters are `AtomicU64`; completion can happen on any
//!   blocking-pool thread
//! - **Bounded memory**: fixed-size latency and slow-batch windows
//!
//! # Example
//!
//! ```
//! use kgmerge::metrics::{BatchKind, PipelineMetrics};
//!
//! let metrics = PipelineMetrics::new();
//! metrics.record_dispatch();
//! metrics.record_success(BatchKind::Merge, 3, 1_000);
//!
//! let stats = metrics.snapshot();
//! assert_eq!(stats.docs_written, 1_000);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Number of batch latencies retained for percentile calculation.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Number of slow batches retained for reporting.
const MAX_SLOW_BATCHES: usize = 10;

/// Batches slower than this are recorded as slow.
pub const SLOW_BATCH_THRESHOLD_MS: u64 = 30_000;

/// Which pipeline a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Merge,
    Index,
}

/// A batch that exceeded `SLOW_BATCH_THRESHOLD_MS`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlowBatch {
    pub kind: BatchKind,
    pub duration_ms: u64,
    /// ms since metrics started
    pub timestamp_ms: u64,
}

/// Point-in-time copy of all counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub batches_dispatched: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub batches_cancelled: u64,
    pub docs_written: u64,
    pub docs_indexed: u64,
    pub batch_p50_ms: u64,
    pub batch_p95_ms: u64,
    pub batch_p99_ms: u64,
    pub batch_avg_ms: u64,
    pub slow_batches: Vec<SlowBatch>,
    pub uptime_secs: u64,
}

pub struct PipelineMetrics {
    batches_dispatched: AtomicU64,
    batches_succeeded: AtomicU64,
    batches_failed: AtomicU64,
    batches_cancelled: AtomicU64,

    docs_written: AtomicU64,
    docs_indexed: AtomicU64,

    /// Rolling window of recent batch latencies.
    latencies_ms: Mutex<VecDeque<u64>>,
    latency_sum_ms: AtomicU64,

    slow_batches: Mutex<VecDeque<SlowBatch>>,

    started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            batches_dispatched: AtomicU64::new(0),
            batches_succeeded: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_cancelled: AtomicU64::new(0),
            docs_written: AtomicU64::new(0),
            docs_indexed: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            slow_batches: Mutex::new(VecDeque::with_capacity(MAX_SLOW_BATCHES)),
            started_at: Instant::now(),
        }
    }

    pub fn record_dispatch(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful batch and the number of documents it handled.
    pub fn record_success(&self, kind: BatchKind, duration_ms: u64, docs: u64) {
        self.batches_succeeded.fetch_add(1, Ordering::Relaxed);
        match kind {
            BatchKind::Merge => self.docs_written.fetch_add(docs, Ordering::Relaxed),
            BatchKind::Index => self.docs_indexed.fetch_add(docs, Ordering::Relaxed),
        };
        self.record_latency(kind, duration_ms);
    }

    pub fn record_failure(&self, kind: BatchKind, duration_ms: u64) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(kind, duration_ms);
    }

    pub fn record_cancelled(&self, count: u64) {
        self.batches_cancelled.fetch_add(count, Ordering::Relaxed);
    }

    fn record_latency(&self, kind: BatchKind, duration_ms: u64) {
        if let Ok(mut latencies) = self.latencies_ms.lock() {
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_BATCH_THRESHOLD_MS {
            let slow = SlowBatch {
                kind,
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };
            if let Ok(mut slow_batches) = self.slow_batches.lock() {
                if slow_batches.len() >= MAX_SLOW_BATCHES {
                    slow_batches.pop_front();
                }
                slow_batches.push_back(slow);
            }
        }
    }

    /// O(LATENCY_WINDOW_SIZE) for the percentile sort.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = match self.latencies_ms.lock() {
            Ok(latencies) if !latencies.is_empty() => {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;
                (p50, p95, p99, avg)
            }
            _ => (0, 0, 0, 0),
        };

        let slow_batches = self
            .slow_batches
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        MetricsSnapshot {
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            batches_succeeded: self.batches_succeeded.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_cancelled: self.batches_cancelled.load(Ordering::Relaxed),
            docs_written: self.docs_written.load(Ordering::Relaxed),
            docs_indexed: self.docs_indexed.load(Ordering::Relaxed),
            batch_p50_ms: p50,
            batch_p95_ms: p95,
            batch_p99_ms: p99,
            batch_avg_ms: avg,
            slow_batches,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_metrics_are_zero() {
        let snapshot = PipelineMetrics::new().snapshot();
        assert_eq!(snapshot.batches_dispatched, 0);
        assert_eq!(snapshot.batch_p50_ms, 0);
        assert!(snapshot.slow_batches.is_empty());
    }

    #[test]
    fn test_success_routes_docs_by_kind() {
        let metrics = PipelineMetrics::new();
        metrics.record_success(BatchKind::Merge, 10, 100);
        metrics.record_success(BatchKind::Index, 10, 40);
        metrics.record_failure(BatchKind::Index, 5);

        let s = metrics.snapshot();
        assert_eq!(s.docs_written, 100);
        assert_eq!(s.docs_indexed, 40);
        assert_eq!(s.batches_succeeded, 2);
        assert_eq!(s.batches_failed, 1);
    }

    #[test]
    fn test_percentiles() {
        let metrics = PipelineMetrics::new();
        for i in 1..=100 {
            metrics.record_success(BatchKind::Merge, i, 1);
        }
        let s = metrics.snapshot();
        assert_eq!(s.batch_p50_ms, 51);
        assert_eq!(s.batch_p95_ms, 96);
        assert_eq!(s.batch_p99_ms, 100);
        assert_eq!(s.batch_avg_ms, 50);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = PipelineMetrics::new();
        for _ in 0..(LATENCY_WINDOW_SIZE + 500) {
            metrics.record_success(BatchKind::Index, 7, 0);
        }
        assert_eq!(metrics.latencies_ms.lock().unwrap().len(), LATENCY_WINDOW_SIZE);
        assert_eq!(metrics.snapshot().batch_avg_ms, 7);
    }

    #[test]
    fn test_slow_batches_are_kept_up_to_limit() {
        let metrics = PipelineMetrics::new();
        for _ in 0..(MAX_SLOW_BATCHES + 3) {
            metrics.record_failure(BatchKind::Merge, SLOW_BATCH_THRESHOLD_MS);
        }
        metrics.record_failure(BatchKind::Merge, 1);
        let s = metrics.snapshot();
        assert_eq!(s.slow_batches.len(), MAX_SLOW_BATCHES);
        assert_eq!(s.slow_batches[0].kind, BatchKind::Merge);
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_dispatch();
                        m.record_success(BatchKind::Merge, 1, 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = metrics.snapshot();
        assert_eq!(s.batches_dispatched, 8000);
        assert_eq!(s.docs_written, 16_000);
    }
}

//! Gateway counters for calls, activations and discovery.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::discovery::QualifiedToolName;

/// How a routed call ended, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcomeKind {
    Success,
    BackendError,
    Unreachable,
}

pub struct GatewayMetrics {
    // Call metrics
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    unreachable_calls: AtomicU64,
    rejected_calls: AtomicU64,
    active_executions: AtomicU64,

    // Activation metrics
    activations_succeeded: AtomicU64,
    activations_failed: AtomicU64,

    // Discovery metrics
    discovery_runs: AtomicU64,
    backend_failures: AtomicU64,

    tool_latencies: DashMap<QualifiedToolName, LatencyStats>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            unreachable_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            active_executions: AtomicU64::new(0),
            activations_succeeded: AtomicU64::new(0),
            activations_failed: AtomicU64::new(0),
            discovery_runs: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
            tool_latencies: DashMap::new(),
        }
    }

    /// A call that never reached a backend because the router refused it.
    pub fn record_call_rejected(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_start(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.active_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_end(&self, tool: &QualifiedToolName, outcome: CallOutcomeKind, duration_ms: u64) {
        self.active_executions.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            CallOutcomeKind::Success => self.successful_calls.fetch_add(1, Ordering::Relaxed),
            CallOutcomeKind::BackendError => self.failed_calls.fetch_add(1, Ordering::Relaxed),
            CallOutcomeKind::Unreachable => self.unreachable_calls.fetch_add(1, Ordering::Relaxed),
        };

        self.tool_latencies
            .entry(tool.clone())
            .or_insert_with(LatencyStats::new)
            .record(duration_ms);
    }

    pub fn record_activation(&self, success: bool) {
        if success {
            self.activations_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.activations_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_discovery(&self, failed_backends: usize) {
        self.discovery_runs.fetch_add(1, Ordering::Relaxed);
        self.backend_failures
            .fetch_add(failed_backends as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            unreachable_calls: self.unreachable_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            active_executions: self.active_executions.load(Ordering::Relaxed),
            activations_succeeded: self.activations_succeeded.load(Ordering::Relaxed),
            activations_failed: self.activations_failed.load(Ordering::Relaxed),
            discovery_runs: self.discovery_runs.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
        }
    }

    pub fn tool_latency(&self, tool: &QualifiedToolName) -> Option<LatencySnapshot> {
        self.tool_latencies.get(tool).map(|stats| stats.snapshot())
    }

    pub fn all_tool_latencies(&self) -> Vec<(QualifiedToolName, LatencySnapshot)> {
        let mut all: Vec<_> = self
            .tool_latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Reset counters. In-flight executions are kept.
    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.unreachable_calls.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
        self.activations_succeeded.store(0, Ordering::Relaxed);
        self.activations_failed.store(0, Ordering::Relaxed);
        self.discovery_runs.store(0, Ordering::Relaxed);
        self.backend_failures.store(0, Ordering::Relaxed);
        self.tool_latencies.clear();
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tool latency statistics.
pub struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);

        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub unreachable_calls: u64,
    pub rejected_calls: u64,
    pub active_executions: u64,
    pub activations_succeeded: u64,
    pub activations_failed: u64,
    pub discovery_runs: u64,
    pub backend_failures: u64,
}

impl MetricsSnapshot {
    /// Success rate of calls that reached a backend, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_calls + self.failed_calls + self.unreachable_calls;
        if completed == 0 {
            100.0
        } else {
            (self.successful_calls as f64 / completed as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_accounting() {
        let metrics = GatewayMetrics::new();
        let tool = QualifiedToolName::new("git", "status");

        metrics.record_call_start();
        metrics.record_call_end(&tool, CallOutcomeKind::Success, 10);
        metrics.record_call_start();
        metrics.record_call_end(&tool, CallOutcomeKind::Unreachable, 30);
        metrics.record_call_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.successful_calls, 1);
        assert_eq!(snapshot.unreachable_calls, 1);
        assert_eq!(snapshot.rejected_calls, 1);
        assert_eq!(snapshot.active_executions, 0);
        assert!((snapshot.success_rate() - 50.0).abs() < f64::EPSILON);

        let latency = metrics.tool_latency(&tool).unwrap();
        assert_eq!(latency.count, 2);
        assert_eq!(latency.avg_ms, 20);
        assert_eq!(latency.min_ms, 10);
        assert_eq!(latency.max_ms, 30);
    }

    #[test]
    fn test_reset_keeps_active_executions() {
        let metrics = GatewayMetrics::new();
        metrics.record_call_start();
        metrics.record_activation(true);
        metrics.record_discovery(2);
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.activations_succeeded, 0);
        assert_eq!(snapshot.backend_failures, 0);
        assert_eq!(snapshot.active_executions, 1);
    }
}

//! Execution metrics for monitoring tool calls.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::Serialize;

use crate::{error::ErrorKind, inventory::QualifiedToolName};

pub struct ExecutionMetrics {
    // Call metrics
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    validation_failures: AtomicU64,
    retries: AtomicU64,

    // Connection metrics
    connection_errors: AtomicU64,

    // Execution metrics
    active_executions: AtomicU64,

    overall_latency: LatencyStats,
    tool_latencies: DashMap<QualifiedToolName, LatencyStats>,
    errors_by_kind: DashMap<ErrorKind, u64>,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            active_executions: AtomicU64::new(0),
            overall_latency: LatencyStats::new(),
            tool_latencies: DashMap::new(),
            errors_by_kind: DashMap::new(),
        }
    }

    /// Record the start of a tool call.
    pub fn record_call_start(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.active_executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a tool call that reached a server.
    pub fn record_call_end(&self, tool: &QualifiedToolName, success: bool, duration_ms: u64) {
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.overall_latency.record(duration_ms);
        self.tool_latencies
            .entry(tool.clone())
            .or_insert_with(LatencyStats::new)
            .record(duration_ms);
    }

    /// Pair of `record_call_start`, called exactly once per call.
    pub fn record_call_finished(&self) {
        self.active_executions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a failure of any kind, including ones that never reached a server.
    pub fn record_error(&self, kind: ErrorKind) {
        match kind {
            ErrorKind::Validation => {
                self.validation_failures.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::Connection => {
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn record_retries(&self, retries: u32) {
        if retries > 0 {
            self.retries.fetch_add(retries as u64, Ordering::Relaxed);
        }
    }

    pub fn active_executions(&self) -> u64 {
        self.active_executions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.overall_latency.snapshot();
        let errors_by_kind = self
            .errors_by_kind
            .iter()
            .map(|e| (e.key().as_str().to_string(), *e.value()))
            .collect();
        let failed_calls = self.failed_calls.load(Ordering::Relaxed);
        let error_count = self.errors_by_kind.iter().map(|e| *e.value()).sum();

        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls,
            error_count,
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            active_executions: self.active_executions.load(Ordering::Relaxed),
            average_latency_ms: latency.avg_ms,
            latency,
            errors_by_kind,
        }
    }

    pub fn tool_latency(&self, tool: &QualifiedToolName) -> Option<LatencySnapshot> {
        self.tool_latencies.get(tool).map(|stats| stats.snapshot())
    }

    pub fn all_tool_latencies(&self) -> Vec<(QualifiedToolName, LatencySnapshot)> {
        self.tool_latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.validation_failures.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.connection_errors.store(0, Ordering::Relaxed);
        // Don't reset active_executions
        self.overall_latency.reset();
        self.tool_latencies.clear();
        self.errors_by_kind.clear();
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency statistics.
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

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_ms.store(0, Ordering::Relaxed);
        self.min_ms.store(u64::MAX, Ordering::Relaxed);
        self.max_ms.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);
        let max = self.max_ms.load(Ordering::Relaxed);

        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: max,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Failures of every kind, including calls rejected before execution
    pub error_count: u64,
    pub validation_failures: u64,
    pub retries: u64,
    pub connection_errors: u64,
    pub active_executions: u64,
    pub average_latency_ms: u64,
    pub latency: LatencySnapshot,
    pub errors_by_kind: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Calculate success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_calls + self.error_count;
        if completed == 0 {
            100.0
        } else {
            (self.successful_calls as f64 / completed as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_lifecycle() {
        let metrics = ExecutionMetrics::new();
        let tool = QualifiedToolName::new("srv", "search");

        metrics.record_call_start();
        assert_eq!(metrics.active_executions(), 1);
        metrics.record_call_end(&tool, true, 20);
        metrics.record_call_finished();

        metrics.record_call_start();
        metrics.record_call_end(&tool, false, 40);
        metrics.record_error(ErrorKind::ToolExecution);
        metrics.record_call_finished();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 2);
        assert_eq!(snapshot.successful_calls, 1);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.active_executions, 0);
        assert_eq!(snapshot.average_latency_ms, 30);
        assert_eq!(snapshot.errors_by_kind["TOOL_EXECUTION_FAILED"], 1);
        assert!((snapshot.success_rate() - 50.0).abs() < f64::EPSILON);

        let latency = metrics.tool_latency(&tool).unwrap();
        assert_eq!(latency.count, 2);
        assert_eq!(latency.min_ms, 20);
        assert_eq!(latency.max_ms, 40);
    }

    #[test]
    fn test_error_classification() {
        let metrics = ExecutionMetrics::new();
        metrics.record_error(ErrorKind::Validation);
        metrics.record_error(ErrorKind::Connection);
        metrics.record_error(ErrorKind::Connection);
        metrics.record_retries(3);
        metrics.record_retries(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.validation_failures, 1);
        assert_eq!(snapshot.connection_errors, 2);
        assert_eq!(snapshot.retries, 3);
        assert_eq!(snapshot.error_count, 3);
    }

    #[test]
    fn test_reset_keeps_active_executions() {
        let metrics = ExecutionMetrics::new();
        metrics.record_call_start();
        metrics.record_error(ErrorKind::Internal);
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.error_count, 0);
        assert_eq!(snapshot.active_executions, 1);
        assert!(metrics.all_tool_latencies().is_empty());
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ExecutionMetrics::new().snapshot();
        assert_eq!(snapshot.latency, LatencySnapshot::default());
        assert!((snapshot.success_rate() - 100.0).abs() < f64::EPSILON);
    }
}

//! Operation metrics.
//!
//! Services record one [`OperationMetric`] per entry-point call through a
//! [`MetricsSink`]. Exporters are out of scope here; the two sinks below cover
//! tests (`InMemoryMetricsSink`) and log-based collection (`TracingMetricsSink`).

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Success,
    Failure,
}

impl OperationResult {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationResult::Success => "success",
            OperationResult::Failure => "failure",
        }
    }
}

/// One completed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetric {
    /// e.g. `"apply_movement"`, `"transfer"`.
    pub operation_type: String,
    pub location_id: Option<String>,
    pub result: OperationResult,
    /// Error category on failure (`"validation"`, `"transient"`, ...).
    pub category: Option<String>,
    pub duration_ms: f64,
    pub recorded_at: DateTime<Utc>,
}

impl OperationMetric {
    pub fn success(operation_type: impl Into<String>, location_id: Option<String>, duration_ms: f64) -> Self {
        Self {
            operation_type: operation_type.into(),
            location_id,
            result: OperationResult::Success,
            category: None,
            duration_ms,
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(
        operation_type: impl Into<String>,
        location_id: Option<String>,
        category: impl Into<String>,
        duration_ms: f64,
    ) -> Self {
        Self {
            operation_type: operation_type.into(),
            location_id,
            result: OperationResult::Failure,
            category: Some(category.into()),
            duration_ms,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == OperationResult::Success
    }
}

/// Destination for operation metrics. Implementations must not block for long.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: OperationMetric);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _metric: OperationMetric) {}
}

/// Keeps every metric in memory (tests, status pages).
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    metrics: Mutex<Vec<OperationMetric>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<OperationMetric> {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count metrics for `operation_type` with the given result.
    pub fn count(&self, operation_type: &str, result: OperationResult) -> usize {
        self.snapshot()
            .iter()
            .filter(|m| m.operation_type == operation_type && m.result == result)
            .count()
    }

    /// Count failures in `category` across all operations.
    pub fn count_category(&self, category: &str) -> usize {
        self.snapshot()
            .iter()
            .filter(|m| m.category.as_deref() == Some(category))
            .count()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, metric: OperationMetric) {
        match self.metrics.lock() {
            Ok(mut m) => m.push(metric),
            Err(poisoned) => poisoned.into_inner().push(metric),
        }
    }
}

/// Emits each metric as a structured `tracing` event on the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, metric: OperationMetric) {
        tracing::info!(
            target: "metrics",
            operation_type = %metric.operation_type,
            location_id = metric.location_id.as_deref().unwrap_or("-"),
            result = metric.result.as_str(),
            category = metric.category.as_deref().unwrap_or("-"),
            duration_ms = metric.duration_ms,
            "operation recorded"
        );
    }
}

use surge_metrics::{MetricKind, Registry};

use crate::iteration_metrics::{
    CHECKS, GROUP_DURATION, ITERATION_DURATION, ITERATION_FAILED, ITERATIONS, ITERATIONS_FAILED,
    IterationMetrics, VUS, VUS_MAX,
};
use crate::request_metrics::{
    DATA_RECEIVED, DATA_SENT, HTTP_REQ_DURATION, HTTP_REQ_FAILED, HTTP_REQ_WAITING, HTTP_REQS,
    RequestMetrics,
};

/// Metrics every run registers before the first VU starts.
pub const BUILTIN_METRICS: &[(&str, MetricKind)] = &[
    (ITERATIONS, MetricKind::Counter),
    (ITERATION_DURATION, MetricKind::Trend),
    (ITERATIONS_FAILED, MetricKind::Counter),
    (ITERATION_FAILED, MetricKind::Rate),
    (GROUP_DURATION, MetricKind::Trend),
    (CHECKS, MetricKind::Rate),
    (HTTP_REQS, MetricKind::Counter),
    (HTTP_REQ_DURATION, MetricKind::Trend),
    (HTTP_REQ_WAITING, MetricKind::Trend),
    (HTTP_REQ_FAILED, MetricKind::Rate),
    (DATA_SENT, MetricKind::Counter),
    (DATA_RECEIVED, MetricKind::Counter),
    (VUS, MetricKind::Gauge),
    (VUS_MAX, MetricKind::Gauge),
];

pub fn builtin_kind(name: &str) -> Option<MetricKind> {
    BUILTIN_METRICS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, kind)| *kind)
}

#[derive(Debug, Clone)]
pub struct BuiltinMetrics {
    pub iterations: IterationMetrics,
    pub requests: RequestMetrics,
}

impl BuiltinMetrics {
    pub fn register(metrics: &Registry) -> surge_metrics::Result<Self> {
        Ok(Self {
            iterations: IterationMetrics::register(metrics)?,
            requests: RequestMetrics::register(metrics)?,
        })
    }
}

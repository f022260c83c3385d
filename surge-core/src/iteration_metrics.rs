use std::time::Duration;

use surge_metrics::{MetricHandle, MetricId, MetricKind, Registry};

pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATIONS_FAILED: &str = "iterations_failed";
pub const ITERATION_FAILED: &str = "iteration_failed";
pub const GROUP_DURATION: &str = "group_duration";
pub const CHECKS: &str = "checks";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

pub const TAG_GROUP: &str = "group";
pub const TAG_CHECK: &str = "check";

pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_secs() as f64 * 1000.0 + f64::from(d.subsec_nanos()) / 1_000_000.0
}

#[derive(Debug, Clone, Copy)]
pub struct IterationSample {
    pub failed: bool,
    pub duration: Duration,
}

/// Iteration, group, check and VU built-ins.
///
/// Untagged series are resolved once; tagged series go through the registry on each sample.
#[derive(Debug, Clone)]
pub struct IterationMetrics {
    iterations: MetricHandle,
    iteration_duration: MetricHandle,
    iterations_failed: MetricHandle,
    iteration_failed: MetricHandle,
    group_duration_id: MetricId,
    group_duration: MetricHandle,
    checks_id: MetricId,
    checks: MetricHandle,
    vus: MetricHandle,
    vus_max: MetricHandle,
}

impl IterationMetrics {
    pub fn register(metrics: &Registry) -> surge_metrics::Result<Self> {
        let group_duration_id = metrics.register(GROUP_DURATION, MetricKind::Trend)?;
        let checks_id = metrics.register(CHECKS, MetricKind::Rate)?;
        Ok(Self {
            iterations: metrics.handle(ITERATIONS, MetricKind::Counter, &[])?,
            iteration_duration: metrics.handle(ITERATION_DURATION, MetricKind::Trend, &[])?,
            iterations_failed: metrics.handle(ITERATIONS_FAILED, MetricKind::Counter, &[])?,
            iteration_failed: metrics.handle(ITERATION_FAILED, MetricKind::Rate, &[])?,
            group_duration_id,
            group_duration: metrics.handle(GROUP_DURATION, MetricKind::Trend, &[])?,
            checks_id,
            checks: metrics.handle(CHECKS, MetricKind::Rate, &[])?,
            vus: metrics.handle(VUS, MetricKind::Gauge, &[])?,
            vus_max: metrics.handle(VUS_MAX, MetricKind::Gauge, &[])?,
        })
    }

    pub fn record_iteration(&self, sample: IterationSample) {
        self.iterations.increment(1);
        self.iteration_duration.observe(duration_ms(sample.duration));
        self.iteration_failed.add_rate(sample.failed);
        if sample.failed {
            self.iterations_failed.increment(1);
        }
    }

    /// Completed iterations so far, across every VU.
    pub fn iterations_total(&self) -> u64 {
        match self.iterations.value() {
            surge_metrics::MetricValue::Counter { value } => value,
            _ => 0,
        }
    }

    pub fn record_group(&self, metrics: &Registry, path: &str, duration: Duration) {
        let ms = duration_ms(duration);
        self.group_duration.observe(ms);
        let tags = metrics.resolve_tags(&[(TAG_GROUP, path)]);
        if let Some(h) = metrics.get_handle(self.group_duration_id, tags) {
            h.observe(ms);
        }
    }

    pub fn record_check(&self, metrics: &Registry, name: &str, group: Option<&str>, passed: bool) {
        self.checks.add_rate(passed);
        let tags = match group {
            Some(group) => metrics.resolve_tags(&[(TAG_CHECK, name), (TAG_GROUP, group)]),
            None => metrics.resolve_tags(&[(TAG_CHECK, name)]),
        };
        if let Some(h) = metrics.get_handle(self.checks_id, tags) {
            h.add_rate(passed);
        }
    }

    /// Counts a live VU until the guard is dropped.
    pub fn enter_active_vu(&self) -> ActiveVuGuard {
        let MetricHandle::Gauge(vus) = &self.vus else {
            return ActiveVuGuard { vus: None };
        };
        let active = vus.fetch_add(1, std::sync::atomic::Ordering::Relaxed).saturating_add(1);
        self.vus_max.max_gauge(active);
        ActiveVuGuard {
            vus: Some(self.vus.clone()),
        }
    }
}

pub struct ActiveVuGuard {
    vus: Option<MetricHandle>,
}

impl Drop for ActiveVuGuard {
    fn drop(&mut self) {
        if let Some(MetricHandle::Gauge(g)) = &self.vus {
            g.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

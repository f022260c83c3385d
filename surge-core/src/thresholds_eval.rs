use std::sync::Arc;
use std::time::Duration;

use surge_metrics::{MetricKind, Registry};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::thresholds::{Threshold, ThresholdAgg};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdOutcome {
    /// Aggregate the expression was compared against; `None` when there is no data yet.
    pub observed: Option<f64>,
    /// `None` while not evaluable.
    pub passed: Option<bool>,
}

impl ThresholdOutcome {
    /// Final verdict: a threshold without data fails.
    pub fn final_pass(self) -> bool {
        self.passed.unwrap_or(false)
    }
}

/// Current value of the threshold's aggregate over the series its selector matches.
pub fn observe(metrics: &Registry, threshold: &Threshold, elapsed: Duration) -> Option<f64> {
    let selector = &threshold.selector;
    let metric = metrics.lookup_metric(&selector.metric)?;
    let kind = metrics.kind_of(metric)?;

    let mut query = metrics.query(metric);
    if selector.tags.is_empty() {
        query = query.untagged();
    } else {
        for (k, v) in &selector.tags {
            // A tag never written cannot match any series.
            let k = metrics.lookup_key(k)?;
            let v = metrics.lookup_key(v)?;
            query = query.where_eq(k, v);
        }
    }
    if query.series_count() == 0 {
        return None;
    }

    let agg = threshold.expr.agg;
    match kind {
        MetricKind::Trend => {
            let trend = query.merge_trend()?;
            match agg {
                ThresholdAgg::Count => Some(trend.count() as f64),
                ThresholdAgg::Avg => trend.avg(),
                ThresholdAgg::Min => trend.min(),
                ThresholdAgg::Max => trend.max(),
                ThresholdAgg::Med => trend.percentile(50.0),
                ThresholdAgg::P(p) => trend.percentile(p),
                ThresholdAgg::Rate | ThresholdAgg::Value => None,
            }
        }
        MetricKind::Rate => {
            let totals = query.sum_rate();
            match agg {
                ThresholdAgg::Count => Some(totals.total as f64),
                ThresholdAgg::Rate if totals.total > 0 => Some(totals.rate()),
                _ => None,
            }
        }
        MetricKind::Counter => {
            let total = query.sum_counter_total();
            match agg {
                ThresholdAgg::Count => Some(total as f64),
                ThresholdAgg::Rate if !elapsed.is_zero() => {
                    Some(total as f64 / elapsed.as_secs_f64())
                }
                _ => None,
            }
        }
        MetricKind::Gauge => match agg {
            ThresholdAgg::Value => query.gauge().map(|v| v as f64),
            _ => None,
        },
    }
}

/// Evaluates every threshold against the current state of `metrics`.
///
/// Pure with respect to the registry: two calls without new samples in between agree.
pub fn evaluate(
    metrics: &Registry,
    thresholds: &[Threshold],
    elapsed: Duration,
) -> Vec<ThresholdOutcome> {
    thresholds
        .iter()
        .map(|t| {
            let observed = observe(metrics, t, elapsed);
            ThresholdOutcome {
                observed,
                passed: observed.map(|v| t.expr.op.compare(v, t.expr.value)),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Per threshold, whether any periodic evaluation saw it fail.
    pub failed_during_run: Vec<bool>,
    /// The abort-on-fail threshold that stopped the run, if any.
    pub aborted_by: Option<String>,
}

/// Periodic threshold evaluation during a run.
pub struct ThresholdMonitor {
    metrics: Arc<Registry>,
    thresholds: Arc<[Threshold]>,
    interval: Duration,
    stop: CancellationToken,
    started: Instant,
}

impl ThresholdMonitor {
    pub fn new(
        metrics: Arc<Registry>,
        thresholds: Arc<[Threshold]>,
        interval: Duration,
        stop: CancellationToken,
        started: Instant,
    ) -> Self {
        Self {
            metrics,
            thresholds,
            interval,
            stop,
            started,
        }
    }

    /// Evaluates every `interval` until `done` fires.
    pub async fn run(self, done: CancellationToken) -> MonitorReport {
        let mut report = MonitorReport {
            failed_during_run: vec![false; self.thresholds.len()],
            aborted_by: None,
        };
        if self.thresholds.is_empty() {
            done.cancelled().await;
            return report;
        }

        let mut interval =
            tokio::time::interval_at(self.started + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = done.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.check(&mut report);
        }
        report
    }

    fn check(&self, report: &mut MonitorReport) {
        let elapsed = self.started.elapsed();
        let outcomes = evaluate(&self.metrics, &self.thresholds, elapsed);

        for (i, (threshold, outcome)) in self.thresholds.iter().zip(outcomes).enumerate() {
            if outcome.passed != Some(false) {
                continue;
            }

            if !report.failed_during_run[i] {
                warn!(
                    metric = %threshold.selector,
                    threshold = %threshold.source,
                    observed = outcome.observed,
                    "threshold crossed"
                );
                report.failed_during_run[i] = true;
            }

            let grace = threshold.delay_abort_eval.unwrap_or_default();
            if threshold.abort_on_fail && elapsed >= grace && report.aborted_by.is_none() {
                let reason = format!("{}: {}", threshold.selector, threshold.source);
                warn!(threshold = %reason, elapsed = ?elapsed, "aborting run on failed threshold");
                report.aborted_by = Some(reason);
                self.stop.cancel();
            }
        }
    }
}

/// Logs the final verdicts.
pub(crate) fn log_final(thresholds: &[Threshold], outcomes: &[ThresholdOutcome]) {
    for (threshold, outcome) in thresholds.iter().zip(outcomes) {
        if outcome.final_pass() {
            info!(
                metric = %threshold.selector,
                threshold = %threshold.source,
                observed = outcome.observed,
                "threshold passed"
            );
        } else {
            warn!(
                metric = %threshold.selector,
                threshold = %threshold.source,
                observed = outcome.observed,
                "threshold failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(selector: &str, expr: &str) -> Threshold {
        Threshold::parse(selector, expr).unwrap_or_else(|e| panic!("{e}"))
    }

    fn registry() -> Registry {
        let reg = Registry::default();
        for (tags, ms) in [
            (vec![], 100.0),
            (vec![], 300.0),
            (vec![("group", "::login")], 100.0),
        ] {
            reg.handle("group_duration", MetricKind::Trend, &tags)
                .unwrap_or_else(|e| panic!("{e}"))
                .observe(ms);
        }
        let checks = reg
            .handle("checks", MetricKind::Rate, &[])
            .unwrap_or_else(|e| panic!("{e}"));
        for ok in [true, true, true, false] {
            checks.add_rate(ok);
        }
        reg.handle("http_reqs", MetricKind::Counter, &[])
            .unwrap_or_else(|e| panic!("{e}"))
            .increment(50);
        reg.handle("vus", MetricKind::Gauge, &[])
            .unwrap_or_else(|e| panic!("{e}"))
            .set_gauge(7);
        reg.register("empty_trend", MetricKind::Trend)
            .unwrap_or_else(|e| panic!("{e}"));
        reg
    }

    #[test]
    fn aggregates_per_metric_kind() {
        let reg = registry();
        let elapsed = Duration::from_secs(10);
        let obs = |sel: &str, expr: &str| observe(&reg, &threshold(sel, expr), elapsed);

        assert_eq!(obs("group_duration", "avg<1"), Some(200.0));
        assert_eq!(obs("group_duration", "count<1"), Some(2.0));
        assert_eq!(obs("group_duration{group:::login}", "max<1"), Some(100.0));
        assert_eq!(obs("checks", "rate<1"), Some(0.75));
        assert_eq!(obs("checks", "count<1"), Some(4.0));
        assert_eq!(obs("http_reqs", "count<1"), Some(50.0));
        assert_eq!(obs("http_reqs", "rate<1"), Some(5.0));
        assert_eq!(obs("vus", "value<1"), Some(7.0));

        let p = obs("group_duration", "p(99)<1").unwrap_or_else(|| panic!("no p99"));
        assert!((p - 300.0).abs() <= 300.0 * surge_metrics::TREND_RELATIVE_ERROR + 0.001);
    }

    #[test]
    fn missing_data_is_not_evaluable_and_fails_at_the_end() {
        let reg = registry();
        let thresholds = [
            threshold("nope", "count>0"),
            threshold("empty_trend", "p(95)<10"),
            threshold("group_duration{group:::checkout}", "avg<10"),
            threshold("checks", "rate>0.9"),
            threshold("checks", "rate>0.5"),
        ];
        let outcomes = evaluate(&reg, &thresholds, Duration::from_secs(1));
        let passed: Vec<Option<bool>> = outcomes.iter().map(|o| o.passed).collect();
        assert_eq!(passed, vec![None, None, None, Some(false), Some(true)]);
        let finals: Vec<bool> = outcomes.iter().map(|o| o.final_pass()).collect();
        assert_eq!(finals, vec![false, false, false, false, true]);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let reg = registry();
        let thresholds = [
            threshold("group_duration", "p(95)<250"),
            threshold("checks", "rate==0.75"),
        ];
        let a = evaluate(&reg, &thresholds, Duration::from_secs(3));
        let b = evaluate(&reg, &thresholds, Duration::from_secs(3));
        assert_eq!(a, b);
        assert_eq!(a[1].passed, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_aborts_after_grace_period() {
        let reg = Arc::new(registry());
        let mut abort = threshold("checks", "rate>0.9");
        abort.abort_on_fail = true;
        abort.delay_abort_eval = Some(Duration::from_secs(3));
        let thresholds: Arc<[Threshold]> = vec![abort, threshold("checks", "rate>0.5")].into();

        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        let started = Instant::now();
        let monitor = ThresholdMonitor::new(
            reg,
            thresholds,
            Duration::from_secs(1),
            stop.clone(),
            started,
        );
        let task = tokio::spawn(monitor.run(done.clone()));

        stop.cancelled().await;
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        done.cancel();

        let report = task.await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(report.failed_during_run, vec![true, false]);
        assert_eq!(report.aborted_by.as_deref(), Some("checks: rate>0.9"));
    }
}

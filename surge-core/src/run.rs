use std::collections::BTreeMap;
use std::sync::Arc;

use surge_http::HttpClient;
use surge_metrics::Registry;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builtin::BuiltinMetrics;
use crate::config::{RunOptions, RunPlan};
use crate::error::{Error, Result};
use crate::progress::{ProgressFn, ProgressUpdate};
use crate::scenario::{ExecutionEnv, Scenario, Transport};
use crate::scheduler::Scheduler;
use crate::summary::{RunSummary, SummaryReporter, ThresholdVerdict};
use crate::thresholds_eval::{ThresholdMonitor, evaluate, log_final};

const STOPPED_EXTERNALLY: &str = "stopped externally";

/// Owns one run from validated options to the final summary.
pub struct Runner {
    plan: RunPlan,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    reporters: Vec<Box<dyn SummaryReporter>>,
    progress: Option<ProgressFn>,
    stop: CancellationToken,
}

impl Runner {
    /// Validates `options` and prepares the metric registry.
    ///
    /// Every configuration fault surfaces here, before any VU is started.
    pub fn new(options: &RunOptions) -> Result<Self> {
        let plan = options.validate()?;
        let registry = Arc::new(Registry::default());
        BuiltinMetrics::register(&registry)?;

        for (name, kind) in &plan.metrics {
            registry.register(name, *kind)?;
        }

        for t in &plan.thresholds {
            let Some(kind) = registry
                .lookup_metric(&t.selector.metric)
                .and_then(|id| registry.kind_of(id))
            else {
                continue;
            };
            if !t.expr.agg.applies_to(kind) {
                return Err(Error::InvalidThreshold {
                    selector: t.selector.to_string(),
                    expression: t.source.clone(),
                    reason: format!("`{}` does not apply to a {kind} metric", t.expr.agg),
                });
            }
        }

        Ok(Self {
            plan,
            registry,
            transport: Arc::new(HttpClient::default()),
            reporters: Vec::new(),
            progress: None,
            stop: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: impl SummaryReporter + 'static) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    #[must_use]
    pub fn with_progress(
        mut self,
        progress: impl Fn(ProgressUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Cancelling the returned token stops the run; in-flight iterations finish first.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    pub async fn run<S: Scenario>(self, scenario: S) -> Result<RunSummary> {
        let Self {
            plan,
            registry,
            transport,
            reporters,
            progress,
            stop,
        } = self;

        info!(
            scenario = %plan.scenario,
            max_vus = plan.executor.max_vus(),
            planned = ?plan.executor.planned_duration(),
            thresholds = plan.thresholds.len(),
            "run starting"
        );

        let env = Arc::new(ExecutionEnv::new(
            registry.clone(),
            transport,
            plan.scenario.as_str(),
            plan.tags.clone(),
        )?);

        let started = Instant::now();
        let done = CancellationToken::new();
        let thresholds: Arc<[_]> = plan.thresholds.clone().into();
        let monitor = ThresholdMonitor::new(
            registry.clone(),
            thresholds.clone(),
            plan.threshold_interval,
            stop.clone(),
            started,
        );
        let monitor = tokio::spawn(monitor.run(done.clone()));

        let scheduled = Scheduler::new(
            env,
            Arc::new(scenario),
            plan.executor.clone(),
            plan.control_tick,
            stop.clone(),
        )
        .with_progress(progress)
        .run()
        .await;

        done.cancel();
        let monitored = monitor.await?;
        let scheduled = scheduled?;
        let elapsed = started.elapsed();

        let outcomes = evaluate(&registry, &thresholds, elapsed);
        log_final(&thresholds, &outcomes);

        let verdicts: Vec<ThresholdVerdict> = thresholds
            .iter()
            .zip(&outcomes)
            .zip(&monitored.failed_during_run)
            .map(|((t, outcome), failed_during_run)| ThresholdVerdict {
                selector: t.selector.to_string(),
                expression: t.source.clone(),
                observed: outcome.observed,
                passed: outcome.final_pass(),
                abort_on_fail: t.abort_on_fail,
                failed_during_run: *failed_during_run,
            })
            .collect();

        let aborted = stop.is_cancelled();
        let abort_reason = match monitored.aborted_by {
            Some(reason) => Some(reason),
            None if aborted => Some(STOPPED_EXTERNALLY.to_string()),
            None => None,
        };

        let summary = RunSummary {
            scenario: plan.scenario,
            tags: plan.tags.into_iter().collect::<BTreeMap<_, _>>(),
            passed: verdicts.iter().all(|v| v.passed),
            aborted,
            abort_reason,
            elapsed,
            iterations: scheduled.reports.iter().map(|r| r.iterations).sum(),
            iterations_failed: scheduled.reports.iter().map(|r| r.failed).sum(),
            vus_used: scheduled.vus_used,
            vus_peak: scheduled.vus_peak,
            metrics: registry.summarize(),
            thresholds: verdicts,
            vu_reports: scheduled.reports,
        };

        for reporter in &reporters {
            if let Err(err) = reporter.report(&summary) {
                warn!(error = %err, "summary reporter failed");
            }
        }

        info!(
            scenario = %summary.scenario,
            passed = summary.passed,
            aborted = summary.aborted,
            elapsed = ?summary.elapsed,
            iterations = summary.iterations,
            "run finished"
        );
        Ok(summary)
    }
}

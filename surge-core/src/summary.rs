use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use surge_metrics::{MetricSeriesSummary, MetricValue};
use tracing::info;

use crate::vu::VuReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdVerdict {
    pub selector: String,
    pub expression: String,
    /// Final value of the aggregate; `None` when the metric never received a sample.
    pub observed: Option<f64>,
    pub passed: bool,
    pub abort_on_fail: bool,
    /// Whether any periodic evaluation saw this threshold fail.
    pub failed_during_run: bool,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scenario: String,
    pub tags: BTreeMap<String, String>,
    /// Every threshold passed at final evaluation.
    pub passed: bool,
    /// The run stopped before its planned end.
    pub aborted: bool,
    pub abort_reason: Option<String>,
    #[serde(serialize_with = "crate::config::duration_format::serialize")]
    pub elapsed: Duration,
    pub iterations: u64,
    pub iterations_failed: u64,
    pub vus_used: u64,
    pub vus_peak: u64,
    pub metrics: Vec<MetricSeriesSummary>,
    pub thresholds: Vec<ThresholdVerdict>,
    pub vu_reports: Vec<VuReport>,
}

impl RunSummary {
    /// Value of the series of `name` carrying exactly `tags`.
    pub fn metric(&self, name: &str, tags: &[(&str, &str)]) -> Option<&MetricValue> {
        let mut wanted: Vec<(&str, &str)> = tags.to_vec();
        wanted.sort_unstable();
        self.metrics
            .iter()
            .find(|m| {
                m.name == name
                    && m.tags.len() == wanted.len()
                    && m.tags
                        .iter()
                        .zip(&wanted)
                        .all(|((k, v), (wk, wv))| k == wk && v == wv)
            })
            .map(|m| &m.value)
    }

    pub fn threshold(&self, selector: &str) -> Option<&ThresholdVerdict> {
        self.thresholds.iter().find(|t| t.selector == selector)
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdVerdict> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}

/// Receives the summary once a run has finished.
pub trait SummaryReporter: Send + Sync {
    fn report(&self, summary: &RunSummary) -> io::Result<()>;
}

/// Pretty-printed JSON, one document per run.
pub struct JsonReporter<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> SummaryReporter for JsonReporter<W> {
    fn report(&self, summary: &RunSummary) -> io::Result<()> {
        let mut out = self.out.lock();
        serde_json::to_writer_pretty(&mut *out, summary)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// Logs the headline numbers and each threshold verdict.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl SummaryReporter for TracingReporter {
    fn report(&self, summary: &RunSummary) -> io::Result<()> {
        info!(
            scenario = %summary.scenario,
            passed = summary.passed,
            aborted = summary.aborted,
            elapsed = ?summary.elapsed,
            iterations = summary.iterations,
            iterations_failed = summary.iterations_failed,
            vus_peak = summary.vus_peak,
            "run summary"
        );
        for t in &summary.thresholds {
            info!(
                selector = %t.selector,
                expression = %t.expression,
                observed = t.observed,
                passed = t.passed,
                "threshold"
            );
        }
        Ok(())
    }
}

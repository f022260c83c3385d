use std::time::Duration;

use surge_metrics::{MetricHandle, MetricId, MetricKind, Registry};

use crate::iteration_metrics::{TAG_GROUP, duration_ms};

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_WAITING: &str = "http_req_waiting";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const DATA_SENT: &str = "data_sent";
pub const DATA_RECEIVED: &str = "data_received";

pub const TAG_METHOD: &str = "method";
pub const TAG_STATUS: &str = "status";
pub const TAG_NAME: &str = "name";
pub const TAG_ERROR_KIND: &str = "error_kind";

#[derive(Debug, Clone, Copy)]
pub struct RequestSample<'a> {
    pub method: &'a str,
    /// `None` when the transport failed before a response arrived.
    pub status: Option<u16>,
    pub name: &'a str,
    pub group: Option<&'a str>,
    pub duration: Duration,
    pub waiting: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error_kind: Option<&'a str>,
}

impl RequestSample<'_> {
    /// Transport errors and 4xx/5xx responses.
    pub fn failed(&self) -> bool {
        self.status.is_none_or(|s| s >= 400)
    }
}

#[derive(Debug, Clone)]
struct TaggedMetric {
    id: MetricId,
    base: MetricHandle,
}

impl TaggedMetric {
    fn register(metrics: &Registry, name: &str, kind: MetricKind) -> surge_metrics::Result<Self> {
        Ok(Self {
            id: metrics.register(name, kind)?,
            base: metrics.handle(name, kind, &[])?,
        })
    }

    fn tagged(&self, metrics: &Registry, tags: &[(&str, &str)]) -> Option<MetricHandle> {
        metrics.get_handle(self.id, metrics.resolve_tags(tags))
    }
}

/// HTTP built-ins recorded for every request made through an iteration context.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    reqs: TaggedMetric,
    duration: TaggedMetric,
    waiting: TaggedMetric,
    failed: TaggedMetric,
    data_sent: MetricHandle,
    data_received: MetricHandle,
}

impl RequestMetrics {
    pub fn register(metrics: &Registry) -> surge_metrics::Result<Self> {
        Ok(Self {
            reqs: TaggedMetric::register(metrics, HTTP_REQS, MetricKind::Counter)?,
            duration: TaggedMetric::register(metrics, HTTP_REQ_DURATION, MetricKind::Trend)?,
            waiting: TaggedMetric::register(metrics, HTTP_REQ_WAITING, MetricKind::Trend)?,
            failed: TaggedMetric::register(metrics, HTTP_REQ_FAILED, MetricKind::Rate)?,
            data_sent: metrics.handle(DATA_SENT, MetricKind::Counter, &[])?,
            data_received: metrics.handle(DATA_RECEIVED, MetricKind::Counter, &[])?,
        })
    }

    pub fn record_request(&self, metrics: &Registry, sample: RequestSample<'_>) {
        let status = sample
            .status
            .map_or_else(|| "0".to_string(), |s| s.to_string());

        let mut tags: Vec<(&str, &str)> = vec![
            (TAG_METHOD, sample.method),
            (TAG_STATUS, status.as_str()),
            (TAG_NAME, sample.name),
        ];
        if let Some(group) = sample.group {
            tags.push((TAG_GROUP, group));
        }
        if sample.status.is_none()
            && let Some(kind) = sample.error_kind
        {
            tags.push((TAG_ERROR_KIND, kind));
        }
        let failed = sample.failed();

        self.reqs.base.increment(1);
        self.failed.base.add_rate(failed);
        self.data_sent.increment(sample.bytes_sent);
        self.data_received.increment(sample.bytes_received);

        if let Some(h) = self.reqs.tagged(metrics, &tags) {
            h.increment(1);
        }
        if let Some(h) = self.failed.tagged(metrics, &tags) {
            h.add_rate(failed);
        }

        // Timings only exist when a response came back.
        if sample.status.is_some() {
            let ms = duration_ms(sample.duration);
            self.duration.base.observe(ms);
            if let Some(h) = self.duration.tagged(metrics, &tags) {
                h.observe(ms);
            }

            if let Some(waiting) = sample.waiting {
                let ms = duration_ms(waiting);
                self.waiting.base.observe(ms);
                if let Some(h) = self.waiting.tagged(metrics, &tags) {
                    h.observe(ms);
                }
            }
        }
    }
}

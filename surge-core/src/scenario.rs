use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use surge_http::{HttpClient, HttpRequest, HttpResponse};
use surge_metrics::{MetricHandle, MetricKind, Registry};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::builtin::BuiltinMetrics;
use crate::iteration_metrics::TAG_GROUP;
use crate::request_metrics::RequestSample;
use crate::vu::VuPhase;

pub type RequestError = surge_http::Error;
pub type IterationResult = std::result::Result<(), IterationError>;

/// Records `group_duration` when dropped, so a group that panics or is cancelled still counts.
struct GroupTimer {
    env: Arc<ExecutionEnv>,
    path: String,
    started: Instant,
}

impl Drop for GroupTimer {
    fn drop(&mut self) {
        self.env.builtins.iterations.record_group(
            &self.env.registry,
            &self.path,
            self.started.elapsed(),
        );
    }
}

/// Why an iteration failed. The worker records it and moves on to the next iteration.
#[derive(Debug, thiserror::Error)]
pub enum IterationError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Metrics(#[from] surge_metrics::Error),

    #[error("{0}")]
    Failed(String),
}

impl IterationError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// User-supplied iteration body, shared by every VU of a run.
pub trait Scenario: Send + Sync + 'static {
    fn iteration<'a>(&'a self, ctx: &'a mut IterationContext) -> BoxFuture<'a, IterationResult>;
}

pub struct ScenarioFn<F>(F);

impl<F> Scenario for ScenarioFn<F>
where
    F: for<'c> Fn(&'c mut IterationContext) -> BoxFuture<'c, IterationResult>
        + Send
        + Sync
        + 'static,
{
    fn iteration<'a>(&'a self, ctx: &'a mut IterationContext) -> BoxFuture<'a, IterationResult> {
        (self.0)(ctx)
    }
}

/// Wraps `|ctx| Box::pin(async move { .. })` as a [`Scenario`].
pub fn scenario_fn<F>(f: F) -> ScenarioFn<F>
where
    F: for<'c> Fn(&'c mut IterationContext) -> BoxFuture<'c, IterationResult>
        + Send
        + Sync
        + 'static,
{
    ScenarioFn(f)
}

/// The service under test, as seen from an iteration.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, req: HttpRequest) -> BoxFuture<'_, surge_http::Result<HttpResponse>>;
}

impl Transport for HttpClient {
    fn send(&self, req: HttpRequest) -> BoxFuture<'_, surge_http::Result<HttpResponse>> {
        Box::pin(self.request(req))
    }
}

/// Run-wide collaborators shared by every iteration context.
pub struct ExecutionEnv {
    registry: Arc<Registry>,
    builtins: BuiltinMetrics,
    transport: Arc<dyn Transport>,
    scenario: Arc<str>,
    tags: Arc<[(String, String)]>,
}

impl ExecutionEnv {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        scenario: impl Into<Arc<str>>,
        tags: Vec<(String, String)>,
    ) -> surge_metrics::Result<Self> {
        let builtins = BuiltinMetrics::register(&registry)?;
        Ok(Self {
            registry,
            builtins,
            transport,
            scenario: scenario.into(),
            tags: tags.into(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn builtins(&self) -> &BuiltinMetrics {
        &self.builtins
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }
}

/// Scratch key/value storage that lives for one iteration.
#[derive(Debug, Clone, Default)]
pub struct VuState {
    values: HashMap<String, String>,
}

impl VuState {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Write handle for a custom metric, recording into the base series and the current group.
#[derive(Debug, Clone)]
pub struct CustomMetric {
    base: MetricHandle,
    grouped: Option<MetricHandle>,
}

impl CustomMetric {
    /// Counters add `value` rounded to the nearest integer (negative and non-finite values are
    /// dropped). Gauges store it rounded the same way, rates count any non-zero value as true and
    /// trends record it as a sample.
    pub fn add(&self, value: f64) {
        for h in std::iter::once(&self.base).chain(self.grouped.as_ref()) {
            match h.kind() {
                MetricKind::Counter => {
                    if value.is_finite() && value >= 0.0 {
                        h.increment(value.round() as u64);
                    }
                }
                MetricKind::Gauge => {
                    if value.is_finite() {
                        h.set_gauge(value.round() as i64);
                    }
                }
                MetricKind::Rate => h.add_rate(value != 0.0),
                MetricKind::Trend => h.observe(value),
            }
        }
    }

    pub fn add_bool(&self, value: bool) {
        self.add(if value { 1.0 } else { 0.0 });
    }
}

/// Everything one iteration of one VU can touch.
pub struct IterationContext {
    env: Arc<ExecutionEnv>,
    vu_id: u64,
    iteration: u64,
    group_path: String,
    state: VuState,
    phase: Option<Arc<watch::Sender<VuPhase>>>,
}

impl IterationContext {
    pub fn new(env: Arc<ExecutionEnv>, vu_id: u64, iteration: u64) -> Self {
        Self {
            env,
            vu_id,
            iteration,
            group_path: String::new(),
            state: VuState::default(),
            phase: None,
        }
    }

    pub(crate) fn with_phase(mut self, phase: Arc<watch::Sender<VuPhase>>) -> Self {
        self.phase = Some(phase);
        self
    }

    /// 1-based, never reused within a run.
    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// 0-based count of iterations this VU started before this one.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn scenario(&self) -> &str {
        &self.env.scenario
    }

    /// Run-level tag from the run options.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.env
            .tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Current `::`-joined group path, `None` outside any group.
    pub fn group_path(&self) -> Option<&str> {
        (!self.group_path.is_empty()).then_some(self.group_path.as_str())
    }

    pub fn state(&mut self) -> &mut VuState {
        &mut self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.env.registry
    }

    /// Runs `f` inside group `name` and records `group_duration` however `f` ends.
    pub fn group<'a, T, F>(&'a mut self, name: &'a str, f: F) -> BoxFuture<'a, T>
    where
        F: for<'c> FnOnce(&'c mut IterationContext) -> BoxFuture<'c, T> + Send + 'a,
        T: Send + 'a,
    {
        Box::pin(async move {
            let parent_len = self.group_path.len();
            self.group_path.push_str("::");
            self.group_path.push_str(name);

            let timer = GroupTimer {
                env: self.env.clone(),
                path: self.group_path.clone(),
                started: Instant::now(),
            };
            let out = f(&mut *self).await;
            drop(timer);
            self.group_path.truncate(parent_len);
            out
        })
    }

    /// Evaluates every predicate against `value`; each one becomes a `checks` sample.
    pub fn check<T: ?Sized>(&self, value: &T, checks: &[(&str, &dyn Fn(&T) -> bool)]) -> bool {
        let group = self.group_path();
        let mut all = true;
        for (name, predicate) in checks {
            let passed = predicate(value);
            self.env
                .builtins
                .iterations
                .record_check(&self.env.registry, name, group, passed);
            all &= passed;
        }
        all
    }

    /// Suspends only this VU.
    pub async fn sleep(&self, duration: Duration) {
        self.set_phase(VuPhase::Sleeping);
        tokio::time::sleep(duration).await;
        self.set_phase(VuPhase::Running);
    }

    fn set_phase(&self, phase: VuPhase) {
        if let Some(tx) = &self.phase {
            tx.send_replace(phase);
        }
    }

    /// Sends `req` through the run's transport and records the HTTP built-ins.
    pub async fn request(&mut self, req: HttpRequest) -> Result<HttpResponse, RequestError> {
        let method = req.method.to_string();
        let name = req.tag_name().to_string();

        let started = Instant::now();
        let res = self.env.transport.send(req).await;
        let duration = started.elapsed();

        let error_kind = res
            .as_ref()
            .err()
            .map(|e| e.transport_error_kind().to_string());
        let sample = match &res {
            Ok(r) => RequestSample {
                method: &method,
                status: Some(r.status),
                name: &name,
                group: self.group_path(),
                duration,
                waiting: Some(r.waiting.min(duration)),
                bytes_sent: r.bytes_sent,
                bytes_received: r.bytes_received,
                error_kind: None,
            },
            Err(_) => RequestSample {
                method: &method,
                status: None,
                name: &name,
                group: self.group_path(),
                duration,
                waiting: None,
                bytes_sent: 0,
                bytes_received: 0,
                error_kind: error_kind.as_deref(),
            },
        };
        self.env
            .builtins
            .requests
            .record_request(&self.env.registry, sample);

        res
    }

    pub fn counter(&self, name: &str) -> surge_metrics::Result<CustomMetric> {
        self.custom(name, MetricKind::Counter)
    }

    pub fn gauge(&self, name: &str) -> surge_metrics::Result<CustomMetric> {
        self.custom(name, MetricKind::Gauge)
    }

    pub fn rate(&self, name: &str) -> surge_metrics::Result<CustomMetric> {
        self.custom(name, MetricKind::Rate)
    }

    pub fn trend(&self, name: &str) -> surge_metrics::Result<CustomMetric> {
        self.custom(name, MetricKind::Trend)
    }

    fn custom(&self, name: &str, kind: MetricKind) -> surge_metrics::Result<CustomMetric> {
        let registry = &self.env.registry;
        let base = registry.handle(name, kind, &[])?;
        let grouped = match self.group_path() {
            Some(group) => Some(registry.handle(name, kind, &[(TAG_GROUP, group)])?),
            None => None,
        };
        Ok(CustomMetric { base, grouped })
    }
}

pub mod builtin;
pub mod config;
mod error;
pub mod gate;
pub mod iteration_metrics;
pub mod progress;
pub mod request_metrics;
pub mod run;
pub mod schedule;
pub mod scenario;
pub mod scheduler;
pub mod summary;
pub mod thresholds;
pub mod thresholds_eval;
pub mod vu;

pub use builtin::{BUILTIN_METRICS, BuiltinMetrics, builtin_kind};
pub use config::{Executor, RunOptions, RunPlan, Stage, StageMode};
pub use error::{Error, Result};
pub use progress::{ProgressFn, ProgressUpdate};
pub use run::Runner;
pub use scenario::{
    CustomMetric, ExecutionEnv, IterationContext, IterationError, IterationResult, Scenario,
    ScenarioFn, Transport, VuState, scenario_fn,
};
pub use schedule::{StageSchedule, StageSnapshot};
pub use scheduler::{Scheduler, SchedulerReport};
pub use summary::{JsonReporter, RunSummary, SummaryReporter, ThresholdVerdict, TracingReporter};
pub use thresholds::{Selector, Threshold, ThresholdAgg, ThresholdExpr, ThresholdOp};
pub use thresholds_eval::{MonitorReport, ThresholdMonitor, ThresholdOutcome, evaluate};
pub use vu::{VuPhase, VuReport, VuWorker};

pub use surge_http::{HttpClient, HttpRequest, HttpResponse};
pub use surge_metrics::{MetricKind, MetricValue, Registry};

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use surge_metrics::MetricKind;

use crate::error::{Error, Result};
use crate::thresholds::Threshold;

const DEFAULT_SCENARIO: &str = "default";
const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// How a stage moves from the previous target to its own.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// Linear interpolation across the stage.
    #[default]
    Ramp,
    /// Jump to the target at stage start and keep it.
    Hold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    #[serde(with = "duration_format")]
    pub duration: Duration,
    pub target: u64,
    /// Falls back to the run-level `stage_mode` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StageMode>,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self {
            duration,
            target,
            mode: None,
        }
    }

    pub fn ramp(duration: Duration, target: u64) -> Self {
        Self {
            mode: Some(StageMode::Ramp),
            ..Self::new(duration, target)
        }
    }

    pub fn hold(duration: Duration, target: u64) -> Self {
        Self {
            mode: Some(StageMode::Hold),
            ..Self::new(duration, target)
        }
    }

    pub fn mode_or_default(&self) -> StageMode {
        self.mode.unwrap_or_default()
    }
}

/// Threshold declarations for one selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdDecl {
    One(String),
    Many(Vec<ThresholdEntry>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed(ThresholdSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdSpec {
    pub threshold: String,

    #[serde(default, alias = "abortOnFail")]
    pub abort_on_fail: bool,

    #[serde(
        default,
        alias = "delayAbortEval",
        with = "duration_format::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay_abort_eval: Option<Duration>,
}

impl ThresholdDecl {
    fn entries(&self) -> Vec<ThresholdSpec> {
        let spec = |threshold: &str| ThresholdSpec {
            threshold: threshold.to_string(),
            abort_on_fail: false,
            delay_abort_eval: None,
        };
        match self {
            Self::One(expr) => vec![spec(expr)],
            Self::Many(list) => list
                .iter()
                .map(|entry| match entry {
                    ThresholdEntry::Expr(expr) => spec(expr),
                    ThresholdEntry::Detailed(detailed) => detailed.clone(),
                })
                .collect(),
        }
    }

    fn push(&mut self, entry: ThresholdEntry) {
        match self {
            Self::One(expr) => {
                *self = Self::Many(vec![ThresholdEntry::Expr(std::mem::take(expr)), entry]);
            }
            Self::Many(list) => list.push(entry),
        }
    }
}

/// User-facing run configuration, loadable from YAML or JSON.
///
/// Either `stages` (ramping VUs) or `vus` with `duration` and/or `iterations` (constant VUs).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunOptions {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scenario: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vus: Option<u64>,

    #[serde(with = "duration_format::option", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,

    #[serde(alias = "startVUs", skip_serializing_if = "Option::is_none")]
    pub start_vus: Option<u64>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,

    #[serde(alias = "stageMode")]
    pub stage_mode: StageMode,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, ThresholdDecl>,

    #[serde(
        alias = "controlTick",
        with = "duration_format::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub control_tick: Option<Duration>,

    #[serde(
        alias = "thresholdInterval",
        with = "duration_format::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub threshold_interval: Option<Duration>,

    /// Custom metrics declared up front, checked against the built-ins.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, MetricKind>,

    /// Run-level tags reported in the summary and readable from scenarios.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl RunOptions {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// `.json` files are read as JSON, anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    pub fn ramping(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            ..Self::default()
        }
    }

    pub fn constant(vus: u64, duration: Duration) -> Self {
        Self {
            vus: Some(vus),
            duration: Some(duration),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_scenario(mut self, name: impl Into<String>) -> Self {
        self.scenario = name.into();
        self
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    #[must_use]
    pub fn with_start_vus(mut self, start_vus: u64) -> Self {
        self.start_vus = Some(start_vus);
        self
    }

    #[must_use]
    pub fn with_stage_mode(mut self, mode: StageMode) -> Self {
        self.stage_mode = mode;
        self
    }

    #[must_use]
    pub fn with_threshold(self, selector: &str, expression: &str) -> Self {
        self.with_threshold_entry(selector, ThresholdEntry::Expr(expression.to_string()))
    }

    #[must_use]
    pub fn with_abort_threshold(
        self,
        selector: &str,
        expression: &str,
        delay_abort_eval: Option<Duration>,
    ) -> Self {
        self.with_threshold_entry(
            selector,
            ThresholdEntry::Detailed(ThresholdSpec {
                threshold: expression.to_string(),
                abort_on_fail: true,
                delay_abort_eval,
            }),
        )
    }

    fn with_threshold_entry(mut self, selector: &str, entry: ThresholdEntry) -> Self {
        match self.thresholds.get_mut(selector) {
            Some(decl) => decl.push(entry),
            None => {
                self.thresholds
                    .insert(selector.to_string(), ThresholdDecl::Many(vec![entry]));
            }
        }
        self
    }

    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, kind: MetricKind) -> Self {
        self.metrics.insert(name.into(), kind);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_control_tick(mut self, tick: Duration) -> Self {
        self.control_tick = Some(tick);
        self
    }

    #[must_use]
    pub fn with_threshold_interval(mut self, interval: Duration) -> Self {
        self.threshold_interval = Some(interval);
        self
    }

    /// Checks the options and resolves defaults into an executable plan.
    pub fn validate(&self) -> Result<RunPlan> {
        let executor = if self.stages.is_empty() {
            self.constant_executor()?
        } else {
            self.ramping_executor()?
        };

        let control_tick = positive_interval(self.control_tick, "control_tick")?;
        let threshold_interval = positive_interval(self.threshold_interval, "threshold_interval")?;

        let mut thresholds = Vec::new();
        for (selector, decl) in &self.thresholds {
            for spec in decl.entries() {
                let mut threshold = Threshold::parse(selector, &spec.threshold).map_err(|reason| {
                    Error::InvalidThreshold {
                        selector: selector.clone(),
                        expression: spec.threshold.clone(),
                        reason,
                    }
                })?;
                threshold.abort_on_fail = spec.abort_on_fail;
                threshold.delay_abort_eval = spec.delay_abort_eval;
                thresholds.push(threshold);
            }
        }

        let scenario = if self.scenario.trim().is_empty() {
            DEFAULT_SCENARIO.to_string()
        } else {
            self.scenario.trim().to_string()
        };

        Ok(RunPlan {
            scenario,
            tags: self
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            executor,
            thresholds,
            control_tick,
            threshold_interval,
            metrics: self
                .metrics
                .iter()
                .map(|(name, kind)| (name.clone(), *kind))
                .collect(),
        })
    }

    fn ramping_executor(&self) -> Result<Executor> {
        if self.iterations.is_some() {
            return Err(Error::InvalidIterations);
        }

        let start_vus = self.start_vus.unwrap_or(0);
        let max_stage = self.stages.iter().map(|st| st.target).max().unwrap_or(0);
        if max_stage.max(start_vus) == 0 {
            return Err(Error::InvalidVus);
        }

        let total_duration = self
            .stages
            .iter()
            .fold(Duration::ZERO, |acc, st| acc.saturating_add(st.duration));
        if total_duration.is_zero() {
            return Err(Error::InvalidStages);
        }

        let stages = self
            .stages
            .iter()
            .map(|st| Stage {
                mode: Some(st.mode.unwrap_or(self.stage_mode)),
                ..st.clone()
            })
            .collect();

        Ok(Executor::RampingVus { start_vus, stages })
    }

    fn constant_executor(&self) -> Result<Executor> {
        let vus = self.vus.unwrap_or(1);
        if vus == 0 {
            return Err(Error::InvalidVus);
        }

        if let Some(duration) = self.duration
            && duration.is_zero()
        {
            return Err(Error::InvalidDuration(duration));
        }

        // Default iterations is 1 unless duration mode is used.
        let iterations = self
            .iterations
            .or_else(|| if self.duration.is_some() { None } else { Some(1) });
        if iterations == Some(0) {
            return Err(Error::InvalidIterations);
        }

        Ok(Executor::ConstantVus {
            vus,
            duration: self.duration,
            iterations,
        })
    }
}

fn positive_interval(value: Option<Duration>, field: &'static str) -> Result<Duration> {
    match value {
        None => Ok(DEFAULT_TICK),
        Some(d) if d.is_zero() => Err(Error::InvalidInterval(field)),
        Some(d) => Ok(d),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executor {
    /// Concurrency follows the stage curve; every stage carries a resolved mode.
    RampingVus { start_vus: u64, stages: Vec<Stage> },
    /// A fixed pool sharing one iteration budget and/or deadline.
    ConstantVus {
        vus: u64,
        duration: Option<Duration>,
        iterations: Option<u64>,
    },
}

impl Executor {
    pub fn max_vus(&self) -> u64 {
        match self {
            Self::RampingVus { start_vus, stages } => stages
                .iter()
                .map(|st| st.target)
                .max()
                .unwrap_or(0)
                .max(*start_vus),
            Self::ConstantVus { vus, .. } => *vus,
        }
    }

    /// Planned run length; `None` for an iteration-bounded constant pool.
    pub fn planned_duration(&self) -> Option<Duration> {
        match self {
            Self::RampingVus { stages, .. } => Some(
                stages
                    .iter()
                    .fold(Duration::ZERO, |acc, st| acc.saturating_add(st.duration)),
            ),
            Self::ConstantVus { duration, .. } => *duration,
        }
    }
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub scenario: String,
    pub tags: Vec<(String, String)>,
    pub executor: Executor,
    pub thresholds: Vec<Threshold>,
    pub control_tick: Duration,
    pub threshold_interval: Duration,
    pub metrics: Vec<(String, MetricKind)>,
}

/// Durations as humantime strings (`"30s"`, `"1m30s"`) or numeric seconds.
pub(crate) mod duration_format {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        HumanDuration::deserialize(deserializer).map(|d| d.0)
    }

    struct HumanDuration(Duration);

    impl<'de> Deserialize<'de> for HumanDuration {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct V;

            impl serde::de::Visitor<'_> for V {
                type Value = HumanDuration;

                fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                    f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
                }

                fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(HumanDuration(Duration::from_secs(v)))
                }

                fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    let secs = u64::try_from(v)
                        .map_err(|_| E::custom("duration must not be negative"))?;
                    Ok(HumanDuration(Duration::from_secs(secs)))
                }

                fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Duration::try_from_secs_f64(v)
                        .map(HumanDuration)
                        .map_err(|_| E::custom("duration must be a non-negative, finite number"))
                }

                fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    let d = humantime::parse_duration(v.trim()).map_err(E::custom)?;
                    Ok(HumanDuration(d))
                }
            }

            deserializer.deserialize_any(V)
        }
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        use super::HumanDuration;

        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<HumanDuration>::deserialize(deserializer)?.map(|d| d.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thresholds::ThresholdAgg;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn yaml_ramping_options_parse() {
        let raw = r#"
scenario: checkout
startVUs: 2
stages:
  - duration: 30s
    target: 10
  - duration: 1m
    target: 50
    mode: hold
  - duration: 5
    target: 0
thresholds:
  http_req_duration: "p(95) < 800ms"
  "group_duration{group:::01_login}":
    - avg < 200
    - threshold: "p99 < 1s"
      abortOnFail: true
      delayAbortEval: 10s
control_tick: 500ms
metrics:
  cart_size: trend
tags:
  env: staging
"#;
        let opts = RunOptions::from_yaml_str(raw).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(opts.start_vus, Some(2));
        assert_eq!(opts.stages[0], Stage::new(secs(30), 10));
        assert_eq!(opts.stages[1], Stage::hold(secs(60), 50));
        assert_eq!(opts.stages[2].duration, secs(5));
        assert_eq!(opts.metrics.get("cart_size"), Some(&MetricKind::Trend));

        let plan = opts.validate().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(plan.scenario, "checkout");
        assert_eq!(plan.tags, vec![("env".to_string(), "staging".to_string())]);
        assert_eq!(plan.control_tick, Duration::from_millis(500));
        assert_eq!(plan.threshold_interval, secs(1));
        assert_eq!(plan.executor.max_vus(), 50);
        assert_eq!(plan.executor.planned_duration(), Some(secs(95)));

        let Executor::RampingVus { start_vus, stages } = &plan.executor else {
            panic!("expected ramping executor");
        };
        assert_eq!(*start_vus, 2);
        assert_eq!(stages[0].mode, Some(StageMode::Ramp));
        assert_eq!(stages[1].mode, Some(StageMode::Hold));

        assert_eq!(plan.thresholds.len(), 3);
        let abort = plan
            .thresholds
            .iter()
            .find(|t| t.abort_on_fail)
            .unwrap_or_else(|| panic!("abort threshold missing"));
        assert_eq!(abort.selector.tags[0].1, "::01_login");
        assert_eq!(abort.expr.agg, ThresholdAgg::P(99.0));
        assert_eq!(abort.expr.value, 1000.0);
        assert_eq!(abort.delay_abort_eval, Some(secs(10)));
    }

    #[test]
    fn json_constant_options_parse() {
        let raw = r#"{"vus": 4, "duration": 2.5, "thresholds": {"checks": ["rate==1"]}}"#;
        let plan = RunOptions::from_json_str(raw)
            .and_then(|o| o.validate())
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(plan.scenario, "default");
        assert_eq!(
            plan.executor,
            Executor::ConstantVus {
                vus: 4,
                duration: Some(Duration::from_millis(2500)),
                iterations: None,
            }
        );
    }

    #[test]
    fn run_level_stage_mode_applies_to_unmarked_stages() {
        let plan = RunOptions::ramping(vec![Stage::new(secs(5), 3), Stage::ramp(secs(5), 0)])
            .with_stage_mode(StageMode::Hold)
            .validate()
            .unwrap_or_else(|e| panic!("{e}"));
        let Executor::RampingVus { stages, .. } = plan.executor else {
            panic!("expected ramping executor");
        };
        assert_eq!(stages[0].mode, Some(StageMode::Hold));
        assert_eq!(stages[1].mode, Some(StageMode::Ramp));
    }

    #[test]
    fn constant_defaults_to_one_iteration() {
        let plan = RunOptions::default()
            .validate()
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            plan.executor,
            Executor::ConstantVus {
                vus: 1,
                duration: None,
                iterations: Some(1),
            }
        );
        assert_eq!(plan.executor.planned_duration(), None);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let zero_stages = RunOptions::ramping(vec![Stage::new(Duration::ZERO, 5)]);
        assert!(matches!(zero_stages.validate(), Err(Error::InvalidStages)));

        let zero_targets = RunOptions::ramping(vec![Stage::new(secs(5), 0)]);
        assert!(matches!(zero_targets.validate(), Err(Error::InvalidVus)));

        let stages_with_iterations =
            RunOptions::ramping(vec![Stage::new(secs(5), 2)]).with_iterations(10);
        assert!(matches!(
            stages_with_iterations.validate(),
            Err(Error::InvalidIterations)
        ));

        let zero_vus = RunOptions::constant(0, secs(5));
        assert!(matches!(zero_vus.validate(), Err(Error::InvalidVus)));

        let zero_duration = RunOptions::constant(2, Duration::ZERO);
        assert!(matches!(
            zero_duration.validate(),
            Err(Error::InvalidDuration(_))
        ));

        let zero_tick = RunOptions::constant(1, secs(1)).with_control_tick(Duration::ZERO);
        assert!(matches!(
            zero_tick.validate(),
            Err(Error::InvalidInterval("control_tick"))
        ));

        let bad_threshold = RunOptions::constant(1, secs(1)).with_threshold("checks", "rate <");
        let err = bad_threshold
            .validate()
            .err()
            .unwrap_or_else(|| panic!("expected threshold error"));
        assert!(err.is_config());
        assert!(matches!(err, Error::InvalidThreshold { .. }));
    }

    #[test]
    fn unknown_fields_and_bad_durations_fail_to_parse() {
        assert!(RunOptions::from_yaml_str("vus: 1\nduraton: 5s\n").is_err());
        assert!(RunOptions::from_yaml_str("duration: -3\n").is_err());
        assert!(RunOptions::from_yaml_str("duration: soon\n").is_err());
    }

    #[test]
    fn from_path_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let json = dir.path().join("run.json");
        std::fs::write(&json, r#"{"vus": 2, "iterations": 7}"#).unwrap_or_else(|e| panic!("{e}"));
        let yaml = dir.path().join("run.yaml");
        std::fs::write(&yaml, "vus: 3\nduration: 1m\n").unwrap_or_else(|e| panic!("{e}"));

        let json = RunOptions::from_path(&json).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(json.iterations, Some(7));
        let yaml = RunOptions::from_path(&yaml).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(yaml.duration, Some(secs(60)));

        assert!(matches!(
            RunOptions::from_path(dir.path().join("missing.yaml")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn options_serialize_back_to_yaml() {
        let opts = RunOptions::ramping(vec![Stage::hold(secs(90), 5)]).with_threshold("checks", "rate==1");
        let yaml = serde_yaml::to_string(&opts).unwrap_or_else(|e| panic!("{e}"));
        assert!(yaml.contains("1m 30s"));
        let back = RunOptions::from_yaml_str(&yaml).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(back, opts);
    }
}

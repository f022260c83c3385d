use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

/// Trend samples are stored as integers of `1 / TREND_SCALE` units.
const TREND_SCALE: f64 = 1000.0;
const TREND_SIGFIG: u8 = 3;
/// 24h expressed in scaled milliseconds; larger samples saturate into the top bucket.
const TREND_MAX_SCALED: u64 = 86_400_000 * 1000;

/// Worst-case relative error of a reported trend percentile (3 significant digits).
///
/// On top of this, values are quantized to `0.001` of the sample unit. `min`, `max`, `avg`
/// and `count` are exact.
pub const TREND_RELATIVE_ERROR: f64 = 0.001;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendSummary {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricValue {
    Counter { value: u64 },
    Gauge { value: i64 },
    Rate { total: u64, trues: u64, rate: f64 },
    Trend(TrendSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeriesSummary {
    pub name: String,
    pub kind: MetricKind,
    pub tags: Vec<(String, String)>,
    pub value: MetricValue,
}

/// Running distribution behind a trend series.
///
/// Percentiles come from an HDR histogram (bounded relative error, see
/// [`TREND_RELATIVE_ERROR`]) and are clamped into the exact `[min, max]` range so the
/// reported order statistics are always monotonic.
#[derive(Debug, Clone)]
pub struct TrendState {
    hist: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for TrendState {
    fn default() -> Self {
        Self::new()
    }
}

impl TrendState {
    pub fn new() -> Self {
        let hist = match Histogram::<u64>::new_with_bounds(1, TREND_MAX_SCALED, TREND_SIGFIG) {
            Ok(h) => h,
            Err(err) => panic!("failed to create trend histogram: {err}"),
        };
        Self {
            hist,
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    /// Records one sample. Negative and non-finite values are rejected.
    pub fn record(&mut self, value: f64) -> bool {
        if !value.is_finite() || value < 0.0 {
            return false;
        }

        let scaled = (value * TREND_SCALE).round() as u64;
        self.hist.saturating_record(scaled.max(1));

        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        true
    }

    pub fn merge(&mut self, other: &TrendState) {
        if other.count == 0 {
            return;
        }
        // Both sides share the same bounds, so addition cannot go out of range.
        let _ = self.hist.add(&other.hist);
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.sum += other.sum;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.sum / self.count as f64).clamp(self.min, self.max))
    }

    /// `p` is a percentage in `0..=100`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        let raw = self.hist.value_at_quantile(q) as f64 / TREND_SCALE;
        Some(raw.clamp(self.min, self.max))
    }

    pub fn summary(&self) -> TrendSummary {
        TrendSummary {
            count: self.count,
            min: self.min(),
            max: self.max(),
            avg: self.avg(),
            p50: self.percentile(50.0),
            p75: self.percentile(75.0),
            p90: self.percentile(90.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }
}

/// Sample and true counts under one lock, so readers always see a matching pair.
#[derive(Debug, Default)]
pub struct RateCell {
    counts: Mutex<(u64, u64)>,
}

impl RateCell {
    fn add(&self, value: bool) {
        let mut counts = self.counts.lock();
        counts.0 += 1;
        counts.1 += u64::from(value);
    }

    /// Returns `(total, trues)`.
    pub fn load(&self) -> (u64, u64) {
        *self.counts.lock()
    }
}

pub(crate) fn rate_value(total: u64, trues: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        trues as f64 / total as f64
    }
}

#[derive(Debug)]
pub(crate) enum MetricStorage {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<AtomicI64>),
    Rate(Arc<RateCell>),
    Trend(Arc<Mutex<TrendState>>),
}

impl MetricStorage {
    pub(crate) fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(Arc::new(AtomicU64::new(0))),
            MetricKind::Gauge => Self::Gauge(Arc::new(AtomicI64::new(0))),
            MetricKind::Rate => Self::Rate(Arc::new(RateCell::default())),
            MetricKind::Trend => Self::Trend(Arc::new(Mutex::new(TrendState::new()))),
        }
    }

    pub(crate) fn handle(&self) -> MetricHandle {
        match self {
            Self::Counter(c) => MetricHandle::Counter(c.clone()),
            Self::Gauge(g) => MetricHandle::Gauge(g.clone()),
            Self::Rate(r) => MetricHandle::Rate(r.clone()),
            Self::Trend(t) => MetricHandle::Trend(t.clone()),
        }
    }
}

/// Cheap, cloneable write handle to one series.
///
/// Writes that do not match the series kind are ignored.
#[derive(Debug, Clone)]
pub enum MetricHandle {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<AtomicI64>),
    Rate(Arc<RateCell>),
    Trend(Arc<Mutex<TrendState>>),
}

impl MetricHandle {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    #[inline]
    pub fn increment(&self, value: u64) {
        if let Self::Counter(c) = self {
            c.fetch_add(value, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn set_gauge(&self, value: i64) {
        if let Self::Gauge(g) = self {
            g.store(value, Ordering::Relaxed);
        }
    }

    /// Raises the gauge to `value` if it is currently lower.
    #[inline]
    pub fn max_gauge(&self, value: i64) {
        if let Self::Gauge(g) = self {
            g.fetch_max(value, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn add_rate(&self, value: bool) {
        if let Self::Rate(r) = self {
            r.add(value);
        }
    }

    #[inline]
    pub fn observe(&self, value: f64) {
        if let Self::Trend(t) = self {
            t.lock().record(value);
        }
    }

    pub fn value(&self) -> MetricValue {
        match self {
            Self::Counter(c) => MetricValue::Counter {
                value: c.load(Ordering::Relaxed),
            },
            Self::Gauge(g) => MetricValue::Gauge {
                value: g.load(Ordering::Relaxed),
            },
            Self::Rate(r) => {
                let (total, trues) = r.load();
                MetricValue::Rate {
                    total,
                    trues,
                    rate: rate_value(total, trues),
                }
            }
            Self::Trend(t) => MetricValue::Trend(t.lock().summary()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_trend_has_no_stats() {
        let s = TrendState::new().summary();
        assert_eq!(s.count, 0);
        assert!(s.p50.is_none());
        assert!(s.min.is_none());
        assert!(s.avg.is_none());
    }

    #[test]
    fn trend_rejects_negative_and_non_finite() {
        let mut t = TrendState::new();
        assert!(!t.record(f64::NAN));
        assert!(!t.record(f64::INFINITY));
        assert!(!t.record(-1.0));
        assert!(t.record(0.0));
        assert!(t.record(2.0));

        assert_eq!(t.count(), 2);
        assert_eq!(t.min(), Some(0.0));
        assert_eq!(t.max(), Some(2.0));
        assert_eq!(t.avg(), Some(1.0));
    }

    #[test]
    fn trend_percentiles_are_ordered_and_within_bound() {
        let mut t = TrendState::new();
        for i in 1..=10_000u32 {
            t.record(f64::from(i) * 0.37);
        }
        let s = t.summary();
        let (min, max) = (s.min.unwrap_or_default(), s.max.unwrap_or_default());
        let ps = [s.p50, s.p75, s.p90, s.p95, s.p99].map(Option::unwrap_or_default);

        assert!(min <= ps[0]);
        for w in ps.windows(2) {
            assert!(w[0] <= w[1], "{ps:?}");
        }
        assert!(ps[4] <= max);

        let avg = s.avg.unwrap_or_default();
        assert!(min <= avg && avg <= max);

        // exact p95 of 1..=10000 scaled by 0.37 is 9500 * 0.37
        let exact = 9500.0 * 0.37;
        let got = ps[3];
        assert!(
            (got - exact).abs() <= exact * TREND_RELATIVE_ERROR + 0.37 + 0.001,
            "p95 {got} vs {exact}"
        );
    }

    #[test]
    fn identical_samples_keep_avg_inside_range() {
        let mut t = TrendState::new();
        for _ in 0..3 {
            t.record(0.1);
        }
        let s = t.summary();
        assert_eq!(s.min, Some(0.1));
        assert_eq!(s.max, Some(0.1));
        assert_eq!(s.avg, Some(0.1));
        assert_eq!(s.p99, Some(0.1));
    }

    #[test]
    fn merge_combines_exact_stats() {
        let mut a = TrendState::new();
        a.record(10.0);
        let mut b = TrendState::new();
        b.record(30.0);
        b.record(20.0);

        a.merge(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(a.min(), Some(10.0));
        assert_eq!(a.max(), Some(30.0));
        assert_eq!(a.avg(), Some(20.0));
    }

    #[test]
    fn rate_value_is_zero_without_samples() {
        let h = MetricHandle::Rate(Arc::new(RateCell::default()));
        assert_eq!(
            h.value(),
            MetricValue::Rate {
                total: 0,
                trues: 0,
                rate: 0.0
            }
        );

        h.add_rate(true);
        h.add_rate(false);
        h.add_rate(true);
        h.add_rate(true);
        let MetricValue::Rate { total, trues, rate } = h.value() else {
            panic!("expected rate value");
        };
        assert_eq!((total, trues), (4, 3));
        assert_eq!(rate, 0.75);
    }

    #[test]
    fn rate_snapshots_stay_consistent_under_concurrent_writers() {
        let h = MetricHandle::Rate(Arc::new(RateCell::default()));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let h = h.clone();
                s.spawn(move || {
                    for _ in 0..10_000 {
                        h.add_rate(true);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..10_000 {
                    let MetricValue::Rate { total, trues, .. } = h.value() else {
                        panic!("expected rate value");
                    };
                    assert_eq!(total, trues, "torn rate snapshot");
                }
            });
        });

        let MetricValue::Rate { total, trues, rate } = h.value() else {
            panic!("expected rate value");
        };
        assert_eq!((total, trues), (40_000, 40_000));
        assert_eq!(rate, 1.0);
    }

    #[test]
    fn handle_ignores_writes_of_other_kinds() {
        let c = MetricStorage::new(MetricKind::Counter).handle();
        c.add_rate(true);
        c.observe(1.0);
        c.set_gauge(5);
        c.increment(2);
        assert_eq!(c.value(), MetricValue::Counter { value: 2 });

        let g = MetricStorage::new(MetricKind::Gauge).handle();
        g.set_gauge(3);
        g.max_gauge(2);
        assert_eq!(g.value(), MetricValue::Gauge { value: 3 });
        g.max_gauge(7);
        assert_eq!(g.value(), MetricValue::Gauge { value: 7 });
    }

    #[test]
    fn metric_kind_parses_case_insensitively() {
        assert_eq!("trend".parse::<MetricKind>().ok(), Some(MetricKind::Trend));
        assert_eq!("Rate".parse::<MetricKind>().ok(), Some(MetricKind::Rate));
        assert_eq!(MetricKind::Counter.to_string(), "counter");
    }
}

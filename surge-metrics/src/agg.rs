use std::sync::atomic::Ordering;

use smallvec::SmallVec;

use crate::key::KeyId;
use crate::metrics::{MetricStorage, TrendState, rate_value};
use crate::registry::{MetricId, Registry};
use crate::tags::TagSet;

#[derive(Debug, Clone)]
enum TagFilter {
    Eq(KeyId, KeyId),
    Untagged,
}

impl TagFilter {
    fn matches(&self, tags: &TagSet) -> bool {
        match self {
            TagFilter::Eq(k, v) => tags.get(*k) == Some(*v),
            TagFilter::Untagged => tags.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateTotals {
    pub total: u64,
    pub trues: u64,
}

impl RateTotals {
    pub fn rate(self) -> f64 {
        rate_value(self.total, self.trues)
    }
}

/// Tag-filtered view over the series of one metric.
#[derive(Debug, Clone)]
pub struct Query<'a> {
    registry: &'a Registry,
    metric: MetricId,
    filters: SmallVec<[TagFilter; 4]>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(registry: &'a Registry, metric: MetricId) -> Self {
        Self {
            registry,
            metric,
            filters: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn where_eq(mut self, key: KeyId, value: KeyId) -> Self {
        self.filters.push(TagFilter::Eq(key, value));
        self
    }

    /// Only the base series (no tags at all).
    #[must_use]
    pub fn untagged(mut self) -> Self {
        self.filters.push(TagFilter::Untagged);
        self
    }

    fn matches(&self, tags: &TagSet) -> bool {
        self.filters.iter().all(|f| f.matches(tags))
    }

    /// Number of series the filters select.
    pub fn series_count(&self) -> usize {
        let mut n = 0;
        self.registry.visit_series(self.metric, |tags, _| {
            if self.matches(tags) {
                n += 1;
            }
        });
        n
    }

    pub fn sum_counter_total(self) -> u64 {
        let mut out = 0u64;
        self.registry.visit_series(self.metric, |tags, storage| {
            if !self.matches(tags) {
                return;
            }
            if let MetricStorage::Counter(c) = storage {
                out = out.saturating_add(c.load(Ordering::Relaxed));
            }
        });
        out
    }

    /// Last value of the first matching gauge series.
    pub fn gauge(self) -> Option<i64> {
        let mut out = None;
        self.registry.visit_series(self.metric, |tags, storage| {
            if out.is_some() || !self.matches(tags) {
                return;
            }
            if let MetricStorage::Gauge(g) = storage {
                out = Some(g.load(Ordering::Relaxed));
            }
        });
        out
    }

    pub fn sum_rate(self) -> RateTotals {
        let mut out = RateTotals::default();
        self.registry.visit_series(self.metric, |tags, storage| {
            if !self.matches(tags) {
                return;
            }
            if let MetricStorage::Rate(r) = storage {
                let (total, trues) = r.load();
                out.total = out.total.saturating_add(total);
                out.trues = out.trues.saturating_add(trues);
            }
        });
        out
    }

    /// Merges every matching trend series; `None` when nothing matched.
    pub fn merge_trend(self) -> Option<TrendState> {
        let mut merged: Option<TrendState> = None;
        self.registry.visit_series(self.metric, |tags, storage| {
            if !self.matches(tags) {
                return;
            }
            if let MetricStorage::Trend(t) = storage {
                merged.get_or_insert_with(TrendState::new).merge(&t.lock());
            }
        });
        merged
    }
}

#[cfg(test)]
mod tests {
    use crate::metrics::MetricKind;
    use crate::registry::Registry;

    fn reg_with_requests() -> Registry {
        let reg = Registry::default();
        for (tags, n) in [
            (vec![("status", "200"), ("group", "::login")], 10),
            (vec![("status", "500"), ("group", "::login")], 3),
            (vec![("status", "200")], 5),
        ] {
            reg.handle("http_reqs", MetricKind::Counter, &tags)
                .unwrap_or_else(|e| panic!("{e}"))
                .increment(n);
        }
        reg
    }

    #[test]
    fn query_filters_by_tag_value_and_base_series() {
        let reg = reg_with_requests();
        let metric = reg
            .lookup_metric("http_reqs")
            .unwrap_or_else(|| panic!("missing metric"));
        let status = reg.resolve_key("status");
        let group = reg.resolve_key("group");
        let ok = reg.resolve_key("200");
        let login = reg.resolve_key("::login");

        assert_eq!(reg.query(metric).sum_counter_total(), 18);
        assert_eq!(reg.query(metric).series_count(), 3);

        let only_ok_login = reg
            .query(metric)
            .where_eq(group, login)
            .where_eq(status, ok)
            .sum_counter_total();
        assert_eq!(only_ok_login, 10);
        assert_eq!(reg.query(metric).where_eq(group, login).series_count(), 2);
        assert_eq!(reg.query(metric).where_eq(status, ok).sum_counter_total(), 15);
        assert_eq!(reg.query(metric).untagged().series_count(), 0);
    }

    #[test]
    fn sum_rate_adds_totals_across_series() {
        let reg = Registry::default();
        let a = reg
            .handle("checks", MetricKind::Rate, &[("check", "a")])
            .unwrap_or_else(|e| panic!("{e}"));
        let b = reg
            .handle("checks", MetricKind::Rate, &[("check", "b")])
            .unwrap_or_else(|e| panic!("{e}"));
        a.add_rate(true);
        a.add_rate(true);
        b.add_rate(false);
        b.add_rate(true);

        let metric = reg
            .lookup_metric("checks")
            .unwrap_or_else(|| panic!("missing metric"));
        let totals = reg.query(metric).sum_rate();
        assert_eq!((totals.total, totals.trues), (4, 3));
        assert_eq!(totals.rate(), 0.75);

        let check = reg.resolve_key("check");
        let b_key = reg.resolve_key("b");
        assert_eq!(reg.query(metric).where_eq(check, b_key).sum_rate().rate(), 0.5);
    }

    #[test]
    fn merge_trend_combines_matching_series() {
        let reg = Registry::default();
        let overall = reg
            .handle("http_req_duration", MetricKind::Trend, &[])
            .unwrap_or_else(|e| panic!("{e}"));
        let tagged = reg
            .handle("http_req_duration", MetricKind::Trend, &[("status", "200")])
            .unwrap_or_else(|e| panic!("{e}"));
        overall.observe(10.0);
        overall.observe(20.0);
        tagged.observe(999.0);

        let metric = reg
            .lookup_metric("http_req_duration")
            .unwrap_or_else(|| panic!("missing metric"));
        let status = reg.resolve_key("status");

        let base = reg
            .query(metric)
            .untagged()
            .merge_trend()
            .unwrap_or_else(|| panic!("expected trend"));
        assert_eq!(base.count(), 2);
        assert_eq!(base.max(), Some(20.0));

        let all = reg
            .query(metric)
            .merge_trend()
            .unwrap_or_else(|| panic!("expected trend"));
        assert_eq!(all.count(), 3);

        let none = reg
            .query(metric)
            .where_eq(status, reg.resolve_key("404"))
            .merge_trend();
        assert!(none.is_none());
    }

    #[test]
    fn gauge_reads_last_value() {
        let reg = Registry::default();
        let vus = reg
            .handle("vus", MetricKind::Gauge, &[])
            .unwrap_or_else(|e| panic!("{e}"));
        vus.set_gauge(4);
        vus.set_gauge(2);
        let metric = reg
            .lookup_metric("vus")
            .unwrap_or_else(|| panic!("missing metric"));
        assert_eq!(reg.query(metric).gauge(), Some(2));
    }
}

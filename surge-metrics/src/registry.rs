use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;

use crate::agg::Query;
use crate::error::{Error, Result};
use crate::key::{Interner, KeyId};
use crate::metrics::{MetricHandle, MetricKind, MetricSeriesSummary, MetricStorage};
use crate::tags::TagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId(u32);

#[derive(Debug)]
struct MetricDef {
    name: KeyId,
    kind: MetricKind,
    series: DashMap<TagSet, MetricStorage, ahash::RandomState>,
}

/// Process-wide store of named metrics and their tagged series.
///
/// Metrics and series are created on first use and never removed. A metric keeps the
/// kind it was first registered with.
#[derive(Debug, Default)]
pub struct Registry {
    interner: Interner,
    by_name: DashMap<KeyId, MetricId, ahash::RandomState>,
    defs: RwLock<Vec<Arc<MetricDef>>>,
}

impl Registry {
    /// Registers `name` with `kind`, or returns the existing id if it is already known with
    /// the same kind.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<MetricId> {
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        let name_id = self.interner.get_or_intern(name);

        match self.by_name.entry(name_id) {
            Entry::Occupied(e) => {
                let id = *e.get();
                let existing = self.kind_of(id).ok_or(Error::UnknownMetric)?;
                if existing != kind {
                    return Err(Error::KindMismatch {
                        name: name.to_string(),
                        existing,
                        requested: kind,
                    });
                }
                Ok(id)
            }
            Entry::Vacant(e) => {
                let mut defs = self.defs.write();
                let id = MetricId(u32::try_from(defs.len()).unwrap_or(u32::MAX));
                defs.push(Arc::new(MetricDef {
                    name: name_id,
                    kind,
                    series: DashMap::default(),
                }));
                e.insert(id);
                Ok(id)
            }
        }
    }

    pub fn lookup_metric(&self, name: &str) -> Option<MetricId> {
        let key = self.interner.lookup(name)?;
        self.by_name.get(&key).map(|id| *id)
    }

    pub fn kind_of(&self, metric: MetricId) -> Option<MetricKind> {
        self.def(metric).map(|d| d.kind)
    }

    pub fn resolve_key(&self, key: &str) -> KeyId {
        self.interner.get_or_intern(key)
    }

    /// Like [`Registry::resolve_key`] but never interns; `None` means no series can use it.
    pub fn lookup_key(&self, key: &str) -> Option<KeyId> {
        self.interner.lookup(key)
    }

    pub fn resolve_tags(&self, tags: &[(&str, &str)]) -> TagSet {
        let mut resolved: Vec<(KeyId, KeyId)> = tags
            .iter()
            .map(|(k, v)| (self.resolve_key(k), self.resolve_key(v)))
            .collect();
        resolved.sort_unstable();
        resolved.dedup_by_key(|(k, _)| *k);
        TagSet::from_sorted_iter(resolved)
    }

    /// Returns the handle for `(metric, tags)`, creating the series if absent.
    pub fn get_handle(&self, metric: MetricId, tags: TagSet) -> Option<MetricHandle> {
        let def = self.def(metric)?;
        if let Some(storage) = def.series.get(&tags) {
            return Some(storage.handle());
        }

        let kind = def.kind;
        let storage = def
            .series
            .entry(tags)
            .or_insert_with(|| MetricStorage::new(kind));
        Some(storage.handle())
    }

    /// Registers (or reuses) `name` and returns the handle for the given tags.
    pub fn handle(
        &self,
        name: &str,
        kind: MetricKind,
        tags: &[(&str, &str)],
    ) -> Result<MetricHandle> {
        let metric = self.register(name, kind)?;
        let tags = self.resolve_tags(tags);
        self.get_handle(metric, tags).ok_or(Error::UnknownMetric)
    }

    pub fn query(&self, metric: MetricId) -> Query<'_> {
        Query::new(self, metric)
    }

    pub(crate) fn visit_series(
        &self,
        metric: MetricId,
        mut f: impl FnMut(&TagSet, &MetricStorage),
    ) {
        let Some(def) = self.def(metric) else {
            return;
        };
        for series in def.series.iter() {
            f(series.key(), series.value());
        }
    }

    /// Snapshot of every series, sorted by metric name then tags.
    pub fn summarize(&self) -> Vec<MetricSeriesSummary> {
        let defs: Vec<Arc<MetricDef>> = self.defs.read().clone();
        let mut out = Vec::new();

        for def in defs {
            let name = self
                .interner
                .resolve(def.name)
                .map(|s| s.to_string())
                .unwrap_or_default();

            for series in def.series.iter() {
                let tags: Vec<(String, String)> = series
                    .key()
                    .iter()
                    .map(|(k, v)| (self.resolve_string(k), self.resolve_string(v)))
                    .collect();

                out.push(MetricSeriesSummary {
                    name: name.clone(),
                    kind: def.kind,
                    tags,
                    value: series.value().handle().value(),
                });
            }
        }

        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        out
    }

    fn resolve_string(&self, id: KeyId) -> String {
        self.interner
            .resolve(id)
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    fn def(&self, metric: MetricId) -> Option<Arc<MetricDef>> {
        self.defs.read().get(metric.0 as usize).cloned()
    }
}

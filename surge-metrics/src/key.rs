use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;

/// Interned string id. Metric names, tag keys and tag values all share one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u32);

impl From<u32> for KeyId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<KeyId> for u32 {
    fn from(v: KeyId) -> Self {
        v.0
    }
}

#[derive(Debug, Default)]
pub(crate) struct Interner {
    ids: DashMap<Arc<str>, KeyId, ahash::RandomState>,
    strings: RwLock<Vec<Arc<str>>>,
}

impl Interner {
    pub(crate) fn get_or_intern(&self, s: &str) -> KeyId {
        if let Some(id) = self.ids.get(s) {
            return *id;
        }

        // The entry keeps the shard locked, so racing callers agree on a single id.
        match self.ids.entry(Arc::from(s)) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                let mut strings = self.strings.write();
                let id = KeyId(u32::try_from(strings.len()).unwrap_or(u32::MAX));
                strings.push(e.key().clone());
                e.insert(id);
                id
            }
        }
    }

    pub(crate) fn lookup(&self, s: &str) -> Option<KeyId> {
        self.ids.get(s).map(|id| *id)
    }

    pub(crate) fn resolve(&self, id: KeyId) -> Option<Arc<str>> {
        self.strings.read().get(id.0 as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable_and_reversible() {
        let interner = Interner::default();
        let a = interner.get_or_intern("group");
        let b = interner.get_or_intern("check");
        assert_ne!(a, b);
        assert_eq!(interner.get_or_intern("group"), a);
        assert_eq!(interner.lookup("check"), Some(b));
        assert_eq!(interner.lookup("missing"), None);
        assert_eq!(interner.resolve(a).as_deref(), Some("group"));
    }

    #[test]
    fn concurrent_interning_agrees_on_ids() {
        let interner = Arc::new(Interner::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let interner = interner.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| interner.get_or_intern(&format!("k{i}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<KeyId>> = handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| panic!("interner thread panicked")))
            .collect();
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
    }
}

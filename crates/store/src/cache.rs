use std::sync::{Arc, Mutex};

use metrics::gauge;
use rustc_hash::FxHashMap;

use vellum_core::{ObjRef, StoredObject};

/// Objects by id. Cleared wholesale once full; entries are removed on
/// every write to their id. Permission is checked by the caller on every
/// hit since entries are keyed by id only.
///
/// Every invalidation bumps an epoch. A load inserts only if the epoch it
/// took before fetching is still current, so a revision read before a
/// write commits never lands in the cache after it.
pub(crate) struct ObjectCache {
    inner: Mutex<Inner>,
    max: usize,
}

#[derive(Default)]
struct Inner {
    map: FxHashMap<ObjRef, Arc<StoredObject>>,
    epoch: u64,
}

impl ObjectCache {
    pub fn new(max: usize) -> Self {
        Self { inner: Mutex::new(Inner::default()), max }
    }

    pub fn get(&self, objref: ObjRef) -> Option<Arc<StoredObject>> {
        self.inner.lock().ok()?.map.get(&objref).cloned()
    }

    /// Take before reading from the database; pass to
    /// [`insert`](Self::insert).
    pub fn epoch(&self) -> u64 {
        self.inner.lock().map(|i| i.epoch).unwrap_or(u64::MAX)
    }

    /// Insert `obj` unless anything was invalidated since `epoch` was
    /// taken. Returns whether it was inserted.
    pub fn insert(&self, obj: Arc<StoredObject>, epoch: u64) -> bool {
        let (Some(objref), Ok(mut inner)) = (obj.objref, self.inner.lock()) else {
            return false;
        };
        if inner.epoch != epoch {
            return false;
        }
        if inner.map.len() >= self.max {
            inner.map.clear();
        }
        inner.map.insert(objref, obj);
        gauge!("store_cache_entries", inner.map.len() as f64);
        true
    }

    pub fn invalidate(&self, objref: ObjRef) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.epoch = inner.epoch.wrapping_add(1);
            inner.map.remove(&objref);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.map.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(id: i64) -> Arc<StoredObject> {
        let mut o = StoredObject::new();
        o.objref = Some(ObjRef(id));
        Arc::new(o)
    }

    #[test]
    fn clears_when_full() {
        let c = ObjectCache::new(2);
        c.insert(obj(1), c.epoch());
        c.insert(obj(2), c.epoch());
        assert_eq!(c.len(), 2);
        c.insert(obj(3), c.epoch());
        assert_eq!(c.len(), 1);
        assert!(c.get(ObjRef(3)).is_some());
        c.invalidate(ObjRef(3));
        assert!(c.get(ObjRef(3)).is_none());
    }

    #[test]
    fn loads_from_before_an_invalidation_are_dropped() {
        let c = ObjectCache::new(8);
        let seen = c.epoch();
        c.invalidate(ObjRef(4));
        assert!(!c.insert(obj(4), seen));
        assert!(c.get(ObjRef(4)).is_none());
        assert!(c.insert(obj(4), c.epoch()));
        assert!(c.get(ObjRef(4)).is_some());
    }
}

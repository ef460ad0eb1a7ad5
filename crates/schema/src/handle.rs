use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::debug;

use crate::Schema;

/// Per-application schema slot.
///
/// Readers take an `Arc<Schema>` and keep it for the whole unit of work.
/// Invalidation drops the published schema and bumps the generation; the
/// next reader loads a fresh one. A load that raced with an invalidation is
/// returned to its caller but never published.
#[derive(Default)]
pub struct SchemaHandle {
    current: ArcSwapOption<Schema>,
    generation: AtomicU64,
}

impl SchemaHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn get_or_load<E, F>(&self, load: F) -> Result<Arc<Schema>, E>
    where
        F: FnOnce(u64) -> Result<Schema, E>,
    {
        if let Some(s) = self.current.load_full() {
            return Ok(s);
        }
        let gen = self.generation();
        let schema = Arc::new(load(gen)?);
        if self.generation() == gen {
            self.current.store(Some(schema.clone()));
            debug!(generation = gen, "schema published");
        }
        Ok(schema)
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.current.store(None);
    }

    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_forces_reload() {
        let h = SchemaHandle::new();
        let s1 = h.get_or_load::<(), _>(|g| Ok(Schema::empty(g))).unwrap();
        let s2 = h.get_or_load::<(), _>(|_| panic!("should be cached")).unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        h.invalidate();
        assert!(!h.is_loaded());
        let s3 = h.get_or_load::<(), _>(|g| Ok(Schema::empty(g))).unwrap();
        assert_eq!(s3.generation(), 1);
        assert_eq!(s1.generation(), 0);
    }
}

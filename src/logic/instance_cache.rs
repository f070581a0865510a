use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::instance::InstanceRef;

/// Identity map from DB_ID to the one live instance object. No eviction.
#[derive(Default)]
pub struct InstanceCache {
    instances: RwLock<HashMap<i64, InstanceRef>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, db_id: i64) -> Option<InstanceRef> {
        self.instances.read().get(&db_id).cloned()
    }

    /// Insert under the instance's DB_ID; instances without one are ignored.
    pub fn put(&self, instance: InstanceRef) {
        if let Some(id) = instance.db_id() {
            self.instances.write().insert(id, instance);
        }
    }

    /// Return the cached instance, or insert the one `make` builds.
    /// Concurrent callers for the same id all receive the same object.
    pub fn get_or_insert_with(
        &self,
        db_id: i64,
        make: impl FnOnce() -> InstanceRef,
    ) -> InstanceRef {
        if let Some(found) = self.get(db_id) {
            return found;
        }
        self.instances.write().entry(db_id).or_insert_with(make).clone()
    }

    pub fn remove(&self, db_id: i64) -> Option<InstanceRef> {
        self.instances.write().remove(&db_id)
    }

    pub fn contains_key(&self, db_id: i64) -> bool {
        self.instances.read().contains_key(&db_id)
    }

    pub fn clear(&self) {
        self.instances.write().clear();
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::instance::Instance;
    use crate::model::schema::InstanceKind;
    use std::sync::Arc;

    #[test]
    fn test_get_or_insert_keeps_first_object() {
        let cache = InstanceCache::new();
        let pathway = || Instance::new(InstanceKind::Generic, "Pathway", Some(7));
        let first = cache.get_or_insert_with(7, pathway);
        let second = cache.get_or_insert_with(7, pathway);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_ignores_unsaved_instances() {
        let cache = InstanceCache::new();
        cache.put(Instance::new(InstanceKind::Generic, "Pathway", None));
        assert!(cache.is_empty());
        cache.put(Instance::new(InstanceKind::Generic, "Pathway", Some(1)));
        assert!(cache.contains_key(1));
        assert!(cache.remove(1).is_some());
        assert!(!cache.contains_key(1));
    }

    #[test]
    fn test_concurrent_materialization_yields_one_object() {
        let cache = Arc::new(InstanceCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache.get_or_insert_with(42, || {
                        Instance::new(InstanceKind::Generic, "Reaction", Some(42))
                    })
                })
            })
            .collect();
        let objects: Vec<InstanceRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(objects.iter().all(|o| Arc::ptr_eq(o, &objects[0])));
    }
}

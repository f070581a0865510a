use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::cypher::ValueShape;
use crate::store::Row;

/// One cached attribute value; `target_class` is set for instance values.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    pub target_class: Option<String>,
}

/// Source DB_ID to its ordered values, for one (class, attribute).
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    rows: HashMap<i64, Vec<CachedValue>>,
}

impl AttributeTable {
    /// Null values are skipped; list values are split into their elements.
    pub fn add_value(&mut self, db_id: i64, value: Value, target_class: Option<String>) {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    self.add_value(db_id, item, target_class.clone());
                }
            }
            value => self.rows.entry(db_id).or_default().push(CachedValue { value, target_class }),
        }
    }

    /// Build from bulk rows of the given shape. Multi-valued instance rows
    /// are ordered by `order` and repeated `stoichiometry` times.
    pub fn from_rows(shape: &ValueShape, rows: Vec<Row>) -> Self {
        let mut table = Self::default();
        match shape {
            ValueShape::Primitive => {
                for row in rows {
                    if let [id, value, ..] = row.as_slice() {
                        if let Some(id) = id.as_i64() {
                            table.add_value(id, value.clone(), None);
                        }
                    }
                }
            }
            ValueShape::Instance { multiple: false, .. } => {
                for row in rows {
                    if let [id, target, class, ..] = row.as_slice() {
                        if let Some(id) = id.as_i64() {
                            table.add_value(id, target.clone(), class.as_str().map(str::to_string));
                        }
                    }
                }
            }
            ValueShape::Instance { multiple: true, .. } => {
                let mut sorted: Vec<(i64, i64, Row)> = rows
                    .into_iter()
                    .filter_map(|row| {
                        let id = row.first()?.as_i64()?;
                        let order = row.get(3).and_then(Value::as_i64).unwrap_or(0);
                        Some((id, order, row))
                    })
                    .collect();
                sorted.sort_by_key(|(id, order, _)| (*id, *order));
                for (id, _, row) in sorted {
                    let stoichiometry = row.get(4).and_then(Value::as_i64).unwrap_or(1).max(1);
                    let class = row.get(2).and_then(Value::as_str).map(str::to_string);
                    let target = row.get(1).cloned().unwrap_or(Value::Null);
                    for _ in 0..stoichiometry {
                        table.add_value(id, target.clone(), class.clone());
                    }
                }
            }
        }
        table
    }

    pub fn values(&self, db_id: i64) -> Vec<CachedValue> {
        self.rows.get(&db_id).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

type Slot = Arc<OnceCell<Arc<AttributeTable>>>;

/// Bulk-loaded attribute values keyed by (class, attribute), populated once.
#[derive(Default)]
pub struct AttributeCache {
    entries: Mutex<HashMap<(String, String), Slot>>,
}

impl AttributeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder for the pair; idempotent, every caller gets the same one.
    pub fn mark_populating(&self, class: &str, attribute: &str) -> Slot {
        self.entries
            .lock()
            .entry((class.to_string(), attribute.to_string()))
            .or_default()
            .clone()
    }

    pub fn is_populated(&self, class: &str, attribute: &str) -> bool {
        self.entries
            .lock()
            .get(&(class.to_string(), attribute.to_string()))
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }

    /// Run `load` unless another caller already has; waiters share its result.
    /// A failed load leaves the placeholder empty for the next caller.
    pub async fn populate<F, Fut, E>(
        &self,
        class: &str,
        attribute: &str,
        load: F,
    ) -> Result<Arc<AttributeTable>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AttributeTable, E>>,
    {
        let slot = self.mark_populating(class, attribute);
        let table = slot.get_or_try_init(|| async move { load().await.map(Arc::new) }).await?;
        Ok(table.clone())
    }

    /// Values for one instance, or `None` when the pair is not populated.
    pub fn values_for(&self, class: &str, attribute: &str, db_id: i64) -> Option<Vec<CachedValue>> {
        let slot = self
            .entries
            .lock()
            .get(&(class.to_string(), attribute.to_string()))
            .cloned()?;
        slot.get().map(|table| table.values(db_id))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every entry keyed by one of `classes`.
    pub fn invalidate_classes(&self, classes: &HashSet<String>) {
        self.entries.lock().retain(|(class, _), _| !classes.contains(class));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::Direction;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_multi_valued_rows_sorted_and_expanded() {
        let shape = ValueShape::Instance {
            target_label: "PhysicalEntity".to_string(),
            direction: Direction::Outgoing,
            multiple: true,
        };
        let rows = vec![
            vec![json!(1), json!(20), json!("Complex"), json!(1), json!(1)],
            vec![json!(1), json!(10), json!("SimpleEntity"), json!(0), json!(2)],
        ];
        let table = AttributeTable::from_rows(&shape, rows);
        let ids: Vec<Value> = table.values(1).into_iter().map(|v| v.value).collect();
        assert_eq!(ids, vec![json!(10), json!(10), json!(20)]);
    }

    #[test]
    fn test_primitive_lists_split_and_nulls_skipped() {
        let rows = vec![
            vec![json!(1), json!(["a", "b"])],
            vec![json!(2), Value::Null],
        ];
        let table = AttributeTable::from_rows(&ValueShape::Primitive, rows);
        assert_eq!(table.values(1).len(), 2);
        assert!(table.values(2).is_empty());
    }

    #[tokio::test]
    async fn test_populate_runs_loader_once() {
        let cache = Arc::new(AttributeCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .populate("Pathway", "name", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        let mut table = AttributeTable::default();
                        table.add_value(1, json!("Apoptosis"), None);
                        Ok::<_, String>(table)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_populated("Pathway", "name"));
        assert_eq!(cache.values_for("Pathway", "name", 2), Some(vec![]));
    }

    #[tokio::test]
    async fn test_failed_population_can_be_retried() {
        let cache = AttributeCache::new();
        let failed = cache
            .populate("Pathway", "name", || async { Err::<AttributeTable, _>("boom") })
            .await;
        assert!(failed.is_err());
        assert!(!cache.is_populated("Pathway", "name"));
        let ok = cache
            .populate("Pathway", "name", || async { Ok::<_, &str>(AttributeTable::default()) })
            .await;
        assert!(ok.is_ok());
        assert!(cache.is_populated("Pathway", "name"));
    }

    #[test]
    fn test_invalidate_by_class() {
        let cache = AttributeCache::new();
        cache.mark_populating("Pathway", "name");
        cache.mark_populating("Reaction", "name");
        cache.invalidate_classes(&HashSet::from(["Pathway".to_string()]));
        assert!(cache.values_for("Pathway", "name", 1).is_none());
        assert_eq!(cache.entries.lock().len(), 1);
    }
}

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::cypher::{compile_instance_query, ReadQuery};
use crate::error::{AdaptorError, AdaptorResult};
use crate::logic::attribute_cache::AttributeCache;
use crate::logic::instance_cache::InstanceCache;
use crate::logic::write::RetryPolicy;
use crate::model::instance::{Instance, InstanceRef};
use crate::model::query::{Operator, QueryRequest, QueryValue};
use crate::model::schema::{Schema, SchemaAttribute};
use crate::store::{GraphStore, Row};

pub const DEFAULT_RESULT_CAP: usize = 100;

/// Runtime knobs of the adaptor.
#[derive(Debug, Clone)]
pub struct AdaptorSettings {
    pub use_instance_cache: bool,
    pub use_attribute_cache: bool,
    /// Upper bound on concurrent attribute population queries.
    pub worker_pool_size: usize,
    pub retry: RetryPolicy,
    pub result_cap: usize,
}

impl Default for AdaptorSettings {
    fn default() -> Self {
        Self {
            use_instance_cache: true,
            use_attribute_cache: true,
            worker_pool_size: 16,
            retry: RetryPolicy::default(),
            result_cap: DEFAULT_RESULT_CAP,
        }
    }
}

pub(crate) struct AdaptorInner {
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) database: String,
    schema: RwLock<Option<Arc<Schema>>>,
    pub(crate) instances: InstanceCache,
    pub(crate) attributes: AttributeCache,
    use_instance_cache: AtomicBool,
    use_attribute_cache: AtomicBool,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) retry: RetryPolicy,
    result_cap: usize,
}

/// Object/graph mapping layer over a [`GraphStore`].
///
/// Cheap to clone; clones share the caches, the schema and the store.
#[derive(Clone)]
pub struct GraphAdaptor {
    pub(crate) inner: Arc<AdaptorInner>,
}

impl GraphAdaptor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        database: impl Into<String>,
        settings: AdaptorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(AdaptorInner {
                store,
                database: database.into(),
                schema: RwLock::new(None),
                instances: InstanceCache::new(),
                attributes: AttributeCache::new(),
                use_instance_cache: AtomicBool::new(settings.use_instance_cache),
                use_attribute_cache: AtomicBool::new(settings.use_attribute_cache),
                workers: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
                retry: settings.retry,
                result_cap: settings.result_cap,
            }),
        }
    }

    pub fn with_schema(
        store: Arc<dyn GraphStore>,
        database: impl Into<String>,
        schema: Schema,
        settings: AdaptorSettings,
    ) -> Self {
        let adaptor = Self::new(store, database, settings);
        adaptor.set_schema(schema);
        adaptor
    }

    pub fn set_schema(&self, schema: Schema) {
        *self.inner.schema.write() = Some(Arc::new(schema));
    }

    pub fn schema(&self) -> AdaptorResult<Arc<Schema>> {
        self.inner.schema.read().clone().ok_or(AdaptorError::SchemaNotLoaded)
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn use_instance_cache(&self) -> bool {
        self.inner.use_instance_cache.load(Ordering::SeqCst)
    }

    pub fn set_use_instance_cache(&self, enabled: bool) {
        log::info!("instance cache {}", if enabled { "enabled" } else { "disabled" });
        self.inner.use_instance_cache.store(enabled, Ordering::SeqCst);
    }

    pub fn use_attribute_cache(&self) -> bool {
        self.inner.use_attribute_cache.load(Ordering::SeqCst)
    }

    pub fn set_use_attribute_cache(&self, enabled: bool) {
        self.inner.use_attribute_cache.store(enabled, Ordering::SeqCst);
    }

    pub fn instance_cache(&self) -> &InstanceCache {
        &self.inner.instances
    }

    pub fn attribute_cache(&self) -> &AttributeCache {
        &self.inner.attributes
    }

    pub fn result_cap(&self) -> usize {
        self.inner.result_cap
    }

    pub fn refresh_caches(&self) {
        self.inner.instances.clear();
        self.inner.attributes.clear();
        log::info!("instance and attribute caches cleared");
    }

    /// Drop caches and schema, then close the store.
    pub async fn cleanup(&self) -> AdaptorResult<()> {
        self.refresh_caches();
        *self.inner.schema.write() = None;
        self.inner.store.close().await?;
        Ok(())
    }

    pub(crate) async fn read(&self, query: &ReadQuery) -> AdaptorResult<Vec<Row>> {
        Ok(self.inner.store.query(&self.inner.database, query).await?)
    }

    /// The one live object for `db_id`. With the identity cache disabled a
    /// fresh object is returned, and installed only if none is cached yet.
    pub(crate) fn instance_for(
        &self,
        schema: &Schema,
        class_name: &str,
        db_id: i64,
    ) -> InstanceRef {
        let make = || Instance::new(schema.instance_kind(class_name), class_name, Some(db_id));
        if self.use_instance_cache() {
            return self.inner.instances.get_or_insert_with(db_id, make);
        }
        let fresh = make();
        self.inner.instances.get_or_insert_with(db_id, || fresh.clone());
        fresh
    }

    /// Rows of `(dbId, displayName, schemaClass)` to instances.
    fn materialize(
        &self,
        schema: &Schema,
        fallback_class: &str,
        rows: Vec<Row>,
    ) -> Vec<InstanceRef> {
        let mut seen = HashSet::new();
        rows.into_iter()
            .filter_map(|row| {
                let id = row.first()?.as_i64()?;
                if !seen.insert(id) {
                    return None;
                }
                let stored_class = row
                    .get(2)
                    .and_then(Value::as_str)
                    .filter(|c| schema.is_valid_class(c));
                let instance =
                    self.instance_for(schema, stored_class.unwrap_or(fallback_class), id);
                if let Some(class_name) = stored_class.filter(|c| *c != instance.class_name()) {
                    instance.set_class_name(class_name);
                }
                instance.set_display_name(row.get(1).and_then(Value::as_str).map(str::to_string));
                Some(instance)
            })
            .collect()
    }

    /// Create-or-fetch from the identity cache; never touches the store.
    pub fn get_instance(&self, class_name: &str, db_id: i64) -> AdaptorResult<InstanceRef> {
        let schema = self.schema()?;
        schema.class(class_name)?;
        Ok(self.instance_for(&schema, class_name, db_id))
    }

    pub fn cached_instance(&self, db_id: i64) -> Option<InstanceRef> {
        self.inner.instances.get(db_id)
    }

    /// `get_instance` for parallel lists; both must have the same length.
    pub fn get_instances(
        &self,
        db_ids: &[i64],
        class_names: &[String],
    ) -> AdaptorResult<Vec<InstanceRef>> {
        check_lengths(db_ids, class_names, true)?;
        db_ids
            .iter()
            .zip(class_names)
            .map(|(id, class)| self.get_instance(class, *id))
            .collect()
    }

    pub async fn fetch_instance(&self, db_id: i64) -> AdaptorResult<Option<InstanceRef>> {
        if self.use_instance_cache() {
            if let Some(found) = self.inner.instances.get(db_id) {
                return Ok(Some(found));
            }
        }
        let root = self.schema()?.root_class().name.clone();
        Ok(self.fetch_instances_by_class(&root, Some(&[db_id])).await?.pop())
    }

    pub async fn fetch_instance_of_class(
        &self,
        class_name: &str,
        db_id: i64,
    ) -> AdaptorResult<Option<InstanceRef>> {
        Ok(self.fetch_instances_by_class(class_name, Some(&[db_id])).await?.pop())
    }

    /// Every instance of `class_name` (subclasses included), optionally
    /// restricted to `db_ids`.
    pub async fn fetch_instances_by_class(
        &self,
        class_name: &str,
        db_ids: Option<&[i64]>,
    ) -> AdaptorResult<Vec<InstanceRef>> {
        let schema = self.schema()?;
        schema.class(class_name)?;
        let rows = self
            .read(&ReadQuery::InstancesByClass {
                label: class_name.to_string(),
                ids: db_ids.map(<[i64]>::to_vec),
            })
            .await?;
        Ok(self.materialize(&schema, class_name, rows))
    }

    /// Instances for the given ids, cached ones first served from the cache.
    /// Result order follows `db_ids`; unknown ids are skipped.
    pub async fn fetch_instances_by_ids(&self, db_ids: &[i64]) -> AdaptorResult<Vec<InstanceRef>> {
        let schema = self.schema()?;
        let mut found: BTreeMap<i64, InstanceRef> = BTreeMap::new();
        let mut missing = Vec::new();
        for id in db_ids {
            match self.inner.instances.get(*id).filter(|_| self.use_instance_cache()) {
                Some(instance) => {
                    found.insert(*id, instance);
                }
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            let root = schema.root_class().name.clone();
            for instance in self.fetch_instances_by_class(&root, Some(&missing)).await? {
                if let Some(id) = instance.db_id() {
                    found.insert(id, instance);
                }
            }
        }
        Ok(db_ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }

    /// With both lists non-empty, ids and class names pair up by position.
    /// Only class names: every instance of each class. Only ids: fetch by id.
    pub async fn fetch_instances_by_class_names(
        &self,
        db_ids: &[i64],
        class_names: &[String],
    ) -> AdaptorResult<Vec<InstanceRef>> {
        if db_ids.is_empty() {
            let mut out = Vec::new();
            for class in class_names {
                out.extend(self.fetch_instances_by_class(class, None).await?);
            }
            return Ok(out);
        }
        if class_names.is_empty() {
            return self.fetch_instances_by_ids(db_ids).await;
        }
        check_lengths(db_ids, class_names, false)?;
        let mut out = Vec::new();
        for (id, class) in db_ids.iter().zip(class_names) {
            out.extend(self.fetch_instance_of_class(class, *id).await?);
        }
        Ok(out)
    }

    /// Instances satisfying every request.
    pub async fn fetch_instances(
        &self,
        requests: &[QueryRequest],
    ) -> AdaptorResult<Vec<InstanceRef>> {
        let schema = self.schema()?;
        let Some(first) = requests.first() else {
            return Ok(vec![]);
        };
        let fallback = first.query().class_name.clone();
        let query = compile_instance_query(requests)?;
        let rows = self.read(&ReadQuery::Instances(query)).await?;
        Ok(self.materialize(&schema, &fallback, rows))
    }

    pub async fn fetch_instance_by_attribute(
        &self,
        class_name: &str,
        attribute_name: &str,
        operator: Operator,
        value: QueryValue,
    ) -> AdaptorResult<Vec<InstanceRef>> {
        let schema = self.schema()?;
        let request =
            QueryRequest::attribute(&schema, class_name, attribute_name, operator, value)?;
        self.fetch_instances(std::slice::from_ref(&request)).await
    }

    pub fn cap_results(&self, mut instances: Vec<InstanceRef>) -> Vec<InstanceRef> {
        instances.truncate(self.inner.result_cap);
        instances
    }

    pub async fn class_instance_count(&self, class_name: &str) -> AdaptorResult<i64> {
        self.schema()?.class(class_name)?;
        let rows = self
            .read(&ReadQuery::ClassCount {
                label: class_name.to_string(),
            })
            .await?;
        Ok(first_cell(&rows).and_then(Value::as_i64).unwrap_or(0))
    }

    pub async fn all_instance_counts(&self) -> AdaptorResult<BTreeMap<String, i64>> {
        let rows = self.read(&ReadQuery::InstanceCounts).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.as_slice() {
                [Value::String(class), count, ..] => Some((class.clone(), count.as_i64()?)),
                _ => None,
            })
            .collect())
    }

    pub async fn max_db_id(&self) -> AdaptorResult<Option<i64>> {
        let rows = self.read(&ReadQuery::MaxDbId).await?;
        Ok(first_cell(&rows).and_then(Value::as_i64))
    }

    /// Highest `_Release.releaseNumber`; `None` when the schema has no
    /// release class or no release is stored.
    pub async fn release_number(&self) -> AdaptorResult<Option<i64>> {
        const RELEASE_CLASS: &str = "_Release";
        const RELEASE_NUMBER: &str = "releaseNumber";
        let schema = self.schema()?;
        let Some(class) = schema.get_class(RELEASE_CLASS) else {
            return Ok(None);
        };
        if class.attribute(RELEASE_NUMBER).is_none() {
            return Ok(None);
        }
        let rows = self
            .read(&ReadQuery::AttributeValues {
                label: RELEASE_CLASS.to_string(),
                id: None,
                attribute: RELEASE_NUMBER.to_string(),
                shape: crate::cypher::ValueShape::Primitive,
            })
            .await?;
        Ok(rows.iter().filter_map(|row| row.get(1)?.as_i64()).max())
    }

    /// Timestamp of the stored schema node, else that of the loaded schema.
    pub async fn schema_timestamp(&self) -> AdaptorResult<Option<String>> {
        let schema = self.schema()?;
        let rows = self.read(&ReadQuery::SchemaTimestamp).await?;
        Ok(first_cell(&rows)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| schema.timestamp().map(str::to_string)))
    }

    /// Ids from `db_ids` that exist. Cached ids count as existing when
    /// `check_cache` is set. With `inverse`, returns the stored ids that are
    /// *not* in `db_ids` instead.
    pub async fn existing(
        &self,
        db_ids: &[i64],
        check_cache: bool,
        inverse: bool,
    ) -> AdaptorResult<Vec<i64>> {
        if db_ids.is_empty() {
            return Ok(vec![]);
        }
        let schema = self.schema()?;
        let mut found = Vec::new();
        let mut unchecked = Vec::new();
        for id in db_ids {
            if check_cache && !inverse && self.inner.instances.contains_key(*id) {
                found.push(*id);
            } else {
                unchecked.push(*id);
            }
        }
        if !unchecked.is_empty() {
            let rows = self
                .read(&ReadQuery::ExistingIds {
                    label: schema.root_class().name.clone(),
                    ids: unchecked,
                    inverse,
                })
                .await?;
            found.extend(rows.iter().filter_map(|row| row.first()?.as_i64()));
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    /// All distinct ids exist (cache included).
    pub async fn exist(&self, db_ids: &[i64]) -> AdaptorResult<bool> {
        let found = self.existing(db_ids, true, false).await?;
        let distinct: HashSet<i64> = db_ids.iter().copied().collect();
        Ok(found.len() == distinct.len())
    }

    pub async fn fetch_schema_class_name(&self, db_id: i64) -> AdaptorResult<Option<String>> {
        let rows = self.read(&ReadQuery::SchemaClassOf { id: db_id }).await?;
        Ok(first_cell(&rows).and_then(Value::as_str).map(str::to_string))
    }

    /// Ids of `attribute.origin` instances holding exactly `count` occurrences
    /// of `values` (DB_IDs for instance-typed attributes).
    pub async fn fetch_ids_by_value_count(
        &self,
        attribute: &SchemaAttribute,
        values: &[Value],
        count: i64,
    ) -> AdaptorResult<Vec<i64>> {
        if !attribute.multiple {
            return Err(AdaptorError::InvalidAttribute {
                class: attribute.origin.clone(),
                attribute: attribute.name.clone(),
            });
        }
        if values.is_empty() {
            return Ok(vec![]);
        }
        let rows = self
            .read(&ReadQuery::IdsByValueCount {
                origin_label: attribute.origin.clone(),
                attribute: attribute.name.clone(),
                instance_valued: attribute.is_instance_type(),
                values: values.to_vec(),
                count,
            })
            .await?;
        Ok(rows.iter().filter_map(|row| row.first()?.as_i64()).collect())
    }

    /// `[sequenceId, residueId]` for every modified residue of an
    /// `EntityWithAccessionedSequence`.
    pub async fn fetch_ewas_modifications(&self) -> AdaptorResult<Vec<[i64; 2]>> {
        let rows = self.read(&ReadQuery::ModifiedResidues).await?;
        Ok(rows
            .iter()
            .filter_map(|row| match row.as_slice() {
                [ewas, residue, ..] => Some([ewas.as_i64()?, residue.as_i64()?]),
                _ => None,
            })
            .collect())
    }

    pub async fn fetch_stable_identifiers_with_duplicate_db_ids(
        &self,
    ) -> AdaptorResult<Vec<StableIdentifierRecord>> {
        let rows = self.read(&ReadQuery::DuplicateStableIdentifiers).await?;
        Ok(rows
            .iter()
            .filter_map(|row| match row.as_slice() {
                [identifier, db_id, old_identifier, ..] => Some(StableIdentifierRecord {
                    identifier: identifier.as_str().map(str::to_string),
                    db_id: db_id.as_i64()?,
                    old_identifier: old_identifier.as_str()?.to_string(),
                }),
                _ => None,
            })
            .collect())
    }
}

/// A stable identifier sharing its `oldIdentifier` with at least one other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableIdentifierRecord {
    pub identifier: Option<String>,
    pub db_id: i64,
    pub old_identifier: String,
}

fn first_cell(rows: &[Row]) -> Option<&Value> {
    rows.first()?.first()
}

fn check_lengths(db_ids: &[i64], class_names: &[String], strict: bool) -> AdaptorResult<()> {
    if db_ids.len() == class_names.len() || (!strict && class_names.is_empty()) {
        return Ok(());
    }
    Err(AdaptorError::MismatchedLengths(format!(
        "the list of class names ({}) must be the same size as the list of DB_IDs ({})",
        class_names.len(),
        db_ids.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::pathway_schema;
    use crate::store::MemoryGraphStore;

    fn adaptor() -> (MemoryGraphStore, GraphAdaptor) {
        let store = MemoryGraphStore::new();
        let adaptor = GraphAdaptor::with_schema(
            Arc::new(store.clone()),
            "graph.db",
            pathway_schema(),
            AdaptorSettings::default(),
        );
        (store, adaptor)
    }

    #[test]
    fn test_get_instance_is_identity_mapped() {
        let (_, adaptor) = adaptor();
        let a = adaptor.get_instance("Pathway", 5).unwrap();
        let b = adaptor.get_instance("Pathway", 5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            adaptor.get_instance("NoSuchClass", 1),
            Err(AdaptorError::InvalidClass(_))
        ));
    }

    #[test]
    fn test_disabled_cache_returns_fresh_objects_but_installs_first() {
        let (_, adaptor) = adaptor();
        adaptor.set_use_instance_cache(false);
        let a = adaptor.get_instance("Pathway", 9).unwrap();
        let b = adaptor.get_instance("Pathway", 9).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        let cached = adaptor.cached_instance(9).unwrap();
        assert!(Arc::ptr_eq(&cached, &a));
    }

    #[test]
    fn test_get_instances_requires_matching_lengths() {
        let (_, adaptor) = adaptor();
        let err = adaptor.get_instances(&[1, 2], &["Pathway".to_string()]).unwrap_err();
        assert!(matches!(err, AdaptorError::MismatchedLengths(_)));
    }

    #[tokio::test]
    async fn test_missing_schema_is_reported() {
        let adaptor = GraphAdaptor::new(
            Arc::new(MemoryGraphStore::new()),
            "graph.db",
            AdaptorSettings::default(),
        );
        assert!(matches!(adaptor.fetch_instance(1).await, Err(AdaptorError::SchemaNotLoaded)));
    }

    #[tokio::test]
    async fn test_release_number_absent_without_release_nodes() {
        let (_, adaptor) = adaptor();
        assert_eq!(adaptor.release_number().await.unwrap(), None);
        assert_eq!(adaptor.max_db_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_closes_store_and_drops_schema() {
        let (store, adaptor) = adaptor();
        adaptor.get_instance("Pathway", 1).unwrap();
        adaptor.cleanup().await.unwrap();
        assert!(store.is_closed());
        assert!(adaptor.instance_cache().is_empty());
        assert!(matches!(adaptor.schema(), Err(AdaptorError::SchemaNotLoaded)));
    }

    #[tokio::test]
    async fn test_stored_schema_timestamp_wins() {
        let (store, adaptor) = adaptor();
        let timestamp = adaptor.schema_timestamp().await.unwrap();
        assert_eq!(timestamp.as_deref(), Some("2024-01-01 00:00:00"));
        store.set_schema_timestamp(Some("2025-06-30 12:00:00".to_string()));
        let timestamp = adaptor.schema_timestamp().await.unwrap();
        assert_eq!(timestamp.as_deref(), Some("2025-06-30 12:00:00"));
    }
}

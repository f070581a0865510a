use itertools::Itertools;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cypher::{ReadQuery, WriteStatement, DB_ID_SEQUENCE};
use crate::error::{AdaptorError, AdaptorResult};
use crate::logic::adaptor::GraphAdaptor;
use crate::logic::BoxFuture;
use crate::model::instance::InstanceRef;
use crate::model::schema::{Direction, SchemaAttribute, SchemaClass, DB_ID, TIMESTAMP};
use crate::model::value::AttributeValue;
use crate::store::GraphTransaction;

/// Statement-level retry on deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per statement.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            backoff: Duration::from_millis(3000),
        }
    }
}

/// One datastore transaction plus the bookkeeping applied when it commits
/// through [`GraphAdaptor::commit`].
pub struct Transaction {
    inner: Box<dyn GraphTransaction>,
    retry: RetryPolicy,
    touched: HashSet<String>,
    deferred: Vec<InstanceRef>,
    /// Instances given a fresh DB_ID here, with the id they had before.
    minted: Vec<(InstanceRef, Option<i64>)>,
}

impl Transaction {
    /// Run one statement, retrying deadlocks per the policy. Any other
    /// failure is returned at once.
    pub async fn run(&mut self, statement: &WriteStatement) -> AdaptorResult<Option<Value>> {
        let mut attempt = 1;
        loop {
            match self.inner.run(statement).await {
                Ok(value) => {
                    self.touched
                        .extend(statement.touched_labels().into_iter().map(str::to_string));
                    return Ok(value);
                }
                Err(e) if e.is_deadlock() && attempt < self.retry.retries => {
                    log::warn!(
                        "deadlock on attempt {}/{}, retrying in {:?}: {}",
                        attempt,
                        self.retry.retries,
                        self.retry.backoff,
                        e
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Classes whose nodes this transaction has written.
    pub fn touched_classes(&self) -> &HashSet<String> {
        &self.touched
    }

    fn touch(&mut self, class_name: &str) {
        self.touched.insert(class_name.to_string());
    }

    fn defer_rehydration(&mut self, instance: InstanceRef) {
        if !self.deferred.iter().any(|d| Arc::ptr_eq(d, &instance)) {
            self.deferred.push(instance);
        }
    }
}

fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl GraphAdaptor {
    pub async fn begin(&self) -> AdaptorResult<Transaction> {
        let inner = self.inner.store.begin(&self.inner.database).await?;
        Ok(Transaction {
            inner,
            retry: self.inner.retry,
            touched: HashSet::new(),
            deferred: Vec::new(),
            minted: Vec::new(),
        })
    }

    /// Commit, then invalidate cached attribute values of every touched
    /// class (and its ancestors) and re-hydrate deferred instances.
    pub async fn commit(&self, tx: Transaction) -> AdaptorResult<()> {
        let Transaction {
            inner,
            touched,
            deferred,
            minted,
            ..
        } = tx;
        if let Err(e) = inner.commit().await {
            self.unmint(minted);
            return Err(e.into());
        }

        let schema = self.schema()?;
        let mut stale: HashSet<String> = HashSet::new();
        for class_name in touched {
            if let Some(class) = schema.get_class(&class_name) {
                stale.extend(class.ancestors.iter().cloned());
            }
            stale.insert(class_name);
        }
        self.inner.attributes.invalidate_classes(&stale);

        for instance in deferred {
            instance.deflate();
            self.inflate(&instance).await?;
        }
        Ok(())
    }

    pub async fn rollback(&self, tx: Transaction) {
        if let Err(e) = tx.inner.rollback().await {
            log::warn!("rollback failed: {}", e);
        }
        self.unmint(tx.minted);
    }

    /// Ids minted by a transaction that never committed name no node, so the
    /// instances get their previous ids back and leave the identity cache.
    fn unmint(&self, minted: Vec<(InstanceRef, Option<i64>)>) {
        for (instance, previous) in minted.into_iter().rev() {
            if let Some(id) = instance.db_id() {
                if self.inner.instances.get(id).is_some_and(|c| Arc::ptr_eq(&c, &instance)) {
                    self.inner.instances.remove(id);
                }
            }
            instance.restore_db_id(previous);
            if let Some(local) = previous {
                self.inner.instances.get_or_insert_with(local, || instance.clone());
            }
        }
    }

    async fn finish<T>(&self, tx: Transaction, result: AdaptorResult<T>) -> AdaptorResult<T> {
        match result {
            Ok(value) => {
                self.commit(tx).await?;
                Ok(value)
            }
            Err(e) => {
                self.rollback(tx).await;
                Err(e)
            }
        }
    }

    /// Next value of the persisted DB_ID counter, in its own transaction.
    pub async fn mint_db_id(&self) -> AdaptorResult<i64> {
        let mut tx = self.begin().await?;
        let minted = tx
            .run(&WriteStatement::MintId {
                key: DB_ID_SEQUENCE.to_string(),
            })
            .await
            .and_then(|v| v.and_then(|v| v.as_i64()).ok_or(AdaptorError::MintFailed));
        self.finish(tx, minted).await
    }

    /// Persist `instance`. Unless `force`d, a persisted instance is left as
    /// is. With `recursive`, unsaved referenced instances are stored first.
    pub fn store_instance<'a>(
        &'a self,
        instance: &'a InstanceRef,
        force: bool,
        tx: &'a mut Transaction,
        recursive: bool,
    ) -> BoxFuture<'a, AdaptorResult<i64>> {
        Box::pin(async move {
            let existing = instance.db_id();
            if let Some(id) = existing.filter(|id| !force && *id >= 0) {
                return Ok(id);
            }
            let schema = self.schema()?;
            let class = schema.class(&instance.class_name())?;
            let db_id = match existing.filter(|id| *id >= 0) {
                Some(id) => id,
                None => {
                    let id = self.mint_db_id().await?;
                    instance.set_db_id(id);
                    tx.minted.push((instance.clone(), existing));
                    if let Some(local) = existing {
                        let cached = self.inner.instances.get(local);
                        if cached.is_some_and(|c| Arc::ptr_eq(&c, instance)) {
                            self.inner.instances.remove(local);
                        }
                    }
                    self.inner.instances.put(instance.clone());
                    id
                }
            };

            let mut labels = vec![class.name.clone()];
            labels.extend(class.ancestors.iter().cloned());
            tx.run(&WriteStatement::CreateNode {
                labels,
                id: db_id,
                class_name: class.name.clone(),
                display_name: instance.display_name(),
            })
            .await?;
            let stamp = now_timestamp();
            instance.set_attribute(TIMESTAMP, vec![stamp.clone().into()]);
            tx.run(&WriteStatement::SetProperty {
                label: class.name.clone(),
                id: db_id,
                property: TIMESTAMP.to_string(),
                value: Value::from(stamp),
            })
            .await?;
            for attribute in class.attributes() {
                self.store_attribute(instance, db_id, class, attribute, tx, recursive)
                    .await?;
            }
            log::debug!("stored {} {}", class.name, db_id);
            Ok(db_id)
        })
    }

    async fn store_attribute(
        &self,
        instance: &InstanceRef,
        db_id: i64,
        class: &SchemaClass,
        attribute: &SchemaAttribute,
        tx: &mut Transaction,
        recursive: bool,
    ) -> AdaptorResult<()> {
        let values = instance.values(&attribute.name);
        if attribute.name == DB_ID || attribute.name == TIMESTAMP || values.is_empty() {
            return Ok(());
        }
        if !attribute.is_instance_type() {
            let mut json: Vec<Value> = values.iter().map(AttributeValue::to_json).collect();
            let value = if attribute.multiple {
                Value::Array(json)
            } else {
                json.swap_remove(0)
            };
            tx.run(&WriteStatement::SetProperty {
                label: class.name.clone(),
                id: db_id,
                property: attribute.name.clone(),
                value,
            })
            .await?;
            return Ok(());
        }

        let mut targets: Vec<(i64, String)> = Vec::with_capacity(values.len());
        for value in &values {
            let Some(target) = value.as_instance() else {
                continue;
            };
            let target_id = if recursive {
                self.store_instance(target, false, tx, true).await?
            } else {
                target
                    .db_id()
                    .filter(|id| *id >= 0)
                    .ok_or_else(|| AdaptorError::DbIdNotSet(target.class_name()))?
            };
            targets.push((target_id, target.class_name()));
        }
        // Duplicates collapse into one relationship carrying their count
        let counts = targets.iter().map(|(id, _)| *id).counts();
        let distinct = targets.iter().unique_by(|(id, _)| *id);
        for (order, (target_id, target_class)) in distinct.enumerate() {
            let (from_label, from_id, to_label, to_id) = match attribute.direction {
                Direction::Outgoing => {
                    (class.name.clone(), db_id, target_class.clone(), *target_id)
                }
                Direction::Incoming => {
                    (target_class.clone(), *target_id, class.name.clone(), db_id)
                }
            };
            tx.run(&WriteStatement::CreateRelationship {
                from_label,
                from_id,
                to_label,
                to_id,
                rel: attribute.name.clone(),
                stoichiometry: counts.get(target_id).copied().unwrap_or(1) as i64,
                order: order as i64,
            })
            .await?;
        }
        Ok(())
    }

    /// Rewrite one attribute of a persisted instance from its in-memory values.
    pub async fn update_instance_attribute(
        &self,
        instance: &InstanceRef,
        attribute_name: &str,
        tx: &mut Transaction,
    ) -> AdaptorResult<()> {
        let db_id = instance
            .db_id()
            .ok_or_else(|| AdaptorError::DbIdNotSet(instance.class_name()))?;
        let schema = self.schema()?;
        let class = schema.class(&instance.class_name())?;
        let attribute = class.attribute_or_err(attribute_name)?;
        if attribute.name == DB_ID {
            return Ok(());
        }
        if attribute.is_instance_type() {
            tx.run(&WriteStatement::DeleteRelationships {
                label: class.name.clone(),
                id: db_id,
                rel: attribute.name.clone(),
                direction: attribute.direction,
            })
            .await?;
        } else if instance.values(&attribute.name).is_empty() {
            tx.run(&WriteStatement::SetProperty {
                label: class.name.clone(),
                id: db_id,
                property: attribute.name.clone(),
                value: Value::Null,
            })
            .await?;
        }
        self.store_attribute(instance, db_id, class, attribute, tx, true)
            .await?;

        let stamp = now_timestamp();
        instance.set_attribute(TIMESTAMP, vec![stamp.clone().into()]);
        tx.run(&WriteStatement::SetProperty {
            label: class.name.clone(),
            id: db_id,
            property: TIMESTAMP.to_string(),
            value: Value::from(stamp),
        })
        .await?;
        Ok(())
    }

    /// Re-create the node of a persisted instance from its in-memory state
    /// and repoint every referrer at it.
    pub async fn update_instance(
        &self,
        instance: &InstanceRef,
        tx: &mut Transaction,
    ) -> AdaptorResult<()> {
        let db_id = instance
            .db_id()
            .filter(|id| *id >= 0)
            .ok_or_else(|| AdaptorError::DbIdNotSet(instance.class_name()))?;
        let schema = self.schema()?;
        let class = schema.class(&instance.class_name())?;

        // Relationships vanish with the node, so referrers are read first
        let mut referrers: Vec<(InstanceRef, Arc<SchemaAttribute>)> = Vec::new();
        let referrer_attributes = class
            .referrers()
            .iter()
            .filter(|a| a.direction == Direction::Outgoing)
            .unique_by(|a| (a.origin.clone(), a.name.clone()));
        for attribute in referrer_attributes {
            let rows = self
                .read(&ReadQuery::Referrers {
                    origin_label: attribute.origin.clone(),
                    attribute: attribute.name.clone(),
                    target_label: class.name.clone(),
                    id: db_id,
                })
                .await?;
            for referrer_id in rows.iter().filter_map(|row| row.first()?.as_i64()) {
                if referrer_id == db_id {
                    continue;
                }
                let referrer = match self.fetch_instance(referrer_id).await? {
                    Some(found) => found,
                    None => self.instance_for(&schema, &attribute.origin, referrer_id),
                };
                let repointed = self
                    .attribute_values(&referrer, &attribute.name)
                    .await?
                    .into_iter()
                    .map(|value| match &value {
                        AttributeValue::Instance(target) if target.db_id() == Some(db_id) => {
                            AttributeValue::Instance(instance.clone())
                        }
                        _ => value,
                    })
                    .collect();
                referrer.set_attribute(&attribute.name, repointed);
                referrers.push((referrer, attribute.clone()));
            }
        }

        tx.run(&WriteStatement::DetachDelete {
            label: class.name.clone(),
            id: db_id,
        })
        .await?;
        self.store_instance(instance, true, tx, true).await?;
        for (referrer, attribute) in &referrers {
            self.update_instance_attribute(referrer, &attribute.name, tx)
                .await?;
        }

        if let Some(cached) = self.inner.instances.get(db_id) {
            if cached.class_name() != class.name {
                cached.set_class_name(&class.name);
            }
            tx.defer_rehydration(cached);
        }
        log::info!("updated {} {} ({} referrers repaired)", class.name, db_id, referrers.len());
        Ok(())
    }

    /// Remove the node and its relationships, then evict the instance.
    pub async fn delete_instance(
        &self,
        instance: &InstanceRef,
        tx: &mut Transaction,
    ) -> AdaptorResult<()> {
        let db_id = instance
            .db_id()
            .ok_or_else(|| AdaptorError::DbIdNotSet(instance.class_name()))?;
        if db_id < 0 {
            self.inner.instances.remove(db_id);
            return Ok(());
        }
        let schema = self.schema()?;
        let class = schema.class(&instance.class_name())?;
        for attribute in class.attributes().iter().filter(|a| a.is_instance_type()) {
            for value in self.attribute_values(instance, &attribute.name).await? {
                if let AttributeValue::Instance(target) = value {
                    target.remove_referrer(instance);
                }
            }
        }
        let label = self
            .fetch_schema_class_name(db_id)
            .await?
            .unwrap_or_else(|| class.name.clone());
        tx.run(&WriteStatement::DetachDelete { label, id: db_id }).await?;
        // Cached values of attributes pointing here go stale with the relationships
        for attribute in class.referrers() {
            for referrer in schema.descendants(&attribute.origin)? {
                tx.touch(&referrer.name);
            }
        }
        self.inner.instances.remove(db_id);
        log::info!("deleted {} {}", class.name, db_id);
        Ok(())
    }

    pub async fn delete_by_db_id(&self, db_id: i64, tx: &mut Transaction) -> AdaptorResult<()> {
        let instance = self
            .fetch_instance(db_id)
            .await?
            .ok_or(AdaptorError::InstanceNotFound(db_id))?;
        self.delete_instance(&instance, tx).await
    }

    /// Force-store instances created by the client; ids come back in order.
    pub async fn store_local_instances(
        &self,
        instances: &[InstanceRef],
        tx: &mut Transaction,
    ) -> AdaptorResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(instances.len());
        for instance in instances {
            ids.push(self.store_instance(instance, true, tx, true).await?);
        }
        Ok(ids)
    }

    /// Store unsaved instances, update persisted ones. Instances referenced
    /// but not listed are stored when unsaved and otherwise left alone.
    pub async fn store_or_update(
        &self,
        instances: &[InstanceRef],
        tx: &mut Transaction,
    ) -> AdaptorResult<()> {
        for instance in instances {
            if instance.is_persisted() {
                self.update_instance(instance, tx).await?;
            } else {
                self.store_instance(instance, false, tx, true).await?;
            }
        }
        Ok(())
    }

    pub async fn tx_store_instance(
        &self,
        instance: &InstanceRef,
        force: bool,
    ) -> AdaptorResult<i64> {
        let mut tx = self.begin().await?;
        let result = self.store_instance(instance, force, &mut tx, true).await;
        self.finish(tx, result).await
    }

    pub async fn tx_update_instance(&self, instance: &InstanceRef) -> AdaptorResult<()> {
        let mut tx = self.begin().await?;
        let result = self.update_instance(instance, &mut tx).await;
        self.finish(tx, result).await
    }

    pub async fn tx_update_instance_attribute(
        &self,
        instance: &InstanceRef,
        attribute_name: &str,
    ) -> AdaptorResult<()> {
        let mut tx = self.begin().await?;
        let result = self
            .update_instance_attribute(instance, attribute_name, &mut tx)
            .await;
        self.finish(tx, result).await
    }

    pub async fn tx_delete_instance(&self, instance: &InstanceRef) -> AdaptorResult<()> {
        let mut tx = self.begin().await?;
        let result = self.delete_instance(instance, &mut tx).await;
        self.finish(tx, result).await
    }

    pub async fn tx_store_or_update(&self, instances: &[InstanceRef]) -> AdaptorResult<()> {
        let mut tx = self.begin().await?;
        let result = self.store_or_update(instances, &mut tx).await;
        self.finish(tx, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::logic::adaptor::AdaptorSettings;
    use crate::model::instance::Instance;
    use crate::model::schema::InstanceKind;
    use crate::seed::pathway_schema;
    use crate::store::MemoryGraphStore;

    fn adaptor(store: &MemoryGraphStore) -> GraphAdaptor {
        GraphAdaptor::with_schema(
            Arc::new(store.clone()),
            "graph.db",
            pathway_schema(),
            AdaptorSettings::default(),
        )
    }

    fn entity(name: &str) -> InstanceRef {
        let ins = Instance::new(InstanceKind::Generic, "SimpleEntity", None);
        ins.set_display_name(Some(name.to_string()));
        ins.set_attribute("name", vec![name.into()]);
        ins
    }

    #[tokio::test]
    async fn test_mint_is_monotonic() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        let a = adaptor.mint_db_id().await.unwrap();
        let b = adaptor.mint_db_id().await.unwrap();
        assert!(b > a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlocks_are_retried_with_backoff() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        store.fail_next_writes([
            StoreError::Deadlock("first".into()),
            StoreError::Deadlock("second".into()),
        ]);
        let started = tokio::time::Instant::now();
        let id = adaptor.tx_store_instance(&entity("ATP"), false).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(6000));
        assert!(adaptor.exist(&[id]).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failures_are_not_retried() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        store.fail_next_writes([StoreError::Statement("syntax".into())]);
        let started = tokio::time::Instant::now();
        let err = adaptor.mint_db_id().await.unwrap_err();
        assert!(matches!(err, AdaptorError::Store(StoreError::Statement(_))));
        assert!(started.elapsed() < Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_deadlock() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        store.fail_next_writes((0..5).map(|i| StoreError::Deadlock(format!("attempt {}", i))));
        let err = adaptor.mint_db_id().await.unwrap_err();
        assert!(matches!(
            err,
            AdaptorError::Store(StoreError::Deadlock(ref m)) if m == "attempt 4"
        ));
    }

    #[tokio::test]
    async fn test_store_is_idempotent_unless_forced() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        let atp = entity("ATP");
        let id = adaptor.tx_store_instance(&atp, false).await.unwrap();
        let nodes = store.node_count();
        assert_eq!(adaptor.tx_store_instance(&atp, false).await.unwrap(), id);
        assert_eq!(store.node_count(), nodes);
        assert!(atp.value(TIMESTAMP).is_some());
        assert!(Arc::ptr_eq(&adaptor.cached_instance(id).unwrap(), &atp));
    }

    #[tokio::test]
    async fn test_update_attribute_requires_db_id() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        let err = adaptor
            .tx_update_instance_attribute(&entity("ADP"), "name")
            .await
            .unwrap_err();
        assert!(matches!(err, AdaptorError::DbIdNotSet(_)));
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        let complex = Instance::new(InstanceKind::Generic, "Complex", None);
        complex.set_attribute("hasComponent", vec![entity("ATP").into()]);
        let schema_less = Instance::new(InstanceKind::Generic, "NoSuchClass", None);
        complex.set_attribute("compartment", vec![schema_less.into()]);
        assert!(adaptor.tx_store_instance(&complex, false).await.is_err());
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn test_store_after_rollback_persists_again() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        let atp = entity("ATP");
        let complex = Instance::new(InstanceKind::Generic, "Complex", None);
        complex.set_attribute("hasComponent", vec![atp.clone().into()]);
        let schema_less = Instance::new(InstanceKind::Generic, "NoSuchClass", None);
        complex.set_attribute("compartment", vec![schema_less.into()]);
        assert!(adaptor.tx_store_instance(&complex, false).await.is_err());
        assert_eq!(complex.db_id(), None);
        assert!(adaptor.instance_cache().is_empty());

        complex.set_attribute("compartment", vec![]);
        let id = adaptor.tx_store_instance(&complex, false).await.unwrap();
        assert!(store.node_count() > 0);
        assert!(adaptor.exist(&[id]).await.unwrap());
        assert!(atp.is_persisted());
    }

    #[tokio::test]
    async fn test_rollback_restores_local_id() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        let local = adaptor.get_instance("SimpleEntity", -1).unwrap();
        local.set_attribute("name", vec!["ATP".into()]);
        let mut tx = adaptor.begin().await.unwrap();
        let minted = adaptor.store_instance(&local, false, &mut tx, true).await.unwrap();
        assert!(Arc::ptr_eq(&adaptor.cached_instance(minted).unwrap(), &local));
        adaptor.rollback(tx).await;

        assert_eq!(local.db_id(), Some(-1));
        assert!(adaptor.cached_instance(minted).is_none());
        assert!(Arc::ptr_eq(&adaptor.cached_instance(-1).unwrap(), &local));
    }

    #[tokio::test]
    async fn test_store_or_update_and_delete_by_id() {
        let store = MemoryGraphStore::new();
        let adaptor = adaptor(&store);
        let atp = entity("ATP");
        let reaction = Instance::new(InstanceKind::Generic, "Reaction", None);
        reaction.set_attribute("input", vec![atp.clone().into()]);
        adaptor.tx_store_or_update(&[reaction.clone()]).await.unwrap();
        let atp_id = atp.db_id().unwrap();
        assert!(adaptor.exist(&[atp_id, reaction.db_id().unwrap()]).await.unwrap());

        atp.set_attribute("name", vec!["adenosine triphosphate".into()]);
        adaptor.tx_store_or_update(&[atp.clone()]).await.unwrap();
        assert_eq!(store.node_count(), 2);

        let mut tx = adaptor.begin().await.unwrap();
        let missing = adaptor.delete_by_db_id(atp_id + 100, &mut tx).await.unwrap_err();
        assert!(matches!(missing, AdaptorError::InstanceNotFound(_)));
        adaptor.delete_by_db_id(atp_id, &mut tx).await.unwrap();
        assert!(tx.touched_classes().contains("SimpleEntity"));
        adaptor.commit(tx).await.unwrap();
        assert_eq!(store.node_count(), 1);
        assert!(adaptor.cached_instance(atp_id).is_none());
    }
}

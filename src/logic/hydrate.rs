use itertools::Itertools;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::cypher::{ReadQuery, ValueShape};
use crate::error::{AdaptorError, AdaptorResult};
use crate::logic::adaptor::GraphAdaptor;
use crate::logic::attribute_cache::{AttributeTable, CachedValue};
use crate::logic::BoxFuture;
use crate::model::instance::InstanceRef;
use crate::model::schema::{Schema, SchemaAttribute, DB_ID};
use crate::model::value::AttributeValue;

/// Row shape used to read `attribute`.
pub(crate) fn value_shape(schema: &Schema, attribute: &SchemaAttribute) -> ValueShape {
    if !attribute.is_instance_type() {
        return ValueShape::Primitive;
    }
    ValueShape::Instance {
        target_label: attribute
            .target_class()
            .unwrap_or(&schema.root_class().name)
            .to_string(),
        direction: attribute.direction,
        multiple: attribute.multiple,
    }
}

fn unique_attributes(
    attributes: impl IntoIterator<Item = Arc<SchemaAttribute>>,
) -> Vec<Arc<SchemaAttribute>> {
    attributes
        .into_iter()
        .unique_by(|a| (a.origin.clone(), a.name.clone()))
        .collect()
}

fn primitive_values(db_id: i64, raw: &serde_json::Value) -> Vec<CachedValue> {
    let mut table = AttributeTable::default();
    table.add_value(db_id, raw.clone(), None);
    table.values(db_id)
}

impl GraphAdaptor {
    /// Load `attributes` on every instance. With `recursive`, referenced
    /// instances are inflated too.
    pub async fn load_attribute_values(
        &self,
        instances: &[InstanceRef],
        attributes: &[Arc<SchemaAttribute>],
        recursive: bool,
    ) -> AdaptorResult<()> {
        let mut visited = HashSet::new();
        self.load_values(instances.to_vec(), attributes.to_vec(), recursive, &mut visited)
            .await
    }

    /// Resolve each name to the attribute(s) declaring it, then load.
    pub async fn load_attribute_values_by_name(
        &self,
        instances: &[InstanceRef],
        names: &[String],
        recursive: bool,
    ) -> AdaptorResult<()> {
        let schema = self.schema()?;
        let attributes =
            unique_attributes(names.iter().flat_map(|n| schema.original_attributes_by_name(n)));
        self.load_attribute_values(instances, &attributes, recursive).await
    }

    /// Every attribute of the instances' classes and their subclasses. The
    /// instances are marked inflated afterwards.
    pub async fn load_all_attribute_values(
        &self,
        instances: &[InstanceRef],
        recursive: bool,
    ) -> AdaptorResult<()> {
        let schema = self.schema()?;
        let mut classes = BTreeSet::new();
        for instance in instances {
            for class in schema.descendants(&instance.class_name())? {
                classes.insert(class.name.clone());
            }
        }
        let attributes = unique_attributes(
            classes
                .iter()
                .filter_map(|c| schema.get_class(c))
                .flat_map(|c| c.attributes().iter().cloned()),
        );
        self.load_attribute_values(instances, &attributes, recursive).await?;
        for instance in instances {
            instance.set_inflated(true);
        }
        Ok(())
    }

    /// Load every attribute of `instance` and the instances it references.
    /// A no-op for an already inflated instance.
    pub async fn inflate(&self, instance: &InstanceRef) -> AdaptorResult<()> {
        let mut visited = HashSet::new();
        self.inflate_with(instance.clone(), &mut visited).await
    }

    /// Loaded values of `name`, loading them first when needed. Attributes
    /// skipped by eager hydration (diagram layout) come in through here.
    pub async fn attribute_values(
        &self,
        instance: &InstanceRef,
        name: &str,
    ) -> AdaptorResult<Vec<AttributeValue>> {
        if !instance.is_attribute_loaded(name) && instance.is_persisted() {
            let schema = self.schema()?;
            let attribute = schema.class(&instance.class_name())?.attribute_or_err(name)?.clone();
            self.load_attribute_values(std::slice::from_ref(instance), &[attribute], false)
                .await?;
        }
        Ok(instance.values(name))
    }

    /// For each instance, load `attributes` and register the instance as a
    /// referrer on every value.
    pub async fn load_reverse_attribute_values(
        &self,
        instances: &[InstanceRef],
        attributes: &[Arc<SchemaAttribute>],
    ) -> AdaptorResult<()> {
        if let Some(primitive) = attributes.iter().find(|a| !a.is_instance_type()) {
            return Err(AdaptorError::NotInstanceAttribute(primitive.name.clone()));
        }
        self.load_attribute_values(instances, attributes, false).await?;
        for instance in instances {
            for attribute in attributes {
                for value in instance.values(&attribute.name) {
                    if let AttributeValue::Instance(target) = value {
                        target.add_referrer(&attribute.name, instance);
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn load_reverse_attribute_values_by_name(
        &self,
        instances: &[InstanceRef],
        names: &[String],
    ) -> AdaptorResult<()> {
        let schema = self.schema()?;
        let attributes =
            unique_attributes(names.iter().flat_map(|n| schema.original_attributes_by_name(n)));
        self.load_reverse_attribute_values(instances, &attributes).await
    }

    fn load_values<'a>(
        &'a self,
        instances: Vec<InstanceRef>,
        attributes: Vec<Arc<SchemaAttribute>>,
        recursive: bool,
        visited: &'a mut HashSet<i64>,
    ) -> BoxFuture<'a, AdaptorResult<()>> {
        Box::pin(async move {
            if instances.is_empty() || attributes.is_empty() {
                return Ok(());
            }
            let schema = self.schema()?;
            visited.extend(instances.iter().filter_map(|i| i.db_id()));
            if self.use_attribute_cache() {
                self.populate_attribute_cache(&schema, &instances, &attributes)
                    .await;
            }
            for instance in &instances {
                self.assign_values(&schema, instance, &attributes, recursive, visited)
                    .await?;
            }
            Ok(())
        })
    }

    fn inflate_with<'a>(
        &'a self,
        instance: InstanceRef,
        visited: &'a mut HashSet<i64>,
    ) -> BoxFuture<'a, AdaptorResult<()>> {
        Box::pin(async move {
            if instance.is_inflated() {
                return Ok(());
            }
            let schema = self.schema()?;
            let kind = instance.kind();
            let attributes: Vec<Arc<SchemaAttribute>> = schema
                .class(&instance.class_name())?
                .attributes()
                .iter()
                .filter(|a| !kind.loads_lazily(&a.name))
                .cloned()
                .collect();
            self.load_values(vec![instance.clone()], attributes, true, visited)
                .await?;
            instance.set_inflated(true);
            Ok(())
        })
    }

    /// Fan out one bulk query per missing (class, attribute) pair and wait
    /// for all of them. Failures are logged; affected pairs stay unpopulated.
    async fn populate_attribute_cache(
        &self,
        schema: &Arc<Schema>,
        instances: &[InstanceRef],
        attributes: &[Arc<SchemaAttribute>],
    ) {
        let mut pairs = BTreeSet::new();
        for instance in instances {
            let class_name = instance.class_name();
            let Some(class) = schema.get_class(&class_name) else {
                continue;
            };
            for attribute in attributes {
                if attribute.name == DB_ID
                    || !class.is_valid_attribute(attribute)
                    || self.inner.attributes.is_populated(&class_name, &attribute.name)
                {
                    continue;
                }
                pairs.insert((class_name.clone(), attribute.name.clone()));
            }
        }
        if pairs.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for (class_name, attribute_name) in pairs {
            let Some(attribute) = schema
                .get_class(&class_name)
                .and_then(|c| c.attribute(&attribute_name))
                .cloned()
            else {
                continue;
            };
            let adaptor = self.clone();
            let schema = schema.clone();
            let workers = self.inner.workers.clone();
            tasks.spawn(async move {
                let _permit = workers.acquire_owned().await.ok();
                adaptor
                    .populate_attribute(&schema, &class_name, &attribute)
                    .await
                    .map(|table| (class_name.clone(), attribute.name.clone(), table.len()))
                    .map_err(|e| (class_name, attribute.name.clone(), e))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((class_name, attribute, rows))) => {
                    log::debug!("cached {}.{} for {} instances", class_name, attribute, rows)
                }
                Ok(Err((class_name, attribute, e))) => {
                    log::error!("failed to populate {}.{}: {}", class_name, attribute, e)
                }
                Err(e) => log::error!("attribute population task aborted: {}", e),
            }
        }
    }

    /// Bulk-load one (class, attribute) pair into the attribute cache.
    pub(crate) async fn populate_attribute(
        &self,
        schema: &Schema,
        class_name: &str,
        attribute: &SchemaAttribute,
    ) -> AdaptorResult<Arc<AttributeTable>> {
        let shape = value_shape(schema, attribute);
        let query = ReadQuery::AttributeValues {
            label: class_name.to_string(),
            id: None,
            attribute: attribute.name.clone(),
            shape: shape.clone(),
        };
        self.inner
            .attributes
            .populate(class_name, &attribute.name, || async move {
                let rows = self.read(&query).await?;
                Ok::<_, AdaptorError>(AttributeTable::from_rows(&shape, rows))
            })
            .await
    }

    async fn assign_values(
        &self,
        schema: &Arc<Schema>,
        instance: &InstanceRef,
        attributes: &[Arc<SchemaAttribute>],
        recursive: bool,
        visited: &mut HashSet<i64>,
    ) -> AdaptorResult<()> {
        // Local instances have nothing stored yet
        let Some(db_id) = instance.db_id().filter(|id| *id >= 0) else {
            return Ok(());
        };
        let class = schema.class(&instance.class_name())?;
        let pending: Vec<&Arc<SchemaAttribute>> = attributes
            .iter()
            .filter(|a| {
                a.name != DB_ID
                    && !instance.is_attribute_loaded(&a.name)
                    && class.is_valid_attribute(a)
            })
            .collect();

        let mut found: Vec<(Arc<SchemaAttribute>, Vec<CachedValue>)> = Vec::new();
        let mut single_primitives = Vec::new();
        for attribute in pending {
            if self.use_attribute_cache() {
                let cached = self.inner.attributes.values_for(&class.name, &attribute.name, db_id);
                if let Some(values) = cached {
                    found.push((attribute.clone(), values));
                    continue;
                }
            }
            if !attribute.is_instance_type() && !attribute.multiple {
                single_primitives.push(attribute.clone());
                continue;
            }
            let shape = value_shape(schema, attribute);
            let rows = self
                .read(&ReadQuery::AttributeValues {
                    label: class.name.clone(),
                    id: Some(db_id),
                    attribute: attribute.name.clone(),
                    shape: shape.clone(),
                })
                .await?;
            found.push((attribute.clone(), AttributeTable::from_rows(&shape, rows).values(db_id)));
        }

        if !single_primitives.is_empty() {
            let rows = self
                .read(&ReadQuery::NodeProperties {
                    label: class.name.clone(),
                    id: db_id,
                    properties: single_primitives.iter().map(|a| a.name.clone()).collect(),
                })
                .await?;
            if let Some(row) = rows.first() {
                for (attribute, raw) in single_primitives.into_iter().zip(row) {
                    let values = primitive_values(db_id, raw);
                    found.push((attribute, values));
                }
            }
        }

        for (attribute, values) in found {
            let mut converted = Vec::with_capacity(values.len());
            for cached in values {
                if !attribute.is_instance_type() {
                    converted.push(AttributeValue::coerce(&attribute, &cached.value)?);
                    continue;
                }
                let Some(target_id) = cached.value.as_i64() else {
                    continue;
                };
                let target_class = cached
                    .target_class
                    .as_deref()
                    .filter(|c| schema.is_valid_class(c))
                    .or(attribute.target_class())
                    .unwrap_or(&schema.root_class().name)
                    .to_string();
                let target = if recursive {
                    self.inflate_reference(schema, &target_class, target_id, visited)
                        .await?
                } else {
                    self.instance_for(schema, &target_class, target_id)
                };
                converted.push(AttributeValue::Instance(target));
            }
            instance.set_attribute(&attribute.name, converted);
        }
        Ok(())
    }

    /// Materialize a referenced instance and inflate it unless it is
    /// already inflated, was cache-resident before the call, or has been
    /// visited during this hydration.
    async fn inflate_reference(
        &self,
        schema: &Schema,
        class_name: &str,
        db_id: i64,
        visited: &mut HashSet<i64>,
    ) -> AdaptorResult<InstanceRef> {
        let was_cached = self.use_instance_cache() && self.inner.instances.contains_key(db_id);
        let target = self.instance_for(schema, class_name, db_id);
        if !target.is_inflated() && !was_cached && visited.insert(db_id) {
            self.inflate_with(target.clone(), visited).await?;
        }
        Ok(target)
    }
}

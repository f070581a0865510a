use itertools::Itertools;
use serde_json::Value;
use std::sync::Arc;

use crate::error::AdaptorResult;
use crate::logic::adaptor::GraphAdaptor;
use crate::logic::BoxFuture;
use crate::model::instance::{Instance, InstanceRef};
use crate::model::query::{AttributeQuery, Operator, QueryRequest, QueryValue};
use crate::model::schema::{DefiningType, SchemaAttribute, SchemaClass, DB_ID};
use crate::model::value::AttributeValue;

/// Outcome of looking up stored instances equivalent to a given one.
#[derive(Debug, Clone)]
pub enum Identicals {
    /// The class declares no defining attributes.
    Undefined,
    /// Some defining value has no stored counterpart, so nothing can match.
    Unresolvable,
    /// Every defining attribute is empty.
    NoDefiningValues,
    Matches(Vec<InstanceRef>),
}

impl Identicals {
    pub fn instances(&self) -> &[InstanceRef] {
        match self {
            Identicals::Matches(found) => found,
            _ => &[],
        }
    }
}

enum Condition {
    Request(QueryRequest),
    Unresolvable,
}

impl GraphAdaptor {
    /// Stored instances of the same class whose defining attributes hold the
    /// same values as `instance`. The instance itself is never included.
    pub fn fetch_identical_instances<'a>(
        &'a self,
        instance: &'a InstanceRef,
    ) -> BoxFuture<'a, AdaptorResult<Identicals>> {
        Box::pin(async move {
            let schema = self.schema()?;
            let class = schema.class(&instance.class_name())?;
            if !class.has_defining_attributes() {
                return Ok(Identicals::Undefined);
            }

            let mut requests = Vec::new();
            let mut all_null = true;
            for attribute in class.defining_attributes(DefiningType::All) {
                let values = self.attribute_values(instance, &attribute.name).await?;
                let condition = if values.is_empty() {
                    Condition::Request(is_null(attribute))
                } else if attribute.multiple {
                    all_null = false;
                    self.multi_valued_condition(class, attribute, &values).await?
                } else {
                    all_null = false;
                    match self.single_valued_requests(class, attribute, &values).await? {
                        Some(mut found) => {
                            requests.append(&mut found);
                            continue;
                        }
                        None => Condition::Unresolvable,
                    }
                };
                match condition {
                    Condition::Request(request) => requests.push(request),
                    Condition::Unresolvable => return Ok(Identicals::Unresolvable),
                }
            }
            for attribute in class.defining_attributes(DefiningType::Any) {
                let values = self.attribute_values(instance, &attribute.name).await?;
                if !values.is_empty() {
                    all_null = false;
                }
                match self.any_condition(class, attribute, &values).await? {
                    Condition::Request(request) => requests.push(request),
                    Condition::Unresolvable => return Ok(Identicals::Unresolvable),
                }
            }
            if all_null {
                return Ok(Identicals::NoDefiningValues);
            }

            let candidates: Vec<InstanceRef> = self
                .fetch_instances(&requests)
                .await?
                .into_iter()
                .filter(|candidate| !Instance::same(candidate, instance))
                .collect();
            if candidates.is_empty() {
                return Ok(Identicals::Matches(vec![]));
            }

            // Only the number of values per ALL attribute is compared, not the values
            let all: Vec<Arc<SchemaAttribute>> =
                class.defining_attributes(DefiningType::All).cloned().collect();
            self.load_attribute_values(&candidates, &all, false).await?;
            let mut source_counts = Vec::with_capacity(all.len());
            for attribute in &all {
                source_counts.push(self.attribute_values(instance, &attribute.name).await?.len());
            }
            let matches = candidates
                .into_iter()
                .filter(|candidate| {
                    all.iter()
                        .zip(&source_counts)
                        .all(|(attribute, count)| candidate.values(&attribute.name).len() == *count)
                })
                .collect();
            Ok(Identicals::Matches(matches))
        })
    }

    /// DB_IDs standing in for an instance value: its own when persisted,
    /// otherwise those of its stored identicals.
    async fn reference_ids(&self, value: &InstanceRef) -> AdaptorResult<Vec<i64>> {
        if let Some(id) = value.db_id().filter(|id| *id >= 0) {
            return Ok(vec![id]);
        }
        let found = self.fetch_identical_instances(value).await?;
        Ok(found.instances().iter().filter_map(|i| i.db_id()).collect())
    }

    /// `None` when an instance value cannot be matched to anything stored.
    async fn single_valued_requests(
        &self,
        class: &SchemaClass,
        attribute: &Arc<SchemaAttribute>,
        values: &[AttributeValue],
    ) -> AdaptorResult<Option<Vec<QueryRequest>>> {
        let mut requests = Vec::new();
        for value in values.iter().unique_by(|v| v.identity_key()) {
            let query_value = match value {
                AttributeValue::Instance(target) => {
                    if let Some(id) = target.db_id().filter(|id| *id >= 0) {
                        QueryValue::Scalar(Value::from(id))
                    } else {
                        let ids = self.reference_ids(target).await?;
                        if ids.is_empty() {
                            return Ok(None);
                        }
                        id_collection(ids)
                    }
                }
                primitive => QueryValue::Scalar(primitive.to_json()),
            };
            requests.push(request(class, attribute, Operator::Eq, query_value));
        }
        Ok(Some(requests))
    }

    /// Each distinct value must occur exactly as often on the match, which the
    /// value-count lookup answers per value; the surviving ids are intersected.
    async fn multi_valued_condition(
        &self,
        class: &SchemaClass,
        attribute: &Arc<SchemaAttribute>,
        values: &[AttributeValue],
    ) -> AdaptorResult<Condition> {
        let counts = values.iter().map(AttributeValue::identity_key).counts();
        let mut survivors: Option<Vec<i64>> = None;
        for value in values.iter().unique_by(|v| v.identity_key()) {
            let count = counts.get(&value.identity_key()).copied().unwrap_or(1) as i64;
            let lookup: Vec<Value> = match value {
                AttributeValue::Instance(target) => {
                    self.reference_ids(target).await?.into_iter().map(Value::from).collect()
                }
                primitive => vec![primitive.to_json()],
            };
            let ids = self.fetch_ids_by_value_count(attribute, &lookup, count).await?;
            let narrowed: Vec<i64> = match survivors.take() {
                Some(previous) => previous.into_iter().filter(|id| ids.contains(id)).collect(),
                None => ids,
            };
            if narrowed.is_empty() {
                return Ok(Condition::Unresolvable);
            }
            survivors = Some(narrowed);
        }
        let ids = survivors.unwrap_or_default();
        let by_id = class.attribute_or_err(DB_ID)?.clone();
        Ok(Condition::Request(QueryRequest::Attribute(AttributeQuery {
            class_name: class.name.clone(),
            attribute: by_id,
            operator: Operator::Eq,
            value: id_collection(ids),
        })))
    }

    /// Any one shared value is enough.
    async fn any_condition(
        &self,
        class: &SchemaClass,
        attribute: &Arc<SchemaAttribute>,
        values: &[AttributeValue],
    ) -> AdaptorResult<Condition> {
        if values.is_empty() {
            return Ok(Condition::Request(is_null(attribute)));
        }
        let mut resolved = Vec::new();
        for value in values {
            match value {
                AttributeValue::Instance(target) => {
                    resolved.extend(
                        self.reference_ids(target)
                            .await?
                            .into_iter()
                            .map(|id| QueryValue::Scalar(Value::from(id))),
                    );
                }
                primitive => resolved.push(QueryValue::Scalar(primitive.to_json())),
            }
        }
        if resolved.is_empty() {
            return Ok(Condition::Unresolvable);
        }
        let resolved = resolved.into_iter().unique_by(|v| format!("{:?}", v)).collect();
        let value = QueryValue::Collection(resolved);
        Ok(Condition::Request(request(class, attribute, Operator::Eq, value)))
    }
}

fn id_collection(ids: impl IntoIterator<Item = i64>) -> QueryValue {
    QueryValue::Collection(ids.into_iter().map(|id| QueryValue::Scalar(Value::from(id))).collect())
}

fn request(
    class: &SchemaClass,
    attribute: &Arc<SchemaAttribute>,
    operator: Operator,
    value: QueryValue,
) -> QueryRequest {
    QueryRequest::Attribute(AttributeQuery {
        class_name: class.name.clone(),
        attribute: attribute.clone(),
        operator,
        value,
    })
}

fn is_null(attribute: &Arc<SchemaAttribute>) -> QueryRequest {
    QueryRequest::for_attribute(attribute.clone(), Operator::IsNull, QueryValue::Null)
}

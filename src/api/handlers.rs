use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::AdaptorError;
use crate::logic::{GraphAdaptor, Identicals};
use crate::model::{
    AttributeValue, InstanceRef, InstanceView, Operator, QueryRequest, QueryValue,
    SchemaAttribute,
};

pub type AppState = GraphAdaptor;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message)))
}

/// Validation failures are the caller's fault; store failures are ours.
fn into_api_error(e: AdaptorError) -> ApiError {
    let status = match &e {
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        AdaptorError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        AdaptorError::SchemaNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        log::error!("request failed: {}", e);
    }
    (status, Json(ErrorResponse::new(&e.to_string())))
}

fn views(instances: &[InstanceRef]) -> Vec<InstanceView> {
    instances.iter().map(|i| i.view()).collect()
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

// ---- Request bodies ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingIdsRequest {
    pub db_ids: Vec<i64>,
    #[serde(default)]
    pub check_cache: bool,
    #[serde(default)]
    pub inverse: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancesClassRequest {
    #[serde(default)]
    pub db_ids: Vec<i64>,
    #[serde(default)]
    pub class_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbIdsRequest {
    pub db_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadAttributesRequest {
    pub db_ids: Vec<i64>,
    /// `[className, attributeName]` pairs; an empty class name means every
    /// class declaring the attribute. No pairs loads everything.
    #[serde(default)]
    pub class_attribute_names: Vec<Vec<String>>,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancesAttributesRequest {
    pub db_ids: Vec<i64>,
    pub attribute_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInCacheRequest {
    pub db_ids: Vec<i64>,
    pub class_name: String,
    pub attribute_names: Vec<String>,
    pub values: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreUpdateRequest {
    pub store_db_id: i64,
    pub store_class_name: String,
    pub update_attribute_name: String,
    pub update_db_id: i64,
    pub update_class_name: String,
}

// ---- Schema and bookkeeping ----

#[derive(Debug, Serialize)]
pub struct ClassSummary {
    pub name: String,
    pub parent: Option<String>,
    pub subclasses: Vec<String>,
    pub attributes: Vec<SchemaAttribute>,
}

#[derive(Debug, Serialize)]
pub struct SchemaSummary {
    pub timestamp: Option<String>,
    pub root: String,
    pub classes: Vec<ClassSummary>,
}

pub async fn get_schema(State(adaptor): State<AppState>) -> ApiResult<SchemaSummary> {
    let schema = adaptor.schema().map_err(into_api_error)?;
    let classes = schema
        .classes()
        .map(|c| ClassSummary {
            name: c.name.clone(),
            parent: c.parent.clone(),
            subclasses: c.subclasses.clone(),
            attributes: c.attributes().iter().map(|a| (**a).clone()).collect(),
        })
        .collect();
    Ok(Json(SchemaSummary {
        timestamp: schema.timestamp().map(str::to_string),
        root: schema.root_class().name.clone(),
        classes,
    }))
}

pub async fn get_schema_timestamp(State(adaptor): State<AppState>) -> ApiResult<Option<String>> {
    adaptor.schema_timestamp().await.map(Json).map_err(into_api_error)
}

pub async fn get_release_number(State(adaptor): State<AppState>) -> ApiResult<Option<i64>> {
    adaptor.release_number().await.map(Json).map_err(into_api_error)
}

pub async fn get_max_db_id(State(adaptor): State<AppState>) -> ApiResult<Option<i64>> {
    adaptor.max_db_id().await.map(Json).map_err(into_api_error)
}

pub async fn fetch_ewas_modifications(State(adaptor): State<AppState>) -> ApiResult<Vec<[i64; 2]>> {
    adaptor.fetch_ewas_modifications().await.map(Json).map_err(into_api_error)
}

/// Every value goes out as a string, `DB_ID` included.
#[derive(Debug, Serialize)]
pub struct DuplicateStableIdentifier {
    pub identifier: Option<String>,
    #[serde(rename = "DB_ID")]
    pub db_id: String,
    #[serde(rename = "oldIdentifier")]
    pub old_identifier: String,
}

pub async fn fetch_stable_identifiers_with_duplicate_db_ids(
    State(adaptor): State<AppState>,
) -> ApiResult<Vec<DuplicateStableIdentifier>> {
    let records = adaptor
        .fetch_stable_identifiers_with_duplicate_db_ids()
        .await
        .map_err(into_api_error)?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| DuplicateStableIdentifier {
                identifier: r.identifier,
                db_id: r.db_id.to_string(),
                old_identifier: r.old_identifier,
            })
            .collect(),
    ))
}

pub async fn refresh_cache(State(adaptor): State<AppState>) -> StatusCode {
    adaptor.refresh_caches();
    StatusCode::NO_CONTENT
}

pub async fn set_use_cache(State(adaptor): State<AppState>, Path(flag): Path<bool>) -> StatusCode {
    adaptor.set_use_instance_cache(flag);
    StatusCode::NO_CONTENT
}

pub async fn is_cache_used(State(adaptor): State<AppState>) -> Json<bool> {
    Json(adaptor.use_instance_cache())
}

pub async fn cleanup(State(adaptor): State<AppState>) -> Result<StatusCode, ApiError> {
    adaptor.cleanup().await.map_err(into_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mint_db_id(State(adaptor): State<AppState>) -> ApiResult<i64> {
    adaptor.mint_db_id().await.map(Json).map_err(into_api_error)
}

pub async fn class_instance_count(
    State(adaptor): State<AppState>,
    Path(class_name): Path<String>,
) -> ApiResult<i64> {
    adaptor
        .class_instance_count(&class_name)
        .await
        .map(Json)
        .map_err(into_api_error)
}

pub async fn all_instance_counts(
    State(adaptor): State<AppState>,
) -> ApiResult<BTreeMap<String, i64>> {
    adaptor.all_instance_counts().await.map(Json).map_err(into_api_error)
}

// ---- Reads ----

pub async fn fetch_existing_db_ids(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<ExistingIdsRequest>,
) -> ApiResult<Vec<i64>> {
    adaptor
        .existing(&request.db_ids, request.check_cache, request.inverse)
        .await
        .map(Json)
        .map_err(into_api_error)
}

pub async fn fetch_instance(
    State(adaptor): State<AppState>,
    Path(db_id): Path<i64>,
) -> ApiResult<InstanceView> {
    match adaptor.fetch_instance(db_id).await {
        Ok(Some(instance)) => Ok(Json(instance.view())),
        Ok(None) => Err(into_api_error(AdaptorError::InstanceNotFound(db_id))),
        Err(e) => Err(into_api_error(e)),
    }
}

pub async fn fetch_instances_by_class_name(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<InstancesClassRequest>,
) -> ApiResult<Vec<InstanceView>> {
    let instances = adaptor
        .fetch_instances_by_class_names(&request.db_ids, &request.class_names)
        .await
        .map_err(into_api_error)?;
    Ok(Json(views(&instances)))
}

pub async fn get_instances_by_class_name(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<InstancesClassRequest>,
) -> ApiResult<Vec<InstanceView>> {
    let instances = adaptor
        .get_instances(&request.db_ids, &request.class_names)
        .map_err(into_api_error)?;
    Ok(Json(views(&instances)))
}

/// Numbers are DB_IDs (or numeric values), anything else is matched as text.
fn query_value(raw: &Value) -> QueryValue {
    match raw {
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(id) => QueryValue::Scalar(Value::from(id)),
            Err(_) => QueryValue::Scalar(raw.clone()),
        },
        other => QueryValue::from(other.clone()),
    }
}

/// Body: `[[className, attributeName, operator, value], ...]`. An empty
/// operator means equality.
pub async fn fetch_instances_by_attribute_values(
    State(adaptor): State<AppState>,
    RequestJson(conditions): RequestJson<Vec<(String, String, String, Value)>>,
) -> ApiResult<Vec<InstanceView>> {
    let schema = adaptor.schema().map_err(into_api_error)?;
    let mut requests = Vec::with_capacity(conditions.len());
    for (class_name, attribute_name, operator, value) in &conditions {
        let operator = if operator.trim().is_empty() {
            Operator::Eq
        } else {
            operator.parse::<Operator>().map_err(into_api_error)?
        };
        let request = QueryRequest::attribute(
            &schema,
            class_name,
            attribute_name,
            operator,
            query_value(value),
        )
        .map_err(into_api_error)?;
        requests.push(request);
    }
    let instances = adaptor.fetch_instances(&requests).await.map_err(into_api_error)?;
    Ok(Json(views(&adaptor.cap_results(instances))))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdenticalResponse {
    pub db_id: i64,
    /// `undefined`, `unresolvable`, `noDefiningValues` or `resolved`
    pub resolution: String,
    pub identicals: Vec<InstanceView>,
}

pub async fn fetch_identical_instances(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<DbIdsRequest>,
) -> ApiResult<Vec<IdenticalResponse>> {
    let mut out = Vec::with_capacity(request.db_ids.len());
    for db_id in request.db_ids {
        let instance = adaptor
            .cached_instance(db_id)
            .ok_or_else(|| into_api_error(AdaptorError::InstanceNotFound(db_id)))?;
        let found = adaptor
            .fetch_identical_instances(&instance)
            .await
            .map_err(into_api_error)?;
        let resolution = match &found {
            Identicals::Undefined => "undefined",
            Identicals::Unresolvable => "unresolvable",
            Identicals::NoDefiningValues => "noDefiningValues",
            Identicals::Matches(_) => "resolved",
        };
        out.push(IdenticalResponse {
            db_id,
            resolution: resolution.to_string(),
            identicals: views(found.instances()),
        });
    }
    Ok(Json(out))
}

// ---- Attribute loading ----

pub async fn load_attribute_values(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<LoadAttributesRequest>,
) -> Result<StatusCode, ApiError> {
    let instances = adaptor
        .fetch_instances_by_ids(&request.db_ids)
        .await
        .map_err(into_api_error)?;
    if request.class_attribute_names.is_empty() {
        adaptor
            .load_all_attribute_values(&instances, request.recursive)
            .await
            .map_err(into_api_error)?;
        return Ok(StatusCode::NO_CONTENT);
    }

    let schema = adaptor.schema().map_err(into_api_error)?;
    let mut attributes: Vec<Arc<SchemaAttribute>> = Vec::new();
    for pair in &request.class_attribute_names {
        let [class_name, attribute_name] = pair.as_slice() else {
            return Err(bad_request(
                "classAttributeNames entries must be [className, attributeName] pairs",
            ));
        };
        if class_name.is_empty() {
            attributes.extend(schema.original_attributes_by_name(attribute_name));
        } else {
            let class = schema.class(class_name).map_err(into_api_error)?;
            let attribute = class.attribute_or_err(attribute_name).map_err(into_api_error)?;
            attributes.push(attribute.clone());
        }
    }
    adaptor
        .load_attribute_values(&instances, &attributes, request.recursive)
        .await
        .map_err(into_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn load_reverse_attribute_values(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<InstancesAttributesRequest>,
) -> Result<StatusCode, ApiError> {
    let instances = adaptor
        .fetch_instances_by_ids(&request.db_ids)
        .await
        .map_err(into_api_error)?;
    adaptor
        .load_reverse_attribute_values_by_name(&instances, &request.attribute_names)
        .await
        .map_err(into_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Writes ----

/// Assign `values` to every named attribute of the cached instances. Values
/// of instance-typed attributes are DB_IDs of the attribute's allowed class.
pub async fn update_attributes_in_cache(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<UpdateInCacheRequest>,
) -> Result<StatusCode, ApiError> {
    if request.db_ids.is_empty()
        || request.attribute_names.is_empty()
        || request.values.is_empty()
    {
        return Err(bad_request("dbIds, attributeNames and values must not be empty"));
    }
    let schema = adaptor.schema().map_err(into_api_error)?;
    let class = schema.class(&request.class_name).map_err(into_api_error)?;
    for db_id in &request.db_ids {
        let instance = adaptor
            .get_instance(&request.class_name, *db_id)
            .map_err(into_api_error)?;
        for name in &request.attribute_names {
            let attribute = class.attribute_or_err(name).map_err(into_api_error)?;
            let mut values = Vec::with_capacity(request.values.len());
            for raw in &request.values {
                let value = if attribute.is_instance_type() {
                    let target_id = raw
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| bad_request(&format!("could not parse DB_ID in: {}", raw)))?;
                    let target_class = attribute
                        .target_class()
                        .unwrap_or(&schema.root_class().name);
                    let target = adaptor
                        .get_instance(target_class, target_id)
                        .map_err(into_api_error)?;
                    AttributeValue::Instance(target)
                } else {
                    AttributeValue::coerce(attribute, &Value::String(raw.clone()))
                        .map_err(into_api_error)?
                };
                values.push(value);
            }
            if !attribute.multiple {
                values.truncate(1);
            }
            instance.set_attribute(name, values);
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Persist cached attribute edits, one transaction per instance.
pub async fn update_attributes_in_db(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<InstancesAttributesRequest>,
) -> Result<StatusCode, ApiError> {
    for db_id in &request.db_ids {
        let instance = adaptor
            .cached_instance(*db_id)
            .ok_or_else(|| into_api_error(AdaptorError::InstanceNotFound(*db_id)))?;
        let mut tx = adaptor.begin().await.map_err(into_api_error)?;
        let mut result = Ok(());
        for name in &request.attribute_names {
            result = adaptor.update_instance_attribute(&instance, name, &mut tx).await;
            if result.is_err() {
                break;
            }
        }
        match result {
            Ok(()) => adaptor.commit(tx).await.map_err(into_api_error)?,
            Err(e) => {
                adaptor.rollback(tx).await;
                return Err(into_api_error(e));
            }
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

fn paired_instances(
    adaptor: &GraphAdaptor,
    request: &InstancesClassRequest,
) -> Result<Vec<InstanceRef>, ApiError> {
    adaptor
        .get_instances(&request.db_ids, &request.class_names)
        .map_err(into_api_error)
}

/// Force-store the client's instances in one transaction; returns their DB_IDs.
pub async fn store_instances(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<InstancesClassRequest>,
) -> ApiResult<Vec<i64>> {
    let instances = paired_instances(&adaptor, &request)?;
    let mut tx = adaptor.begin().await.map_err(into_api_error)?;
    match adaptor.store_local_instances(&instances, &mut tx).await {
        Ok(ids) => {
            adaptor.commit(tx).await.map_err(into_api_error)?;
            Ok(Json(ids))
        }
        Err(e) => {
            adaptor.rollback(tx).await;
            Err(into_api_error(e))
        }
    }
}

pub async fn update_instances(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<InstancesClassRequest>,
) -> Result<StatusCode, ApiError> {
    let instances = paired_instances(&adaptor, &request)?;
    if let Some(deflated) = instances.iter().find(|i| !i.is_inflated()) {
        return Err(bad_request(&format!(
            "instance {} is not inflated - cannot update",
            deflated.db_id().unwrap_or_default()
        )));
    }
    let mut tx = adaptor.begin().await.map_err(into_api_error)?;
    let mut result = Ok(());
    for instance in &instances {
        result = adaptor.update_instance(instance, &mut tx).await;
        if result.is_err() {
            break;
        }
    }
    match result {
        Ok(()) => adaptor.commit(tx).await.map_err(into_api_error)?,
        Err(e) => {
            adaptor.rollback(tx).await;
            return Err(into_api_error(e));
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_instances(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<InstancesClassRequest>,
) -> Result<StatusCode, ApiError> {
    let instances = paired_instances(&adaptor, &request)?;
    let mut tx = adaptor.begin().await.map_err(into_api_error)?;
    let mut result = Ok(());
    for instance in &instances {
        result = adaptor.delete_instance(instance, &mut tx).await;
        if result.is_err() {
            break;
        }
    }
    match result {
        Ok(()) => adaptor.commit(tx).await.map_err(into_api_error)?,
        Err(e) => {
            adaptor.rollback(tx).await;
            return Err(into_api_error(e));
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Store one instance and point an attribute of another at it, atomically.
pub async fn store_update_instances(
    State(adaptor): State<AppState>,
    RequestJson(request): RequestJson<StoreUpdateRequest>,
) -> ApiResult<i64> {
    let stored = adaptor
        .get_instance(&request.store_class_name, request.store_db_id)
        .map_err(into_api_error)?;
    let updated = adaptor
        .get_instance(&request.update_class_name, request.update_db_id)
        .map_err(into_api_error)?;
    updated.set_attribute(&request.update_attribute_name, vec![stored.clone().into()]);

    let mut tx = adaptor.begin().await.map_err(into_api_error)?;
    let result = match adaptor.store_instance(&stored, false, &mut tx, true).await {
        Ok(id) => adaptor
            .update_instance_attribute(&updated, &request.update_attribute_name, &mut tx)
            .await
            .map(|_| id),
        Err(e) => Err(e),
    };
    match result {
        Ok(id) => {
            adaptor.commit(tx).await.map_err(into_api_error)?;
            Ok(Json(id))
        }
        Err(e) => {
            adaptor.rollback(tx).await;
            Err(into_api_error(e))
        }
    }
}

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::api::handlers::{self, AppState};

pub fn create_router() -> Router<AppState> {
    let data = Router::new()
        // Schema and bookkeeping
        .route("/fetch/schema", get(handlers::get_schema))
        .route("/fetch/schema/timestamp", get(handlers::get_schema_timestamp))
        .route("/fetch/releasenumber", get(handlers::get_release_number))
        .route("/fetch/maxdbid", get(handlers::get_max_db_id))
        .route("/fetch/ewas_modifications", get(handlers::fetch_ewas_modifications))
        .route(
            "/fetch/stable_identifiers_with_dup_dbids",
            get(handlers::fetch_stable_identifiers_with_duplicate_db_ids),
        )
        .route("/cache/refresh", get(handlers::refresh_cache))
        .route("/cache/use/:flag", get(handlers::set_use_cache))
        .route("/cache/isused", get(handlers::is_cache_used))
        .route("/cleanup", get(handlers::cleanup))
        .route("/mint/dbid", get(handlers::mint_db_id))
        // Reads
        .route("/instances/fetch/existingdbids", post(handlers::fetch_existing_db_ids))
        .route("/instances/fetch/byclassname", post(handlers::fetch_instances_by_class_name))
        .route(
            "/instances/fetch/byattributevalues",
            post(handlers::fetch_instances_by_attribute_values),
        )
        .route("/instances/fetch/identical", post(handlers::fetch_identical_instances))
        .route("/instances/fetch/:db_id", get(handlers::fetch_instance))
        .route("/instances/get/byclassname", post(handlers::get_instances_by_class_name))
        .route("/instances/count", get(handlers::all_instance_counts))
        .route("/instances/:class_name/count", get(handlers::class_instance_count))
        // Attribute loading and cache edits
        .route("/instances/attributes/load", post(handlers::load_attribute_values))
        .route(
            "/instances/attributes/reverse/load",
            post(handlers::load_reverse_attribute_values),
        )
        .route(
            "/instances/attributes/updateincache",
            post(handlers::update_attributes_in_cache),
        )
        .route("/instances/attributes/updateindb", post(handlers::update_attributes_in_db))
        // Writes
        .route("/instances/store", post(handlers::store_instances))
        .route("/instances/update", post(handlers::update_instances))
        .route("/instances/delete", post(handlers::delete_instances))
        .route("/instances/storeupdate", post(handlers::store_update_instances));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/data", data)
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{AdaptorSettings, GraphAdaptor};
    use crate::seed::pathway_schema;
    use crate::store::MemoryGraphStore;
    use axum::{body::Body, http::Request, http::StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let adaptor = GraphAdaptor::with_schema(
            Arc::new(MemoryGraphStore::new()),
            "graph.db",
            pathway_schema(),
            AdaptorSettings::default(),
        );
        create_router().with_state(adaptor)
    }

    async fn status(uri: &str) -> StatusCode {
        app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_static_segments_win_over_db_id() {
        // A GET on a POST-only static route must not fall through to /:db_id
        assert_eq!(
            status("/data/instances/fetch/existingdbids").await,
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(status("/data/instances/fetch/12").await, StatusCode::NOT_FOUND);
        assert_eq!(status("/data/instances/fetch/abc").await, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cache_flag_round_trip() {
        let app = app();
        let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        let off = app.clone().oneshot(get("/data/cache/use/false")).await.unwrap();
        assert_eq!(off.status(), StatusCode::NO_CONTENT);

        let used = app.oneshot(get("/data/cache/isused")).await.unwrap();
        let body = axum::body::to_bytes(used.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"false");
    }

    #[tokio::test]
    async fn test_maintenance_reads_are_get_routes() {
        for uri in [
            "/data/fetch/ewas_modifications",
            "/data/fetch/stable_identifiers_with_dup_dbids",
        ] {
            let response = app()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&body[..], b"[]");
        }
    }
}

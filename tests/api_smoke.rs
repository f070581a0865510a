use std::sync::Arc;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use curator_graph::routes::create_router;
use curator_graph::seed::{load_demo_data, pathway_schema};
use curator_graph::{AdaptorSettings, GraphAdaptor, MemoryGraphStore};

// Test client wrapper for making API calls
struct TestClient {
    client: Client,
    base_url: String,
}

impl TestClient {
    /// Serve a seeded in-memory knowledgebase on an ephemeral port.
    async fn spawn() -> Self {
        let adaptor = GraphAdaptor::with_schema(
            Arc::new(MemoryGraphStore::new()),
            "graph.db",
            pathway_schema(),
            AdaptorSettings::default(),
        );
        load_demo_data(&adaptor).await.unwrap();
        let app = create_router().with_state(adaptor);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            client: Client::new(),
            base_url: format!("http://{}", address),
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn find(&self, class_name: &str, attribute: &str, value: &str) -> Vec<Value> {
        let response = self
            .post(
                "/data/instances/fetch/byattributevalues",
                json!([[class_name, attribute, "=", value]]),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.unwrap()
    }
}

#[tokio::test]
async fn test_health_and_bookkeeping() {
    let client = TestClient::spawn().await;

    let health: Value = client.get("/health").await.json().await.unwrap();
    assert_eq!(health["status"], "healthy");

    let release: Option<i64> = client.get("/data/fetch/releasenumber").await.json().await.unwrap();
    assert_eq!(release, Some(86));

    let count: i64 = client.get("/data/instances/Pathway/count").await.json().await.unwrap();
    assert_eq!(count, 2);

    let response = client.get("/data/instances/NoSuchClass/count").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let used: bool = client.get("/data/cache/isused").await.json().await.unwrap();
    assert!(used);
}

#[tokio::test]
async fn test_fetch_by_attribute_and_by_id() {
    let client = TestClient::spawn().await;

    let pathways = client.find("Pathway", "name", "Apoptosis").await;
    assert_eq!(pathways.len(), 1);
    assert_eq!(pathways[0]["className"], "Pathway");
    let db_id = pathways[0]["dbId"].as_i64().unwrap();

    let fetched: Value = client
        .get(&format!("/data/instances/fetch/{}", db_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["displayName"], "Apoptosis");

    let missing = client.get("/data/instances/fetch/999999").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let existing: Vec<i64> = client
        .post("/data/instances/fetch/existingdbids", json!({ "dbIds": [db_id, 999999] }))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(existing, vec![db_id]);
}

#[tokio::test]
async fn test_unknown_operator_is_rejected() {
    let client = TestClient::spawn().await;
    let response = client
        .post(
            "/data/instances/fetch/byattributevalues",
            json!([["Pathway", "name", "SOUNDS LIKE", "Apoptosis"]]),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_identical_compartment_is_resolved_without_self_match() {
    let client = TestClient::spawn().await;
    let cytosol = client.find("Compartment", "name", "cytosol").await;
    let db_id = cytosol[0]["dbId"].as_i64().unwrap();

    let results: Vec<Value> = client
        .post("/data/instances/fetch/identical", json!({ "dbIds": [db_id] }))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(results[0]["resolution"], "resolved");
    assert!(results[0]["identicals"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_local_instance_is_edited_in_cache_then_stored() {
    let client = TestClient::spawn().await;
    let local = json!({ "dbIds": [-1], "classNames": ["Compartment"] });

    let created = client.post("/data/instances/get/byclassname", local.clone()).await;
    assert_eq!(created.status(), StatusCode::OK);

    let edited = client
        .post(
            "/data/instances/attributes/updateincache",
            json!({
                "dbIds": [-1],
                "className": "Compartment",
                "attributeNames": ["name"],
                "values": ["mitochondrion"],
            }),
        )
        .await;
    assert_eq!(edited.status(), StatusCode::NO_CONTENT);

    let ids: Vec<i64> = client
        .post("/data/instances/store", local)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
    assert!(ids[0] > 0);

    let stored = client.find("Compartment", "name", "mitochondrion").await;
    assert_eq!(stored[0]["dbId"].as_i64(), Some(ids[0]));
}

pub mod api;
pub mod config;
pub mod cypher;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use api::routes;
pub use error::{AdaptorError, AdaptorResult, StoreError};
pub use logic::{AdaptorSettings, GraphAdaptor, Identicals, RetryPolicy, Transaction};
pub use model::*;
pub use store::{GraphStore, GraphTransaction, MemoryGraphStore, Neo4jGraphStore};

use std::sync::Arc;

use crate::config::{AppConfig, Backend};
use crate::model::schema::Schema;

/// Connect the configured backend and load the schema into a new adaptor.
/// The memory backend is seeded with demo data when `LOAD_SEED_DATA=true`.
pub async fn build_adaptor(config: &AppConfig) -> anyhow::Result<GraphAdaptor> {
    let schema = match &config.graph.schema_path {
        Some(path) => Schema::from_json(&std::fs::read_to_string(path)?)?,
        None => seed::pathway_schema(),
    };
    let settings = config.adaptor.settings();
    let adaptor = match config.graph.backend {
        Backend::Memory => {
            let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
            let adaptor =
                GraphAdaptor::with_schema(store, &config.graph.database, schema, settings);
            if std::env::var("LOAD_SEED_DATA").unwrap_or_default() == "true" {
                log::info!("loading demo data");
                seed::load_demo_data(&adaptor).await?;
                adaptor.refresh_caches();
            }
            adaptor
        }
        Backend::Neo4j => {
            let store = Neo4jGraphStore::connect(
                &config.graph.uri,
                &config.graph.user,
                &config.graph.password,
            )
            .await?;
            GraphAdaptor::with_schema(Arc::new(store), &config.graph.database, schema, settings)
        }
    };
    Ok(adaptor)
}

// Function for integration testing
pub async fn run_server() -> anyhow::Result<()> {
    use axum::serve;
    use tokio::net::TcpListener;

    dotenvy::dotenv().ok();
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let config = AppConfig::load()?;
    let adaptor = build_adaptor(&config).await?;
    let app = crate::api::routes::create_router().with_state(adaptor);

    let listener = TcpListener::bind(&config.server_address()).await?;
    serve(listener, app).await?;
    Ok(())
}

use axum::serve;
use curator_graph::api::routes::create_router;
use curator_graph::build_adaptor;
use curator_graph::config::AppConfig;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("neo4rs", LevelFilter::Warn)
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "configuration loaded: server={} backend={:?} database={}",
        config.server_address(),
        config.graph.backend,
        config.graph.database
    );

    let adaptor = build_adaptor(&config).await?;
    let app = create_router().with_state(adaptor.clone());

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("curator-graph running on http://{}", bind_address);

    serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    adaptor.cleanup().await?;
    Ok(())
}

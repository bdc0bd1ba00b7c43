/// Server setup and initialization
///
/// Wires together the database, flow registry, engine service, sweep scheduler and
/// HTTP routes. Provides the application factory used by `main` and by tests.

use crate::{
    api::{api_routes, AppState},
    config::Config,
    project::Database,
    runtime::{FlowService, HttpTransport, LogTransport, SweepScheduler, Transport},
    workflow::{FlowRegistry, FlowStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Open storage, load published flows and build the engine service
pub async fn build_service(config: &Config, database: &Database, transport: Arc<dyn Transport>) -> Result<Arc<FlowService>> {
    tracing::info!("📊 Initializing flow registry");
    let registry = Arc::new(FlowRegistry::new(FlowStorage::new(database.pool().clone())));

    tracing::info!("📥 Loading published flows from storage");
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load flows from storage: {}", e))?;

    tracing::info!("🚀 Initializing flow service");
    Ok(Arc::new(FlowService::new(database, registry, transport, &config.engine)))
}

/// Router with every endpoint, bound to `service`
pub fn create_router(service: Arc<FlowService>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(api_routes(AppState { service }))
}

/// Create the main Axum application with all routes and background jobs
pub async fn create_app(config: Config) -> Result<Router> {
    let database = Database::connect(&config.database.url).await?;

    let transport: Arc<dyn Transport> = match &config.transport.outbound_url {
        Some(url) => {
            tracing::info!("📤 Delivering outbound messages to {}", url);
            Arc::new(HttpTransport::new(url.clone()))
        }
        None => {
            tracing::warn!("⚠️ No outbound URL configured; outbound messages are only logged");
            Arc::new(LogTransport)
        }
    };
    let service = build_service(&config, &database, transport).await?;

    tracing::info!("⏰ Initializing expired-wait sweep");
    let sweep = Arc::new(
        SweepScheduler::new(Arc::clone(&service), config.scheduler.sweep_schedule.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize sweep scheduler: {}", e))?,
    );
    tokio::spawn(async move {
        if let Err(e) = sweep.start().await {
            tracing::error!("❌ Failed to start sweep scheduler: {}", e);
        }
    });

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = create_router(service);
    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting chatflow server...");
    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

//! services/client/src/bin/client.rs

use axum::http::{HeaderValue, Method};
use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use study_client_lib::{
    adapters::{PgAuth, PgRecordStore, PgRelay, TracingCues},
    bridge::ws_handler,
    config::{Config, ConfigError},
    error::ClientError,
    session::{Ports, StudyClient},
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting study client...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PgRecordStore::new(db_pool.clone()));
    info!("Running database migrations...");
    store.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Wire the Session Client ---
    let client = StudyClient::new(
        Ports {
            store,
            relay: Arc::new(PgRelay::new(db_pool.clone())),
            auth: Arc::new(PgAuth::new(db_pool)),
            cues: Arc::new(TracingCues),
        },
        config.session.clone(),
    );
    client.start().await?;

    // --- 4. Create the Bridge Router ---
    let origin = config.allowed_origin.parse::<HeaderValue>().map_err(|e| {
        ConfigError::InvalidValue("ALLOWED_ORIGIN".to_string(), e.to_string())
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::OPTIONS]);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(client.clone());

    // --- 5. Start the Server ---
    info!("Bridge listening on ws://{}/ws", config.bridge_address);
    let listener = tokio::net::TcpListener::bind(&config.bridge_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received.");
        })
        .await?;

    client.shutdown().await;
    Ok(())
}

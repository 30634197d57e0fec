use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use import_progress::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        gateway::{spawn_redis_forwarder, ProgressHub},
        job_status::JobStatusService,
        store::RedisJobStore,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing progress gateway");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to Redis job store");
    let store = Arc::new(
        RedisJobStore::connect(&config.redis_url)
            .await
            .expect("Failed to connect to Redis"),
    );
    let status = JobStatusService::new(store.clone(), config.job_processing());

    // Bridge the Redis progress channel into the in-process fan-out
    let hub = ProgressHub::new();
    let shutdown = CancellationToken::new();
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis connection string");
    let forwarder = spawn_redis_forwarder(
        redis_client,
        config.progress_channel.clone(),
        hub.clone(),
        status.config().retry_delay,
        shutdown.clone(),
    );

    let state = AppState::new(store, status, hub);

    let app = routes::router(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Progress gateway listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    let _ = forwarder.await;
    tracing::info!("Progress gateway stopped");
}

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod config;
mod db;
mod decimal;
mod error;
mod events;
mod metrics;
mod models;
mod services;
mod utils;
mod websocket;

use crate::config::AppConfig;
use crate::db::Database;
use crate::events::EventSink;
use crate::services::matching::{BookRegistry, ExchangeEngine};
use metrics_exporter_prometheus::PrometheusHandle;

pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub engine: Arc<ExchangeEngine>,
    pub events: Arc<EventSink>,
    pub metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foresight_exchange=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting Foresight Exchange v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    // Initialize metrics exporter
    let metrics_handle = metrics::init_metrics();

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    tracing::info!("Database connected");

    // Connect Redis for the external event bus (graceful degradation)
    let redis = match &config.redis_url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(manager) => {
                    tracing::info!("Event bus connected to Redis at {url}");
                    Some(manager)
                }
                Err(err) => {
                    tracing::warn!("Redis unavailable, events stay in-process only: {err}");
                    None
                }
            },
            Err(err) => {
                tracing::warn!("Invalid Redis URL, events stay in-process only: {err}");
                None
            }
        },
        None => {
            tracing::warn!("No REDIS_URL configured, events stay in-process only");
            None
        }
    };
    let events = Arc::new(EventSink::new(redis));

    // Rebuild the in-memory books from open orders; the store is the
    // source of truth across restarts.
    let registry = Arc::new(BookRegistry::new());
    match registry.warm_up(&db.pool).await {
        Ok(count) => {
            if count > 0 {
                tracing::info!("Recovered {count} open orders into the books");
            } else {
                tracing::info!("No open orders to recover");
            }
        }
        Err(err) => {
            tracing::error!("Failed to recover open orders: {err}");
            tracing::warn!("Starting with empty books");
        }
    }
    metrics::record_active_markets(registry.market_count());

    // Initialize the matching engine
    let engine = ExchangeEngine::new(
        db.pool.clone(),
        registry.clone(),
        events.clone(),
        (&config).into(),
    );
    tracing::info!("Matching engine initialized");

    // Reap expired idempotency keys in the background
    let reaper_pool = db.pool.clone();
    let retention = chrono::Duration::hours(config.idempotency_retention_hours);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match db::store::reap_idempotency_keys(&reaper_pool, retention).await {
                Ok(0) => {}
                Ok(reaped) => tracing::debug!("reaped {reaped} expired idempotency keys"),
                Err(err) => tracing::warn!("idempotency reaper failed: {err}"),
            }
        }
    });

    // Build application state
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        engine,
        events,
        metrics_handle,
    });

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .nest("/api/v1", api::routes::create_router(state.clone()))
        .nest("/ws", websocket::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

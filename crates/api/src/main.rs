//! Hookrelay API Server
//!
//! Receives tenant webhooks, reconciles gateway payments and serves the
//! admin endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, Method};
use axum::middleware;
use hookrelay_api::{
    create_router, security::security_headers_middleware, AppState, Config, StoreBackend,
};
use hookrelay_reconcile::{
    HttpPaymentGateway, InMemoryStore, InvariantChecker, ReconcileServices, Stores,
};
use hookrelay_shared::{
    create_migration_pool, create_pool, run_migrations, RateLimiter, RedisRateLimitStore,
};
use tokio::time::{interval, Duration};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Expired rate-limit counters are swept this often
const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hookrelay_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Hookrelay API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(config = ?config, "Configuration loaded");

    let (stores, pool) = match &config.store {
        StoreBackend::Postgres {
            database_url,
            direct_url,
        } => {
            tracing::info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            tracing::info!("Database connection established");

            if config.run_migrations {
                // Direct URL bypasses the pooler, which does not support prepared statements
                let migration_pool =
                    create_migration_pool(direct_url.as_deref().unwrap_or(database_url)).await?;
                run_migrations(&migration_pool).await?;
                migration_pool.close().await;
            } else {
                tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
            }

            (Stores::postgres(pool.clone()), Some(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store - nothing survives a restart");
            (Stores::in_memory(Arc::new(InMemoryStore::new())), None)
        }
    };

    let gateway = Arc::new(HttpPaymentGateway::new(
        &config.gateway_base_url,
        &config.gateway_access_token,
    )?);
    let services = ReconcileServices::new(stores, gateway)?;

    let rate_limiter = match &config.redis_url {
        Some(redis_url) => {
            let store = RedisRateLimitStore::connect(redis_url).await?;
            tracing::info!("Rate limiter using Redis counters");
            RateLimiter::new(Arc::new(store))
        }
        None => {
            tracing::info!("Rate limiter using in-memory counters");
            RateLimiter::new_in_memory()
        }
    };

    // Sweep expired rate-limit windows
    let sweeper = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = interval(RATE_LIMIT_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = sweeper.cleanup().await;
            if removed > 0 {
                tracing::debug!(removed, "Rate limit counters swept");
            }
        }
    });

    let invariants = pool.map(|pool| Arc::new(InvariantChecker::new(pool)));
    let state = AppState::new(config.clone(), services, rate_limiter, invariants);

    // Build CORS layer - restrict to allowed origins only
    let allowed_origins: Vec<axum::http::HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE, header::RETRY_AFTER]);

    let app = create_router(state)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

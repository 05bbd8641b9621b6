#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! StageRight API Server
//!
//! Serves the billing webhook, cancellation, entitlement, and admin
//! reconciliation endpoints.

mod config;
mod error;
mod routes;
mod state;

use stageright_shared::{create_migration_pool, create_pool, run_migrations};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stageright_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting StageRight API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Run migrations using the direct URL where available (bypasses
    // PgBouncer, which doesn't support prepared statements)
    let migration_url = config
        .database_direct_url
        .as_ref()
        .unwrap_or(&config.database_url);
    let migration_pool = create_migration_pool(migration_url).await?;
    run_migrations(&migration_pool).await?;
    tracing::info!("Migrations applied");

    let state = AppState::new(pool, config.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(bind_address = %config.bind_address, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}

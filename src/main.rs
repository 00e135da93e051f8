//! Fieldroute Worker - route planning backend for field-service technicians
//!
//! Builds daily technician routes from service orders, optimizes them
//! through external routing providers and keeps the chosen orders in
//! Postgres. The worker connects to NATS and answers requests from the
//! planning client.

mod cli;
mod config;
mod db;
mod defaults;
mod handlers;
mod services;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::services::concurrency::OptimizationController;
use crate::services::geocoding::{create_geocoder, GeocodingCoordinator};
use crate::services::optimizer::RouteOptimizer;
use crate::services::planner::RoutePlanner;
use crate::services::route_builder::BuilderOptions;
use crate::services::route_store::{InMemoryRouteStore, PgRouteStore, RouteStore};
use crate::services::routing::{create_routing_providers, RoutingGateway};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so LOGS_DIR from .env is honoured
    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fieldroute_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    match cli.command() {
        Command::Migrate => migrate(&config).await,
        Command::Serve => serve(config).await,
    }
}

async fn migrate(config: &Config) -> Result<()> {
    let pool = db::create_pool(config.require_database_url()?, config.db_max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db::run_migrations(&pool).await
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Fieldroute Worker...");

    let store: Arc<dyn RouteStore> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.db_max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            info!("Connected to PostgreSQL");

            db::run_migrations(&pool).await?;

            Arc::new(PgRouteStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, optimized route orders will only live in memory");
            Arc::new(InMemoryRouteStore::new())
        }
    };

    let providers = create_routing_providers(&config)?;
    let gateway = Arc::new(RoutingGateway::new(
        providers,
        Duration::from_secs(config.routing_timeout_secs),
    ));
    let provider_names = gateway.provider_names();
    info!("Routing chain: {:?} then local estimate", provider_names);

    let geocoder = create_geocoder()?;
    info!("Geocoder initialized: {}", geocoder.name());

    let optimizer = RouteOptimizer::new(gateway, store.clone(), OptimizationController::new());
    let planner = Arc::new(RoutePlanner::new(
        BuilderOptions {
            fallback_origin: config.fallback_origin,
        },
        store,
        optimizer,
        GeocodingCoordinator::new(geocoder),
    ));

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (&config.nats_user, &config.nats_password) {
        (Some(user), Some(password)) => async_nats::ConnectOptions::new()
            .user_and_password(user.clone(), password.clone())
            .connect(&config.nats_url)
            .await
            .context("Failed to connect to NATS")?,
        _ => async_nats::connect(&config.nats_url)
            .await
            .context("Failed to connect to NATS")?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    // Start message handlers
    let handler_result = handlers::start_handlers(nats_client, planner, provider_names).await;

    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    Ok(())
}

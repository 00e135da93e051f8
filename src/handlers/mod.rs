//! NATS message handlers

pub mod geocode;
pub mod ping;
pub mod route;

use std::sync::Arc;

use anyhow::Result;
use async_nats::subject::ToSubject;
use async_nats::Client;
use serde::Serialize;
use tokio::select;
use tracing::{error, info};
use uuid::Uuid;

use crate::services::planner::RoutePlanner;
use crate::types::ErrorResponse;

pub const SUBJECT_PING: &str = "fieldroute.ping";
pub const SUBJECT_ROUTES_LOAD: &str = "fieldroute.routes.load";
pub const SUBJECT_ROUTES_LIST: &str = "fieldroute.routes.list";
pub const SUBJECT_OPTIMIZE: &str = "fieldroute.route.optimize";
pub const SUBJECT_OPTIMIZE_ALL: &str = "fieldroute.route.optimize_all";
pub const SUBJECT_OPTIMIZE_ALL_STATUS: &str = "fieldroute.route.optimize_all.status";
pub const SUBJECT_REORDER: &str = "fieldroute.route.reorder";
pub const SUBJECT_GEOCODE: &str = "fieldroute.route.geocode";
pub const SUBJECT_GEOCODE_STATUS_PREFIX: &str = "fieldroute.geocode.status";

/// Serialize and publish a payload to a subject
pub(crate) async fn publish_json<S: ToSubject, T: Serialize>(
    client: &Client,
    subject: S,
    payload: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(payload)?;
    client.publish(subject, bytes.into()).await?;
    Ok(())
}

pub(crate) async fn reply_error(
    client: &Client,
    reply: impl ToSubject,
    request_id: Uuid,
    code: &str,
    message: String,
) -> Result<()> {
    let error = ErrorResponse::new(request_id, code, message);
    publish_json(client, reply, &error).await
}

/// Start all message handlers
pub async fn start_handlers(client: Client, planner: Arc<RoutePlanner>, providers: Vec<String>) -> Result<()> {
    info!("Starting message handlers...");

    // Subscribe to all subjects
    let ping_sub = client.subscribe(SUBJECT_PING).await?;
    let load_sub = client.subscribe(SUBJECT_ROUTES_LOAD).await?;
    let list_sub = client.subscribe(SUBJECT_ROUTES_LIST).await?;
    let optimize_sub = client.subscribe(SUBJECT_OPTIMIZE).await?;
    let optimize_all_sub = client.subscribe(SUBJECT_OPTIMIZE_ALL).await?;
    let reorder_sub = client.subscribe(SUBJECT_REORDER).await?;
    let geocode_sub = client.subscribe(SUBJECT_GEOCODE).await?;

    info!("Subscribed to NATS subjects");

    let client_ping = client.clone();
    let ping_handle = tokio::spawn(async move {
        ping::handle_ping(client_ping, ping_sub, providers).await
    });

    let client_load = client.clone();
    let planner_load = planner.clone();
    let load_handle = tokio::spawn(async move {
        route::handle_load(client_load, load_sub, planner_load).await
    });

    let client_list = client.clone();
    let planner_list = planner.clone();
    let list_handle = tokio::spawn(async move {
        route::handle_list(client_list, list_sub, planner_list).await
    });

    let client_optimize = client.clone();
    let planner_optimize = planner.clone();
    let optimize_handle = tokio::spawn(async move {
        route::handle_optimize(client_optimize, optimize_sub, planner_optimize).await
    });

    let client_optimize_all = client.clone();
    let planner_optimize_all = planner.clone();
    let optimize_all_handle = tokio::spawn(async move {
        route::handle_optimize_all(client_optimize_all, optimize_all_sub, planner_optimize_all).await
    });

    let client_reorder = client.clone();
    let planner_reorder = planner.clone();
    let reorder_handle = tokio::spawn(async move {
        route::handle_reorder(client_reorder, reorder_sub, planner_reorder).await
    });

    let client_geocode = client.clone();
    let geocode_handle = tokio::spawn(async move {
        geocode::handle_geocode_route(client_geocode, geocode_sub, planner).await
    });

    info!("All handlers started");

    // Any handler exiting means its subscription is gone
    select! {
        result = ping_handle => {
            error!("Ping handler finished: {:?}", result);
        }
        result = load_handle => {
            error!("Routes load handler finished: {:?}", result);
        }
        result = list_handle => {
            error!("Routes list handler finished: {:?}", result);
        }
        result = optimize_handle => {
            error!("Route optimize handler finished: {:?}", result);
        }
        result = optimize_all_handle => {
            error!("Route optimize all handler finished: {:?}", result);
        }
        result = reorder_handle => {
            error!("Route reorder handler finished: {:?}", result);
        }
        result = geocode_handle => {
            error!("Route geocode handler finished: {:?}", result);
        }
    }

    Ok(())
}

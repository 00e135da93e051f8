//! Route planning message handlers

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{publish_json, reply_error, SUBJECT_OPTIMIZE_ALL_STATUS};
use crate::services::optimizer::OptimizeError;
use crate::services::planner::RoutePlanner;
use crate::types::{
    BatchOptimizeProgress, EmptyPayload, ErrorResponse, LoadRoutesRequest, OptimizeAllRequest,
    OptimizeRouteRequest, ReorderRouteRequest, Request, Route, SuccessResponse,
};

/// Map an optimization error onto the response envelope
pub fn optimize_error_response(request_id: Uuid, err: &OptimizeError) -> ErrorResponse {
    ErrorResponse::new(request_id, err.code(), err.to_string())
}

/// Routes as sent to clients
fn routes_payload(routes: &[Route], busy_route_ids: &[u32]) -> serde_json::Value {
    serde_json::json!({ "routes": routes, "busyRouteIds": busy_route_ids })
}

/// Handle routes.load messages: replace the service orders and rebuild
pub async fn handle_load(
    client: Client,
    mut subscriber: Subscriber,
    planner: Arc<RoutePlanner>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received routes.load message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<LoadRoutesRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse routes.load request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let routes = planner.load(request.payload.orders).await;
        info!("Built {} routes", routes.len());

        let busy = planner.busy_route_ids();
        let response = SuccessResponse::new(request.id, routes_payload(&routes, &busy));
        publish_json(&client, reply, &response).await?;
    }

    Ok(())
}

/// Handle routes.list messages
pub async fn handle_list(
    client: Client,
    mut subscriber: Subscriber,
    planner: Arc<RoutePlanner>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => continue,
        };

        let request: Request<EmptyPayload> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let routes = planner.routes();
        let busy = planner.busy_route_ids();
        let response = SuccessResponse::new(request.id, routes_payload(&routes, &busy));
        publish_json(&client, reply, &response).await?;
    }

    Ok(())
}

/// Handle route.optimize messages.
///
/// Each request runs in its own task so that a second request for a busy
/// route reaches the concurrency controller and is rejected instead of
/// queueing behind the first.
pub async fn handle_optimize(
    client: Client,
    mut subscriber: Subscriber,
    planner: Arc<RoutePlanner>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<OptimizeRouteRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse route.optimize request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let client = client.clone();
        let planner = planner.clone();
        tokio::spawn(async move {
            let route_id = request.payload.route_id;
            let published = match planner.optimize_route(route_id).await {
                Ok(response) => {
                    if let Some(warning) = &response.warning {
                        warn!("Route {}: {}", route_id, warning);
                    }
                    publish_json(&client, reply, &SuccessResponse::new(request.id, response)).await
                }
                Err(e) => {
                    publish_json(&client, reply, &optimize_error_response(request.id, &e)).await
                }
            };
            if let Err(e) = published {
                error!("Failed to reply to route.optimize: {}", e);
            }
        });
    }

    Ok(())
}

/// Handle route.optimize_all messages. Progress is published on
/// `SUBJECT_OPTIMIZE_ALL_STATUS` after every route.
pub async fn handle_optimize_all(
    client: Client,
    mut subscriber: Subscriber,
    planner: Arc<RoutePlanner>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => continue,
        };

        let request: Request<OptimizeAllRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse route.optimize_all request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let client = client.clone();
        let planner = planner.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel::<BatchOptimizeProgress>();

            let status_client = client.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    if let Err(e) =
                        publish_json(&status_client, SUBJECT_OPTIMIZE_ALL_STATUS, &progress).await
                    {
                        warn!("Failed to publish optimize all progress: {}", e);
                    }
                }
            });

            let outcome = planner.optimize_all(request.payload.date, Some(&tx)).await;
            drop(tx);
            let _ = forwarder.await;

            let published = match outcome {
                Ok(report) => {
                    let message = report.summary();
                    let payload = serde_json::json!({ "report": report, "message": message });
                    publish_json(&client, reply, &SuccessResponse::new(request.id, payload)).await
                }
                Err(e) => publish_json(&client, reply, &optimize_error_response(request.id, &e)).await,
            };
            if let Err(e) = published {
                error!("Failed to reply to route.optimize_all: {}", e);
            }
        });
    }

    Ok(())
}

/// Handle route.reorder messages (manual drag and drop order)
pub async fn handle_reorder(
    client: Client,
    mut subscriber: Subscriber,
    planner: Arc<RoutePlanner>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => continue,
        };

        let request: Request<ReorderRouteRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse route.reorder request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let ReorderRouteRequest { route_id, stop_ids } = request.payload;
        match planner.reorder_route(route_id, stop_ids).await {
            Ok(response) => {
                publish_json(&client, reply, &SuccessResponse::new(request.id, response)).await?;
            }
            Err(e) => {
                publish_json(&client, reply, &optimize_error_response(request.id, &e)).await?;
            }
        }
    }

    Ok(())
}

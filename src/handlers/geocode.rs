//! Geocoding job handler
//!
//! `route.geocode` replies right away with a job id; progress for the job is
//! published on `fieldroute.geocode.status.<jobId>` and the routes are
//! rebuilt once the batch finishes.

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::route::optimize_error_response;
use super::{publish_json, reply_error, SUBJECT_GEOCODE_STATUS_PREFIX};
use crate::services::planner::RoutePlanner;
use crate::types::{
    GeocodeJobStatusUpdate, GeocodeJobSubmitResponse, GeocodeProgress, GeocodeRouteRequest,
    Request, SuccessResponse,
};

pub fn status_subject(job_id: Uuid) -> String {
    format!("{}.{}", SUBJECT_GEOCODE_STATUS_PREFIX, job_id)
}

/// Handle route.geocode messages
pub async fn handle_geocode_route(
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

        let request: Request<GeocodeRouteRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse route.geocode request: {}", e);
                reply_error(&client, reply, Uuid::nil(), "INVALID_REQUEST", e.to_string()).await?;
                continue;
            }
        };

        let items = match planner.geocode_items(request.payload.route_id) {
            Ok(items) => items,
            Err(e) => {
                publish_json(&client, reply, &optimize_error_response(request.id, &e)).await?;
                continue;
            }
        };

        let job_id = Uuid::new_v4();
        let submitted = GeocodeJobSubmitResponse {
            job_id,
            total_count: items.len() as u32,
        };
        publish_json(&client, reply, &SuccessResponse::new(request.id, submitted)).await?;

        info!(
            "Geocode job {} started for route {} with {} addresses",
            job_id,
            request.payload.route_id,
            items.len()
        );

        let client = client.clone();
        let planner = planner.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel::<GeocodeProgress>();
            let subject = status_subject(job_id);

            let status_client = client.clone();
            let forwarder = tokio::spawn(async move {
                // One publisher keeps updates in emission order
                while let Some(progress) = rx.recv().await {
                    let update = GeocodeJobStatusUpdate::new(job_id, progress);
                    if let Err(e) = publish_json(&status_client, subject.clone(), &update).await {
                        warn!("Failed to publish geocode status for job {}: {}", job_id, e);
                    }
                }
            });

            let report = planner.geocode(items, Some(&tx)).await;
            drop(tx);
            let _ = forwarder.await;

            info!(
                "Geocode job {} done: {} resolved, {} failed",
                job_id,
                report.resolved.len(),
                report.failed.len()
            );
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_subject_includes_job_id() {
        let id = Uuid::from_u128(0xabc);
        assert_eq!(
            status_subject(id),
            "fieldroute.geocode.status.00000000-0000-0000-0000-000000000abc"
        );
    }
}

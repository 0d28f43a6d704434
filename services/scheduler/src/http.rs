//! HTTP surface of the placement service.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tracing::error;

use crate::engine::{ScheduleRequest, ScheduleResponse, Scheduler};
use crate::metrics;
use crate::reservations::{self, Reservation, ReservationStats};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> impl IntoResponse {
    (
        code,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

#[derive(Debug, Serialize)]
struct ScheduledResourcesResponse {
    resources: HashMap<String, Vec<Reservation>>,
    stats: HashMap<String, ReservationStats>,
}

pub fn router(scheduler: Scheduler) -> Router {
    Router::new()
        .route("/schedule", post(post_schedule))
        .route("/scheduled-resources", get(get_scheduled_resources))
        .route("/metrics", get(get_metrics))
        .with_state(scheduler)
}

async fn post_schedule(
    State(scheduler): State<Scheduler>,
    Json(req): Json<ScheduleRequest>,
) -> impl IntoResponse {
    match scheduler.schedule(&req).await {
        Some(host) => (StatusCode::OK, Json(ScheduleResponse { host })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no available host").into_response(),
    }
}

async fn get_scheduled_resources(State(scheduler): State<Scheduler>) -> impl IntoResponse {
    let store = scheduler.store();
    let resources = match reservations::list_active(&store).await {
        Ok(resources) => resources,
        Err(e) => {
            error!(error = %e, "failed to list reservations");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                .into_response();
        }
    };
    let stats = reservations::stats(&resources);

    (
        StatusCode::OK,
        Json(ScheduledResourcesResponse { resources, stats }),
    )
        .into_response()
}

async fn get_metrics(State(scheduler): State<Scheduler>) -> impl IntoResponse {
    // The scheduled_* families are derived from store state at scrape time.
    let store = scheduler.store();
    if let Ok(resources) = reservations::list_active(&store).await {
        metrics::record_reservations(&reservations::stats(&resources));
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metrics::metrics().registry.gather(), &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

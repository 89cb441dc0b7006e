//! Worker pool and dispatcher event views.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

use conductor_core::bus;
use conductor_store::models::Worker;

use crate::context::Ctx;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn list(State(ctx): State<Ctx>) -> Result<Json<Vec<Worker>>, AppError> {
    Ok(Json(ctx.scheduler.workers_snapshot()))
}

pub async fn events(
    State(ctx): State<Ctx>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<serde_json::Value>>, AppError> {
    let limit = query.limit.unwrap_or(100).min(bus::SYSTEM_RING);
    Ok(Json(ctx.bus.replay(bus::TOPIC_SYSTEM, limit)))
}

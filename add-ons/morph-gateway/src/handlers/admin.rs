//! Read-only admin endpoints: roster, journey, dashboard, health.

use super::{api_key, origin, ApiError};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use morph_core::{DashboardSummary, JourneySnapshot, UserRecord};
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn users_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserRecord>>, ApiError> {
    let users = state
        .orchestrator
        .users_all(api_key(&headers).as_deref(), origin(&headers).as_deref())?;
    Ok(Json(users))
}

pub async fn user_journey(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<JourneySnapshot>, ApiError> {
    let journey = state.orchestrator.user_journey(
        api_key(&headers).as_deref(),
        origin(&headers).as_deref(),
        &user_id,
    )?;
    Ok(Json(journey))
}

pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<DashboardSummary>, ApiError> {
    let summary = state
        .orchestrator
        .dashboard(api_key(&headers).as_deref(), origin(&headers).as_deref())?;
    Ok(Json(summary))
}

/// Health and mode. No auth; reports whether a live model backs the pipeline.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "app": state.orchestrator.config().app_name,
        "mode": state.orchestrator.mode().as_str(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

//! Event ingest endpoints: single track and batch.

use super::{api_key, origin, ApiError};
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use morph_core::{CoreError, IncomingEvent, IngestReport, IngestStatus};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct TrackBody {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub event_name: String,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Single event. A rejected event surfaces as a request-level error here;
/// the batch endpoint reports per-index statuses instead.
pub async fn track(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TrackBody>,
) -> Result<Json<IngestReport>, ApiError> {
    let report = state.orchestrator.ingest_events(
        api_key(&headers).as_deref(),
        origin(&headers).as_deref(),
        body.user_id.as_deref(),
        body.session_id.as_deref(),
        vec![IncomingEvent {
            event_name: body.event_name,
            component_id: body.component_id,
            properties: body.properties,
            timestamp: body.timestamp,
        }],
    )?;

    if let Some(IngestStatus::Rejected { reason }) = report.statuses.first() {
        if reason == "quota_exceeded" {
            return Err(CoreError::Forbidden("monthly event quota exceeded".to_string()).into());
        }
        return Err(CoreError::Validation(reason.clone()).into());
    }
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub events: Vec<IncomingEvent>,
}

/// Batch ingest: per-index statuses plus drop/coalesce counts.
pub async fn batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BatchBody>,
) -> Result<Json<IngestReport>, ApiError> {
    let report = state.orchestrator.ingest_events(
        api_key(&headers).as_deref(),
        origin(&headers).as_deref(),
        body.user_id.as_deref(),
        body.session_id.as_deref(),
        body.events,
    )?;
    Ok(Json(report))
}

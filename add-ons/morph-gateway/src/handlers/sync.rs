//! Cross-site identity link endpoint.

use super::{api_key, origin, ApiError};
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use morph_core::CoreError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct LinkBody {
    pub user_id: String,
    pub global_uid: String,
}

/// Links a tenant-local user id to a global identity. Membership only grows.
pub async fn link(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LinkBody>,
) -> Result<Json<Value>, ApiError> {
    if body.user_id.trim().is_empty() || body.global_uid.trim().is_empty() {
        return Err(CoreError::Validation("user_id and global_uid are required".to_string()).into());
    }
    let linked = state.orchestrator.link_global_user(
        api_key(&headers).as_deref(),
        origin(&headers).as_deref(),
        &body.user_id,
        &body.global_uid,
    )?;
    Ok(Json(json!({
        "global_uid": linked.global_uid,
        "memberships": linked.business_uids.len(),
    })))
}

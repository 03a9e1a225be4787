//! Optimize and reward endpoints. The legacy routes (`/tagAi`, `/rewardTag`)
//! share the integrated handlers; response fields match, byte layout is not
//! promised.

use super::{api_key, origin, ApiError};
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use morph_core::{OptimizeRequest, OptimizeResponse, RewardRequest, RewardResponse, SlotLabel};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct OptimizeBody {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub global_uid: Option<String>,
    pub component_id: String,
    #[serde(rename = "changingHtml")]
    pub changing_html: String,
    #[serde(default, rename = "contextHtml")]
    pub context_html: Option<String>,
}

pub async fn optimize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OptimizeBody>,
) -> Result<Json<OptimizeResponse>, ApiError> {
    let response = state
        .orchestrator
        .optimize(OptimizeRequest {
            api_key: api_key(&headers),
            origin: origin(&headers),
            user_id: body.user_id,
            session_id: body.session_id,
            global_uid: body.global_uid,
            component_id: body.component_id,
            changing_html: body.changing_html,
            context_html: body.context_html,
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct RewardBody {
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(rename = "variantAttributed")]
    pub variant_attributed: String,
    #[serde(default)]
    pub reward: Option<f64>,
    #[serde(default)]
    pub reward_type: Option<String>,
    #[serde(default)]
    pub component_ids: Vec<String>,
    /// Legacy single-component field; folded into `component_ids`.
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default, rename = "contextHtml")]
    pub context_html: Option<String>,
}

pub async fn reward(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RewardBody>,
) -> Result<Json<RewardResponse>, ApiError> {
    let mut component_ids = body.component_ids;
    if let Some(legacy) = body.component_id {
        if !component_ids.contains(&legacy) {
            component_ids.push(legacy);
        }
    }
    let variant = SlotLabel::parse(&body.variant_attributed).ok_or_else(|| {
        morph_core::CoreError::Validation(format!(
            "variantAttributed must be A or B, got {:?}",
            body.variant_attributed
        ))
    })?;

    let response = state
        .orchestrator
        .reward(RewardRequest {
            api_key: api_key(&headers),
            origin: origin(&headers),
            user_id: body.user_id,
            session_id: body.session_id,
            variant: Some(variant),
            reward: body.reward,
            reward_type: body.reward_type,
            component_ids,
        })
        .await?;
    Ok(Json(response))
}

//! Axum-based API gateway for the Morph optimization core. Config-driven via
//! CoreConfig; the LLM capability check at boot decides multi-agent vs stub
//! mode for the whole process.

mod handlers;
mod rate_limit;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use morph_core::{Business, CoreConfig, DocumentStore, LlmBridge, Orchestrator};
use rate_limit::{RateLimiter, RateVerdict};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shared state for all handlers.
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub limiter: RateLimiter,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match CoreConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(target: "morph::boot", error = %e, "config load failed");
            std::process::exit(1);
        }
    };

    let store = match DocumentStore::open(&config.storage_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(target: "morph::boot", error = %e, path = %config.storage_path, "store open failed");
            std::process::exit(1);
        }
    };

    seed_bootstrap_tenant(&store);

    // Capability check: without LLM_API_KEY the whole process runs in stub
    // mode and regeneration triggers are acknowledged but skipped.
    let bridge = LlmBridge::from_env(&config);
    match &bridge {
        Some(_) => tracing::info!(target: "morph::boot", model = %config.llm_model, "multi-agent mode"),
        None => tracing::warn!(target: "morph::boot", "LLM_API_KEY not set; stub mode"),
    }

    let port = config.port;
    let limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);
    let state = Arc::new(AppState {
        orchestrator: Orchestrator::new(store, config, bridge),
        limiter,
    });

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tick.tick().await;
                state.limiter.cleanup();
            }
        });
    }

    let app = Router::new()
        .route("/", get(handlers::admin::health))
        .route("/tagAi", post(handlers::optimize::optimize))
        .route("/api/optimize", post(handlers::optimize::optimize))
        .route("/rewardTag", post(handlers::optimize::reward))
        .route("/api/reward", post(handlers::optimize::reward))
        .route("/api/component/reward", post(handlers::optimize::reward))
        .route("/api/events/track", post(handlers::events::track))
        .route("/api/events/batch", post(handlers::events::batch))
        .route("/sync/link", post(handlers::sync::link))
        .route("/api/users/all", get(handlers::admin::users_all))
        .route("/api/user/:user_id/journey", get(handlers::admin::user_journey))
        .route("/api/analytics/dashboard", get(handlers::admin::dashboard))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            throttle_by_api_key,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&state));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(target: "morph::boot", error = %e, %addr, "bind failed");
            std::process::exit(1);
        }
    };
    tracing::info!(target: "morph::boot", %addr, "gateway listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(Arc::clone(&state)));
    if let Err(e) = serve.await {
        tracing::error!(target: "morph::boot", error = %e, "server error");
    }
}

/// Token-bucket gate keyed by api key; unkeyed requests fall through to the
/// resolver's 401.
async fn throttle_by_api_key(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(key) = key {
        if let RateVerdict::Exceeded { retry_after_secs } = state.limiter.check(&key) {
            let body = Json(json!({
                "error": "rate_limited",
                "detail": format!("retry after {retry_after_secs}s"),
            }));
            let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            if let Ok(v) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", v);
            }
            return response;
        }
    }
    next.run(request).await
}

/// Registers the operator-provided tenant on first boot so a fresh install
/// can take traffic. Provisioning beyond this lives outside the core.
fn seed_bootstrap_tenant(store: &DocumentStore) {
    let Ok(api_key) = std::env::var("MORPH_SEED_API_KEY") else {
        return;
    };
    let api_key = api_key.trim().to_string();
    if api_key.is_empty() {
        return;
    }
    match store.business_by_api_key(&api_key) {
        Ok(_) => {}
        Err(_) => {
            let business = Business {
                business_id: uuid::Uuid::new_v4().to_string(),
                api_key,
                allowed_domains: Vec::new(),
                tier: "bootstrap".to_string(),
                partner_ids: Vec::new(),
                monthly_event_limit: 100_000,
                monthly_events_used: 0,
            };
            match store.insert_business(&business) {
                Ok(()) => tracing::info!(
                    target: "morph::boot",
                    business_id = %business.business_id,
                    "bootstrap tenant registered"
                ),
                Err(e) => tracing::error!(target: "morph::boot", error = %e, "bootstrap tenant failed"),
            }
        }
    }
}

async fn shutdown_signal(state: Arc<AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(target: "morph::boot", "shutdown requested; draining ingest queue");
    state.orchestrator.ingestor().drain().await;
}

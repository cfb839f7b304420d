use crate::bridge::TabBridge;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use mindure_core::{Controller, DecisionEngine, NavigationEvent, PageDescriptor, SettingsError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub controller: Controller,
    pub engine: DecisionEngine,
    pub bridge: Arc<TabBridge>,
    pub events: mpsc::UnboundedSender<NavigationEvent>,
}

fn settings_error(e: SettingsError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        SettingsError::EmptyCredential | SettingsError::CredentialTooShort => {
            StatusCode::BAD_REQUEST
        }
        SettingsError::CredentialRejected => StatusCode::UNPROCESSABLE_ENTITY,
        SettingsError::NotConfigured => StatusCode::CONFLICT,
        SettingsError::Persist(_) => {
            tracing::error!(error = %e, "settings store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({ "success": false, "error": e.to_string() })),
    )
}

#[derive(Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

/// POST /api/toggle — turn the focus guard on or off.
pub async fn toggle_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ToggleRequest>,
) -> impl IntoResponse {
    match state.controller.toggle_enabled(body.enabled).await {
        Ok(enabled) => (
            StatusCode::OK,
            Json(json!({ "success": true, "enabled": enabled })),
        ),
        Err(e) => settings_error(e),
    }
}

/// GET /api/status
pub async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.status().await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "enabled": status.enabled,
                "has_credential": status.has_credential,
            })),
        ),
        Err(e) => settings_error(e),
    }
}

/// POST /api/reload — re-read settings from disk.
pub async fn reload_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.reload_settings().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(e) => settings_error(e),
    }
}

#[derive(Deserialize)]
pub struct EvaluateRequest {
    #[serde(alias = "pageInfo")]
    pub page_info: PageDescriptor,
}

/// POST /api/evaluate — classify a page supplied by the caller.
pub async fn evaluate_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EvaluateRequest>,
) -> impl IntoResponse {
    match state.controller.evaluate_now(&body.page_info).await {
        Ok(decision) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "verdict": decision.verdict,
                "source": decision.source,
            })),
        ),
        Err(e) => settings_error(e),
    }
}

#[derive(Deserialize)]
pub struct CredentialRequest {
    pub credential: String,
}

/// POST /api/credential — validate, probe and save an API key.
pub async fn credential_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialRequest>,
) -> impl IntoResponse {
    match state.controller.set_credential(&body.credential).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(e) => settings_error(e),
    }
}

/// POST /api/navigation — navigation event from the browser. Handled in the
/// background; the response only acknowledges receipt.
pub async fn navigation_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<NavigationEvent>,
) -> impl IntoResponse {
    if state.events.send(event).is_err() {
        tracing::error!("navigation dispatcher is gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

/// GET /api/stats — one-shot cache and bridge stats.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache = state.engine.cache();
    let stats = cache.stats();
    let lookups = stats.hits + stats.misses;

    Json(json!({
        "cache": {
            "policy": cache.name(),
            "capacity": cache.capacity(),
            "ttl_seconds": cache.ttl().as_secs(),
            "size": stats.current_size,
            "hits": stats.hits,
            "misses": stats.misses,
            "hit_rate": if lookups > 0 { stats.hits as f64 / lookups as f64 } else { 0.0 },
            "evictions": stats.evictions,
            "invalidations": stats.invalidations,
        },
        "inflight": state.engine.inflight(),
        "attached_tabs": state.bridge.attached(),
    }))
}

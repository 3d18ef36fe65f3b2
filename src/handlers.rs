use axum::{extract::State, http::Uri, response::IntoResponse, Json};
use serde::Serialize;

use crate::middleware::AdmissionState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub rate_limiting_enabled: bool,
    pub store_connected: bool,
    pub version: String,
}

/// Health check endpoint
///
/// A store outage only degrades the service: requests keep flowing unthrottled.
pub async fn health_check(State(state): State<AdmissionState>) -> impl IntoResponse {
    let store_connected = match state.admission.store() {
        Some(store) => store.ping().await.is_ok(),
        None => false,
    };
    let rate_limiting_enabled = state.admission.policy().is_some();

    let status = if rate_limiting_enabled && store_connected {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        rate_limiting_enabled,
        store_connected,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Stand-in upstream guarded by admission control
pub async fn upstream(uri: Uri) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "path": uri.path(),
    }))
}

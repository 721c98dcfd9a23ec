//! Liveness and service info handlers

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Service name, version and the routes it serves
pub async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: state.config.observability.service_name.clone(),
        version: scoperag_common::VERSION,
        endpoints: vec!["POST /ask", "GET /status", "GET /health"],
    })
}

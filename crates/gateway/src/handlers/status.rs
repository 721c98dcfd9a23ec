//! Aggregate status handler

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppState;
use scoperag_common::scope::ScopeSelector;
use scoperag_search::router::{AggregateHealth, FallbackEvent, ScopeStatus};

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Probe backends now instead of serving cached health
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: AggregateHealth,
    pub service: String,
    pub version: &'static str,
    pub default_scope: ScopeSelector,
    pub fallback_scope: Option<ScopeSelector>,

    /// A scope fallback happened since startup or a legacy collection is in use
    pub fallback_used: bool,
    pub last_fallback: Option<FallbackEvent>,
    pub scopes: Vec<ScopeStatus>,
    pub embedding: EmbeddingStatus,
    pub llm: LlmStatus,
    pub cache: CacheStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct EmbeddingStatus {
    pub model: String,
    pub dimension: usize,
    pub ready: bool,
}

#[derive(Serialize)]
pub struct LlmStatus {
    pub client: String,
    pub model: String,
    pub reachable: bool,
}

#[derive(Serialize)]
pub struct CacheStatus {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Per-scope backend health, provider readiness and fallback state
///
/// Returns 503 only when no scope is reachable; a partial outage is
/// reported as `degraded` with 200.
pub async fn status(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> Response {
    if query.refresh {
        state.router.invalidate_health().await;
    }

    let llm = state.streamer.llm();
    let (router_status, embedding_ready, llm_reachable) = tokio::join!(
        state.router.status(),
        state.embedder.ready(),
        llm.health_check(),
    );

    let mut overall = router_status.status;
    if overall == AggregateHealth::Ok && !(embedding_ready && llm_reachable) {
        overall = AggregateHealth::Degraded;
    }

    let legacy_in_use = router_status
        .scopes
        .iter()
        .flat_map(|scope| scope.sources.iter())
        .any(|source| source.fallback_used);

    if overall != AggregateHealth::Ok {
        tracing::warn!(
            status = overall.as_str(),
            embedding_ready,
            llm_reachable,
            "Service not fully healthy"
        );
    }

    let cache_stats = state.cache.stats();
    let config = &state.config;

    let response = StatusResponse {
        status: overall,
        service: config.observability.service_name.clone(),
        version: scoperag_common::VERSION,
        default_scope: config.qdrant.default_scope,
        fallback_scope: config.qdrant.fallback_enabled.then_some(config.qdrant.fallback_scope),
        fallback_used: legacy_in_use || router_status.last_fallback.is_some(),
        last_fallback: router_status.last_fallback,
        scopes: router_status.scopes,
        embedding: EmbeddingStatus {
            model: state.embedder.model_name().to_string(),
            dimension: state.embedder.dimension(),
            ready: embedding_ready,
        },
        llm: LlmStatus {
            client: llm.name().to_string(),
            model: config.llm.model.clone(),
            reachable: llm_reachable,
        },
        cache: CacheStatus {
            entries: state.cache.len(),
            capacity: state.cache.capacity(),
            hits: cache_stats.hits,
            misses: cache_stats.misses,
        },
        timestamp: Utc::now(),
    };

    let code = match overall {
        AggregateHealth::Down => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(response)).into_response()
}

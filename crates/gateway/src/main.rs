//! ScopeRAG HTTP Gateway
//!
//! The entry point for the desktop client.
//! Handles:
//! - Question answering with streamed NDJSON responses
//! - Scope selection (header, query parameter, default)
//! - Aggregate health and liveness
//! - Rate limiting
//! - Observability (logging, metrics, request ids)

mod handlers;
mod middleware;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use scoperag_common::{
    cache::EmbeddingCache,
    config::{AppConfig, ObservabilityConfig},
    embeddings::{create_embedder, Embedder},
    errors::AppError,
    llm::{create_llm, LlmClient},
    metrics,
};
use scoperag_search::{AnswerStreamer, RetrievalEngine, RetrievalSettings, VectorStoreRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
///
/// Every collaborator is built once at startup and shared read-only.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub router: Arc<VectorStoreRouter>,
    pub embedder: Arc<dyn Embedder>,
    pub cache: Arc<EmbeddingCache>,
    pub retrieval: Arc<RetrievalEngine>,
    pub streamer: Arc<AnswerStreamer>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        router: Arc<VectorStoreRouter>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let cache = Arc::new(EmbeddingCache::new(config.cache.embedding_capacity));
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::clone(&router),
            Arc::clone(&embedder),
            Arc::clone(&cache),
            RetrievalSettings::from(&config.retrieval),
        ));
        let streamer = Arc::new(AnswerStreamer::new(llm, &config.llm));

        Self {
            config: Arc::new(config),
            router,
            embedder,
            cache,
            retrieval,
            streamer,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(&config.observability);

    info!(
        service = %config.observability.service_name,
        "Starting ScopeRAG gateway v{}",
        scoperag_common::VERSION
    );

    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    if config.observability.metrics_port > 0 {
        install_metrics_exporter(config.observability.metrics_port)?;
        info!(port = config.observability.metrics_port, "Prometheus exporter listening");
    }
    metrics::register_metrics();

    let shutdown_grace = config.shutdown_timeout();
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let state = build_state(config).await.map_err(|e| {
        error!(error = %e, "Startup failed");
        e
    })?;

    let app = create_router(state)?;

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let _ = shutdown_tx.send(());
            })
            .await
    });

    // Open answer streams get `shutdown_grace` to finish once a signal arrives
    let grace_expired = async move {
        match shutdown_rx.await {
            Ok(()) => tokio::time::sleep(shutdown_grace).await,
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = &mut server => result??,
        _ = grace_expired => {
            warn!(grace_secs = shutdown_grace.as_secs(), "Graceful shutdown timed out; closing open streams");
            server.abort();
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_metrics_exporter(port: u16) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_embedding_duration_seconds", metrics::METRICS_PREFIX)),
            metrics::EMBEDDING_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            metrics::LATENCY_BUCKETS,
        )?
        .install()
}

/// Build the shared collaborators and run the startup checks
///
/// A collection whose vector width differs from the embedding model aborts
/// startup. An embedding provider that cannot be probed only logs a warning;
/// the configured dimension is used instead.
async fn build_state(config: AppConfig) -> Result<AppState, AppError> {
    let embedder = create_embedder(&config.embedding)?;

    let dimension = match embedder.detect_dimension().await {
        Ok(detected) => {
            if detected != config.embedding.dimension {
                warn!(
                    model = %embedder.model_name(),
                    configured = config.embedding.dimension,
                    detected,
                    "Embedding dimension differs from configuration; using detected value"
                );
            } else {
                info!(model = %embedder.model_name(), dimension = detected, "Embedding model ready");
            }
            detected
        }
        Err(e) => {
            warn!(
                model = %embedder.model_name(),
                error = %e,
                "Embedding provider not reachable at startup; using configured dimension"
            );
            config.embedding.dimension
        }
    };

    let router = Arc::new(VectorStoreRouter::from_config(&config.qdrant)?);
    router.verify_dimension(dimension, embedder.model_name()).await?;

    let llm = create_llm(&config.llm)?;
    info!(llm = %llm.name(), model = %config.llm.model, "LLM client configured");

    Ok(AppState::new(config, router, embedder, llm))
}

/// Create the main application router
fn create_router(state: AppState) -> Result<Router, AppError> {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let mut api_routes = Router::new()
        .route("/ask", post(handlers::ask::ask))
        .route("/status", get(handlers::status::status))
        .route("/", get(handlers::health::service_info));

    let limits = &state.config.rate_limit;
    if limits.enabled {
        let limiter =
            middleware::rate_limit::create_rate_limiter(limits.requests_per_second, limits.burst)?;
        api_routes = api_routes.layer(from_fn_with_state(
            limiter,
            middleware::rate_limit::rate_limit_middleware,
        ));
    }

    // Liveness stays outside the rate limit
    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .merge(api_routes)
        .route_layer(from_fn(middleware::metrics::track_requests));

    Ok(app
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::response::Response;
    use scoperag_common::embeddings::MockEmbedder;
    use scoperag_common::llm::MockLlm;
    use scoperag_common::scope::{CollectionNamingPolicy, ScopeSelector};
    use scoperag_search::{ScriptedStore, VectorStore};
    use tower::ServiceExt;

    pub const DIM: usize = 8;

    /// Config with rate limiting off and a dev naming policy
    pub fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.rate_limit.enabled = false;
        config.embedding.dimension = DIM;
        config
    }

    pub fn naming() -> CollectionNamingPolicy {
        CollectionNamingPolicy::new("dev", "my_documents")
    }

    pub fn state_with(
        config: AppConfig,
        personal: ScriptedStore,
        dept: ScriptedStore,
        llm: Arc<MockLlm>,
    ) -> AppState {
        let fallback = config.qdrant.fallback_for(ScopeSelector::Dept);
        let router = VectorStoreRouter::new(
            naming(),
            vec![
                (ScopeSelector::Personal, Arc::new(personal) as Arc<dyn VectorStore>),
                (ScopeSelector::Dept, Arc::new(dept) as Arc<dyn VectorStore>),
            ],
        )
        .with_fallback_scope(fallback);

        AppState::new(
            config,
            Arc::new(router),
            Arc::new(MockEmbedder::new(DIM)),
            llm,
        )
    }

    pub fn app(state: AppState) -> Router {
        create_router(state).unwrap()
    }

    pub async fn send(app: Router, request: Request<Body>) -> Response {
        app.oneshot(request).await.unwrap()
    }

    pub async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Parse an NDJSON body into one value per line
    pub async fn ndjson_lines(response: Response) -> Vec<serde_json::Value> {
        body_text(response)
            .await
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use scoperag_common::llm::MockLlm;
    use scoperag_search::ScriptedStore;

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let state = state_with(
            test_config(),
            ScriptedStore::new("personal"),
            ScriptedStore::new("dept"),
            Arc::new(MockLlm::new(Vec::<String>::new())),
        );

        let response = send(
            app(state),
            Request::get("/health").header("x-request-id", "req-42").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let state = state_with(
            test_config(),
            ScriptedStore::new("personal"),
            ScriptedStore::new("dept"),
            Arc::new(MockLlm::new(Vec::<String>::new())),
        );

        let response = send(app(state), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_burst_overflow() {
        let mut config = test_config();
        config.rate_limit.enabled = true;
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst = 1;

        let state = state_with(
            config,
            ScriptedStore::new("personal"),
            ScriptedStore::new("dept"),
            Arc::new(MockLlm::new(Vec::<String>::new())),
        );
        let app = app(state);

        let first = send(app.clone(), Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = send(app.clone(), Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value = serde_json::from_str(&body_text(second).await).unwrap();
        assert_eq!(body["error"]["code"], "RATE_LIMITED");

        // Liveness is not rate limited
        let health = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(health.status(), StatusCode::OK);
    }
}

//! Dual-scope vector-store router
//!
//! Resolves a (scope, source) pair to a concrete collection and searches it.
//! Two independent fallbacks compose here:
//! - **Scope fallback**: the requested scope's backend is unreachable, so the
//!   configured fallback scope's backend serves the request instead.
//! - **Legacy-name fallback**: the canonical collection is missing or empty, so
//!   pre-convention names are tried in priority order.
//!
//! Expected absence of data never surfaces as an error; every search returns a
//! [`SearchOutcome`].

mod health;

pub use health::{AggregateHealth, FallbackEvent, HealthState, RouterStatus, ScopeStatus, SourceStatus};

use crate::store::{QdrantStore, RetrievalHit, SearchParams, StoreError, VectorStore};
use chrono::Utc;
use futures::future::join_all;
use scoperag_common::config::QdrantConfig;
use scoperag_common::errors::{AppError, Result};
use scoperag_common::metrics;
use scoperag_common::scope::{CollectionNamingPolicy, ScopeSelector, SourceType};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Upper bound on a single health check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// How a search ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Hits were returned
    Found,
    /// A populated collection was searched but nothing cleared the threshold
    NoHits,
    /// Neither the canonical nor any legacy collection holds data
    NoCollection,
    /// The scope's backend and its fallback were both unreachable
    BackendUnavailable,
}

impl SearchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStatus::Found => "found",
            SearchStatus::NoHits => "no_hits",
            SearchStatus::NoCollection => "no_collection",
            SearchStatus::BackendUnavailable => "backend_unavailable",
        }
    }
}

/// Result of a routed search
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub status: SearchStatus,

    /// Hits best first; empty unless `status` is `Found`
    pub hits: Vec<RetrievalHit>,

    pub requested_scope: ScopeSelector,

    /// Scope whose backend answered, if any did
    pub scope_used: Option<ScopeSelector>,

    /// Collection searched, if one held data
    pub collection: Option<String>,

    /// True when `collection` is a legacy name
    pub fallback_used: bool,

    /// Set when the requested scope was unreachable and another served it
    pub scope_fallback: Option<FallbackEvent>,
}

impl SearchOutcome {
    fn empty(status: SearchStatus, requested: ScopeSelector, used: Option<ScopeSelector>) -> Self {
        Self {
            status,
            hits: Vec::new(),
            requested_scope: requested,
            scope_used: used,
            collection: None,
            fallback_used: false,
            scope_fallback: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == SearchStatus::Found
    }
}

/// Routes searches across the configured scopes
pub struct VectorStoreRouter {
    backends: BTreeMap<ScopeSelector, Arc<dyn VectorStore>>,
    naming: CollectionNamingPolicy,
    fallback_scope: Option<ScopeSelector>,
    hnsw_ef: Option<u64>,
    exact: bool,
    health_ttl: Duration,
    health_timeout: Duration,
    health_cache: RwLock<HashMap<ScopeSelector, (Instant, ScopeStatus)>>,
    last_fallback: StdRwLock<Option<FallbackEvent>>,
}

impl VectorStoreRouter {
    /// Create a router over explicit backends
    pub fn new(
        naming: CollectionNamingPolicy,
        backends: impl IntoIterator<Item = (ScopeSelector, Arc<dyn VectorStore>)>,
    ) -> Self {
        Self {
            backends: backends.into_iter().collect(),
            naming,
            fallback_scope: None,
            hnsw_ef: None,
            exact: false,
            health_ttl: Duration::from_secs(30),
            health_timeout: HEALTH_CHECK_TIMEOUT,
            health_cache: RwLock::new(HashMap::new()),
            last_fallback: StdRwLock::new(None),
        }
    }

    /// Serve unreachable scopes from `scope`
    pub fn with_fallback_scope(mut self, scope: Option<ScopeSelector>) -> Self {
        self.fallback_scope = scope;
        self
    }

    pub fn with_health_ttl(mut self, ttl: Duration) -> Self {
        self.health_ttl = ttl;
        self
    }

    /// Bound on one scope's health check
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_search_tuning(mut self, hnsw_ef: Option<u64>, exact: bool) -> Self {
        self.hnsw_ef = hnsw_ef;
        self.exact = exact;
        self
    }

    /// Build Qdrant clients for every scope from configuration
    pub fn from_config(config: &QdrantConfig) -> Result<Self> {
        let mut backends: Vec<(ScopeSelector, Arc<dyn VectorStore>)> = Vec::new();
        for scope in ScopeSelector::ALL {
            let backend = config.backend(scope);
            let store = QdrantStore::new(backend)?;
            tracing::info!(
                scope = %scope,
                endpoint = %store.endpoint(),
                timeout_secs = backend.timeout_secs,
                "Vector store configured"
            );
            backends.push((scope, Arc::new(store) as Arc<dyn VectorStore>));
        }

        let naming = CollectionNamingPolicy::new(&config.environment, &config.base_name)
            .with_legacy_names(config.legacy_collections.clone());

        let fallback = if config.fallback_enabled { Some(config.fallback_scope) } else { None };

        Ok(Self::new(naming, backends)
            .with_fallback_scope(fallback)
            .with_health_ttl(config.health_ttl())
            .with_search_tuning(Some(config.hnsw_ef), config.exact))
    }

    pub fn naming(&self) -> &CollectionNamingPolicy {
        &self.naming
    }

    /// Backend handle for a scope
    pub fn get_client(&self, scope: ScopeSelector) -> Option<Arc<dyn VectorStore>> {
        self.backends.get(&scope).cloned()
    }

    /// Scope that serves `scope` when its backend is unreachable
    pub fn fallback_for(&self, scope: ScopeSelector) -> Option<ScopeSelector> {
        self.fallback_scope.filter(|fallback| *fallback != scope)
    }

    /// Most recent scope fallback since startup
    pub fn last_fallback(&self) -> Option<FallbackEvent> {
        self.last_fallback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Search `source` in `scope`, falling back across scopes and legacy names
    pub async fn search(
        &self,
        scope: ScopeSelector,
        source: SourceType,
        query_vector: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> SearchOutcome {
        let start = Instant::now();
        let params = SearchParams {
            limit: top_k,
            score_threshold: Some(score_threshold),
            hnsw_ef: self.hnsw_ef,
            exact: self.exact,
        };

        let outcome = match self.search_scope(scope, source, query_vector, &params).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(scope = %scope, error = %err, "Vector store unreachable");
                self.search_fallback_scope(scope, source, query_vector, &params).await
            }
        };

        let reported_scope = outcome.scope_used.unwrap_or(scope);
        metrics::record_search(
            start.elapsed().as_secs_f64(),
            reported_scope.as_str(),
            outcome.status.as_str(),
            outcome.hits.len(),
        );

        tracing::info!(
            scope = %scope,
            scope_used = ?outcome.scope_used,
            source = %source,
            collection = ?outcome.collection,
            status = outcome.status.as_str(),
            hits = outcome.hits.len(),
            fallback_used = outcome.fallback_used,
            "Vector search finished"
        );

        outcome
    }

    async fn search_fallback_scope(
        &self,
        scope: ScopeSelector,
        source: SourceType,
        query_vector: &[f32],
        params: &SearchParams,
    ) -> SearchOutcome {
        let Some(fallback) = self.fallback_for(scope) else {
            return SearchOutcome::empty(SearchStatus::BackendUnavailable, scope, None);
        };

        match self.search_scope(fallback, source, query_vector, params).await {
            Ok(mut outcome) => {
                let event = FallbackEvent::new(scope, fallback);
                tracing::warn!(
                    fallback_from = %scope,
                    fallback_to = %fallback,
                    "Scope fallback served the request"
                );
                metrics::record_scope_fallback(scope.as_str(), fallback.as_str());
                *self.last_fallback
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(event.clone());

                outcome.requested_scope = scope;
                outcome.scope_fallback = Some(event);
                outcome
            }
            Err(err) => {
                tracing::error!(
                    scope = %scope,
                    fallback = %fallback,
                    error = %err,
                    "Fallback scope unreachable as well"
                );
                SearchOutcome::empty(SearchStatus::BackendUnavailable, scope, None)
            }
        }
    }

    /// Search one scope; `Err` only when its backend cannot be reached
    async fn search_scope(
        &self,
        scope: ScopeSelector,
        source: SourceType,
        query_vector: &[f32],
        params: &SearchParams,
    ) -> std::result::Result<SearchOutcome, StoreError> {
        let store = self.backends.get(&scope).ok_or_else(|| StoreError::Unreachable {
            endpoint: scope.to_string(),
            message: "no backend configured".to_string(),
        })?;

        let candidates = self.naming.candidates(scope, source);
        for (position, name) in candidates.iter().enumerate() {
            match store.collection_info(name).await {
                Ok(Some(info)) if info.points_count > 0 => {}
                Ok(Some(_)) => {
                    tracing::debug!(scope = %scope, collection = %name, "Collection is empty");
                    continue;
                }
                Ok(None) => {
                    tracing::debug!(scope = %scope, collection = %name, "Collection does not exist");
                    continue;
                }
                Err(err) if err.is_connectivity() => return Err(err),
                Err(err) => {
                    tracing::warn!(scope = %scope, collection = %name, error = %err, "Collection lookup failed");
                    continue;
                }
            }

            let points = match store.search(name, query_vector, params).await {
                Ok(points) => points,
                Err(err) if err.is_connectivity() => return Err(err),
                Err(err) => {
                    tracing::warn!(scope = %scope, collection = %name, error = %err, "Search failed");
                    continue;
                }
            };

            let fallback_used = position > 0;
            if fallback_used {
                tracing::info!(
                    scope = %scope,
                    primary = %candidates[0],
                    collection = %name,
                    "Serving from legacy collection"
                );
                metrics::record_legacy_fallback(scope.as_str(), name);
            }

            let hits: Vec<RetrievalHit> = points
                .into_iter()
                .map(|p| RetrievalHit::from_point(p, name, scope))
                .collect();

            return Ok(SearchOutcome {
                status: if hits.is_empty() { SearchStatus::NoHits } else { SearchStatus::Found },
                hits,
                requested_scope: scope,
                scope_used: Some(scope),
                collection: Some(name.clone()),
                fallback_used,
                scope_fallback: None,
            });
        }

        tracing::warn!(
            scope = %scope,
            source = %source,
            candidates = ?candidates,
            "No collection with data found"
        );
        Ok(SearchOutcome::empty(SearchStatus::NoCollection, scope, Some(scope)))
    }

    /// Health of one scope, served from cache while fresh
    pub async fn scope_status(&self, scope: ScopeSelector) -> ScopeStatus {
        {
            let cache = self.health_cache.read().await;
            if let Some((checked, status)) = cache.get(&scope) {
                if checked.elapsed() < self.health_ttl {
                    return status.clone();
                }
            }
        }

        let status = self.probe_scope(scope).await;
        self.health_cache
            .write()
            .await
            .insert(scope, (Instant::now(), status.clone()));
        status
    }

    /// Health of every configured scope
    pub async fn status(&self) -> RouterStatus {
        let scopes = join_all(self.backends.keys().map(|scope| self.scope_status(*scope))).await;
        RouterStatus {
            status: AggregateHealth::from_states(scopes.iter().map(|s| s.state)),
            scopes,
            last_fallback: self.last_fallback(),
        }
    }

    /// Drop cached health so the next query probes again
    pub async fn invalidate_health(&self) {
        self.health_cache.write().await.clear();
    }

    async fn probe_scope(&self, scope: ScopeSelector) -> ScopeStatus {
        let checked_at = Utc::now();
        let down = |endpoint: String, error: String| {
            metrics::record_backend_up(scope.as_str(), false);
            ScopeStatus {
                scope,
                endpoint,
                state: HealthState::Down,
                reachable: false,
                error: Some(error),
                sources: Vec::new(),
                checked_at,
            }
        };

        let Some(store) = self.backends.get(&scope) else {
            return down(String::new(), "no backend configured".to_string());
        };

        // The listing and every per-source lookup share one deadline
        let inspection = async {
            let listing = store.list_collections().await?;
            let mut sources = Vec::with_capacity(SourceType::ALL.len());
            for source in SourceType::ALL {
                sources.push(self.source_status(store.as_ref(), scope, source, &listing).await);
            }
            Ok::<_, StoreError>(sources)
        };

        let sources = match tokio::time::timeout(self.health_timeout, inspection).await {
            Ok(Ok(sources)) => sources,
            Ok(Err(err)) => return down(store.endpoint(), err.to_string()),
            Err(_) => return down(store.endpoint(), "health check timed out".to_string()),
        };

        let state = if sources.iter().all(|s| s.points > 0) {
            HealthState::Up
        } else {
            HealthState::Degraded
        };
        metrics::record_backend_up(scope.as_str(), true);

        ScopeStatus {
            scope,
            endpoint: store.endpoint(),
            state,
            reachable: true,
            error: None,
            sources,
            checked_at,
        }
    }

    /// Which collection a search for `source` would use, and what it holds
    async fn source_status(
        &self,
        store: &dyn VectorStore,
        scope: ScopeSelector,
        source: SourceType,
        listing: &[String],
    ) -> SourceStatus {
        let candidates = self.naming.candidates(scope, source);
        let primary = candidates[0].clone();
        let mut first_existing = None;

        for (position, name) in candidates.iter().enumerate() {
            if !listing.contains(name) {
                continue;
            }
            let info = match store.collection_info(name).await {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(scope = %scope, collection = %name, error = %err, "Status lookup failed");
                    continue;
                }
            };

            let status = SourceStatus {
                source,
                primary_collection: primary.clone(),
                resolved_collection: Some(name.clone()),
                exists: true,
                points: info.points_count,
                dimension: info.dimension,
                fallback_used: position > 0,
            };
            if info.points_count > 0 {
                return status;
            }
            first_existing.get_or_insert(status);
        }

        first_existing.unwrap_or(SourceStatus {
            source,
            primary_collection: primary,
            resolved_collection: None,
            exists: false,
            points: 0,
            dimension: None,
            fallback_used: false,
        })
    }

    /// Fail when a resolved collection stores vectors of another width
    ///
    /// Unreachable scopes are skipped with a warning; they are checked again
    /// on the next start.
    pub async fn verify_dimension(&self, expected: usize, model: &str) -> Result<()> {
        for scope in self.backends.keys().copied() {
            let status = self.probe_scope(scope).await;
            self.health_cache
                .write()
                .await
                .insert(scope, (Instant::now(), status.clone()));

            if !status.reachable {
                tracing::warn!(
                    scope = %scope,
                    error = ?status.error,
                    "Skipping dimension check for unreachable scope"
                );
                continue;
            }

            for source in &status.sources {
                let (Some(collection), Some(stored)) = (&source.resolved_collection, source.dimension) else {
                    continue;
                };
                if stored != expected {
                    return Err(AppError::DimensionMismatch {
                        scope: scope.to_string(),
                        collection: collection.clone(),
                        model: model.to_string(),
                        stored,
                        produced: expected,
                    });
                }
                tracing::info!(
                    scope = %scope,
                    collection = %collection,
                    dimension = stored,
                    "Embedding dimension verified"
                );
            }
        }
        Ok(())
    }
}

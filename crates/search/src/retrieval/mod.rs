//! Retrieval engine
//!
//! Turns a question into grounding context:
//! 1. Normalize the question and embed it through the [`EmbeddingCache`]
//! 2. Search the routed vector store
//! 3. Keep hits at or above the threshold, one per document, best first
//! 4. Render bounded context text plus reference descriptors
//!
//! An empty result is an outcome, not an error.

pub mod context;

pub use context::{Reference, ReferenceKind};

use crate::router::{FallbackEvent, SearchStatus, VectorStoreRouter};
use crate::store::RetrievalHit;
use scoperag_common::cache::{normalize_text, EmbeddingCache};
use scoperag_common::config::RetrievalConfig;
use scoperag_common::embeddings::Embedder;
use scoperag_common::errors::{AppError, Result};
use scoperag_common::scope::{ScopeSelector, SourceType};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Candidates fetched per requested hit, so deduplication can still fill top-k
const CANDIDATE_FACTOR: usize = 2;

/// Tunables for one engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub score_threshold: f32,
    pub snippet_chars: usize,
    pub max_context_chars: usize,

    /// Budget for embedding plus search
    pub timeout: Duration,
}

impl From<&RetrievalConfig> for RetrievalSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            score_threshold: config.score_threshold,
            snippet_chars: config.snippet_chars,
            max_context_chars: config.max_context_chars,
            timeout: config.timeout(),
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

/// Whether retrieval produced usable grounding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    Found,
    NoRelevantResults,
}

/// Why nothing usable came back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoResultReason {
    /// Hits existed but none reached the threshold
    BelowThreshold,
    /// No canonical or legacy collection holds data
    NoCollection,
    /// No backend for the scope could be reached
    BackendUnavailable,
}

/// Ordered hits and the text rendered from them
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalContext {
    pub hits: Vec<RetrievalHit>,
    pub text: String,
}

impl RetrievalContext {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Everything the answer step needs from retrieval
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub status: RetrievalStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NoResultReason>,

    pub context: RetrievalContext,

    pub references: Vec<Reference>,

    pub source: SourceType,

    pub requested_scope: ScopeSelector,

    pub scope_used: Option<ScopeSelector>,

    pub collection: Option<String>,

    /// Served from a legacy collection name
    pub fallback_used: bool,

    /// Served by another scope's backend
    pub scope_fallback: Option<FallbackEvent>,
}

impl RetrievalResult {
    pub fn is_found(&self) -> bool {
        self.status == RetrievalStatus::Found
    }
}

/// Embeds, searches, deduplicates, and formats
pub struct RetrievalEngine {
    router: Arc<VectorStoreRouter>,
    embedder: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
    settings: RetrievalSettings,
}

impl RetrievalEngine {
    pub fn new(
        router: Arc<VectorStoreRouter>,
        embedder: Arc<dyn Embedder>,
        cache: Arc<EmbeddingCache>,
        settings: RetrievalSettings,
    ) -> Self {
        Self { router, embedder, cache, settings }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    pub fn router(&self) -> &Arc<VectorStoreRouter> {
        &self.router
    }

    /// Query vector for `question`, from cache when possible
    pub async fn embed_query(&self, question: &str) -> Result<Arc<Vec<f32>>> {
        let embedder = Arc::clone(&self.embedder);
        self.cache
            .get_or_compute(question, |normalized| async move { embedder.embed(&normalized).await })
            .await
    }

    /// Retrieve grounding context for `question`
    ///
    /// Fails with `RetrievalTimeout` when embedding and search together take
    /// longer than the configured budget.
    pub async fn retrieve(
        &self,
        question: &str,
        scope: ScopeSelector,
        source: SourceType,
    ) -> Result<RetrievalResult> {
        let normalized = normalize_text(question);
        if normalized.is_empty() {
            return Err(AppError::EmptyQuestion);
        }

        let budget = self.settings.timeout;
        match tokio::time::timeout(budget, self.retrieve_normalized(&normalized, scope, source)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(scope = %scope, source = %source, timeout_ms = budget.as_millis() as u64, "Retrieval timed out");
                Err(AppError::RetrievalTimeout {
                    timeout_ms: budget.as_millis() as u64,
                })
            }
        }
    }

    async fn retrieve_normalized(
        &self,
        normalized: &str,
        scope: ScopeSelector,
        source: SourceType,
    ) -> Result<RetrievalResult> {
        let start = Instant::now();
        let vector = self.embed_query(normalized).await?;

        let settings = &self.settings;
        let outcome = self
            .router
            .search(
                scope,
                source,
                &vector,
                settings.top_k * CANDIDATE_FACTOR,
                settings.score_threshold,
            )
            .await;

        let passing: Vec<RetrievalHit> = outcome
            .hits
            .into_iter()
            .filter(|hit| hit.score >= settings.score_threshold)
            .collect();

        let mut hits = context::dedupe(passing, source);
        hits.truncate(settings.top_k);

        let (status, reason) = if !hits.is_empty() {
            (RetrievalStatus::Found, None)
        } else {
            let reason = match outcome.status {
                SearchStatus::NoCollection => NoResultReason::NoCollection,
                SearchStatus::BackendUnavailable => NoResultReason::BackendUnavailable,
                SearchStatus::Found | SearchStatus::NoHits => NoResultReason::BelowThreshold,
            };
            (RetrievalStatus::NoRelevantResults, Some(reason))
        };

        let blocks: Vec<String> = hits
            .iter()
            .map(|hit| context::format_block(hit, settings.snippet_chars))
            .collect();
        let text = context::assemble_context(&blocks, settings.max_context_chars);

        let references: Vec<Reference> = hits
            .iter()
            .filter_map(|hit| {
                let reference = context::build_reference(hit, source);
                if reference.is_none() {
                    tracing::debug!(point = %hit.id, "Hit has no link or path; no reference emitted");
                }
                reference
            })
            .collect();

        tracing::info!(
            scope = %scope,
            source = %source,
            hits = hits.len(),
            references = references.len(),
            top_score = ?hits.first().map(|h| h.score),
            context_chars = text.chars().count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retrieval finished"
        );

        Ok(RetrievalResult {
            status,
            reason,
            context: RetrievalContext { hits, text },
            references,
            source,
            requested_scope: scope,
            scope_used: outcome.scope_used,
            collection: outcome.collection,
            fallback_used: outcome.fallback_used,
            scope_fallback: outcome.scope_fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ScoredPoint, ScriptedStore, VectorStore};
    use scoperag_common::embeddings::MockEmbedder;
    use scoperag_common::scope::CollectionNamingPolicy;
    use serde_json::json;

    const DIM: usize = 8;
    const MAIL: &str = "personal_dev_mail_my_documents";
    const DOC: &str = "personal_dev_doc_my_documents";

    fn mail_point(id: &str, score: f32) -> ScoredPoint {
        ScoredPoint::new(
            id,
            score,
            json!({
                "source_type": "email_body",
                "mail_subject": format!("Subject {}", id),
                "sender": "sales@example.com",
                "sent_date": "2024-03-01",
                "text": format!("Body of mail {}", id),
                "entry_id": id,
                "link": format!("outlook:{}", id),
            }),
        )
    }

    fn engine_with(
        store: ScriptedStore,
        threshold: f32,
    ) -> (RetrievalEngine, Arc<MockEmbedder>) {
        let backends = vec![(ScopeSelector::Personal, Arc::new(store) as Arc<dyn VectorStore>)];
        let router = VectorStoreRouter::new(CollectionNamingPolicy::new("dev", "my_documents"), backends);
        let embedder = Arc::new(MockEmbedder::new(DIM));
        let settings = RetrievalSettings {
            top_k: 3,
            score_threshold: threshold,
            snippet_chars: 500,
            max_context_chars: 4000,
            timeout: Duration::from_secs(5),
        };
        let engine = RetrievalEngine::new(
            Arc::new(router),
            embedder.clone(),
            Arc::new(EmbeddingCache::new(16)),
            settings,
        );
        (engine, embedder)
    }

    #[tokio::test]
    async fn test_discount_question_keeps_hits_above_threshold() {
        let store = ScriptedStore::new("personal").with_collection(
            MAIL,
            DIM,
            vec![mail_point("a", 0.82), mail_point("b", 0.61), mail_point("c", 0.29)],
        );
        let (engine, _) = engine_with(store, 0.55);

        let result = engine
            .retrieve("What is the discount percentage?", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap();

        assert!(result.is_found());
        let scores: Vec<f32> = result.context.hits.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![0.82, 0.61]);
        assert_eq!(result.references.len(), 2);
        assert_eq!(result.references[0].title, "Subject a");
        assert!(result.context.text.contains("Body of mail a"));
        assert!(result.context.text.contains(context::BLOCK_SEPARATOR));
        assert!(!result.context.text.contains("Body of mail c"));
    }

    #[tokio::test]
    async fn test_threshold_boundary_is_inclusive() {
        let store = ScriptedStore::new("personal").with_collection(
            MAIL,
            DIM,
            vec![mail_point("at", 0.55), mail_point("below", 0.5499)],
        );
        let (engine, _) = engine_with(store, 0.55);

        let result = engine
            .retrieve("boundary", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap();

        let ids: Vec<&str> = result.context.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["at"]);
    }

    #[tokio::test]
    async fn test_engine_filters_unthresholded_store_results() {
        let store = ScriptedStore::new("personal").ignoring_threshold().with_collection(
            MAIL,
            DIM,
            vec![
                mail_point("high", 0.9),
                mail_point("at", 0.55),
                mail_point("below", 0.5499),
                mail_point("low", 0.1),
            ],
        );
        let (engine, _) = engine_with(store, 0.55);

        let result = engine
            .retrieve("discount", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap();

        let ids: Vec<&str> = result.context.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "at"]);
        assert!(!result.context.text.contains("Body of mail below"));

        let store = ScriptedStore::new("personal")
            .ignoring_threshold()
            .with_collection(MAIL, DIM, vec![mail_point("low", 0.2)]);
        let (engine, _) = engine_with(store, 0.55);
        let result = engine
            .retrieve("discount", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap();
        assert_eq!(result.status, RetrievalStatus::NoRelevantResults);
        assert_eq!(result.reason, Some(NoResultReason::BelowThreshold));
    }

    #[tokio::test]
    async fn test_slow_backend_exceeds_budget() {
        let store = ScriptedStore::new("personal")
            .with_latency(Duration::from_millis(500))
            .with_collection(MAIL, DIM, vec![mail_point("a", 0.9)]);
        let (mut engine, _) = engine_with(store, 0.3);
        engine.settings.timeout = Duration::from_millis(50);

        let err = engine
            .retrieve("anything", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RetrievalTimeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn test_duplicate_documents_collapse_to_best_chunk() {
        let store = ScriptedStore::new("personal").with_collection(
            DOC,
            DIM,
            vec![
                ScoredPoint::new("1", 0.70, json!({ "file_path": "D:\\Specs\\Hull.docx", "text": "weaker" })),
                ScoredPoint::new("2", 0.90, json!({ "file_path": "d:/specs/hull.docx", "text": "stronger" })),
                ScoredPoint::new("3", 0.60, json!({ "file_path": "d:/specs/deck.docx", "text": "other" })),
            ],
        );
        let (engine, _) = engine_with(store, 0.3);

        let result = engine
            .retrieve("hull drawing", ScopeSelector::Personal, SourceType::Doc)
            .await
            .unwrap();

        let ids: Vec<&str> = result.context.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
        assert!(result.context.text.contains("stronger"));
        assert!(!result.context.text.contains("weaker"));
        assert_eq!(result.references[0].kind, ReferenceKind::Document);
    }

    #[tokio::test]
    async fn test_repeat_question_is_served_from_cache() {
        let store = ScriptedStore::new("personal")
            .with_collection(MAIL, DIM, vec![mail_point("a", 0.9), mail_point("b", 0.8)]);
        let (engine, embedder) = engine_with(store, 0.3);

        let first = engine
            .retrieve("When is the shipment due?", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap();
        let second = engine
            .retrieve("  When is the   shipment due? ", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap();

        assert_eq!(embedder.calls(), 1);
        assert_eq!(first.context, second.context);
        assert_eq!(first.references, second.references);
    }

    #[tokio::test]
    async fn test_no_relevant_results_is_not_an_error() {
        let store = ScriptedStore::new("personal").with_collection(MAIL, DIM, vec![mail_point("a", 0.1)]);
        let (engine, _) = engine_with(store, 0.5);

        let result = engine
            .retrieve("unrelated", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap();
        assert_eq!(result.status, RetrievalStatus::NoRelevantResults);
        assert_eq!(result.reason, Some(NoResultReason::BelowThreshold));
        assert!(result.context.is_empty());
        assert!(result.context.text.is_empty());
        assert!(result.references.is_empty());

        let (engine, _) = engine_with(ScriptedStore::new("personal"), 0.5);
        let result = engine
            .retrieve("anything", ScopeSelector::Personal, SourceType::Doc)
            .await
            .unwrap();
        assert_eq!(result.reason, Some(NoResultReason::NoCollection));
    }

    #[tokio::test]
    async fn test_top_k_after_dedup() {
        let points = (0..10).map(|i| mail_point(&format!("m{}", i), 0.9 - i as f32 * 0.01)).collect();
        let store = ScriptedStore::new("personal").with_collection(MAIL, DIM, points);
        let (engine, _) = engine_with(store, 0.3);

        let result = engine
            .retrieve("many", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap();
        assert_eq!(result.context.hits.len(), 3);
        assert_eq!(result.context.hits[0].id, "m0");
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let (engine, _) = engine_with(ScriptedStore::new("personal"), 0.5);
        let err = engine
            .retrieve("   ", ScopeSelector::Personal, SourceType::Mail)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EmptyQuestion));
    }
}

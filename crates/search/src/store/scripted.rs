//! In-process vector store with preset scores
//!
//! Scores are fixed per point instead of computed from the query vector, so
//! tests can place hits exactly on a threshold. Every probe and search is
//! logged for ordering assertions.

use super::{CollectionInfo, ScoredPoint, SearchParams, StoreError, StoreResult, VectorStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

struct ScriptedCollection {
    dimension: usize,
    points: Vec<ScoredPoint>,
}

/// Scripted backend
pub struct ScriptedStore {
    name: String,
    collections: Mutex<HashMap<String, ScriptedCollection>>,
    reachable: AtomicBool,
    honor_threshold: bool,
    latency: Option<Duration>,
    probed: Mutex<Vec<String>>,
    searched: Mutex<Vec<String>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            honor_threshold: true,
            latency: None,
            probed: Mutex::new(Vec::new()),
            searched: Mutex::new(Vec::new()),
        }
    }

    /// Add a collection holding `points`
    pub fn with_collection(self, name: &str, dimension: usize, points: Vec<ScoredPoint>) -> Self {
        guard(&self.collections).insert(name.to_string(), ScriptedCollection { dimension, points });
        self
    }

    /// Add a collection with no points
    pub fn with_empty_collection(self, name: &str, dimension: usize) -> Self {
        self.with_collection(name, dimension, Vec::new())
    }

    /// Start out unreachable
    pub fn unreachable(self) -> Self {
        self.set_reachable(false);
        self
    }

    /// Return every point regardless of `score_threshold`
    pub fn ignoring_threshold(mut self) -> Self {
        self.honor_threshold = false;
        self
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Collections passed to `collection_info`, in call order
    pub fn probed(&self) -> Vec<String> {
        guard(&self.probed).clone()
    }

    /// Collections passed to `search`, in call order
    pub fn searched(&self) -> Vec<String> {
        guard(&self.searched).clone()
    }

    async fn check_reachable(&self) -> StoreResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unreachable {
                endpoint: self.endpoint(),
                message: "connection refused".to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl VectorStore for ScriptedStore {
    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        self.check_reachable().await?;
        let mut names: Vec<String> = guard(&self.collections).keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn collection_info(&self, name: &str) -> StoreResult<Option<CollectionInfo>> {
        self.check_reachable().await?;
        guard(&self.probed).push(name.to_string());

        Ok(guard(&self.collections).get(name).map(|c| CollectionInfo {
            name: name.to_string(),
            points_count: c.points.len() as u64,
            dimension: Some(c.dimension),
        }))
    }

    async fn search(
        &self,
        collection: &str,
        _vector: &[f32],
        params: &SearchParams,
    ) -> StoreResult<Vec<ScoredPoint>> {
        self.check_reachable().await?;
        guard(&self.searched).push(collection.to_string());

        let collections = guard(&self.collections);
        let Some(scripted) = collections.get(collection) else {
            return Err(StoreError::Api {
                status: 404,
                message: format!("Collection `{}` doesn't exist!", collection),
            });
        };

        let mut points: Vec<ScoredPoint> = scripted
            .points
            .iter()
            .filter(|p| !self.honor_threshold || params.score_threshold.map_or(true, |t| p.score >= t))
            .cloned()
            .collect();
        points.sort_by(|a, b| b.score.total_cmp(&a.score));
        points.truncate(params.limit);
        Ok(points)
    }

    fn endpoint(&self) -> String {
        format!("scripted://{}", self.name)
    }
}

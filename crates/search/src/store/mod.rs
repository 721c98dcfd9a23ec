//! Vector-store client seam
//!
//! Provides:
//! - [`VectorStore`]: the three operations the router needs from a backend
//! - [`QdrantStore`]: Qdrant over its REST API
//! - [`ScriptedStore`]: in-process store with preset scores for tests
//!
//! Transport failures are reported as [`StoreError`] so callers can tell a
//! dead backend (scope fallback) from a collection-level problem (legacy-name
//! fallback).

mod qdrant;
#[cfg(any(test, feature = "testing"))]
mod scripted;

pub use qdrant::QdrantStore;
#[cfg(any(test, feature = "testing"))]
pub use scripted::ScriptedStore;

use scoperag_common::scope::ScopeSelector;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Vector-store failure
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("{endpoint} unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("{endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("store returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// True when the backend itself could not be reached
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unreachable { .. } | StoreError::Timeout { .. })
    }
}

/// Collection metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,

    /// Stored points; zero for an empty collection
    pub points_count: u64,

    /// Vector width, when the backend reports one
    pub dimension: Option<usize>,
}

/// Search tuning forwarded with every query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub limit: usize,

    /// Inclusive lower bound on similarity
    pub score_threshold: Option<f32>,

    /// HNSW beam width; larger is more accurate and slower
    pub hnsw_ef: Option<u64>,

    /// Bypass the index and scan every point
    pub exact: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            limit: 3,
            score_threshold: None,
            hnsw_ef: None,
            exact: false,
        }
    }
}

/// A point returned by a similarity search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    /// Point id rendered as a string (Qdrant ids are integers or UUIDs)
    pub id: String,

    pub score: f32,

    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl ScoredPoint {
    /// Build a point from a JSON object payload; non-object payloads become empty
    pub fn new(id: impl Into<String>, score: f32, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { id: id.into(), score, payload }
    }
}

/// A search result tagged with where it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalHit {
    pub id: String,

    pub score: f32,

    pub payload: Map<String, Value>,

    /// Collection the hit was read from
    pub collection: String,

    /// Scope whose backend served the hit
    pub scope: ScopeSelector,
}

impl RetrievalHit {
    pub fn from_point(point: ScoredPoint, collection: &str, scope: ScopeSelector) -> Self {
        Self {
            id: point.id,
            score: point.score,
            payload: point.payload,
            collection: collection.to_string(),
            scope,
        }
    }

    /// First non-empty string value among `keys`
    pub fn payload_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.payload.get(*k))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// Operations the router needs from a vector-store backend
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// Names of all collections; doubles as the connectivity probe
    async fn list_collections(&self) -> StoreResult<Vec<String>>;

    /// Metadata for one collection, `None` when it does not exist
    async fn collection_info(&self, name: &str) -> StoreResult<Option<CollectionInfo>>;

    /// Nearest neighbours of `vector` in `collection`, best first
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        params: &SearchParams,
    ) -> StoreResult<Vec<ScoredPoint>>;

    /// Human-readable address for logs and status output
    fn endpoint(&self) -> String;
}

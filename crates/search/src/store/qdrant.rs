//! Qdrant REST client
//!
//! Uses three endpoints:
//! - `GET /collections`
//! - `GET /collections/{name}`
//! - `POST /collections/{name}/points/search`

use super::{CollectionInfo, ScoredPoint, SearchParams, StoreError, StoreResult, VectorStore};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use scoperag_common::config::BackendConfig;
use scoperag_common::errors::{AppError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Qdrant envelope: `{"result": ..., "status": "ok", "time": ...}`
#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionList {
    collections: Vec<CollectionName>,
}

#[derive(Deserialize)]
struct CollectionName {
    name: String,
}

#[derive(Deserialize)]
struct CollectionDescription {
    #[serde(default)]
    points_count: Option<u64>,

    #[serde(default)]
    config: Option<Value>,
}

#[derive(Serialize)]
struct SearchBody<'a> {
    vector: &'a [f32],
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    score_threshold: Option<f32>,
    with_payload: bool,
    params: HnswParams,
}

#[derive(Serialize)]
struct HnswParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    hnsw_ef: Option<u64>,
    exact: bool,
}

#[derive(Deserialize)]
struct RawPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

/// Qdrant instance reached over HTTP
pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
}

impl QdrantStore {
    /// Create a client bound to one backend's address, key and timeout
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key).map_err(|e| AppError::Configuration {
                message: format!("invalid Qdrant api key: {}", e),
            })?;
            headers.insert("api-key", value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create Qdrant client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.url().trim_end_matches('/').to_string(),
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout { endpoint: self.base_url.clone() }
        } else if err.is_connect() || err.is_request() {
            StoreError::Unreachable {
                endpoint: self.base_url.clone(),
                message: err.to_string(),
            }
        } else {
            StoreError::Decode(err.to_string())
        }
    }

    async fn read<T: DeserializeOwned>(&self, response: reqwest::Response) -> StoreResult<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api { status: status.as_u16(), message });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(envelope.result)
    }
}

/// Vector width from a collection config, for unnamed or single named vectors
fn vector_dimension(config: &Value) -> Option<usize> {
    let vectors = config.get("params")?.get("vectors")?;
    if let Some(size) = vectors.get("size").and_then(Value::as_u64) {
        return Some(size as usize);
    }
    vectors
        .as_object()?
        .values()
        .find_map(|v| v.get("size").and_then(Value::as_u64))
        .map(|size| size as usize)
}

fn point_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl VectorStore for QdrantStore {
    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        let url = format!("{}/collections", self.base_url);
        let response = self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let list: CollectionList = self.read(response).await?;
        Ok(list.collections.into_iter().map(|c| c.name).collect())
    }

    async fn collection_info(&self, name: &str) -> StoreResult<Option<CollectionInfo>> {
        let url = format!("{}/collections/{}", self.base_url, name);
        let response = self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let description: CollectionDescription = self.read(response).await?;
        Ok(Some(CollectionInfo {
            name: name.to_string(),
            points_count: description.points_count.unwrap_or(0),
            dimension: description.config.as_ref().and_then(vector_dimension),
        }))
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        params: &SearchParams,
    ) -> StoreResult<Vec<ScoredPoint>> {
        let url = format!("{}/collections/{}/points/search", self.base_url, collection);
        let body = SearchBody {
            vector,
            limit: params.limit,
            score_threshold: params.score_threshold,
            with_payload: true,
            params: HnswParams {
                hnsw_ef: params.hnsw_ef,
                exact: params.exact,
            },
        };

        let response = self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let points: Vec<RawPoint> = self.read(response).await?;
        Ok(points
            .into_iter()
            .map(|p| ScoredPoint {
                id: point_id(&p.id),
                score: p.score,
                payload: p.payload.unwrap_or_default(),
            })
            .collect())
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}

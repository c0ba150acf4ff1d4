//! KNN lookups against the managed vector backend.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use glimpse_server::{BackendFailure, ProductMatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::constants::SIMILARITY_THRESHOLD;
use crate::services::rest::{RestClient, RestError};

#[derive(Debug, Error)]
#[error("vector search failed ({failure:?}): {message}")]
pub struct VectorSearchError {
    pub failure: BackendFailure,
    pub message: String,
}

impl VectorSearchError {
    pub fn new(failure: BackendFailure, message: impl Into<String>) -> Self {
        Self {
            failure,
            message: message.into(),
        }
    }
}

/// Candidate row as returned by the match function. `final_score` starts out
/// equal to `score`.
pub type Candidate = ProductMatch;

#[async_trait]
pub trait VectorSearchClient: Send + Sync {
    /// Up to `k` candidates ordered by descending similarity.
    async fn knn(&self, embedding: &[f32], k: usize) -> Result<Vec<Candidate>, VectorSearchError>;
}

#[derive(Debug, Clone)]
pub struct RpcVectorSearchClient {
    rest: RestClient,
    function: String,
}

#[derive(Serialize)]
struct MatchArgs<'a> {
    query_embedding: &'a [f32],
    match_count: usize,
    similarity_threshold: f64,
}

impl RpcVectorSearchClient {
    pub fn new(rest: RestClient, function: impl Into<String>) -> Self {
        let function = function.into();
        debug_assert!(!function.is_empty());
        Self { rest, function }
    }
}

#[async_trait]
impl VectorSearchClient for RpcVectorSearchClient {
    async fn knn(&self, embedding: &[f32], k: usize) -> Result<Vec<Candidate>, VectorSearchError> {
        debug_assert!(k > 0);
        let path = format!("rest/v1/rpc/{}", self.function);
        let args = MatchArgs {
            query_embedding: embedding,
            match_count: k,
            similarity_threshold: SIMILARITY_THRESHOLD,
        };
        let rows: Vec<CandidateRow> = self
            .rest
            .post_json(&path, &args)
            .await
            .map_err(classify_rest_error)?;
        tracing::debug!(function = %self.function, returned = rows.len(), "vector search completed");
        Ok(rows.into_iter().map(CandidateRow::into_candidate).collect())
    }
}

/// Row shape of the match function. Catalog ids may be numeric or textual.
#[derive(Debug, Deserialize)]
struct CandidateRow {
    id: Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    score: f64,
}

impl CandidateRow {
    fn into_candidate(self) -> Candidate {
        let id = match self.id {
            Value::String(text) => text,
            other => other.to_string(),
        };
        ProductMatch {
            id,
            title: self.title.unwrap_or_default(),
            price: self.price,
            brand: self.brand,
            color: self.color,
            category: self.category,
            image_url: self.image_url,
            score: self.score,
            final_score: self.score,
        }
    }
}

fn classify_rest_error(error: RestError) -> VectorSearchError {
    let failure = classify_backend_message(&error.to_string());
    VectorSearchError::new(failure, error.to_string())
}

pub fn classify_backend_message(message: &str) -> BackendFailure {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("pgrst203") || lowered.contains("could not choose the best candidate function")
    {
        BackendFailure::FunctionOverload
    } else if lowered.contains("57014") || lowered.contains("statement timeout") {
        BackendFailure::StatementTimeout
    } else {
        BackendFailure::Other
    }
}

/// Brute-force cosine search over a fixed catalog.
#[derive(Debug, Default, Clone)]
pub struct InMemoryVectorIndex {
    items: Arc<RwLock<Vec<(Vec<f32>, Candidate)>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// `embedding` is expected to be L2-normalized.
    pub fn insert(&self, embedding: Vec<f32>, item: Candidate) {
        match self.items.write() {
            Ok(mut items) => items.push((embedding, item)),
            Err(poisoned) => poisoned.into_inner().push((embedding, item)),
        }
    }

    pub fn len(&self) -> usize {
        match self.items.read() {
            Ok(items) => items.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorSearchClient for InMemoryVectorIndex {
    async fn knn(&self, embedding: &[f32], k: usize) -> Result<Vec<Candidate>, VectorSearchError> {
        let items = self
            .items
            .read()
            .map_err(|_| VectorSearchError::new(BackendFailure::Other, "index lock poisoned"))?;
        let mut scored: Vec<Candidate> = items
            .iter()
            .filter(|(stored, _)| stored.len() == embedding.len())
            .map(|(stored, item)| {
                let score = dot(stored, embedding);
                Candidate {
                    score,
                    final_score: score,
                    ..item.clone()
                }
            })
            .filter(|candidate| candidate.score >= SIMILARITY_THRESHOLD)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

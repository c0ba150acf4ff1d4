//! Content hash to embedding lookups.
//!
//! The cache is an optimization only: read failures are misses and write
//! failures are logged, never surfaced to the caller.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::services::rest::RestClient;

const CACHE_TABLE: &str = "rest/v1/query_cache";
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates";

pub type Embedding = Arc<[f32]>;

#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(&self, hash: &str) -> Option<Embedding>;

    /// Concurrent writes for the same hash are allowed; the last one wins.
    async fn put(&self, hash: &str, embedding: Embedding);
}

/// Bounded in-process cache.
#[derive(Clone)]
pub struct MokaEmbeddingCache {
    inner: Cache<String, Embedding>,
}

impl MokaEmbeddingCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        debug_assert!(max_capacity > 0);
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }
}

#[async_trait]
impl EmbeddingCache for MokaEmbeddingCache {
    async fn get(&self, hash: &str) -> Option<Embedding> {
        self.inner.get(hash).await
    }

    async fn put(&self, hash: &str, embedding: Embedding) {
        self.inner.insert(hash.to_string(), embedding).await;
    }
}

/// Table-backed cache shared by every replica.
#[derive(Debug, Clone)]
pub struct RestEmbeddingCache {
    rest: RestClient,
}

#[derive(Deserialize)]
struct CacheRow {
    embedding: Option<EmbeddingColumn>,
}

/// pgvector columns arrive either as JSON arrays or as their text form.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingColumn {
    Array(Vec<f32>),
    Text(String),
}

#[derive(Serialize)]
struct CacheInsert<'a> {
    image_hash: &'a str,
    embedding: &'a [f32],
}

impl RestEmbeddingCache {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl EmbeddingCache for RestEmbeddingCache {
    async fn get(&self, hash: &str) -> Option<Embedding> {
        debug_assert!(!hash.is_empty());
        let query = [
            ("select", "embedding".to_string()),
            ("image_hash", format!("eq.{hash}")),
            ("limit", "1".to_string()),
        ];
        match self.rest.get_json::<Vec<CacheRow>>(CACHE_TABLE, &query).await {
            Ok(rows) => rows
                .into_iter()
                .next()
                .and_then(|row| row.embedding)
                .and_then(EmbeddingColumn::into_vector)
                .filter(|vector| !vector.is_empty())
                .map(Embedding::from),
            Err(error) => {
                tracing::warn!(%error, %hash, "embedding cache read failed; treating as miss");
                None
            }
        }
    }

    async fn put(&self, hash: &str, embedding: Embedding) {
        let row = CacheInsert {
            image_hash: hash,
            embedding: &embedding,
        };
        if let Err(error) = self
            .rest
            .insert(CACHE_TABLE, &row, Some(MERGE_DUPLICATES))
            .await
        {
            tracing::warn!(%error, %hash, "embedding cache write failed");
        }
    }
}

impl EmbeddingColumn {
    fn into_vector(self) -> Option<Vec<f32>> {
        match self {
            EmbeddingColumn::Array(values) => Some(values),
            EmbeddingColumn::Text(text) => parse_vector_literal(&text),
        }
    }
}

fn parse_vector_literal(text: &str) -> Option<Vec<f32>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|part| part.trim().parse::<f32>().ok())
        .collect()
}

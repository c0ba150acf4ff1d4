//! Request pipeline: admission, ingestion, embedding, KNN, re-rank.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use glimpse_server::{
    BackendFailure, ClientRateLimiter, ImageQuery, SEARCH_SUCCEEDED_EVENT, SearchError,
    SearchRequest, SearchResponse, VisualSearch,
};
use serde_json::json;
use tokio::time::{Instant, timeout};

use crate::constants::{CANDIDATE_POOL, DEFAULT_CALL_TIMEOUT_MS, EMBEDDING_DIM, RESULT_LIMIT};
use crate::services::analytics::AnalyticsSink;
use crate::services::cache::{Embedding, EmbeddingCache};
use crate::services::embed::{EmbeddingProvider, l2_normalize};
use crate::services::ingest::{ImageIngestor, IngestError, IngestedImage};
use crate::services::rerank::rank;
use crate::services::vector::VectorSearchClient;

#[derive(bon::Builder)]
pub struct SearchPipeline {
    limiter: Option<Arc<ClientRateLimiter>>,
    ingestor: ImageIngestor,
    cache: Arc<dyn EmbeddingCache>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorSearchClient>,
    analytics: Arc<dyn AnalyticsSink>,
    #[builder(default = Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS))]
    call_timeout: Duration,
}

impl SearchPipeline {
    async fn bounded<T, F>(
        &self,
        stage: &'static str,
        call: F,
        on_timeout: fn(String) -> SearchError,
    ) -> Result<T, SearchError>
    where
        F: Future<Output = T>,
    {
        timeout(self.call_timeout, call).await.map_err(|_| {
            tracing::warn!(stage, timeout_ms = self.call_timeout.as_millis() as u64, "call timed out");
            on_timeout(format!(
                "{stage} timed out after {} ms",
                self.call_timeout.as_millis()
            ))
        })
    }

    /// Cached embedding for `image`, or a fresh normalized one.
    async fn resolve_embedding(
        &self,
        image: &IngestedImage,
    ) -> Result<(Embedding, bool), SearchError> {
        match timeout(self.call_timeout, self.cache.get(&image.hash)).await {
            Ok(Some(cached)) if cached.len() == EMBEDDING_DIM => {
                tracing::debug!(hash = %image.hash, "embedding cache hit");
                return Ok((cached, true));
            }
            Ok(Some(cached)) => {
                tracing::warn!(hash = %image.hash, dim = cached.len(), "ignoring cached embedding with wrong dimension");
            }
            Ok(None) => tracing::debug!(hash = %image.hash, "embedding cache miss"),
            Err(_) => tracing::warn!(hash = %image.hash, "embedding cache read timed out"),
        }

        let raw = self
            .bounded(
                "embedding provider",
                self.embedder.embed(&image.location),
                |message| SearchError::upstream_provider(message),
            )
            .await?
            .map_err(|error| SearchError::upstream_provider(error.to_string()))?;

        if raw.dim() != EMBEDDING_DIM || raw.vector.len() != EMBEDDING_DIM {
            let got = if raw.dim() != EMBEDDING_DIM {
                raw.dim()
            } else {
                raw.vector.len()
            };
            return Err(SearchError::data_integrity(format!(
                "embedding dim mismatch: expected {EMBEDDING_DIM}, got {got}"
            )));
        }

        let mut vector = raw.vector;
        l2_normalize(&mut vector);
        let embedding = Embedding::from(vector);

        if timeout(
            self.call_timeout,
            self.cache.put(&image.hash, Arc::clone(&embedding)),
        )
        .await
        .is_err()
        {
            tracing::warn!(hash = %image.hash, "embedding cache write timed out");
        }
        Ok((embedding, false))
    }

    fn record_success(&self, event_data: serde_json::Value) {
        let sink = Arc::clone(&self.analytics);
        let limit = self.call_timeout;
        tokio::spawn(async move {
            match timeout(limit, sink.append(SEARCH_SUCCEEDED_EVENT, event_data)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::warn!(%error, "analytics write failed"),
                Err(_) => tracing::warn!("analytics write timed out"),
            }
        });
    }
}

fn ingest_error(error: IngestError) -> SearchError {
    match error {
        IngestError::Fetch(source) => SearchError::upstream_fetch(source.to_string()),
        IngestError::Storage(source) => SearchError::upstream_storage(source.to_string()),
    }
}

fn backend_timeout(message: String) -> SearchError {
    SearchError::search_backend(BackendFailure::Other, message)
}

#[async_trait]
impl VisualSearch for SearchPipeline {
    async fn search(
        &self,
        client_key: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();

        if let Some(limiter) = &self.limiter {
            limiter.acquire(client_key).map_err(|rejected| {
                tracing::info!(client = %rejected.key, "search rate limited");
                SearchError::rate_limited("too many requests")
            })?;
        }

        let cropped = request.crop_requested || request.crop.is_some();
        let query = ImageQuery::from_parts(request.file, request.url, request.crop)?;

        // The ingestor bounds its own fetch, upload and sign calls.
        let image = self.ingestor.ingest(&query).await.map_err(ingest_error)?;

        let (embedding, used_cache) = self.resolve_embedding(&image).await?;

        let mut matches = self
            .bounded(
                "vector search",
                self.vectors.knn(&embedding, CANDIDATE_POOL),
                backend_timeout,
            )
            .await?
            .map_err(|error| SearchError::search_backend(error.failure, error.message))?;

        let filtered = rank(&mut matches, &request.filters, RESULT_LIMIT);
        let search_time_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;

        tracing::debug!(
            hash = %image.hash,
            results = matches.len(),
            used_cache,
            filtered,
            search_time_ms,
            "search completed"
        );
        self.record_success(json!({
            "results_count": matches.len(),
            "search_time_ms": search_time_ms,
            "used_cache": used_cache,
            "filtered": filtered,
            "bbox": cropped,
        }));

        Ok(SearchResponse {
            matches,
            used_cache,
            search_time_ms,
        })
    }
}

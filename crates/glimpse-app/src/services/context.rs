//! Wires configured collaborators into a runnable pipeline.

use std::{sync::Arc, time::Duration};

use glimpse_server::{AnalyticsReader, ClientRateLimiter, RateLimitConfigError};
use thiserror::Error;

use crate::config::{AppConfig, StoreBackend};
use crate::services::analytics::{AnalyticsSink, MemoryAnalytics, RestAnalytics};
use crate::services::cache::{EmbeddingCache, MokaEmbeddingCache, RestEmbeddingCache};
use crate::services::embed::{EmbedError, EmbeddingProvider, HttpEmbeddingProvider};
use crate::services::ingest::{HttpImageFetcher, ImageIngestor};
use crate::services::pipeline::SearchPipeline;
use crate::services::rest::{RestClient, RestError};
use crate::services::storage::RestObjectStorage;
use crate::services::vector::{RpcVectorSearchClient, VectorSearchClient};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("{0} must be configured")]
    Missing(&'static str),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitConfigError),
}

/// Everything `serve`, `search` and `probe` need.
pub struct AppContext {
    pub pipeline: Arc<SearchPipeline>,
    pub analytics: Arc<dyn AnalyticsReader>,
    pub limiter: Option<Arc<ClientRateLimiter>>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vectors: Arc<dyn VectorSearchClient>,
}

fn require<'a>(value: &'a str, name: &'static str) -> Result<&'a str, ContextError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ContextError::Missing(name))
    } else {
        Ok(trimmed)
    }
}

pub fn build_app_context(config: &AppConfig) -> Result<AppContext, ContextError> {
    let call_timeout = Duration::from_millis(config.pipeline.call_timeout_ms.max(1));

    let backend_url = require(&config.backend.url, "backend.url")?;
    let rest = RestClient::new(backend_url, &config.backend.service_key, call_timeout)?;

    let endpoint = require(&config.embedding.endpoint, "embedding.endpoint")?;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(
        endpoint,
        config.embedding.token.clone(),
        call_timeout,
    )?);

    let vectors: Arc<dyn VectorSearchClient> = Arc::new(RpcVectorSearchClient::new(
        rest.clone(),
        config.backend.match_function.clone(),
    ));

    let ingestor = ImageIngestor::builder()
        .storage(Arc::new(RestObjectStorage::new(
            rest.clone(),
            config.backend.storage_bucket.clone(),
        )))
        .fetcher(Arc::new(HttpImageFetcher::new(rest.http().clone())))
        .sign_ttl(Duration::from_secs(config.backend.sign_ttl_secs.max(1)))
        .call_timeout(call_timeout)
        .build();

    let cache: Arc<dyn EmbeddingCache> = match config.cache.backend {
        StoreBackend::Memory => Arc::new(MokaEmbeddingCache::new(
            config.cache.max_capacity.max(1),
            Duration::from_secs(config.cache.ttl_secs.max(1)),
        )),
        StoreBackend::Rest => Arc::new(RestEmbeddingCache::new(rest.clone())),
    };

    let (sink, analytics): (Arc<dyn AnalyticsSink>, Arc<dyn AnalyticsReader>) =
        match config.analytics.backend {
            StoreBackend::Memory => {
                let memory = Arc::new(MemoryAnalytics::new(config.analytics.memory_capacity));
                let sink: Arc<dyn AnalyticsSink> = memory.clone();
                let reader: Arc<dyn AnalyticsReader> = memory;
                (sink, reader)
            }
            StoreBackend::Rest => {
                let remote = Arc::new(RestAnalytics::new(rest.clone()));
                let sink: Arc<dyn AnalyticsSink> = remote.clone();
                let reader: Arc<dyn AnalyticsReader> = remote;
                (sink, reader)
            }
        };

    let limiter = if config.server.rate_limit.enabled {
        Some(Arc::new(ClientRateLimiter::try_new(
            &config.server.rate_limit,
        )?))
    } else {
        tracing::warn!("rate limiting disabled");
        None
    };

    let pipeline = SearchPipeline::builder()
        .maybe_limiter(limiter.clone())
        .ingestor(ingestor)
        .cache(cache)
        .embedder(Arc::clone(&embedder))
        .vectors(Arc::clone(&vectors))
        .analytics(sink)
        .call_timeout(call_timeout)
        .build();

    tracing::debug!(
        cache = ?config.cache.backend,
        analytics = ?config.analytics.backend,
        timeout_ms = call_timeout.as_millis() as u64,
        "pipeline context ready"
    );

    Ok(AppContext {
        pipeline: Arc::new(pipeline),
        analytics,
        limiter,
        embedder,
        vectors,
    })
}

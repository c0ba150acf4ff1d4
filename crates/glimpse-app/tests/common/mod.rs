#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use glimpse_app::constants::EMBEDDING_DIM;
use glimpse_app::services::{
    AnalyticsError, AnalyticsSink, EmbedError, Embedding, EmbeddingCache, EmbeddingProvider,
    FetchError, ImageFetcher, ImageIngestor, InMemoryVectorIndex, MemoryAnalytics,
    MokaEmbeddingCache, ObjectStorage, RawEmbedding, RestError, SearchPipeline, StorageError,
    VectorSearchClient, VectorSearchError, l2_normalize,
};
use glimpse_server::{BackendFailure, ClientRateLimiter, ProductMatch, RateLimitConfig};
use serde_json::Value;

#[derive(Default)]
pub struct FakeStorage {
    pub uploads: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(
        &self,
        path: &str,
        _bytes: Bytes,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.uploads
            .lock()
            .expect("uploads mutex")
            .push(path.to_string());
        Ok(())
    }

    async fn sign(&self, path: &str, _ttl: Duration) -> Result<String, StorageError> {
        Ok(format!("https://storage.test/{path}?token=signed"))
    }
}

pub struct NoFetch;

#[async_trait]
impl ImageFetcher for NoFetch {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        Err(FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

/// Never answers within any test timeout.
pub struct StalledFetch;

#[async_trait]
impl ImageFetcher for StalledFetch {
    async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Bytes::new())
    }
}

/// Rejects every write.
pub struct BrokenSink;

#[async_trait]
impl AnalyticsSink for BrokenSink {
    async fn append(&self, _event_type: &str, _event_data: Value) -> Result<(), AnalyticsError> {
        Err(AnalyticsError::Rest(RestError::Status {
            endpoint: "rest/v1/analytics_events".to_string(),
            status: 503,
            body: "unavailable".to_string(),
        }))
    }
}

/// Raw vector `FakeEmbedder` returns for `dim`.
pub fn fake_embedding(dim: usize) -> Vec<f32> {
    (0..dim).map(|i| 2.0 + (i % 5) as f32).collect()
}

/// What the pipeline sends to vector search after normalizing `fake_embedding`.
pub fn fake_query_vector(dim: usize) -> Vec<f32> {
    let mut vector = fake_embedding(dim);
    l2_normalize(&mut vector);
    vector
}

/// Returns a fixed vector with the given length, scaled so it is not unit norm.
pub struct FakeEmbedder {
    pub dim: usize,
    pub calls: AtomicUsize,
    pub fail_with: Option<String>,
}

impl FakeEmbedder {
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            calls: AtomicUsize::new(0),
            fail_with: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::with_dim(EMBEDDING_DIM)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, _image_ref: &str) -> Result<RawEmbedding, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(EmbedError::Provider(message.clone()));
        }
        Ok(RawEmbedding {
            vector: fake_embedding(self.dim),
            reported_dim: Some(self.dim),
        })
    }
}

/// In-process cache that counts writes.
pub struct CountingCache {
    pub inner: MokaEmbeddingCache,
    pub puts: AtomicUsize,
}

impl Default for CountingCache {
    fn default() -> Self {
        Self {
            inner: MokaEmbeddingCache::new(128, Duration::from_secs(600)),
            puts: AtomicUsize::new(0),
        }
    }
}

impl CountingCache {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingCache for CountingCache {
    async fn get(&self, hash: &str) -> Option<Embedding> {
        self.inner.get(hash).await
    }

    async fn put(&self, hash: &str, embedding: Embedding) {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(hash, embedding).await;
    }
}

/// Serves a fixed candidate pool and records what it was asked.
pub struct FakeVectors {
    pub pool: Vec<ProductMatch>,
    pub requested_k: Mutex<Vec<usize>>,
    pub last_norm: Mutex<Option<f64>>,
    pub fail_with: Option<(BackendFailure, String)>,
}

impl FakeVectors {
    pub fn with_pool(pool: Vec<ProductMatch>) -> Self {
        Self {
            pool,
            requested_k: Mutex::new(Vec::new()),
            last_norm: Mutex::new(None),
            fail_with: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.requested_k.lock().expect("k mutex").len()
    }
}

#[async_trait]
impl VectorSearchClient for FakeVectors {
    async fn knn(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ProductMatch>, VectorSearchError> {
        self.requested_k.lock().expect("k mutex").push(k);
        let norm = embedding
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt();
        *self.last_norm.lock().expect("norm mutex") = Some(norm);
        if let Some((failure, message)) = &self.fail_with {
            return Err(VectorSearchError::new(*failure, message.clone()));
        }
        Ok(self.pool.iter().take(k).cloned().collect())
    }
}

pub fn product(id: usize, score: f64) -> ProductMatch {
    ProductMatch {
        id: format!("p{id}"),
        title: format!("Product {id}"),
        price: Some(50.0 + id as f64),
        brand: Some(if id % 2 == 0 { "Adidas" } else { "Puma" }.to_string()),
        color: Some("black".to_string()),
        category: Some("shoes".to_string()),
        image_url: Some(format!("https://img.test/{id}.jpg")),
        score,
        final_score: score,
    }
}

/// 48 candidates with strictly descending scores.
pub fn candidate_pool() -> Vec<ProductMatch> {
    (0..48).map(|i| product(i, 0.95 - i as f64 * 0.01)).collect()
}

pub struct Harness {
    pub storage: Arc<FakeStorage>,
    pub embedder: Arc<FakeEmbedder>,
    pub cache: Arc<CountingCache>,
    pub vectors: Arc<FakeVectors>,
    pub analytics: Arc<MemoryAnalytics>,
    pub pipeline: Arc<SearchPipeline>,
}

pub struct HarnessOptions {
    pub embedder: FakeEmbedder,
    pub vectors: FakeVectors,
    /// Searched instead of `vectors` when set.
    pub index: Option<InMemoryVectorIndex>,
    /// Written to instead of the in-memory analytics when set.
    pub sink: Option<Arc<dyn AnalyticsSink>>,
    pub fetcher: Option<Arc<dyn ImageFetcher>>,
    pub ingest_timeout: Option<Duration>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            embedder: FakeEmbedder::with_dim(EMBEDDING_DIM),
            vectors: FakeVectors::with_pool(candidate_pool()),
            index: None,
            sink: None,
            fetcher: None,
            ingest_timeout: None,
            rate_limit: None,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let storage = Arc::new(FakeStorage::default());
        let embedder = Arc::new(options.embedder);
        let cache = Arc::new(CountingCache::default());
        let vectors = Arc::new(options.vectors);
        let analytics = Arc::new(MemoryAnalytics::new(100));
        let limiter = options.rate_limit.map(|cfg| {
            Arc::new(ClientRateLimiter::try_new(&cfg).expect("valid rate limit config"))
        });

        let fetcher = options
            .fetcher
            .unwrap_or_else(|| Arc::new(NoFetch) as Arc<dyn ImageFetcher>);
        let ingestor = ImageIngestor::builder()
            .storage(storage.clone())
            .fetcher(fetcher)
            .call_timeout(options.ingest_timeout.unwrap_or(Duration::from_secs(5)))
            .build();
        let search: Arc<dyn VectorSearchClient> = match options.index {
            Some(index) => Arc::new(index),
            None => vectors.clone(),
        };
        let sink = options
            .sink
            .unwrap_or_else(|| analytics.clone() as Arc<dyn AnalyticsSink>);
        let pipeline = SearchPipeline::builder()
            .maybe_limiter(limiter)
            .ingestor(ingestor)
            .cache(cache.clone())
            .embedder(embedder.clone())
            .vectors(search)
            .analytics(sink)
            .call_timeout(Duration::from_secs(5))
            .build();

        Self {
            storage,
            embedder,
            cache,
            vectors,
            analytics,
            pipeline: Arc::new(pipeline),
        }
    }

    /// Analytics run on a detached task; give it a chance to land.
    pub async fn wait_for_events(&self, expected: usize) {
        for _ in 0..200 {
            if self.analytics.len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {expected} analytics events, saw {}",
            self.analytics.len()
        );
    }
}

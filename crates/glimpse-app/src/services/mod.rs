//! IO-bound collaborators of the search pipeline.
//!
//! Each external system sits behind a trait so the pipeline can be exercised
//! with in-memory fakes; pure transforms (cropping, normalization, re-ranking)
//! stay free functions next to the service that uses them.

pub mod analytics;
pub mod cache;
pub mod context;
pub mod embed;
pub mod ingest;
pub mod pipeline;
pub mod rerank;
pub mod rest;
pub mod storage;
pub mod vector;

pub use analytics::{AnalyticsError, AnalyticsSink, MemoryAnalytics, RestAnalytics};
pub use cache::{Embedding, EmbeddingCache, MokaEmbeddingCache, RestEmbeddingCache};
pub use context::{AppContext, ContextError, build_app_context};
pub use embed::{
    EmbedError, EmbeddingProvider, HttpEmbeddingProvider, RawEmbedding, l2_normalize,
    parse_embedding_payload,
};
pub use ingest::{
    ContentHash, FetchError, HttpImageFetcher, ImageFetcher, ImageIngestor, IngestError,
    IngestedImage, content_hash, crop_image,
};
pub use pipeline::SearchPipeline;
pub use rerank::{meta_boost, rank};
pub use rest::{RestClient, RestError};
pub use storage::{ObjectStorage, RestObjectStorage, StorageError};
pub use vector::{
    Candidate, InMemoryVectorIndex, RpcVectorSearchClient, VectorSearchClient, VectorSearchError,
};

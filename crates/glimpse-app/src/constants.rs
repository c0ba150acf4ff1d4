//! Cross-cutting application constants.

/// Dimensionality the vector backend indexes; anything else is rejected.
pub const EMBEDDING_DIM: usize = 1152;

/// Candidates requested from the vector backend before re-ranking.
pub const CANDIDATE_POOL: usize = 48;

/// Matches returned to the caller.
pub const RESULT_LIMIT: usize = 24;

pub const SIMILARITY_THRESHOLD: f64 = 0.0;

/// Object storage prefix for uploaded and cropped query images.
pub const QUERY_OBJECT_PREFIX: &str = "queries";

pub const DEFAULT_SIGN_TTL_SECS: u64 = 120;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MATCH_FUNCTION: &str = "match_products_siglip";
pub const DEFAULT_STORAGE_BUCKET: &str = "uploads";

pub const CROP_JPEG_QUALITY: u8 = 92;
/// Crops this narrow (in pixels) or narrower fall back to the original image.
pub const MIN_CROP_EDGE_PX: u32 = 2;

/// Image the health probe asks the embedding provider to encode.
pub const PROBE_IMAGE_URL: &str = "http://images.cocodataset.org/val2017/000000039769.jpg";

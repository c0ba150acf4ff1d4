use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Crop rectangle expressed as fractions of the source width/height.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct CropBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Metadata filters supplied with a search. Empty lists and absent bounds are
/// equivalent to "no filter".
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FilterSpec {
    #[serde(default, rename = "brand", deserialize_with = "null_as_empty")]
    pub brands: Vec<String>,
    #[serde(default, rename = "color", deserialize_with = "null_as_empty")]
    pub colors: Vec<String>,
    #[serde(default, rename = "category", deserialize_with = "null_as_empty")]
    pub categories: Vec<String>,
    #[serde(default, rename = "priceMin")]
    pub price_min: Option<f64>,
    #[serde(default, rename = "priceMax")]
    pub price_max: Option<f64>,
}

// A list sent as `null` means the same as an omitted one.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl FilterSpec {
    pub fn has_any_filter(&self) -> bool {
        !self.brands.is_empty()
            || !self.colors.is_empty()
            || !self.categories.is_empty()
            || self.has_price_range()
    }

    pub fn has_price_range(&self) -> bool {
        self.price_min.is_some() || self.price_max.is_some()
    }

    pub fn price_in_range(&self, price: f64) -> bool {
        self.price_min.is_none_or(|min| price >= min) && self.price_max.is_none_or(|max| price <= max)
    }
}

/// Where the query image comes from. Exactly one source per request.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Bytes(Bytes),
    Url(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageQuery {
    pub source: ImageSource,
    pub crop: Option<CropBox>,
}

impl ImageQuery {
    pub fn from_parts(
        file: Option<Bytes>,
        url: Option<String>,
        crop: Option<CropBox>,
    ) -> Result<Self, SearchError> {
        let file = file.filter(|bytes| !bytes.is_empty());
        let url = url
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());
        let source = match (file, url) {
            (Some(bytes), None) => ImageSource::Bytes(bytes),
            (None, Some(url)) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(SearchError::invalid_param(
                        "url",
                        "must be an absolute http(s) URL",
                    ));
                }
                ImageSource::Url(url)
            }
            (None, None) => {
                return Err(SearchError::invalid_param("file", "provide file or url"));
            }
            (Some(_), Some(_)) => {
                return Err(SearchError::invalid_param(
                    "file",
                    "provide either file or url, not both",
                ));
            }
        };
        Ok(Self { source, crop })
    }
}

/// Parsed inbound search. Source validation is deferred to the pipeline so
/// that admission control runs first.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub file: Option<Bytes>,
    pub url: Option<String>,
    pub crop: Option<CropBox>,
    /// A crop box was sent, even if it failed to parse and `crop` is `None`.
    pub crop_requested: bool,
    pub filters: FilterSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMatch {
    pub id: String,
    pub title: String,
    pub price: Option<f64>,
    pub brand: Option<String>,
    pub color: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    /// Cosine similarity reported by the vector backend.
    pub score: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub matches: Vec<ProductMatch>,
    pub used_cache: bool,
    pub search_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_type: String,
    #[serde(default)]
    pub event_data: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Event emitted after every successful search.
pub const SEARCH_SUCCEEDED_EVENT: &str = "search_succeeded";

#[async_trait]
pub trait VisualSearch: Send + Sync + 'static {
    async fn search(
        &self,
        client_key: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse, SearchError>;
}

#[async_trait]
pub trait AnalyticsReader: Send + Sync + 'static {
    async fn recent_events(&self, limit: usize) -> Result<Vec<AnalyticsEvent>, SearchError>;
}

#[derive(Debug, Clone)]
pub struct SearchError {
    pub kind: SearchErrorKind,
    pub message: String,
    pub field: Option<String>,
}

impl SearchError {
    pub fn invalid_param(field: impl Into<String>, message: impl Into<String>) -> Self {
        SearchError {
            kind: SearchErrorKind::InvalidParameter,
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::with_kind(SearchErrorKind::RateLimited, message)
    }

    pub fn upstream_provider(message: impl Into<String>) -> Self {
        Self::with_kind(SearchErrorKind::UpstreamProvider, message)
    }

    pub fn upstream_storage(message: impl Into<String>) -> Self {
        Self::with_kind(SearchErrorKind::UpstreamStorage, message)
    }

    pub fn upstream_fetch(message: impl Into<String>) -> Self {
        Self::with_kind(SearchErrorKind::UpstreamFetch, message)
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::with_kind(SearchErrorKind::DataIntegrity, message)
    }

    pub fn search_backend(failure: BackendFailure, message: impl Into<String>) -> Self {
        Self::with_kind(SearchErrorKind::SearchBackend(failure), message)
    }

    fn with_kind(kind: SearchErrorKind, message: impl Into<String>) -> Self {
        SearchError {
            kind,
            message: message.into(),
            field: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchErrorKind {
    InvalidParameter,
    RateLimited,
    UpstreamProvider,
    UpstreamStorage,
    UpstreamFetch,
    DataIntegrity,
    SearchBackend(BackendFailure),
}

/// Recognised vector backend failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFailure {
    FunctionOverload,
    StatementTimeout,
    Other,
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SearchError {}

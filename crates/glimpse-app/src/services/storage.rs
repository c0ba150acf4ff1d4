use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::rest::{RestClient, RestError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload of `{path}` failed: {source}")]
    Upload {
        path: String,
        #[source]
        source: RestError,
    },
    #[error("signing `{path}` failed: {source}")]
    Sign {
        path: String,
        #[source]
        source: RestError,
    },
    #[error("signing `{path}` returned no url")]
    EmptySignedUrl { path: String },
    #[error("{operation} of `{path}` timed out after {timeout_ms} ms")]
    TimedOut {
        operation: &'static str,
        path: String,
        timeout_ms: u64,
    },
}

/// Object storage for query images the embedding provider must fetch.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` at `path`, replacing any previous object.
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str)
    -> Result<(), StorageError>;

    /// Return an absolute URL granting read access to `path` for `ttl`.
    async fn sign(&self, path: &str, ttl: Duration) -> Result<String, StorageError>;
}

#[derive(Debug, Clone)]
pub struct RestObjectStorage {
    rest: RestClient,
    bucket: String,
}

#[derive(Serialize)]
struct SignRequest {
    #[serde(rename = "expiresIn")]
    expires_in: u64,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", default)]
    signed_url: String,
}

impl RestObjectStorage {
    pub fn new(rest: RestClient, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        debug_assert!(!bucket.is_empty());
        Self { rest, bucket }
    }

    /// Signed paths come back relative to the backend origin.
    fn absolutize(&self, signed: &str) -> String {
        if signed.starts_with('/') {
            format!("{}{signed}", self.rest.origin())
        } else {
            signed.to_string()
        }
    }
}

#[async_trait]
impl ObjectStorage for RestObjectStorage {
    async fn upload(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        debug_assert!(!path.is_empty());
        let object = format!("storage/v1/object/{}/{path}", self.bucket);
        tracing::debug!(%path, size = bytes.len(), content_type, "uploading query image");
        self.rest
            .post_bytes(&object, bytes, content_type)
            .await
            .map_err(|source| StorageError::Upload {
                path: path.to_string(),
                source,
            })
    }

    async fn sign(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        debug_assert!(!path.is_empty());
        let object = format!("storage/v1/object/sign/{}/{path}", self.bucket);
        let request = SignRequest {
            expires_in: ttl.as_secs().max(1),
        };
        let response: SignResponse = self
            .rest
            .post_json(&object, &request)
            .await
            .map_err(|source| StorageError::Sign {
                path: path.to_string(),
                source,
            })?;
        if response.signed_url.trim().is_empty() {
            return Err(StorageError::EmptySignedUrl {
                path: path.to_string(),
            });
        }
        Ok(self.absolutize(&response.signed_url))
    }
}

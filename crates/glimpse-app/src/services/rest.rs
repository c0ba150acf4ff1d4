//! Thin authenticated client for the managed backend's REST surface.
//!
//! Storage, the embedding cache table, the KNN RPC and analytics all share one
//! connection pool and one service key.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, header::CONTENT_TYPE};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use url::Url;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("invalid backend url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} answered {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base: Url,
    service_key: String,
}

impl RestClient {
    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> Result<Self, RestError> {
        debug_assert!(!timeout.is_zero());
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RestError::Client)?;
        Self::with_http(http, base_url, service_key)
    }

    pub fn with_http(http: Client, base_url: &str, service_key: &str) -> Result<Self, RestError> {
        let trimmed = base_url.trim();
        let normalized = if trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        };
        let base = Url::parse(&normalized).map_err(|source| RestError::InvalidUrl {
            url: trimmed.to_string(),
            source,
        })?;
        Ok(Self {
            http,
            base,
            service_key: service_key.to_string(),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Base URL without the trailing slash, for rebuilding relative links.
    pub fn origin(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, RestError> {
        debug_assert!(!path.starts_with('/'));
        self.base.join(path).map_err(|source| RestError::InvalidUrl {
            url: format!("{}{path}", self.base),
            source,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RestError> {
        let url = self.endpoint(path)?;
        let request = self.authorized(self.http.get(url.clone()).query(query));
        let response = send(request, &url).await?;
        decode(response, &url).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let request = self.authorized(self.http.post(url.clone()).json(body));
        let response = send(request, &url).await?;
        decode(response, &url).await
    }

    /// POST a JSON row and ignore the response body. `prefer` is passed as the
    /// `Prefer` header (e.g. upsert resolution).
    pub async fn insert<B>(&self, path: &str, body: &B, prefer: Option<&str>) -> Result<(), RestError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        let mut request = self.http.post(url.clone()).json(body);
        if let Some(prefer) = prefer {
            request = request.header("Prefer", prefer);
        }
        send(self.authorized(request), &url).await?;
        Ok(())
    }

    pub async fn post_bytes(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), RestError> {
        let url = self.endpoint(path)?;
        let request = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes);
        send(self.authorized(request), &url).await?;
        Ok(())
    }
}

async fn send(request: RequestBuilder, url: &Url) -> Result<Response, RestError> {
    let response = request.send().await.map_err(|source| RestError::Transport {
        endpoint: redact(url),
        source,
    })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RestError::Status {
        endpoint: redact(url),
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    })
}

async fn decode<T: DeserializeOwned>(response: Response, url: &Url) -> Result<T, RestError> {
    response.json().await.map_err(|source| RestError::Decode {
        endpoint: redact(url),
        source,
    })
}

/// Drop query strings (signed tokens, filters) from URLs that end up in logs.
fn redact(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

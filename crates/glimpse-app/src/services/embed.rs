use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("failed to build embedding client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("embedding request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("embedding provider answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("embedding provider error: {0}")]
    Provider(String),
    #[error("unexpected embedding payload: {0}")]
    UnexpectedShape(String),
}

/// Raw provider output; dimension and normalization are checked by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEmbedding {
    pub vector: Vec<f32>,
    /// Dimension the provider claims, which may disagree with the vector.
    pub reported_dim: Option<usize>,
}

impl RawEmbedding {
    pub fn dim(&self) -> usize {
        self.reported_dim.unwrap_or(self.vector.len())
    }
}

/// Converts an image reference (a fetchable URL) into an embedding.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, image_ref: &str) -> Result<RawEmbedding, EmbedError>;
}

#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: EmbedInputs<'a>,
}

#[derive(Serialize)]
struct EmbedInputs<'a> {
    image_url: &'a str,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EmbedError> {
        let endpoint = endpoint.into();
        debug_assert!(!endpoint.is_empty());
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EmbedError::Client)?;
        Ok(Self {
            http,
            endpoint,
            token: token.into(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, image_ref: &str) -> Result<RawEmbedding, EmbedError> {
        debug_assert!(!image_ref.is_empty());
        let request = EmbedRequest {
            inputs: EmbedInputs {
                image_url: image_ref,
            },
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(EmbedError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }
        let payload: Value = response.json().await.map_err(EmbedError::Transport)?;
        parse_embedding_payload(payload)
    }
}

#[derive(Deserialize)]
struct EmbeddingPayload {
    embedding: Vec<f32>,
    #[serde(default)]
    dim: Option<usize>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: Value,
}

/// Accepts `{"embedding": [...], "dim"?: n}` or `{"error": ...}`. Extra keys on
/// the object (model name, `dims`) are ignored; bare lists and any non-object
/// are rejected.
pub fn parse_embedding_payload(payload: Value) -> Result<RawEmbedding, EmbedError> {
    if !payload.is_object() {
        return Err(EmbedError::UnexpectedShape(format!(
            "expected a JSON object, got {}",
            json_kind(&payload)
        )));
    }
    if payload.get("error").is_some() {
        let ErrorPayload { error } = serde_json::from_value(payload)
            .map_err(|err| EmbedError::UnexpectedShape(err.to_string()))?;
        let message = match error {
            Value::String(text) => text,
            other => other.to_string(),
        };
        return Err(EmbedError::Provider(message));
    }
    let parsed: EmbeddingPayload = serde_json::from_value(payload)
        .map_err(|err| EmbedError::UnexpectedShape(err.to_string()))?;
    Ok(RawEmbedding {
        vector: parsed.embedding,
        reported_dim: parsed.dim,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Scale to unit length. A zero vector is returned unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt();
    let divisor = if norm == 0.0 { 1.0 } else { norm };
    for value in vector.iter_mut() {
        *value = (f64::from(*value) / divisor) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn norm(vector: &[f32]) -> f64 {
        vector
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt()
    }

    #[test]
    fn normalized_vectors_have_unit_norm() {
        let mut vector: Vec<f32> = (0..1152).map(|i| (i % 17) as f32 - 8.0).collect();
        l2_normalize(&mut vector);
        assert!((norm(&vector) - 1.0).abs() < 1e-5);

        let mut small = vec![3.0_f32, 4.0];
        l2_normalize(&mut small);
        assert!((small[0] - 0.6).abs() < 1e-6);
        assert!((small[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_left_untouched() {
        let mut zero = vec![0.0_f32; 8];
        l2_normalize(&mut zero);
        assert!(zero.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn embedding_payload_is_parsed() {
        let raw = parse_embedding_payload(json!({ "embedding": [0.1, 0.2], "dim": 2 }))
            .expect("valid payload");
        assert_eq!(raw.vector, vec![0.1, 0.2]);
        assert_eq!(raw.dim(), 2);

        let without_dim =
            parse_embedding_payload(json!({ "embedding": [1.0, 2.0, 3.0] })).expect("dim optional");
        assert_eq!(without_dim.dim(), 3);
    }

    #[test]
    fn reported_dim_wins_over_length() {
        let raw = parse_embedding_payload(json!({ "embedding": [0.1], "dim": 512 }))
            .expect("valid payload");
        assert_eq!(raw.dim(), 512);
    }

    #[test]
    fn error_payload_is_surfaced() {
        let err = parse_embedding_payload(json!({ "error": "model loading" }))
            .expect_err("error payload");
        assert!(matches!(err, EmbedError::Provider(message) if message == "model loading"));
    }

    #[test]
    fn encoder_metadata_keys_are_ignored() {
        let raw = parse_embedding_payload(json!({
            "embedding": vec![0.5_f32; 1152],
            "dim": 1152,
            "dims": 1152,
            "model": "google/siglip-so400m-patch14-384",
        }))
        .expect("encoder payload with metadata");
        assert_eq!(raw.dim(), 1152);
        assert_eq!(raw.vector.len(), 1152);
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        for payload in [
            json!([[0.1, 0.2]]),
            json!({ "vector": [0.1] }),
            json!({ "embedding": "0.1,0.2" }),
            json!([0.1, 0.2]),
            json!("0.1,0.2"),
        ] {
            let err = parse_embedding_payload(payload).expect_err("shape must be rejected");
            assert!(matches!(err, EmbedError::UnexpectedShape(_)));
        }
    }
}

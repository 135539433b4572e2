//! Text embedding backends.
//!
//! A [`TextEmbedder`] maps a batch of strings to one fixed-width vector per
//! string, returned as a flat `f16` buffer. [`ApiEmbedder`] calls an
//! OpenAI-compatible embeddings endpoint; [`ZeroEmbedder`] returns zero vectors
//! and is used when embeddings are skipped.

use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use half::f16;
use rand::Rng;
use reqwest::{
    Client,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::time::sleep;

/// The truncated MRL dimensionality we actually store (as f16).
pub const DEFAULT_EMBEDDING_DIM: usize = 256;

/// Strings per request.
pub const DEFAULT_BATCH_SIZE: usize = 128;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to parse API response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("failed to start embedding runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("API returned an error: {0}")]
    Api(String),

    #[error("embedding[{index}] has dimension {got}, expected at least {expected}")]
    Dimension {
        index: usize,
        got: usize,
        expected: usize,
    },
}

// ============================================================================
// Trait
// ============================================================================

pub trait TextEmbedder {
    /// Width of every returned vector.
    fn dim(&self) -> usize;

    /// Embeds a batch of text strings, returning a flat buffer of `f16` values.
    /// The returned buffer has length `texts.len() * self.dim()`, laid out contiguously:
    /// the embedding for `texts[i]` occupies indices `i * dim..(i + 1) * dim`.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<f16>, EmbedderError>;

    /// Embed any number of strings, `batch_size` at a time. Output order and
    /// values do not depend on the batch size.
    fn embed_all(&self, texts: &[&str], batch_size: usize) -> Result<Vec<f16>, EmbedderError> {
        let mut out = Vec::with_capacity(texts.len() * self.dim());
        for chunk in texts.chunks(batch_size.max(1)) {
            out.extend(self.embed_batch(chunk)?);
        }
        Ok(out)
    }
}

/// Zero vectors of a fixed width.
#[derive(Debug, Clone, Copy)]
pub struct ZeroEmbedder {
    pub dim: usize,
}

impl TextEmbedder for ZeroEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<f16>, EmbedderError> {
        Ok(vec![f16::ZERO; texts.len() * self.dim])
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct EmbedderConfig {
    /// The URL of the OpenAI-compatible embeddings endpoint
    pub base_url: String,
    pub api_key: String,
    /// Sent as `model` in the request body when set.
    pub model: Option<String>,
    /// Stored width; responses are truncated to this many leading components (MRL).
    pub dim: usize,
    /// Requests that exceed this timeout will be retried according to the retry policy.
    pub request_timeout: Duration,
    pub max_retries: u32,
    /// Requests in flight at once in [`ApiEmbedder::embed_all`].
    pub concurrency: usize,
}

impl EmbedderConfig {
    /// Read `EMBEDDER_URL`, `EMBEDDER_API_KEY` and optionally `EMBEDDER_MODEL`.
    pub fn from_env() -> Result<Self, EmbedderError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EmbedderError> {
        let base_url = lookup("EMBEDDER_URL").ok_or(EmbedderError::MissingEnv("EMBEDDER_URL"))?;
        let api_key =
            lookup("EMBEDDER_API_KEY").ok_or(EmbedderError::MissingEnv("EMBEDDER_API_KEY"))?;
        Ok(Self {
            base_url,
            api_key,
            model: lookup("EMBEDDER_MODEL").filter(|m| !m.is_empty()),
            dim: DEFAULT_EMBEDDING_DIM,
            request_timeout: Duration::from_secs(30),
            max_retries: 5,
            concurrency: 8,
        })
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
struct ApiRequest<'a> {
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct ApiResponseItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ApiResponse {
    data: Vec<ApiResponseItem>,
}

/// Truncate to `dim` (MRL), L2-normalize, and convert f32 → f16.
pub(crate) fn truncate_normalize(embedding: &[f32], dim: usize, out: &mut Vec<f16>) {
    let truncated = &embedding[..dim];
    let norm = truncated.iter().map(|x| x * x).sum::<f32>().sqrt();
    let inv_norm = if norm > 0.0 { 1.0 / norm } else { 0.0 };
    out.extend(truncated.iter().map(|&x| f16::from_f32(x * inv_norm)));
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Blocking client for an OpenAI-compatible embeddings endpoint. The async
/// client runs on a private current-thread runtime.
pub struct ApiEmbedder {
    client: Client,
    config: EmbedderConfig,
    runtime: Runtime,
}

impl ApiEmbedder {
    pub fn new(config: EmbedderConfig) -> Result<Self, EmbedderError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", &config.api_key))?,
        );
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(default_headers)
            .tcp_nodelay(true)
            .build()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            client,
            config,
            runtime,
        })
    }

    async fn send_batch(&self, texts: &[&str]) -> Result<Vec<f16>, EmbedderError> {
        tracing::debug!("Embedder API call: embedding {} texts", texts.len());

        let payload = ApiRequest {
            input: texts,
            model: self.config.model.as_deref(),
        };

        let response = self
            .client
            .post(&self.config.base_url)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(EmbedderError::Api(format!(
                "status={}, body={}",
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }

        let parsed: ApiResponse = serde_json::from_slice(&bytes)?;
        if parsed.data.len() != texts.len() {
            return Err(EmbedderError::Api(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let dim = self.config.dim;
        let mut flat = Vec::with_capacity(texts.len() * dim);
        for (index, item) in parsed.data.into_iter().enumerate() {
            if item.embedding.len() < dim {
                return Err(EmbedderError::Dimension {
                    index,
                    got: item.embedding.len(),
                    expected: dim,
                });
            }
            truncate_normalize(&item.embedding, dim, &mut flat);
        }

        Ok(flat)
    }

    /// [`send_batch`](Self::send_batch) with jittered exponential backoff.
    async fn embed_texts(&self, texts: &[&str]) -> Result<Vec<f16>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut current_attempt = 0;
        let mut current_backoff = Duration::from_millis(200);
        let max_backoff = Duration::from_secs(10);

        loop {
            match self.send_batch(texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) => {
                    current_attempt += 1;
                    if current_attempt >= self.config.max_retries {
                        tracing::error!(
                            "Failed to embed texts after {} attempts: {}",
                            current_attempt,
                            e
                        );
                        return Err(e);
                    }

                    let jitter: f64 = rand::rng().random_range(0.5..1.5);
                    let jittered = current_backoff.mul_f64(jitter);

                    tracing::debug!(
                        "Embedding request failed (attempt {}/{}), retrying in {}ms: {}",
                        current_attempt,
                        self.config.max_retries,
                        jittered.as_millis(),
                        e
                    );
                    sleep(jittered).await;
                    current_backoff = std::cmp::min(current_backoff * 2, max_backoff);
                }
            }
        }
    }
}

impl TextEmbedder for ApiEmbedder {
    fn dim(&self) -> usize {
        self.config.dim
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<f16>, EmbedderError> {
        self.runtime.block_on(self.embed_texts(texts))
    }

    /// Keeps up to `concurrency` requests in flight; `buffered` yields them in
    /// submission order.
    fn embed_all(&self, texts: &[&str], batch_size: usize) -> Result<Vec<f16>, EmbedderError> {
        let concurrency = self.config.concurrency.max(1);
        self.runtime.block_on(async {
            let chunks: Vec<Vec<f16>> = stream::iter(texts.chunks(batch_size.max(1)))
                .map(|chunk| self.embed_texts(chunk))
                .buffered(concurrency)
                .try_collect()
                .await?;
            Ok(chunks.concat())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Deterministic embedder: vector component `j` is `len(text) + j`.
    struct LenEmbedder;

    impl TextEmbedder for LenEmbedder {
        fn dim(&self) -> usize {
            3
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<f16>, EmbedderError> {
            Ok(texts
                .iter()
                .flat_map(|t| (0..3).map(move |j| f16::from_f32((t.len() + j) as f32)))
                .collect())
        }
    }

    #[test]
    fn test_embed_all_is_batch_size_independent() {
        let texts = ["a", "bb", "", "dddd", "eeeee"];
        let one = LenEmbedder.embed_all(&texts, 1).unwrap();
        let two = LenEmbedder.embed_all(&texts, 2).unwrap();
        let all = LenEmbedder.embed_all(&texts, 100).unwrap();
        assert_eq!(one.len(), texts.len() * 3);
        assert_eq!(one, two);
        assert_eq!(one, all);
        assert_eq!(one[3].to_f32(), 2.0);
    }

    #[test]
    fn test_zero_embedder() {
        let z = ZeroEmbedder { dim: 4 };
        let out = z.embed_batch(&["x", "y"]).unwrap();
        assert_eq!(out.len(), 8);
        assert!(out.iter().all(|v| *v == f16::ZERO));
    }

    #[test]
    fn test_truncate_normalize() {
        let mut out = Vec::new();
        truncate_normalize(&[3.0, 4.0, 100.0], 2, &mut out);
        assert_eq!(out.len(), 2);
        assert!((out[0].to_f32() - 0.6).abs() < 1e-3);
        assert!((out[1].to_f32() - 0.8).abs() < 1e-3);

        let mut out = Vec::new();
        truncate_normalize(&[0.0, 0.0], 2, &mut out);
        assert!(out.iter().all(|v| *v == f16::ZERO));
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("EMBEDDER_URL", "http://localhost:8080/v1/embeddings"),
            ("EMBEDDER_API_KEY", "secret"),
        ]
        .into_iter()
        .collect();
        let config =
            EmbedderConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.base_url, "http://localhost:8080/v1/embeddings");
        assert_eq!(config.model, None);
        assert_eq!(config.dim, DEFAULT_EMBEDDING_DIM);

        let err = EmbedderConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, EmbedderError::MissingEnv("EMBEDDER_URL")));
    }

    #[test]
    #[ignore] // requires EMBEDDER_URL and EMBEDDER_API_KEY env vars
    fn test_embed_texts_live() {
        let config = EmbedderConfig::from_env().expect("EMBEDDER_URL and EMBEDDER_API_KEY must be set");
        let embedder = ApiEmbedder::new(config).expect("failed to build embedder");

        let texts: &[&str] = &[
            "The quick brown fox jumps over the lazy dog.",
            "Rust is a systems programming language.",
            "Matryoshka representation learning enables flexible truncation.",
        ];
        let dim = embedder.dim();
        let result = embedder.embed_all(texts, 2).expect("embed_all failed");
        assert_eq!(result.len(), texts.len() * dim);

        for (i, chunk) in result.chunks_exact(dim).enumerate() {
            let norm: f32 = chunk.iter().map(|x| x.to_f32() * x.to_f32()).sum::<f32>().sqrt();
            assert!(
                (norm - 1.0).abs() < 0.05,
                "embedding[{i}] L2 norm = {norm:.4}, expected ~1.0"
            );
        }
    }
}

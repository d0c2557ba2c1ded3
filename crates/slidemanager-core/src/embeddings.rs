//! Text embeddings via the OpenAI API, with rate limiting and retry,
//! plus the local CPU image embedder for thumbnails.
//!
//! The remote side sits behind the `EmbeddingApi` trait so tests can count
//! and script upstream calls.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ErrorCode;
use crate::limiter::{Backoff, RateLimiter};

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding API rejected credentials")]
    Auth,
    #[error("embedding API rate limited: {0}")]
    RateLimited(String),
    #[error("transient embedding failure: {0}")]
    Transient(String),
    #[error("embedding API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("embedding dim mismatch: expected {expected}, got {actual}")]
    DimMismatch { expected: usize, actual: usize },
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<EmbedError>,
    },
}

impl EmbedError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth => ErrorCode::OpenaiAuth,
            Self::RateLimited(_) => ErrorCode::OpenaiRateLimit,
            Self::DimMismatch { .. } => ErrorCode::EmbedDimMismatch,
            Self::RetriesExhausted { last, .. } => last.code(),
            Self::Transient(_) | Self::Api { .. } => ErrorCode::OpenaiApi,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

/// One upstream embeddings call: returns one vector per input, in order.
#[async_trait]
pub trait EmbeddingApi: Send + Sync {
    async fn embed(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// `POST {base}/embeddings` against the OpenAI API.
pub struct OpenAiEmbeddingApi {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbeddingApi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://api.openai.com/v1")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingApi for OpenAiEmbeddingApi {
    async fn embed(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": model, "input": inputs }))
            .send()
            .await
            .map_err(|e| EmbedError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(EmbedError::Auth);
        }
        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::RateLimited(body));
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Transient(format!("status {status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let mut parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Transient(e.to_string()))?;
        parsed.data.sort_by_key(|row| row.index);
        if parsed.data.len() != inputs.len() {
            return Err(EmbedError::Api {
                status: status.as_u16(),
                message: format!(
                    "expected {} embeddings, got {}",
                    inputs.len(),
                    parsed.data.len()
                ),
            });
        }
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }
}

/// Canonical all-zero vector blob for a dim (`dim * 4` bytes).
pub fn zero_vector(dim: usize) -> Vec<u8> {
    vec![0u8; dim * 4]
}

/// Crude byte-budget token estimate; always >= 1 so the limiter is never
/// asked for zero cost.
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() as u32) / 4).max(1)
}

/// Batch embedding front-end: zero-vector short-circuit for blank inputs,
/// limiter acquisition before every upstream call, retry with backoff on
/// transient failures, dim discovery on first success.
pub struct EmbeddingClient {
    api: Arc<dyn EmbeddingApi>,
    limiter: Arc<RateLimiter>,
    backoff: Mutex<Backoff>,
    max_retries: u32,
    discovered_dim: AtomicUsize,
    fallback_dim: usize,
}

impl EmbeddingClient {
    pub fn new(
        api: Arc<dyn EmbeddingApi>,
        limiter: Arc<RateLimiter>,
        backoff: Backoff,
        max_retries: u32,
        fallback_dim: usize,
    ) -> Self {
        Self {
            api,
            limiter,
            backoff: Mutex::new(backoff),
            max_retries,
            discovered_dim: AtomicUsize::new(0),
            fallback_dim,
        }
    }

    /// The model's vector dim: discovered from a successful call (or noted
    /// from the cache), otherwise the configured fallback.
    pub fn dim(&self) -> usize {
        match self.discovered_dim.load(Ordering::Relaxed) {
            0 => self.fallback_dim,
            dim => dim,
        }
    }

    /// Record a dim learned out-of-band (from a cache row).
    pub fn note_dim(&self, dim: usize) {
        if dim > 0 {
            self.discovered_dim.store(dim, Ordering::Relaxed);
        }
    }

    /// Embed a batch, one vector per input in order. Blank inputs never
    /// reach the API and come back as zero vectors of the model dim.
    pub async fn embed_text_batch(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let non_blank: Vec<usize> = inputs
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.trim().is_empty())
            .map(|(i, _)| i)
            .collect();

        let mut out: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        if !non_blank.is_empty() {
            let batch: Vec<String> = non_blank.iter().map(|&i| inputs[i].clone()).collect();
            let vectors = self.call_with_retry(model, &batch).await?;
            for (slot, vector) in non_blank.iter().zip(vectors) {
                out[*slot] = Some(vector);
            }
        }

        let dim = self.dim();
        Ok(out
            .into_iter()
            .map(|v| v.unwrap_or_else(|| vec![0.0; dim]))
            .collect())
    }

    async fn call_with_retry(
        &self,
        model: &str,
        batch: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let token_cost: u32 = batch.iter().map(|s| estimate_tokens(s)).sum();
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire(1, token_cost).await;
            match self.api.embed(model, batch).await {
                Ok(vectors) => {
                    let dim = vectors.first().map(Vec::len).unwrap_or(0);
                    for v in &vectors {
                        if v.len() != dim {
                            return Err(EmbedError::DimMismatch {
                                expected: dim,
                                actual: v.len(),
                            });
                        }
                    }
                    self.note_dim(dim);
                    return Ok(vectors);
                }
                Err(e) if e.is_retryable() => {
                    if attempt >= self.max_retries {
                        return Err(EmbedError::RetriesExhausted {
                            attempts: attempt + 1,
                            last: Box::new(e),
                        });
                    }
                    let delay = self
                        .backoff
                        .lock()
                        .expect("backoff lock poisoned")
                        .delay(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying embedding call"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Image embeddings
// ---------------------------------------------------------------------------

/// Built-in local image embedding model: a 16x16 luminance grid,
/// L2-normalized. CPU-bound and deterministic; good enough for
/// same-looking-slide retrieval without any model download.
pub const TILE_LUMA_MODEL: &str = "tile-luma-v1";
pub const TILE_LUMA_DIM: usize = 256;
const TILE_GRID: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum ImageEmbedError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Embed a thumbnail file into a `TILE_LUMA_DIM` vector.
pub fn embed_thumbnail(image_path: &Path) -> Result<Vec<f32>, ImageEmbedError> {
    let img = image::open(image_path)?;
    let gray = image::imageops::resize(
        &img.to_luma8(),
        TILE_GRID,
        TILE_GRID,
        image::imageops::FilterType::Triangle,
    );
    let mut vector: Vec<f32> = gray.pixels().map(|p| f32::from(p.0[0]) / 255.0).collect();
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted mock: pops a result per call, counting calls.
    struct MockApi {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<usize, EmbedError>>>,
        dim: usize,
    }

    impl MockApi {
        fn ok(dim: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                dim,
            })
        }

        fn scripted(dim: usize, failures: Vec<EmbedError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(failures.into_iter().map(Err).collect()),
                dim,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingApi for MockApi {
        async fn embed(
            &self,
            _model: &str,
            inputs: &[String],
        ) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(step) = self.script.lock().unwrap().pop_front() {
                step?;
            }
            Ok(inputs.iter().map(|_| vec![0.25; self.dim]).collect())
        }
    }

    fn client(api: Arc<dyn EmbeddingApi>, max_retries: u32) -> EmbeddingClient {
        EmbeddingClient::new(
            api,
            Arc::new(RateLimiter::new(10_000, 1_000_000)),
            Backoff::with_seed(Duration::from_millis(10), Duration::from_secs(1), 0.2, 1),
            max_retries,
            8,
        )
    }

    #[tokio::test]
    async fn test_blank_inputs_short_circuit_without_remote_call() {
        let api = MockApi::ok(8);
        let client = client(api.clone(), 3);
        let out = client
            .embed_text_batch("m", &["".to_string(), "   \n\t ".to_string()])
            .await
            .unwrap();
        assert_eq!(api.call_count(), 0);
        assert_eq!(out.len(), 2);
        for v in out {
            assert_eq!(v, vec![0.0; 8]);
        }
    }

    #[tokio::test]
    async fn test_mixed_batch_embeds_only_non_blank_in_order() {
        let api = MockApi::ok(4);
        let client = client(api.clone(), 3);
        let out = client
            .embed_text_batch(
                "m",
                &["hello".to_string(), "".to_string(), "world".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(api.call_count(), 1);
        assert_eq!(out[0], vec![0.25; 4]);
        // Blank slot uses the discovered dim, not the fallback.
        assert_eq!(out[1], vec![0.0; 4]);
        assert_eq!(out[2], vec![0.25; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_success() {
        let api = MockApi::scripted(
            4,
            vec![
                EmbedError::Transient("boom".into()),
                EmbedError::RateLimited("slow down".into()),
            ],
        );
        let client = client(api.clone(), 5);
        let out = client
            .embed_text_batch("m", &["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(api.call_count(), 3);
        assert_eq!(out[0].len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cap_raises_final_error() {
        let api = MockApi::scripted(
            4,
            (0..10)
                .map(|_| EmbedError::RateLimited("429".into()))
                .collect(),
        );
        let client = client(api.clone(), 2);
        let err = client
            .embed_text_batch("m", &["hello".to_string()])
            .await
            .unwrap_err();
        // max_retries=2 means 3 total attempts.
        assert_eq!(api.call_count(), 3);
        match &err {
            EmbedError::RetriesExhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert!(matches!(**last, EmbedError::RateLimited(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(err.code(), ErrorCode::OpenaiRateLimit);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let api = MockApi::scripted(4, vec![EmbedError::Auth]);
        let client = client(api.clone(), 5);
        let err = client
            .embed_text_batch("m", &["hello".to_string()])
            .await
            .unwrap_err();
        assert_eq!(api.call_count(), 1);
        assert!(matches!(err, EmbedError::Auth));
        assert_eq!(err.code(), ErrorCode::OpenaiAuth);
    }

    #[test]
    fn test_zero_vector_length() {
        assert_eq!(zero_vector(3072).len(), 3072 * 4);
        assert!(zero_vector(4).iter().all(|b| *b == 0));
    }

    #[test]
    fn test_estimate_tokens_is_at_least_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("ab"), 1);
        assert!(estimate_tokens(&"x".repeat(400)) >= 100);
    }

    #[test]
    fn test_tile_luma_embedding_is_normalized_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thumb.png");
        let mut img = image::GrayImage::new(64, 48);
        for (x, y, p) in img.enumerate_pixels_mut() {
            p.0[0] = ((x + y) % 256) as u8;
        }
        img.save(&path).unwrap();

        let vector = embed_thumbnail(&path).unwrap();
        assert_eq!(vector.len(), TILE_LUMA_DIM);
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        // Deterministic.
        assert_eq!(embed_thumbnail(&path).unwrap(), vector);
    }
}

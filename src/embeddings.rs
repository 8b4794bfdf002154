//! Vector Embeddings
//!
//! Turns task, agent, tool and scope text into fixed-length vectors.
//!
//! Two providers sit behind [`EmbeddingProvider`]:
//! - [`OllamaEmbedder`]: local embedding model served by Ollama
//! - [`HashEmbedder`]: deterministic feature-hashing embedder, no network
//!
//! The provider is picked once at startup (see `Engine::build`) and kept for
//! the life of the process, so every stored vector lives in one space.
//! [`EmbeddingService`] adds the embedding cache and a single retry with
//! backoff in front of whichever provider was picked.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::EmbeddingCache;
use crate::error::{Result, RouterError};

/// Ollama embedding configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Ollama API URL
    pub ollama_url: String,
    /// Embedding model name
    pub model: String,
    /// Embedding dimension (depends on model)
    pub dimension: usize,
    /// Request timeout
    pub timeout: Duration,
}

/// Get embedding dimension for known models
pub fn model_dimension(model: &str) -> usize {
    match model {
        "mxbai-embed-large" => 1024,
        "snowflake-arctic-embed" | "snowflake-arctic-embed-m" => 768,
        "nomic-embed-text" => 768,
        "all-minilm" | "all-minilm-l6-v2" => 384,
        "bge-large" | "bge-large-en" => 1024,
        "bge-base" | "bge-base-en" => 768,
        _ => 768,
    }
}

impl EmbeddingConfig {
    pub fn new(ollama_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            ollama_url: ollama_url.into(),
            dimension: model_dimension(&model),
            model,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Text -> vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Length of every vector this provider returns
    fn dimension(&self) -> usize;

    /// Embed one text. Identical input must give an identical vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Ollama embedding response
#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embeddings from a local Ollama server
pub struct OllamaEmbedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
    available: AtomicBool,
}

impl OllamaEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            config,
            client,
            available: AtomicBool::new(true),
        })
    }

    /// Check if Ollama is reachable
    pub async fn check_availability(&self) -> bool {
        let available = match self
            .client
            .get(format!("{}/api/tags", self.config.ollama_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        };
        self.available.store(available, Ordering::Relaxed);
        available
    }

    /// Cached availability from the last check or request
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.config.ollama_url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.config.model,
                "prompt": text
            }))
            .send()
            .await
            .map_err(|e| {
                self.available.store(false, Ordering::Relaxed);
                RouterError::backend("ollama-embeddings", e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            self.available.store(false, Ordering::Relaxed);
            return Err(RouterError::backend(
                "ollama-embeddings",
                format!("embedding request failed: {}", status),
            ));
        }

        let result: OllamaEmbeddingResponse = response.json().await?;
        self.available.store(true, Ordering::Relaxed);
        Ok(result.embedding)
    }
}

/// Deterministic bag-of-words embedder using signed feature hashing
///
/// Each lower-cased word (and each adjacent word pair) is hashed to a slot
/// and a sign; the vector is L2-normalized. Identical text gives identical
/// vectors, texts sharing vocabulary land close together, and texts with no
/// words in common are near-orthogonal.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn slot(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let value = u64::from_le_bytes(bytes);
        let index = (value % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    /// Synchronous embedding, used directly by tests and seeding
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        let words: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 1 && !is_stopword(w))
            .map(str::to_string)
            .collect();

        for word in &words {
            let (index, sign) = self.slot(word);
            vector[index] += sign;
        }
        for pair in words.windows(2) {
            let (index, sign) = self.slot(&format!("{} {}", pair[0], pair[1]));
            vector[index] += sign * 0.5;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}

fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "the" | "a" | "an" | "and" | "or" | "of" | "to" | "in" | "for" | "on" | "with"
            | "this" | "that" | "is" | "it" | "be" | "as" | "at" | "by" | "from"
    )
}

/// Cached, retrying front for the configured provider
#[derive(Clone)]
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    retry_backoff: Duration,
}

impl EmbeddingService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: EmbeddingCache,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            provider,
            cache,
            retry_backoff,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Embed with cache; provider failures are retried once after a backoff
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        if let Some(cached) = self.cache.get(text).await {
            return Ok(cached);
        }

        let embedding = match self.provider.embed(text).await {
            Ok(embedding) => embedding,
            Err(e) if e.is_retryable() => {
                warn!(
                    "Embedding via {} failed ({}), retrying in {:?}",
                    self.provider.name(),
                    e,
                    self.retry_backoff
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.provider.embed(text).await?
            }
            Err(e) => return Err(e),
        };

        let embedding = Arc::new(embedding);
        self.cache.insert(text, embedding.clone()).await;
        debug!("Embedded {} chars via {}", text.len(), self.provider.name());
        Ok(embedding)
    }

    /// Embed without touching the cache (registration paths)
    pub async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        match self.provider.embed(text).await {
            Err(e) if e.is_retryable() => {
                tokio::time::sleep(self.retry_backoff).await;
                self.provider.embed(text).await
            }
            other => other,
        }
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Euclidean distance; mismatched lengths are maximally distant
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Serialize embedding to bytes for SQLite BLOB storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize embedding from bytes
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);

        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 0.001);
        assert!(euclidean_distance(&[0.0], &[0.0, 1.0]).is_infinite());
    }

    #[test]
    fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(128);
        let a = embedder.embed_text("Review the authentication module for security issues");
        let b = embedder.embed_text("Review the authentication module for security issues");
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_similarity_tracks_vocabulary() {
        let embedder = HashEmbedder::default();
        let base = embedder.embed_text("write unit tests for the payment service");
        let close = embedder.embed_text("write unit tests for the billing service");
        let far = embedder.embed_text("kubernetes ingress certificate rotation");

        let close_sim = cosine_similarity(&base, &close);
        let far_sim = cosine_similarity(&base, &far);
        assert!(close_sim > far_sim);
        assert!(far_sim < 0.5);
    }

    #[test]
    fn test_hash_embedder_empty_text() {
        let embedder = HashEmbedder::new(16);
        let v = embedder.embed_text("");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_embedding_serialization() {
        let embedding = vec![1.0, 2.5, -3.0, 0.0];
        let bytes = embedding_to_bytes(&embedding);
        assert_eq!(embedding_from_bytes(&bytes), embedding);
    }

    /// Fails the first `failures` calls, then delegates to a hash embedder
    struct FlakyEmbedder {
        failures: usize,
        calls: AtomicUsize,
        inner: HashEmbedder,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        fn name(&self) -> &str {
            "flaky"
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(RouterError::backend("flaky", "connection refused"))
            } else {
                Ok(self.inner.embed_text(text))
            }
        }
    }

    fn service(failures: usize) -> (EmbeddingService, Arc<FlakyEmbedder>) {
        let provider = Arc::new(FlakyEmbedder {
            failures,
            calls: AtomicUsize::new(0),
            inner: HashEmbedder::new(32),
        });
        let service = EmbeddingService::new(
            provider.clone(),
            EmbeddingCache::new(100),
            Duration::from_millis(1),
        );
        (service, provider)
    }

    #[tokio::test]
    async fn test_service_caches_embeddings() {
        let (service, provider) = service(0);
        let a = service.embed("hello world").await.unwrap();
        let b = service.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_retries_once() {
        let (service, provider) = service(1);
        assert!(service.embed("retry me").await.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_service_surfaces_second_failure() {
        let (service, provider) = service(2);
        let err = service.embed("still down").await.unwrap_err();
        assert!(matches!(err, RouterError::BackendUnavailable { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}

//! Embedding client trait and vector utilities.
//!
//! Concrete clients (OpenAI, disabled) live in the `ragsync` app crate.
//! Clients make exactly one attempt per call; retry with backoff is layered
//! on top by the caller so that every backend shares one retry policy.

use async_trait::async_trait;

use crate::error::Result;

/// A batch embedding backend.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dimensions(&self) -> usize;

    /// Embed `texts`, returning one vector per input in the same order.
    ///
    /// # Errors
    ///
    /// Transient failures (rate limits, 5xx, network) are reported as
    /// [`SyncError::Transient`](crate::SyncError::Transient) so callers can retry.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for mismatched lengths and
/// zero-magnitude inputs.
///
/// ```rust
/// use ragsync_core::embedding::cosine_similarity;
///
/// assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
/// assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

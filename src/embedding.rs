//! Embedding clients and batched embedding with retry.
//!
//! - **[`DisabledEmbedder`]** fails every call; used when
//!   `embedding.provider = "disabled"`.
//! - **[`OpenAiEmbedder`]** calls the OpenAI embeddings API, one request per
//!   batch.
//!
//! Neither client retries on its own. [`embed_in_batches`] slices the input
//! to `max_batch_size` and runs each slice under a [`RetryPolicy`], which is
//! where transient failures get their backoff.
//!
//! # Error classification
//!
//! | Failure | Error |
//! |---------|-------|
//! | HTTP 429, HTTP 5xx, network error | `Transient` |
//! | Any other HTTP 4xx | `Terminal` |
//! | Malformed body, wrong vector count or length | `Terminal` |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::StatusCode;

use ragsync_core::embedding::EmbeddingClient;
use ragsync_core::{Result, SyncError};

use crate::config::EmbeddingConfig;
use crate::retry::{RetryPolicy, RetryableOperation};

pub struct DisabledEmbedder {
    dims: usize,
}

impl DisabledEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingClient for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(SyncError::terminal("embedding", "embedding provider is disabled"))
    }
}

/// Embedding client for `POST /v1/embeddings`.
///
/// Reads the key from `OPENAI_API_KEY` at construction.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .context("embedding.model required for OpenAI provider")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint().to_string(),
            api_key,
            model,
            dims: config.dims,
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::transient("embedding", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::terminal("embedding", format!("invalid response body: {}", e)))?;
        parse_openai_response(&json)
    }
}

fn status_error(status: StatusCode, body: &str) -> SyncError {
    let message = format!("OpenAI API error {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SyncError::transient("embedding", message)
    } else {
        SyncError::terminal("embedding", message)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
pub fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let invalid = |what: &str| SyncError::terminal("embedding", format!("invalid response: {}", what));

    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let values = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("missing embedding"))?;
        let vector = values
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| invalid("non-numeric embedding value"))?;
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Build the client selected by `embedding.provider`.
pub fn create_client(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embed `texts` in slices of at most `max_batch_size`, retrying each slice
/// under `policy`.
///
/// The output has one vector per input, in input order, each of the client's
/// declared dimension.
pub async fn embed_in_batches(
    client: &dyn EmbeddingClient,
    texts: &[String],
    max_batch_size: usize,
    policy: RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    let op = RetryableOperation::new("embedding", policy);

    for slice in texts.chunks(max_batch_size.max(1)) {
        let vectors = op.run(|| client.embed_batch(slice)).await?;
        if vectors.len() != slice.len() {
            return Err(SyncError::terminal(
                "embedding",
                format!("expected {} vectors, got {}", slice.len(), vectors.len()),
            ));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != client.dimensions()) {
            return Err(SyncError::terminal(
                "embedding",
                format!(
                    "expected dimension {}, got {}",
                    client.dimensions(),
                    bad.len()
                ),
            ));
        }
        out.extend(vectors);
    }
    Ok(out)
}

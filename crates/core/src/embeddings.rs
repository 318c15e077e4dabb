use crate::chunking::normalize_whitespace;
use crate::error::{RagError, Result};
use crate::http::{endpoint, with_retry, HttpSettings};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;
pub const DEFAULT_HTTP_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_HTTP_EMBEDDING_DIMENSIONS: usize = 384;

/// Maps text to fixed-size vectors. Vectors from different `model_id`s are not comparable.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::embedding(self.model_id(), "empty embedding response"))
    }
}

/// Hashed character-trigram embedder. Needs no network and is fully deterministic.
#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    dimensions: usize,
    model_id: String,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("char-trigram-{dimensions}"),
        }
    }

    /// Counts padded character trigrams of the whitespace-normalised, lowercased
    /// text into hashed buckets, then scales to unit length.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let padded = format!(" {} ", normalize_whitespace(&text.to_lowercase()));
        let chars: Vec<char> = padded.chars().collect();

        let mut vector = vec![0f32; self.dimensions];
        for trigram in chars.windows(3) {
            vector[trigram_bucket(trigram, self.dimensions)] += 1.0;
        }
        unit_length(&mut vector);
        vector
    }
}

/// FNV-1a over the trigram's code points.
fn trigram_bucket(trigram: &[char], buckets: usize) -> usize {
    let hash = trigram.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, ch| {
        (hash ^ u64::from(u32::from(*ch))).wrapping_mul(0x0100_0000_01b3)
    });
    (hash % buckets as u64) as usize
}

fn unit_length(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        vector.iter_mut().for_each(|value| *value /= magnitude);
    }
}

#[async_trait]
impl EmbeddingModel for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

#[derive(Debug, Clone)]
pub struct HttpEmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub api_key: Option<String>,
}

/// Client for an OpenAI-compatible `POST {base}/embeddings` endpoint.
pub struct HttpEmbeddingModel {
    client: Client,
    url: String,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
    settings: HttpSettings,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl HttpEmbeddingModel {
    pub fn new(config: HttpEmbeddingConfig, settings: HttpSettings) -> Result<Self> {
        if config.dimensions == 0 {
            return Err(RagError::Config("embedding dimensions must be positive".to_string()));
        }
        Ok(Self {
            client: settings.client()?,
            url: endpoint(&config.base_url, "embeddings")?,
            model: config.model,
            dimensions: config.dimensions,
            api_key: config.api_key,
            settings,
        })
    }

    async fn request(&self, texts: &[&str]) -> Result<EmbeddingResponse> {
        let mut request = self.client.post(&self.url).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbeddingModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.model, batch_size = texts.len(), "embedding batch");

        let response = with_retry("embeddings", self.settings.retry_backoff, || self.request(texts))
            .await
            .map_err(|error| RagError::embedding(&self.model, error.to_string()))?;

        let mut data = response.data;
        if data.iter().all(|item| item.index.is_some()) {
            data.sort_by_key(|item| item.index);
        }
        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}

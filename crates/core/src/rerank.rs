use crate::error::{RagError, Result};
use crate::http::{endpoint, with_retry, HttpSettings};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

pub const DEFAULT_RERANK_MODEL: &str = "cross-encoder/ms-marco-MiniLM-L-6-v2";

/// Jointly scores a query against each passage; higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn reranker_id(&self) -> &str;

    /// Returns exactly one score per passage, in passage order.
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>>;
}

/// Fraction of query terms present in the passage. Offline stand-in for a cross-encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalOverlapReranker;

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Reranker for LexicalOverlapReranker {
    fn reranker_id(&self) -> &str {
        "lexical-overlap"
    }

    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }

        Ok(passages
            .iter()
            .map(|passage| {
                let passage_terms = terms(passage);
                let shared = query_terms.intersection(&passage_terms).count();
                shared as f32 / query_terms.len() as f32
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRerankerConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// Client for a cross-encoder served behind `POST {base}/rerank`
/// (text-embeddings-inference request and response shape).
pub struct HttpReranker {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    settings: HttpSettings,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [&'a str],
    raw_scores: bool,
}

#[derive(Deserialize)]
struct RerankScore {
    index: usize,
    score: f32,
}

impl HttpReranker {
    pub fn new(config: HttpRerankerConfig, settings: HttpSettings) -> Result<Self> {
        Ok(Self {
            client: settings.client()?,
            url: endpoint(&config.base_url, "rerank")?,
            model: config.model,
            api_key: config.api_key,
            settings,
        })
    }

    async fn request(&self, query: &str, passages: &[&str]) -> Result<Vec<RerankScore>> {
        let mut request = self.client.post(&self.url).json(&RerankRequest {
            query,
            texts: passages,
            raw_scores: false,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Places `(index, score)` pairs back into passage order.
fn scores_in_order(model: &str, scored: Vec<RerankScore>, expected: usize) -> Result<Vec<f32>> {
    let mut ordered = vec![None; expected];
    for item in scored {
        let slot = ordered
            .get_mut(item.index)
            .ok_or_else(|| RagError::rerank(model, format!("score index {} out of range", item.index)))?;
        *slot = Some(item.score);
    }
    ordered
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| RagError::rerank(model, "response is missing passage scores"))
}

#[async_trait]
impl Reranker for HttpReranker {
    fn reranker_id(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.model, passages = passages.len(), "reranking candidates");

        let scored = with_retry("rerank", self.settings.retry_backoff, || {
            self.request(query, passages)
        })
        .await
        .map_err(|error| RagError::rerank(&self.model, error.to_string()))?;

        scores_in_order(&self.model, scored, passages.len())
    }
}

use crate::embeddings::EmbeddingModel;
use crate::error::{RagError, Result};
use crate::index::VectorIndex;
use crate::models::RetrievalCandidate;
use crate::rerank::Reranker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_SEARCH_K: usize = 10;
pub const DEFAULT_RERANK_TOP_N: usize = 3;
pub const EMPTY_CONTEXT: &str = "No relevant context found.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates fetched by vector similarity.
    pub search_k: usize,
    /// Candidates kept after reranking.
    pub rerank_top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_k: DEFAULT_SEARCH_K,
            rerank_top_n: DEFAULT_RERANK_TOP_N,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rerank_top_n == 0 {
            return Err(RagError::Config("rerank_top_n must be at least 1".to_string()));
        }
        if self.search_k < self.rerank_top_n {
            return Err(RagError::Config(format!(
                "search_k {} is smaller than rerank_top_n {}",
                self.search_k, self.rerank_top_n
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    /// Best candidates first.
    pub candidates: Vec<RetrievalCandidate>,
    /// Set when the reranker failed and candidates are in vector order.
    pub degraded: Option<String>,
}

/// Vector search over `search_k` candidates followed by cross-encoder reranking.
pub struct Retriever {
    embedder: Arc<dyn EmbeddingModel>,
    reranker: Arc<dyn Reranker>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        reranker: Arc<dyn Reranker>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            embedder,
            reranker,
            config,
        })
    }

    pub fn config(&self) -> RetrievalConfig {
        self.config
    }

    pub async fn retrieve(&self, index: &VectorIndex, query: &str) -> Result<Retrieval> {
        if index.is_empty() {
            return Ok(Retrieval::default());
        }
        if index.embedding_model_id() != self.embedder.model_id() {
            return Err(RagError::Config(format!(
                "index was built with {} but the retriever embeds with {}",
                index.embedding_model_id(),
                self.embedder.model_id()
            )));
        }

        let query_vector = self.embedder.embed(query).await?;
        let candidates = index.search(&query_vector, self.config.search_k)?;
        debug!(candidates = candidates.len(), search_k = self.config.search_k, "vector candidates");

        let passages: Vec<&str> = candidates
            .iter()
            .map(|candidate| candidate.chunk.text.as_str())
            .collect();

        let scores = match self.reranker.score(query, &passages).await {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                let reason = format!(
                    "reranker {} returned {} scores for {} candidates",
                    self.reranker.reranker_id(),
                    scores.len(),
                    passages.len()
                );
                return Ok(self.degrade(candidates, reason));
            }
            Err(error) => return Ok(self.degrade(candidates, error.to_string())),
        };

        let mut reranked: Vec<RetrievalCandidate> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| RetrievalCandidate {
                chunk: candidate.chunk,
                score,
            })
            .collect();
        reranked.sort_by(|left, right| right.score.total_cmp(&left.score));
        reranked.truncate(self.config.rerank_top_n);

        Ok(Retrieval {
            candidates: reranked,
            degraded: None,
        })
    }

    fn degrade(&self, mut candidates: Vec<RetrievalCandidate>, reason: String) -> Retrieval {
        warn!(
            reranker = self.reranker.reranker_id(),
            reason = %reason,
            "reranking unavailable, using vector order"
        );
        candidates.truncate(self.config.rerank_top_n);
        Retrieval {
            candidates,
            degraded: Some(reason),
        }
    }
}

/// Joins passage texts with a blank line, or a placeholder when there are none.
pub fn format_context(candidates: &[RetrievalCandidate]) -> String {
    if candidates.is_empty() {
        return EMPTY_CONTEXT.to_string();
    }
    candidates
        .iter()
        .map(|candidate| candidate.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{chunk_documents, ChunkingConfig};
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{Chunk, Document};
    use crate::rerank::LexicalOverlapReranker;
    use async_trait::async_trait;

    /// Scores passages by a fixed table keyed on passage text, so ordering is fully controlled.
    struct TableReranker(Vec<(&'static str, f32)>);

    #[async_trait]
    impl Reranker for TableReranker {
        fn reranker_id(&self) -> &str {
            "table"
        }

        async fn score(&self, _query: &str, passages: &[&str]) -> Result<Vec<f32>> {
            Ok(passages
                .iter()
                .map(|passage| {
                    self.0
                        .iter()
                        .find(|(text, _)| passage == text)
                        .map(|(_, score)| *score)
                        .unwrap_or(0.0)
                })
                .collect())
        }
    }

    struct DownReranker;

    #[async_trait]
    impl Reranker for DownReranker {
        fn reranker_id(&self) -> &str {
            "down"
        }

        async fn score(&self, _query: &str, _passages: &[&str]) -> Result<Vec<f32>> {
            Err(RagError::rerank("down", "connection refused"))
        }
    }

    /// Always returns a single score, whatever it is asked to rank.
    struct ShortReranker;

    #[async_trait]
    impl Reranker for ShortReranker {
        fn reranker_id(&self) -> &str {
            "short"
        }

        async fn score(&self, _query: &str, _passages: &[&str]) -> Result<Vec<f32>> {
            Ok(vec![1.0])
        }
    }

    const PASSAGES: [&str; 12] = [
        "alpha registration office hours",
        "beta capital requirements for companies",
        "gamma tax filing deadlines",
        "delta licensing and permits",
        "epsilon investment incentives",
        "zeta shareholder agreements",
        "eta import export licences",
        "theta labour law basics",
        "iota intellectual property",
        "kappa bankruptcy procedure",
        "lambda company dissolution",
        "mu registration renewal",
    ];

    async fn index() -> Result<VectorIndex> {
        let documents: Vec<Document> = PASSAGES
            .iter()
            .enumerate()
            .map(|(position, text)| Document {
                document_id: format!("doc-{position}"),
                source_path: format!("/data/{position}.pdf"),
                page: 1,
                text: text.to_string(),
            })
            .collect();
        let chunks: Vec<Chunk> = chunk_documents(&documents, &ChunkingConfig::default())?;
        VectorIndex::build(chunks, &CharacterNgramEmbedder::default(), 16, None).await
    }

    fn retriever(reranker: Arc<dyn Reranker>, search_k: usize, rerank_top_n: usize) -> Result<Retriever> {
        Retriever::new(
            Arc::new(CharacterNgramEmbedder::default()),
            reranker,
            RetrievalConfig {
                search_k,
                rerank_top_n,
            },
        )
    }

    #[test]
    fn search_k_below_top_n_is_a_config_error() {
        let result = retriever(Arc::new(LexicalOverlapReranker), 2, 5);
        assert!(matches!(result, Err(RagError::Config(_))));
        assert!(retriever(Arc::new(LexicalOverlapReranker), 5, 0).is_err());
    }

    #[tokio::test]
    async fn reranked_results_are_bounded_and_ordered() -> Result<()> {
        let index = index().await?;
        let query = "registration requirements";
        let candidates: Vec<String> = index
            .search(&CharacterNgramEmbedder::default().embed_text(query), 10)?
            .into_iter()
            .map(|candidate| candidate.chunk.text)
            .collect();

        let table = TableReranker(
            PASSAGES
                .iter()
                .enumerate()
                .map(|(position, text)| (*text, position as f32))
                .collect(),
        );
        let result = retriever(Arc::new(table), 10, 3)?.retrieve(&index, query).await?;

        assert!(result.degraded.is_none());
        assert_eq!(result.candidates.len(), 3);
        assert!(result
            .candidates
            .iter()
            .all(|candidate| candidates.contains(&candidate.chunk.text)));
        assert!(result
            .candidates
            .windows(2)
            .all(|pair| pair[0].score >= pair[1].score));

        let mut expected: Vec<(usize, &str)> = PASSAGES
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, text)| candidates.iter().any(|candidate| candidate.as_str() == *text))
            .collect();
        expected.sort_by(|left, right| right.0.cmp(&left.0));
        let top: Vec<&str> = expected.iter().take(3).map(|(_, text)| *text).collect();
        let got: Vec<&str> = result
            .candidates
            .iter()
            .map(|candidate| candidate.chunk.text.as_str())
            .collect();
        assert_eq!(got, top);
        Ok(())
    }

    #[tokio::test]
    async fn equal_scores_keep_vector_order() -> Result<()> {
        let index = index().await?;
        let query = "company capital";
        let vector_order: Vec<String> = index
            .search(&CharacterNgramEmbedder::default().embed_text(query), 10)?
            .into_iter()
            .map(|candidate| candidate.chunk.chunk_id)
            .collect();

        let result = retriever(Arc::new(TableReranker(Vec::new())), 10, 3)?
            .retrieve(&index, query)
            .await?;
        let ids: Vec<String> = result
            .candidates
            .into_iter()
            .map(|candidate| candidate.chunk.chunk_id)
            .collect();
        assert_eq!(ids, vector_order[..3].to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn reranker_failure_degrades_to_vector_order() -> Result<()> {
        let index = index().await?;
        let result = retriever(Arc::new(DownReranker), 10, 3)?
            .retrieve(&index, "tax deadlines")
            .await?;

        assert_eq!(result.candidates.len(), 3);
        assert!(result
            .degraded
            .as_deref()
            .is_some_and(|reason| reason.contains("connection refused")));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_score_count_degrades_to_vector_order() -> Result<()> {
        let index = index().await?;
        let query = "tax deadlines";
        let vector_order: Vec<String> = index
            .search(&CharacterNgramEmbedder::default().embed_text(query), 10)?
            .into_iter()
            .map(|candidate| candidate.chunk.chunk_id)
            .collect();

        let result = retriever(Arc::new(ShortReranker), 10, 3)?
            .retrieve(&index, query)
            .await?;
        let ids: Vec<String> = result
            .candidates
            .iter()
            .map(|candidate| candidate.chunk.chunk_id.clone())
            .collect();

        assert_eq!(ids, vector_order[..3].to_vec());
        assert!(result
            .degraded
            .as_deref()
            .is_some_and(|reason| reason.contains("returned 1 scores for 10 candidates")));
        Ok(())
    }

    #[tokio::test]
    async fn empty_index_returns_nothing() -> Result<()> {
        let empty = VectorIndex::build(Vec::new(), &CharacterNgramEmbedder::default(), 8, None).await?;
        let result = retriever(Arc::new(LexicalOverlapReranker), 10, 3)?
            .retrieve(&empty, "anything")
            .await?;
        assert!(result.candidates.is_empty());
        assert!(result.degraded.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn index_from_another_model_is_rejected() -> Result<()> {
        let index = index().await?;
        let other = Retriever::new(
            Arc::new(CharacterNgramEmbedder::new(64)),
            Arc::new(LexicalOverlapReranker),
            RetrievalConfig::default(),
        )?;
        assert!(matches!(
            other.retrieve(&index, "tax").await,
            Err(RagError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn context_is_blank_line_joined() {
        assert_eq!(format_context(&[]), EMPTY_CONTEXT);

        let candidate = |text: &str| RetrievalCandidate {
            chunk: Chunk {
                chunk_id: text.to_string(),
                document_id: "d".to_string(),
                source_path: "/d.pdf".to_string(),
                page: 1,
                offset: 0,
                text: text.to_string(),
            },
            score: 1.0,
        };
        assert_eq!(
            format_context(&[candidate("first"), candidate("second")]),
            "first\n\nsecond"
        );
    }
}

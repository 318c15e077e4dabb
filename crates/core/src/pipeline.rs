//! Setup and query entry points shared by every front end.
//!
//! [`QaService::process_documents`] runs load → chunk → index and installs a
//! fresh [`PipelineContext`]; [`QaService::ask_question`] retrieves context
//! and asks the chat model. Queries hold an `Arc` to the context they started
//! with, so a concurrent rebuild never changes the index under them.

use crate::chat::{build_prompt, ChatModel};
use crate::chunking::{chunk_documents, ChunkingConfig};
use crate::embeddings::EmbeddingModel;
use crate::error::{RagError, Result};
use crate::index::{IndexStore, Progress, VectorIndex, DEFAULT_EMBED_BATCH_SIZE};
use crate::loader::{load_documents_with, LopdfExtractor, PdfExtractor};
use crate::memory::ConversationMemory;
use crate::models::{ConversationTurn, SourceRef};
use crate::rerank::Reranker;
use crate::retriever::{format_context, Retrieval, RetrievalConfig, Retriever};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub data_dir: PathBuf,
    pub index_dir: PathBuf,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embed_batch_size: usize,
    /// Skip PDFs that fail to parse instead of failing the whole load.
    pub skip_unreadable: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            index_dir: PathBuf::from("./vector_index"),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
            skip_unreadable: false,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.retrieval.validate()?;
        if self.embed_batch_size == 0 {
            return Err(RagError::Config("embed_batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// The external services the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn PdfExtractor>,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub reranker: Arc<dyn Reranker>,
    pub chat: Arc<dyn ChatModel>,
}

impl Collaborators {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        reranker: Arc<dyn Reranker>,
        chat: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            extractor: Arc::new(LopdfExtractor),
            embedder,
            reranker,
            chat,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PdfExtractor>) -> Self {
        self.extractor = extractor;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    pub chunk_count: usize,
    /// Distinct source files that contributed pages.
    pub document_count: usize,
    pub skipped_files: Vec<SkippedFile>,
    pub index_reused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub ready: bool,
    pub chunk_count: Option<usize>,
    pub embedding_model_id: String,
    pub reranker_id: String,
    pub chat_model_id: String,
}

/// Everything a query needs, built once by the setup step.
pub struct PipelineContext {
    index: Arc<VectorIndex>,
    retriever: Retriever,
    chat: Arc<dyn ChatModel>,
}

impl PipelineContext {
    pub fn new(index: Arc<VectorIndex>, retriever: Retriever, chat: Arc<dyn ChatModel>) -> Self {
        Self {
            index,
            retriever,
            chat,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub async fn retrieve(&self, query: &str) -> Result<Retrieval> {
        self.retriever.retrieve(&self.index, query).await
    }

    pub async fn answer(&self, question: &str, memory: &mut ConversationMemory) -> Result<Answer> {
        let answer = self.answer_with_history(question, &memory.history()).await?;
        memory.add(question.trim(), answer.text.clone());
        Ok(answer)
    }

    /// Answers against a snapshot of earlier turns; recording the new turn is up to the caller.
    pub async fn answer_with_history(
        &self,
        question: &str,
        history: &[ConversationTurn],
    ) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::InvalidQuestion("question is empty".to_string()));
        }

        let retrieval = self.retrieve(question).await?;
        let context = format_context(&retrieval.candidates);
        let prompt = build_prompt(&context, question, history);
        let text = self.chat.complete(&prompt).await?;

        info!(
            sources = retrieval.candidates.len(),
            degraded = retrieval.degraded.is_some(),
            "answered question"
        );

        Ok(Answer {
            text,
            sources: retrieval.candidates.iter().map(SourceRef::from).collect(),
            degraded: retrieval.degraded,
        })
    }
}

/// Runs load → chunk → index and returns a ready context.
pub async fn process_documents(
    settings: &PipelineSettings,
    collaborators: &Collaborators,
    progress: Option<Progress<'_>>,
) -> Result<(PipelineContext, ProcessReport)> {
    settings.validate()?;

    let folder = settings.data_dir.clone();
    let extractor = collaborators.extractor.clone();
    let skip_unreadable = settings.skip_unreadable;
    let chunking = settings.chunking;
    let (loaded, chunks) = tokio::task::spawn_blocking(move || -> Result<_> {
        let loaded = load_documents_with(&folder, extractor.as_ref(), skip_unreadable)?;
        let chunks = chunk_documents(&loaded.documents, &chunking)?;
        Ok((loaded, chunks))
    })
    .await??;

    if loaded.documents.is_empty() {
        warn!(folder = %settings.data_dir.display(), "no pdf pages to index");
    }

    let document_count = loaded
        .documents
        .iter()
        .map(|document| document.source_path.as_str())
        .collect::<HashSet<_>>()
        .len();
    info!(
        folder = %settings.data_dir.display(),
        pages = loaded.documents.len(),
        chunk_count = chunks.len(),
        "documents chunked"
    );

    let store = IndexStore::new(&settings.index_dir);
    let ensured = store
        .create_or_load(
            chunks,
            collaborators.embedder.as_ref(),
            settings.embed_batch_size,
            progress,
        )
        .await?;

    let retriever = Retriever::new(
        collaborators.embedder.clone(),
        collaborators.reranker.clone(),
        settings.retrieval,
    )?;

    let report = ProcessReport {
        chunk_count: ensured.index.chunk_count(),
        document_count,
        skipped_files: loaded
            .skipped_files
            .into_iter()
            .map(|skipped| SkippedFile {
                path: skipped.path.to_string_lossy().to_string(),
                reason: skipped.reason,
            })
            .collect(),
        index_reused: ensured.reused,
    };
    let context = PipelineContext::new(
        Arc::new(ensured.index),
        retriever,
        collaborators.chat.clone(),
    );
    Ok((context, report))
}

/// Owns the current [`PipelineContext`], if setup has succeeded.
pub struct QaService {
    settings: PipelineSettings,
    collaborators: Collaborators,
    context: RwLock<Option<Arc<PipelineContext>>>,
    setup: Mutex<()>,
}

impl QaService {
    pub fn new(settings: PipelineSettings, collaborators: Collaborators) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            collaborators,
            context: RwLock::new(None),
            setup: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn process_documents(&self) -> Result<ProcessReport> {
        self.process_documents_with_progress(None).await
    }

    pub async fn process_documents_with_progress(
        &self,
        progress: Option<Progress<'_>>,
    ) -> Result<ProcessReport> {
        let _setup = self.setup.lock().await;
        let (context, report) =
            process_documents(&self.settings, &self.collaborators, progress).await?;
        *self.context.write().await = Some(Arc::new(context));

        info!(
            chunk_count = report.chunk_count,
            reused = report.index_reused,
            "pipeline ready"
        );
        Ok(report)
    }

    /// Drops the current context and persisted index, then processes from scratch.
    pub async fn reprocess_documents(&self) -> Result<ProcessReport> {
        {
            let _setup = self.setup.lock().await;
            *self.context.write().await = None;
            let store = IndexStore::new(&self.settings.index_dir);
            tokio::task::spawn_blocking(move || store.remove()).await??;
        }
        self.process_documents().await
    }

    pub async fn context(&self) -> Result<Arc<PipelineContext>> {
        self.context.read().await.clone().ok_or_else(|| {
            RagError::NotReady("documents have not been processed yet".to_string())
        })
    }

    pub async fn ask_question(
        &self,
        question: &str,
        memory: &mut ConversationMemory,
    ) -> Result<Answer> {
        let context = self.context().await?;
        context.answer(question, memory).await
    }

    /// Like [`QaService::ask_question`], but leaves recording the turn to the caller.
    pub async fn ask_with_history(
        &self,
        question: &str,
        history: &[ConversationTurn],
    ) -> Result<Answer> {
        let context = self.context().await?;
        context.answer_with_history(question, history).await
    }

    pub async fn status(&self) -> ServiceStatus {
        let context = self.context.read().await.clone();
        ServiceStatus {
            ready: context.is_some(),
            chunk_count: context.map(|context| context.index().chunk_count()),
            embedding_model_id: self.collaborators.embedder.model_id().to_string(),
            reranker_id: self.collaborators.reranker.reranker_id().to_string(),
            chat_model_id: self.collaborators.chat.model_id().to_string(),
        }
    }
}

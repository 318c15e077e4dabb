pub mod chat;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod http;
pub mod index;
pub mod loader;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod rerank;
pub mod retriever;

pub use chat::{build_prompt, ChatConfig, ChatModel, OpenAiChatModel};
pub use chunking::{chunk_documents, normalize_whitespace, ChunkingConfig};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingModel, HttpEmbeddingConfig, HttpEmbeddingModel,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{RagError, Result};
pub use http::HttpSettings;
pub use index::{EnsuredIndex, IndexMetadata, IndexStore, VectorIndex};
pub use loader::{
    discover_pdf_files, load_documents, load_documents_with, LoadReport, LopdfExtractor, PageText,
    PdfExtractor, SkippedPdf,
};
pub use memory::ConversationMemory;
pub use models::{Chunk, ConversationTurn, Document, RetrievalCandidate, SourceRef};
pub use pipeline::{
    process_documents, Answer, Collaborators, PipelineContext, PipelineSettings, ProcessReport,
    QaService, ServiceStatus,
};
pub use rerank::{HttpReranker, HttpRerankerConfig, LexicalOverlapReranker, Reranker};
pub use retriever::{format_context, Retrieval, RetrievalConfig, Retriever};

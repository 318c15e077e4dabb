mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_rag_core::chat::{DEFAULT_CHAT_BASE_URL, DEFAULT_CHAT_MODEL};
use pdf_rag_core::embeddings::{DEFAULT_HTTP_EMBEDDING_DIMENSIONS, DEFAULT_HTTP_EMBEDDING_MODEL};
use pdf_rag_core::rerank::DEFAULT_RERANK_MODEL;
use pdf_rag_core::{
    CharacterNgramEmbedder, ChatConfig, ChunkingConfig, Collaborators, ConversationMemory,
    EmbeddingModel, HttpEmbeddingConfig, HttpEmbeddingModel, HttpReranker, HttpRerankerConfig,
    HttpSettings, LexicalOverlapReranker, OpenAiChatModel, PipelineSettings, ProcessReport,
    QaService, Reranker, RetrievalConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Folder of PDFs to index (not searched recursively)
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Directory holding the persisted vector index
    #[arg(long, env = "INDEX_DIR", default_value = "./vector_index")]
    index_dir: PathBuf,

    /// Chunk size in characters
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 500)]
    chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[arg(long, env = "CHUNK_OVERLAP", default_value_t = 50)]
    chunk_overlap: usize,

    /// Vector candidates fetched before reranking
    #[arg(long, env = "SEARCH_K", default_value_t = 10)]
    search_k: usize,

    /// Chunks kept after reranking
    #[arg(long, env = "RERANK_TOP_N", default_value_t = 3)]
    rerank_top_n: usize,

    /// Chunks per embedding request
    #[arg(long, env = "EMBED_BATCH_SIZE", default_value_t = 32)]
    embed_batch_size: usize,

    /// Skip PDFs that fail to parse instead of aborting
    #[arg(long, env = "SKIP_UNREADABLE", default_value_t = false)]
    skip_unreadable: bool,

    /// OpenAI-compatible embeddings base URL; the local trigram embedder is used when unset
    #[arg(long, env = "EMBEDDING_URL")]
    embedding_url: Option<String>,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = DEFAULT_HTTP_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_HTTP_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Cross-encoder rerank base URL; lexical overlap scoring is used when unset
    #[arg(long, env = "RERANK_URL")]
    rerank_url: Option<String>,

    #[arg(long, env = "RERANK_MODEL", default_value = DEFAULT_RERANK_MODEL)]
    rerank_model: String,

    #[arg(long, env = "RERANK_API_KEY", hide_env_values = true)]
    rerank_api_key: Option<String>,

    /// OpenAI-compatible chat completions base URL
    #[arg(long, env = "CHAT_BASE_URL", default_value = DEFAULT_CHAT_BASE_URL)]
    chat_base_url: String,

    #[arg(long, env = "CHAT_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    chat_model: String,

    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    chat_api_key: Option<String>,

    /// Timeout for each collaborator request
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 30)]
    http_timeout_secs: u64,

    /// Conversation turns remembered for follow-up questions
    #[arg(long, env = "MEMORY_TURNS", default_value_t = 5)]
    memory_turns: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Load, chunk and index the PDF folder (reuses a current index).
    Process,
    /// Delete the persisted index and index the folder again.
    Reprocess,
    /// Answer a single question.
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Interactive question loop with conversation memory.
    Chat,
    /// Serve the HTTP API.
    Serve {
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = 8000)]
        port: u16,
    },
}

impl Cli {
    fn settings(&self) -> anyhow::Result<PipelineSettings> {
        Ok(PipelineSettings {
            data_dir: self.data_dir.clone(),
            index_dir: self.index_dir.clone(),
            chunking: ChunkingConfig::new(self.chunk_size, self.chunk_overlap)?,
            retrieval: RetrievalConfig {
                search_k: self.search_k,
                rerank_top_n: self.rerank_top_n,
            },
            embed_batch_size: self.embed_batch_size,
            skip_unreadable: self.skip_unreadable,
        })
    }

    fn collaborators(&self) -> anyhow::Result<Collaborators> {
        let http = HttpSettings {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..HttpSettings::default()
        };

        let embedder: Arc<dyn EmbeddingModel> = match &self.embedding_url {
            Some(base_url) => Arc::new(HttpEmbeddingModel::new(
                HttpEmbeddingConfig {
                    base_url: base_url.clone(),
                    model: self.embedding_model.clone(),
                    dimensions: self.embedding_dimensions,
                    api_key: self.embedding_api_key.clone(),
                },
                http,
            )?),
            None => Arc::new(CharacterNgramEmbedder::default()),
        };

        let reranker: Arc<dyn Reranker> = match &self.rerank_url {
            Some(base_url) => Arc::new(HttpReranker::new(
                HttpRerankerConfig {
                    base_url: base_url.clone(),
                    model: self.rerank_model.clone(),
                    api_key: self.rerank_api_key.clone(),
                },
                http,
            )?),
            None => Arc::new(LexicalOverlapReranker),
        };

        if self.chat_api_key.is_none() {
            warn!("GROQ_API_KEY is not set; chat requests will be sent without credentials");
        }
        let chat = OpenAiChatModel::new(
            ChatConfig {
                base_url: self.chat_base_url.clone(),
                model: self.chat_model.clone(),
                api_key: self.chat_api_key.clone(),
                ..ChatConfig::default()
            },
            http,
        )?;

        Ok(Collaborators::new(embedder, reranker, Arc::new(chat)))
    }
}

fn log_progress(embedded: usize, total: usize) {
    info!(embedded, total, "embedding chunks");
}

fn print_report(report: &ProcessReport) {
    for skipped in &report.skipped_files {
        warn!(path = %skipped.path, reason = %skipped.reason, "skipped pdf");
    }
    println!(
        "{} chunks from {} documents ready ({}) at {}",
        report.chunk_count,
        report.document_count,
        if report.index_reused { "index reused" } else { "index built" },
        Utc::now().to_rfc3339()
    );
}

async fn run_chat(service: &QaService, memory_turns: usize) -> anyhow::Result<()> {
    let mut memory = ConversationMemory::new(memory_turns);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Ask a question (/history, /clear, /exit).");

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                memory.clear();
                println!("{}", memory.summary());
            }
            "/history" => {
                println!("{}", memory.summary());
                for turn in memory.history() {
                    println!("[{}] Q: {}\n    A: {}", turn.asked_at.to_rfc3339(), turn.question, turn.answer);
                }
            }
            question => match service.ask_question(question, &mut memory).await {
                Ok(answer) => {
                    println!("{}", answer.text);
                    for source in &answer.sources {
                        println!("  source={} page={} score={:.4}", source.source_path, source.page, source.score);
                    }
                    if let Some(reason) = answer.degraded {
                        println!("  (reranking unavailable: {reason})");
                    }
                }
                Err(error) => println!("error: {error}"),
            },
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "pdf-rag boot"
    );

    let service = QaService::new(cli.settings()?, cli.collaborators()?)
        .context("invalid pipeline settings")?;

    match &cli.command {
        Command::Process => {
            let report = service
                .process_documents_with_progress(Some(&log_progress))
                .await?;
            print_report(&report);
        }
        Command::Reprocess => {
            let report = service.reprocess_documents().await?;
            print_report(&report);
        }
        Command::Ask { question } => {
            service
                .process_documents_with_progress(Some(&log_progress))
                .await?;
            let mut memory = ConversationMemory::new(cli.memory_turns);
            let answer = service.ask_question(question, &mut memory).await?;

            println!("{}", answer.text);
            for source in &answer.sources {
                println!("  source={} page={} score={:.4}", source.source_path, source.page, source.score);
            }
            if let Some(reason) = answer.degraded {
                println!("  (reranking unavailable: {reason})");
            }
        }
        Command::Chat => {
            let report = service
                .process_documents_with_progress(Some(&log_progress))
                .await?;
            print_report(&report);
            run_chat(&service, cli.memory_turns).await?;
        }
        Command::Serve { host, port } => {
            let state = server::AppState::new(Arc::new(service), cli.memory_turns);
            server::run_server(state, host, *port).await?;
        }
    }

    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pdf_rag_core::{
    Answer, ConversationMemory, ConversationTurn, ProcessReport, QaService, RagError,
    ServiceStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Turns kept for `GET /chat-history`.
pub const CHAT_HISTORY_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    service: Arc<QaService>,
    memory: Arc<Mutex<ConversationMemory>>,
    history: Arc<Mutex<ConversationMemory>>,
}

impl AppState {
    pub fn new(service: Arc<QaService>, memory_turns: usize) -> Self {
        Self {
            service,
            memory: Arc::new(Mutex::new(ConversationMemory::new(memory_turns))),
            history: Arc::new(Mutex::new(ConversationMemory::new(CHAT_HISTORY_LIMIT))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub report: ProcessReport,
}

#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    pub success: bool,
    #[serde(flatten)]
    pub answer: Answer,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: ServiceStatus,
    pub memory: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub chat_history: Vec<ConversationTurn>,
}

/// Maps pipeline errors onto HTTP status codes.
pub struct ApiError(RagError);

impl From<RagError> for ApiError {
    fn from(error: RagError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RagError::NotReady(_) => StatusCode::CONFLICT,
            RagError::Config(_) | RagError::InvalidQuestion(_) | RagError::Load(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, status = status.as_u16(), "request rejected");
        }

        let detail = match &self.0 {
            RagError::NotReady(_) => {
                "Documents not processed yet. Call POST /process-documents first.".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "success": false, "detail": detail }))).into_response()
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/process-documents", post(process_documents))
        .route("/reprocess-documents", post(reprocess_documents))
        .route("/ask-question", post(ask_question))
        .route("/chat-history", get(chat_history).delete(clear_chat_history))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub async fn run_server(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = app_router(state);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid host/port {host}:{port}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("pdf-rag listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn index() -> impl IntoResponse {
    Json(json!({ "message": "PDF question answering API", "version": env!("CARGO_PKG_VERSION") }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.service.status().await;
    Json(json!({ "status": "healthy", "docs_processed": status.ready }))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.service.status().await;
    let memory = state.memory.lock().await.summary();
    Json(StatusResponse { status, memory })
}

async fn process_documents(
    State(state): State<AppState>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let report = state.service.process_documents().await?;
    Ok(Json(process_response(report)))
}

async fn reprocess_documents(
    State(state): State<AppState>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let report = state.service.reprocess_documents().await?;
    state.memory.lock().await.clear();
    Ok(Json(process_response(report)))
}

fn process_response(report: ProcessReport) -> ProcessResponse {
    let message = if report.index_reused {
        format!("Loaded existing index with {} chunks", report.chunk_count)
    } else {
        format!(
            "Processed {} chunks from {} documents",
            report.chunk_count, report.document_count
        )
    };
    ProcessResponse {
        success: true,
        message,
        report,
    }
}

async fn ask_question(
    State(state): State<AppState>,
    Json(request): Json<QuestionRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let earlier = state.memory.lock().await.history();
    let answer = state
        .service
        .ask_with_history(&request.question, &earlier)
        .await?;

    let question = request.question.trim();
    state.memory.lock().await.add(question, answer.text.clone());
    state.history.lock().await.add(question, answer.text.clone());

    Ok(Json(AnswerResponse {
        success: true,
        answer,
    }))
}

async fn chat_history(State(state): State<AppState>) -> Json<HistoryResponse> {
    let chat_history = state.history.lock().await.history();
    Json(HistoryResponse { chat_history })
}

async fn clear_chat_history(State(state): State<AppState>) -> impl IntoResponse {
    state.history.lock().await.clear();
    state.memory.lock().await.clear();
    Json(json!({ "success": true, "message": "Chat history cleared" }))
}

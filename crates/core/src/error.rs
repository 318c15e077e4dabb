use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("load error: {0}")]
    Load(String),

    #[error("embedding error ({model}): {details}")]
    Embedding { model: String, details: String },

    #[error("corrupt index at {path}: {details}")]
    CorruptIndex { path: String, details: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rerank error ({reranker}): {details}")]
    Rerank { reranker: String, details: String },

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("chat completion failed: {0}")]
    Chat(String),

    #[error("invalid question: {0}")]
    InvalidQuestion(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RagError {
    pub(crate) fn embedding(model: &str, details: impl Into<String>) -> Self {
        Self::Embedding {
            model: model.to_string(),
            details: details.into(),
        }
    }

    pub(crate) fn rerank(reranker: &str, details: impl Into<String>) -> Self {
        Self::Rerank {
            reranker: reranker.to_string(),
            details: details.into(),
        }
    }

    pub(crate) fn corrupt(path: &std::path::Path, details: impl Into<String>) -> Self {
        Self::CorruptIndex {
            path: path.display().to_string(),
            details: details.into(),
        }
    }

    /// Transport-level failures worth a single retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(error) => {
                error.is_timeout()
                    || error.is_connect()
                    || error.status().is_some_and(|status| {
                        status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    })
            }
            _ => false,
        }
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;

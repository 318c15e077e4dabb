use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of extracted text from a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub source_path: String,
    pub page: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source_path: String,
    pub page: u32,
    /// Character offset into the owning document's text.
    pub offset: usize,
    pub text: String,
}

impl Chunk {
    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    pub asked_at: DateTime<Utc>,
}

/// Where a retrieved passage came from, as reported alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_path: String,
    pub page: u32,
    pub chunk_id: String,
    pub score: f32,
}

impl From<&RetrievalCandidate> for SourceRef {
    fn from(candidate: &RetrievalCandidate) -> Self {
        Self {
            source_path: candidate.chunk.source_path.clone(),
            page: candidate.chunk.page,
            chunk_id: candidate.chunk.chunk_id.clone(),
            score: candidate.score,
        }
    }
}

//! Embedding index: construction, on-disk persistence and reload.
//!
//! A persisted index is a directory holding three files:
//!
//! - `vectors.bin`: magic `PRAGVEC1`, `u32` dimension, `u64` count, then the
//!   vectors as little-endian `f32`, row by row.
//! - `chunks.json`: the indexed chunks in vector order.
//! - `metadata.json`: [`IndexMetadata`], checked on reload to reject indexes
//!   built by another embedding model or from different content.
//!
//! [`IndexStore::persist`] writes into a staging directory next to the target
//! and renames it into place, so a reader never sees a half-written index.

use crate::embeddings::EmbeddingModel;
use crate::error::{RagError, Result};
use crate::models::{Chunk, RetrievalCandidate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INDEX_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;

const VECTORS_FILE: &str = "vectors.bin";
const CHUNKS_FILE: &str = "chunks.json";
const METADATA_FILE: &str = "metadata.json";
const VECTOR_MAGIC: &[u8; 8] = b"PRAGVEC1";
const VECTOR_HEADER_LEN: usize = 8 + 4 + 8;

/// Called with `(embedded, total)` after every embedding batch.
pub type Progress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub format_version: u32,
    /// Number of indexed chunks.
    pub document_count: usize,
    pub embedding_model_id: String,
    pub embedding_dim: usize,
    pub content_fingerprint: String,
    pub sample_chunk_len: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Immutable set of embedded chunks. Share it behind an `Arc`; a rebuild makes a new one.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    entries: Vec<IndexedChunk>,
    metadata: IndexMetadata,
}

impl VectorIndex {
    pub async fn build(
        chunks: Vec<Chunk>,
        model: &dyn EmbeddingModel,
        batch_size: usize,
        progress: Option<Progress<'_>>,
    ) -> Result<Self> {
        let total = chunks.len();
        let batch_size = batch_size.max(1);
        let dimensions = model.dimensions();
        info!(model = model.model_id(), chunk_count = total, batch_size, "building vector index");

        let mut vectors = Vec::with_capacity(total);
        for batch in chunks.chunks(batch_size) {
            let texts: Vec<&str> = batch.iter().map(|chunk| chunk.text.as_str()).collect();
            let embedded = model.embed_batch(&texts).await?;

            if embedded.len() != texts.len() {
                return Err(RagError::embedding(
                    model.model_id(),
                    format!("expected {} vectors, got {}", texts.len(), embedded.len()),
                ));
            }
            if let Some(bad) = embedded.iter().find(|vector| vector.len() != dimensions) {
                return Err(RagError::embedding(
                    model.model_id(),
                    format!("vector dimension {} != {dimensions}", bad.len()),
                ));
            }

            vectors.extend(embedded);
            if let Some(report) = progress {
                report(vectors.len(), total);
            }
        }

        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexedChunk { chunk, vector })
            .collect();

        Ok(Self::from_entries(entries, model.model_id(), dimensions))
    }

    fn from_entries(entries: Vec<IndexedChunk>, model_id: &str, dimensions: usize) -> Self {
        let metadata = IndexMetadata {
            format_version: INDEX_FORMAT_VERSION,
            document_count: entries.len(),
            embedding_model_id: model_id.to_string(),
            embedding_dim: dimensions,
            content_fingerprint: content_fingerprint(entries.iter().map(|entry| &entry.chunk)),
            sample_chunk_len: entries.first().map(|entry| entry.chunk.len()).unwrap_or(0),
            created_at: Utc::now(),
        };
        Self { entries, metadata }
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn chunk_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn embedding_model_id(&self) -> &str {
        &self.metadata.embedding_model_id
    }

    pub fn dimensions(&self) -> usize {
        self.metadata.embedding_dim
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.entries.iter().map(|entry| &entry.chunk)
    }

    /// The `k` chunks closest to `query_vector` by cosine similarity. Ties keep index order.
    pub fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<RetrievalCandidate>> {
        if query_vector.len() != self.dimensions() {
            return Err(RagError::embedding(
                self.embedding_model_id(),
                format!(
                    "query vector dimension {} != {}",
                    query_vector.len(),
                    self.dimensions()
                ),
            ));
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (position, cosine_similarity(&entry.vector, query_vector)))
            .collect();

        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(position, score)| RetrievalCandidate {
                chunk: self.entries[position].chunk.clone(),
                score,
            })
            .collect())
    }
}

fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let norm_left = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let norm_right = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm_left == 0.0 || norm_right == 0.0 {
        return 0.0;
    }
    dot / (norm_left * norm_right)
}

pub fn content_fingerprint<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.chunk_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(chunk.text.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Result of [`IndexStore::create_or_load`].
#[derive(Debug)]
pub struct EnsuredIndex {
    pub index: VectorIndex,
    /// `true` when the persisted index was current and no embedding happened.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    directory: PathBuf,
}

impl IndexStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn persist(&self, index: &VectorIndex) -> Result<()> {
        let (parent, name) = self.split_directory()?;
        fs::create_dir_all(&parent)?;

        let staging = parent.join(format!(".{name}.staging-{}", Uuid::new_v4()));
        fs::create_dir(&staging)?;

        if let Err(error) = write_index_files(&staging, index) {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "failed to remove staging directory");
            }
            return Err(error);
        }

        let retired = if self.directory.exists() {
            let retired = parent.join(format!(".{name}.retired-{}", Uuid::new_v4()));
            fs::rename(&self.directory, &retired)?;
            Some(retired)
        } else {
            None
        };

        if let Err(error) = fs::rename(&staging, &self.directory) {
            if let Some(retired) = &retired {
                if let Err(restore) = fs::rename(retired, &self.directory) {
                    warn!(path = %retired.display(), error = %restore, "failed to restore previous index");
                }
            }
            return Err(error.into());
        }

        if let Some(retired) = retired {
            if let Err(error) = fs::remove_dir_all(&retired) {
                warn!(path = %retired.display(), error = %error, "failed to remove retired index");
            }
        }

        info!(
            path = %self.directory.display(),
            chunk_count = index.chunk_count(),
            model = index.embedding_model_id(),
            "vector index persisted"
        );
        Ok(())
    }

    /// `Ok(None)` when there is no usable index: nothing on disk, files missing,
    /// or built by a different embedding model.
    pub fn load(&self, model: &dyn EmbeddingModel) -> Result<Option<VectorIndex>> {
        self.load_for(model.model_id(), model.dimensions())
    }

    fn load_for(&self, model_id: &str, model_dimensions: usize) -> Result<Option<VectorIndex>> {
        if !self.directory.is_dir() {
            debug!(path = %self.directory.display(), "no index directory");
            return Ok(None);
        }

        let metadata_path = self.directory.join(METADATA_FILE);
        let vectors_path = self.directory.join(VECTORS_FILE);
        let chunks_path = self.directory.join(CHUNKS_FILE);
        if [&metadata_path, &vectors_path, &chunks_path]
            .iter()
            .any(|path| !path.is_file())
        {
            debug!(path = %self.directory.display(), "index directory is incomplete");
            return Ok(None);
        }

        let metadata: IndexMetadata = serde_json::from_slice(&read_index_file(&metadata_path)?)
            .map_err(|error| RagError::corrupt(&metadata_path, error.to_string()))?;

        if metadata.format_version != INDEX_FORMAT_VERSION {
            warn!(
                found = metadata.format_version,
                expected = INDEX_FORMAT_VERSION,
                "index format version differs, ignoring persisted index"
            );
            return Ok(None);
        }
        if metadata.embedding_model_id != model_id {
            warn!(
                persisted = %metadata.embedding_model_id,
                configured = model_id,
                "index was built with a different embedding model, ignoring it"
            );
            return Ok(None);
        }
        if metadata.embedding_dim != model_dimensions {
            warn!(
                persisted = metadata.embedding_dim,
                configured = model_dimensions,
                "index dimension differs from the embedding model, ignoring it"
            );
            return Ok(None);
        }

        let (dimensions, vectors) = decode_vectors(&read_index_file(&vectors_path)?)
            .map_err(|details| RagError::corrupt(&vectors_path, details))?;
        let chunks: Vec<Chunk> = serde_json::from_slice(&read_index_file(&chunks_path)?)
            .map_err(|error| RagError::corrupt(&chunks_path, error.to_string()))?;

        if dimensions != metadata.embedding_dim {
            return Err(RagError::corrupt(
                &vectors_path,
                format!("dimension {dimensions} != metadata {}", metadata.embedding_dim),
            ));
        }
        if vectors.len() != chunks.len() || chunks.len() != metadata.document_count {
            return Err(RagError::corrupt(
                &self.directory,
                format!(
                    "{} vectors and {} chunks but metadata records {}",
                    vectors.len(),
                    chunks.len(),
                    metadata.document_count
                ),
            ));
        }
        if content_fingerprint(&chunks) != metadata.content_fingerprint {
            return Err(RagError::corrupt(&chunks_path, "content fingerprint mismatch"));
        }

        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexedChunk { chunk, vector })
            .collect();

        info!(
            path = %self.directory.display(),
            chunk_count = metadata.document_count,
            "loaded persisted vector index"
        );
        Ok(Some(VectorIndex { entries, metadata }))
    }

    /// Reuses the persisted index when it matches `chunks` and `model`, otherwise builds and persists.
    pub async fn create_or_load(
        &self,
        chunks: Vec<Chunk>,
        model: &dyn EmbeddingModel,
        batch_size: usize,
        progress: Option<Progress<'_>>,
    ) -> Result<EnsuredIndex> {
        let fingerprint = content_fingerprint(&chunks);

        let store = self.clone();
        let (model_id, dimensions) = (model.model_id().to_string(), model.dimensions());
        let loaded =
            tokio::task::spawn_blocking(move || store.load_for(&model_id, dimensions)).await??;

        match loaded {
            Some(index) if index.metadata().content_fingerprint == fingerprint => {
                return Ok(EnsuredIndex {
                    index,
                    reused: true,
                });
            }
            Some(index) => warn!(
                persisted_chunks = index.chunk_count(),
                current_chunks = chunks.len(),
                "persisted index is stale, rebuilding"
            ),
            None => info!(path = %self.directory.display(), "no usable index, building"),
        }

        let index = VectorIndex::build(chunks, model, batch_size, progress).await?;
        let store = self.clone();
        let index =
            tokio::task::spawn_blocking(move || store.persist(&index).map(|()| index)).await??;
        Ok(EnsuredIndex {
            index,
            reused: false,
        })
    }

    pub fn remove(&self) -> Result<()> {
        if self.directory.exists() {
            fs::remove_dir_all(&self.directory)?;
            info!(path = %self.directory.display(), "removed persisted index");
        }
        Ok(())
    }

    fn split_directory(&self) -> Result<(PathBuf, String)> {
        let name = self
            .directory
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                RagError::Config(format!(
                    "index directory has no usable name: {}",
                    self.directory.display()
                ))
            })?
            .to_string();
        let parent = match self.directory.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((parent, name))
    }
}

/// Reads a file already known to exist; any failure marks the index as corrupt.
fn read_index_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|error| RagError::corrupt(path, error.to_string()))
}

fn write_index_files(directory: &Path, index: &VectorIndex) -> Result<()> {
    let vectors: Vec<&[f32]> = index.entries.iter().map(|entry| entry.vector.as_slice()).collect();
    fs::write(
        directory.join(VECTORS_FILE),
        encode_vectors(index.dimensions(), &vectors),
    )?;

    let chunks: Vec<&Chunk> = index.chunks().collect();
    fs::write(directory.join(CHUNKS_FILE), serde_json::to_vec(&chunks)?)?;
    fs::write(
        directory.join(METADATA_FILE),
        serde_json::to_vec_pretty(&index.metadata)?,
    )?;
    Ok(())
}

fn encode_vectors(dimensions: usize, vectors: &[&[f32]]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(VECTOR_HEADER_LEN + vectors.len() * dimensions * 4);
    bytes.extend_from_slice(VECTOR_MAGIC);
    bytes.extend_from_slice(&(dimensions as u32).to_le_bytes());
    bytes.extend_from_slice(&(vectors.len() as u64).to_le_bytes());
    for vector in vectors {
        for value in vector.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

fn decode_vectors(bytes: &[u8]) -> std::result::Result<(usize, Vec<Vec<f32>>), String> {
    if bytes.len() < VECTOR_HEADER_LEN || &bytes[..8] != VECTOR_MAGIC {
        return Err("missing vector header".to_string());
    }

    let mut dim_bytes = [0u8; 4];
    dim_bytes.copy_from_slice(&bytes[8..12]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[12..20]);
    let dimensions = u32::from_le_bytes(dim_bytes) as usize;
    let count = u64::from_le_bytes(count_bytes) as usize;

    if dimensions == 0 && count > 0 {
        return Err(format!("{count} vectors declared with dimension 0"));
    }

    let body = &bytes[VECTOR_HEADER_LEN..];
    let expected = count
        .checked_mul(dimensions)
        .and_then(|values| values.checked_mul(4))
        .ok_or_else(|| "vector header overflows".to_string())?;
    if body.len() != expected {
        return Err(format!("expected {expected} vector bytes, found {}", body.len()));
    }

    let values: Vec<f32> = body
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect();
    let vectors = if dimensions == 0 {
        Vec::new()
    } else {
        values.chunks(dimensions).map(<[f32]>::to_vec).collect()
    };
    Ok((dimensions, vectors))
}

use crate::storage::vectors::LoadedIndex;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Cannot build an index from an empty batch")]
    EmptyInput,

    #[error("Got {vectors} vectors for {paths} paths")]
    LengthMismatch { vectors: usize, paths: usize },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector index not found: {}", .0.display())]
    IndexMissing(PathBuf),

    /// The vector structure loaded but its path list did not. `degraded`
    /// holds the loaded index with an empty path list; it is not searchable.
    #[error("Index path list not found: {}", .path.display())]
    PathsMissing {
        path: PathBuf,
        degraded: Box<LoadedIndex>,
    },

    #[error("Corrupt vector index: {0}")]
    CorruptIndex(String),

    #[error("An indexing run is already in progress")]
    IndexingInProgress,

    #[error("Duplicate upload: content {0} is already in the gallery")]
    DuplicateUpload(String),

    #[error("Failed to embed {}: {reason}", .path.display())]
    Embedding { path: PathBuf, reason: String },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("HuggingFace API error: {0}")]
    HuggingFace(#[from] hf_hub::api::sync::ApiError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// True for the cold-start conditions that a rebuild repairs.
    pub fn is_missing_artifact(&self) -> bool {
        matches!(self, Error::IndexMissing(_) | Error::PathsMissing { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

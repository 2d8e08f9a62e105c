use crate::indexing::status::IndexingType;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Result of embedding one image during a run
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Embedded {
        path: PathBuf,
        /// Path as stored in the index
        resolved: String,
        hash: String,
        vector: Vec<f32>,
        /// Taken from the embedding cache instead of the model
        reused: bool,
    },
    Failed {
        path: PathBuf,
        reason: String,
    },
}

impl ItemOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Embedded { path, .. } | Self::Failed { path, .. } => path,
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, Self::Embedded { .. })
    }
}

/// Everything one indexing run did
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub indexing_type: IndexingType,
    pub outcomes: Vec<ItemOutcome>,
    /// Vectors appended to the index
    pub added: usize,
}

impl BatchReport {
    pub fn empty(indexing_type: IndexingType) -> Self {
        Self {
            indexing_type,
            outcomes: Vec::new(),
            added: 0,
        }
    }

    pub fn embedded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_embedded()).count()
    }

    pub fn reused_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Embedded { reused: true, .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.embedded_count()
    }

    /// Failed images with the reason they were skipped
    pub fn failures(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            ItemOutcome::Failed { path, reason } => Some((path.as_path(), reason.as_str())),
            ItemOutcome::Embedded { .. } => None,
        })
    }

    /// Vectors and resolved paths of the embedded images, in run order
    pub fn embedded_pairs(&self) -> (Vec<Vec<f32>>, Vec<String>) {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ItemOutcome::Embedded {
                    vector, resolved, ..
                } => Some((vector.clone(), resolved.clone())),
                ItemOutcome::Failed { .. } => None,
            })
            .unzip()
    }
}

/// An uploaded file as received from the client
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// Why an uploaded file was not stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Same content is already in the gallery
    Duplicate,
    /// Name has no usable file component
    InvalidName,
    UnsupportedFormat,
    /// Writing the file into the image directory failed
    WriteFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUpload {
    pub name: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Where each stored file landed
    pub uploaded: Vec<PathBuf>,
    pub skipped: Vec<SkippedUpload>,
}

/// Answer of [`crate::Gallery::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    AlreadyInitialized,
    Started,
}

/// Paths ranked for a text query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResults {
    pub query: String,
    pub images: Vec<String>,
}

impl SearchResults {
    pub fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            images: Vec::new(),
        }
    }
}

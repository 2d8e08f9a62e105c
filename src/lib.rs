// Core functionality
pub mod core {
    pub mod config;
    pub mod error;
}

// Index artifacts and caches
pub mod storage {
    pub mod embeddings;
    pub mod registry;
    pub mod vectors;
}

// Indexing pipeline
pub mod indexing {
    pub mod discovery;
    pub mod status;
    pub mod worker;
}

// Search & ML
pub mod search {
    pub mod model;
}

// Gallery lifecycle
pub mod gallery {
    pub mod orchestrator;
    pub mod report;
}

// User interfaces
pub mod ui {
    pub mod cli;
    pub mod watch;
}

// Re-export commonly used types
pub use core::config::Config;
pub use core::error::{Error, Result};
pub use gallery::orchestrator::Gallery;
pub use gallery::report::{
    BatchReport, InitOutcome, ItemOutcome, SearchResults, SkipReason, SkippedUpload, UploadFile,
    UploadReport,
};
pub use indexing::status::{IndexingStatus, IndexingType, RunStatus};
pub use search::model::{ClipEmbedder, Embedder};
pub use storage::registry::HashRegistry;
pub use storage::vectors::{LoadedIndex, VectorIndexStore};
pub use ui::cli;
pub use ui::watch::FileWatcher;

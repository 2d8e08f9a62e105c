use super::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a loaded index stays cached before it is re-read from disk.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Number of results returned by a search when the caller does not ask.
pub const DEFAULT_TOP_K: usize = 12;

/// Configuration for picvec
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for picvec data
    pub base_dir: PathBuf,
    /// Directory holding the gallery images
    pub images_dir: PathBuf,
    /// Directory holding the vector index artifacts
    pub index_dir: PathBuf,
    /// Path to the binary vector index; the path list sits next to it
    pub index_path: PathBuf,
    /// Directory for cached models
    pub models_dir: PathBuf,
    /// Path to the embedding cache
    pub state_path: PathBuf,
    /// Lifetime of the in-memory index snapshot
    pub cache_ttl: Duration,
    pub default_top_k: usize,
    /// Schedule background indexing after uploads
    pub auto_index: bool,
}

impl Config {
    /// Get the default configuration directory
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))
            .map(|home| home.join(".picvec"))
    }

    /// Create a new configuration
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.unwrap_or_else(|| {
            Self::default_base_dir().unwrap_or_else(|_| PathBuf::from(".picvec"))
        });
        let index_dir = base_dir.join("index");

        Ok(Self {
            images_dir: base_dir.join("images"),
            index_path: index_dir.join("vector.index"),
            index_dir,
            models_dir: base_dir.join("models"),
            state_path: base_dir.join("state").join("embeddings.redb"),
            cache_ttl: DEFAULT_CACHE_TTL,
            default_top_k: DEFAULT_TOP_K,
            auto_index: true,
            base_dir,
        })
    }

    /// Disable background scheduling after uploads
    pub fn without_auto_index(mut self) -> Self {
        self.auto_index = false;
        self
    }

    /// Path of the newline-delimited path list for the index
    pub fn paths_path(&self) -> PathBuf {
        paths_file_for(&self.index_path)
    }

    /// Initialize the configuration directories
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.images_dir)?;
        std::fs::create_dir_all(&self.index_dir)?;
        std::fs::create_dir_all(&self.models_dir)?;
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Check if the configuration is already initialized
    pub fn is_initialized(&self) -> bool {
        self.base_dir.exists() && self.images_dir.exists() && self.index_dir.exists()
    }
}

/// `vector.index` -> `vector.index.paths`
pub fn paths_file_for(index_path: &Path) -> PathBuf {
    let mut name = index_path.as_os_str().to_os_string();
    name.push(".paths");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let config = Config::new(Some(PathBuf::from("/data/picvec"))).unwrap();
        assert_eq!(config.images_dir, PathBuf::from("/data/picvec/images"));
        assert_eq!(config.index_path, PathBuf::from("/data/picvec/index/vector.index"));
        assert_eq!(
            config.paths_path(),
            PathBuf::from("/data/picvec/index/vector.index.paths")
        );
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.default_top_k, 12);
        assert!(config.auto_index);
        assert!(!config.without_auto_index().auto_index);
    }

    #[test]
    fn test_init_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().join("picvec"))).unwrap();
        assert!(!config.is_initialized());

        config.init().unwrap();
        assert!(config.is_initialized());
        assert!(config.models_dir.exists());
        assert!(config.state_path.parent().unwrap().exists());
    }
}

use crate::core::error::{Error, Result};
use crate::indexing::discovery::discover_images;
use crate::storage::vectors::resolve_path;
use parking_lot::Mutex;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RegistryState {
    /// Content hashes of every image the gallery holds
    hashes: HashSet<String>,
    /// Resolved paths whose embedding is in the vector index
    indexed: HashSet<String>,
}

/// Known content hashes and indexed paths.
///
/// Both sets sit behind one lock so a duplicate check and the registration
/// that follows it cannot interleave with another upload.
#[derive(Debug, Default)]
pub struct HashRegistry {
    state: Mutex<RegistryState>,
}

impl HashRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry from the persisted path list and the image directory.
    ///
    /// Listed files that no longer exist are skipped; they stay in the path
    /// list until the next full rebuild.
    pub fn load(paths_file: &Path, images_dir: &Path) -> Result<Self> {
        let registry = Self::new();
        registry.reload(paths_file, images_dir)?;
        Ok(registry)
    }

    /// Clear both sets and seed them again from disk
    pub fn reload(&self, paths_file: &Path, images_dir: &Path) -> Result<()> {
        self.seed(Some(paths_file), images_dir)
    }

    /// Start over ahead of a full rebuild: no path is indexed, and the known
    /// hashes are exactly those of the images now in `images_dir`
    pub fn reset(&self, images_dir: &Path) -> Result<()> {
        self.seed(None, images_dir)
    }

    fn seed(&self, paths_file: Option<&Path>, images_dir: &Path) -> Result<()> {
        let mut indexed = HashSet::new();
        let mut listed = Vec::new();

        let Some(paths_file) = paths_file else {
            return self.replace(indexed, listed, images_dir);
        };
        match std::fs::read_to_string(paths_file) {
            Ok(content) => {
                for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    let path = Path::new(line);
                    if path.exists() {
                        indexed.insert(resolve_path(path));
                        listed.push(path.to_path_buf());
                    } else {
                        warn!("Indexed path no longer exists, skipping: {}", line);
                    }
                }
                info!("Loaded {} paths from index", indexed.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No existing index path list at {}", paths_file.display());
            }
            Err(e) => return Err(e.into()),
        }
        self.replace(indexed, listed, images_dir)
    }

    /// Hash the listed files plus every unindexed image, then swap both sets in
    fn replace(
        &self,
        indexed: HashSet<String>,
        listed: Vec<PathBuf>,
        images_dir: &Path,
    ) -> Result<()> {
        let mut candidates = listed;
        if images_dir.is_dir() {
            for image in discover_images(images_dir)? {
                if !indexed.contains(&resolve_path(&image)) {
                    candidates.push(image);
                }
            }
        }

        let hashes: HashSet<String> = candidates
            .par_iter()
            .filter_map(|path| match calculate_file_hash(path) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    warn!("Failed to hash {}: {}", path.display(), e);
                    None
                }
            })
            .collect();

        info!(
            "Registry seeded: {} unique hashes, {} indexed paths",
            hashes.len(),
            indexed.len()
        );

        let mut state = self.state.lock();
        state.hashes = hashes;
        state.indexed = indexed;
        Ok(())
    }

    /// Whether content with these bytes is already known
    pub fn is_duplicate_content(&self, bytes: &[u8]) -> bool {
        let hash = content_hash(bytes);
        self.state.lock().hashes.contains(&hash)
    }

    /// Whether the resolved form of `path` is in the index
    pub fn is_path_indexed(&self, path: &Path) -> bool {
        let resolved = resolve_path(path);
        self.state.lock().indexed.contains(&resolved)
    }

    /// Record the hash of an accepted upload.
    ///
    /// Fails with [`Error::DuplicateUpload`] when the content is already
    /// known, including when a concurrent upload of the same bytes won.
    pub fn register_upload(&self, bytes: &[u8]) -> Result<String> {
        let hash = content_hash(bytes);
        let mut state = self.state.lock();
        if !state.hashes.insert(hash.clone()) {
            return Err(Error::DuplicateUpload(hash));
        }
        Ok(hash)
    }

    /// Record the hash of a file that reached the image directory some other
    /// way. Returns false if the content was already known.
    pub fn register_hash(&self, hash: &str) -> bool {
        self.state.lock().hashes.insert(hash.to_string())
    }

    /// Undo [`register_upload`](Self::register_upload) for content that was
    /// never committed
    pub fn forget_hash(&self, hash: &str) {
        self.state.lock().hashes.remove(hash);
    }

    /// Record that the embedding for `path` is durably in the index
    pub fn register_indexed(&self, path: &Path) {
        let resolved = resolve_path(path);
        self.state.lock().indexed.insert(resolved);
    }

    pub fn hash_count(&self) -> usize {
        self.state.lock().hashes.len()
    }

    pub fn indexed_count(&self) -> usize {
        self.state.lock().indexed.len()
    }
}

/// Hex SHA-256 digest of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Calculate SHA256 hash of file contents
pub fn calculate_file_hash(path: &Path) -> Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

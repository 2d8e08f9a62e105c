//! Ties the registry, index store, status machine and embedder together.

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::gallery::report::{
    BatchReport, InitOutcome, ItemOutcome, SearchResults, SkipReason, SkippedUpload, UploadFile,
    UploadReport,
};
use crate::indexing::discovery::{discover_images, is_image_file, is_valid_image};
use crate::indexing::status::{IndexingManager, IndexingStatus, IndexingType};
use crate::indexing::worker::{IndexWorker, Submission};
use crate::search::model::Embedder;
use crate::storage::embeddings::{CachedEmbedding, EmbeddingCache};
use crate::storage::registry::{calculate_file_hash, HashRegistry};
use crate::storage::vectors::{resolve_path, LoadedIndex, VectorIndexStore};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// In-memory copy of the index, shared with searches in flight
#[derive(Default)]
struct IndexCache {
    loaded: Option<Arc<LoadedIndex>>,
    loaded_at: Option<Instant>,
}

impl IndexCache {
    fn fresh(&self, ttl: Duration) -> Option<Arc<LoadedIndex>> {
        match (&self.loaded, self.loaded_at) {
            (Some(loaded), Some(at)) if at.elapsed() < ttl => Some(Arc::clone(loaded)),
            _ => None,
        }
    }

    fn store(&mut self, loaded: Arc<LoadedIndex>) {
        self.loaded = Some(loaded);
        self.loaded_at = Some(Instant::now());
    }

    fn invalidate(&mut self) {
        self.loaded = None;
        self.loaded_at = None;
    }
}

struct GalleryInner {
    config: Config,
    embedder: Arc<dyn Embedder>,
    registry: HashRegistry,
    store: VectorIndexStore,
    embeddings: EmbeddingCache,
    manager: IndexingManager,
    /// Held for every load and mutation of the index artifacts
    index: Mutex<IndexCache>,
    /// Set when images arrive that the current run may not have seen
    has_new_images: AtomicBool,
    worker: IndexWorker,
}

/// An image gallery with text search over its contents.
///
/// Cloning is cheap; every clone drives the same gallery.
#[derive(Clone)]
pub struct Gallery {
    inner: Arc<GalleryInner>,
}

impl Gallery {
    /// Open the gallery under `config`, repairing and catching up the index.
    ///
    /// Existing artifacts are compacted. If the image directory holds images
    /// that are not indexed yet they are indexed before this returns.
    pub fn open(config: Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        config.init()?;

        let store = VectorIndexStore::new(&config.index_path);
        let registry = HashRegistry::load(store.paths_path(), &config.images_dir)?;
        let embeddings = EmbeddingCache::open(&config, embedder.model_id())?;
        let manager = IndexingManager::new(&config.index_path);
        let worker = IndexWorker::spawn()?;

        let inner = Arc::new(GalleryInner {
            config,
            embedder,
            registry,
            store,
            embeddings,
            manager,
            index: Mutex::new(IndexCache::default()),
            has_new_images: AtomicBool::new(false),
            worker,
        });
        inner.startup()?;

        Ok(Self { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Copy of the current indexing status
    pub fn status(&self) -> IndexingStatus {
        self.inner.manager.get_status()
    }

    /// Schedule indexing if the status machine says it is needed
    pub fn initialize(&self) -> InitOutcome {
        self.inner.manager.reset_error();
        if self.inner.start_indexing(false) {
            InitOutcome::Started
        } else {
            InitOutcome::AlreadyInitialized
        }
    }

    /// Start a run if one is needed, either on the worker or on this thread.
    ///
    /// Returns whether a run was started or queued.
    pub fn start_indexing(&self, force_immediate: bool) -> bool {
        self.inner.start_indexing(force_immediate)
    }

    /// Index every pending image on this thread
    pub fn run_indexing(&self) -> Result<BatchReport> {
        self.inner.run_indexing()
    }

    /// Store uploaded files, skipping duplicates and non-images
    pub fn upload(&self, files: Vec<UploadFile>) -> Result<UploadReport> {
        self.inner.upload(files)
    }

    /// Rank gallery images against a text query.
    ///
    /// Any failure along the way yields an empty result.
    pub fn search(&self, query: &str, top_k: usize) -> SearchResults {
        self.inner.search(query, top_k)
    }

    /// The cached index, reloading it when stale
    pub fn load_index(&self) -> Option<Arc<LoadedIndex>> {
        self.inner.load_index()
    }

    /// Drop duplicate and unpaired entries from the index
    pub fn compact(&self) -> Result<usize> {
        self.inner.compact()
    }

    /// Delete the index and build it again from the image directory
    pub fn rebuild(&self) -> Result<BatchReport> {
        self.inner.rebuild()
    }

    /// Account for images that appeared in the image directory.
    ///
    /// Returns how many of them were new to the gallery.
    pub fn notify_new_images(&self, paths: &[PathBuf]) -> usize {
        self.inner.notify_new_images(paths)
    }

    pub fn is_path_indexed(&self, path: &Path) -> bool {
        self.inner.registry.is_path_indexed(path)
    }

    /// Whether a background run is waiting to start
    pub fn has_queued_run(&self) -> bool {
        self.inner.worker.has_queued()
    }
}

impl GalleryInner {
    fn startup(self: &Arc<Self>) -> Result<()> {
        let unprocessed = self.unprocessed_images()?;
        info!("Found {} unprocessed images", unprocessed.len());

        if self.store.exists() {
            info!("Found existing index, cleaning up");
            let mut cache = self.index.lock();
            if let Err(e) = self.store.compact() {
                warn!("Index cleanup failed: {}", e);
            }
            cache.invalidate();
        }

        if unprocessed.is_empty() {
            self.manager.mark_idle();
            return Ok(());
        }

        self.manager.add_new_images(unprocessed.len());
        self.has_new_images.store(true, Ordering::SeqCst);
        info!("Indexing {} images before serving", unprocessed.len());
        if let Err(e) = self.run_indexing() {
            warn!("Initial indexing failed: {}", e);
        }
        Ok(())
    }

    fn start_indexing(self: &Arc<Self>, force_immediate: bool) -> bool {
        if !self.manager.needs_indexing() {
            return false;
        }

        if force_immediate {
            if let Err(e) = self.run_indexing() {
                debug!("Immediate indexing did not complete: {}", e);
            }
            return true;
        }

        let gallery = Arc::downgrade(self);
        let submission = self.worker.submit(move || {
            if let Some(inner) = gallery.upgrade() {
                if let Err(e) = inner.run_indexing() {
                    debug!("Background indexing did not complete: {}", e);
                }
            }
        });
        match submission {
            Submission::Queued => debug!("Background indexing queued"),
            Submission::Coalesced => debug!("Background indexing already queued"),
            Submission::Closed => {
                warn!("Indexing worker has stopped");
                return false;
            }
        }
        true
    }

    fn run_indexing(self: &Arc<Self>) -> Result<BatchReport> {
        let result = {
            let Some(_run) = self.manager.try_begin_run() else {
                return Err(Error::IndexingInProgress);
            };
            info!("Starting indexing run");

            let result = self.index_pending();
            match &result {
                Ok(report) => {
                    self.manager.finish_success();
                    info!(
                        "Indexing complete: {} embedded ({} from cache), {} failed",
                        report.embedded_count(),
                        report.reused_count(),
                        report.failed_count()
                    );
                }
                Err(e) => {
                    error!("Indexing error: {}", e);
                    self.manager.finish_error(&e.to_string());
                }
            }
            result
        };

        self.reschedule_if_pending();
        result
    }

    /// Embed every image not yet in the index and persist the batch
    fn index_pending(&self) -> Result<BatchReport> {
        self.has_new_images.store(false, Ordering::SeqCst);

        let full = !self.store.is_complete();
        if full {
            // Content deleted since the last run must be uploadable again.
            self.registry.reset(&self.config.images_dir)?;
        }
        let indexing_type = if full {
            IndexingType::Full
        } else {
            IndexingType::Incremental
        };

        let candidates = self.unprocessed_images()?;
        self.manager.set_total(candidates.len(), indexing_type);
        if candidates.is_empty() {
            info!("No new images to index");
            return Ok(BatchReport::empty(indexing_type));
        }
        info!("Processing {} images ({:?})", candidates.len(), indexing_type);

        let outcomes: Vec<ItemOutcome> = candidates
            .iter()
            .map(|path| {
                let outcome = self.embed_image(path);
                if outcome.is_embedded() {
                    self.manager.record_processed();
                }
                outcome
            })
            .collect();

        let mut report = BatchReport {
            indexing_type,
            outcomes,
            added: 0,
        };

        let (vectors, paths) = report.embedded_pairs();
        if vectors.is_empty() {
            warn!("No images could be embedded");
            return Ok(report);
        }

        {
            let mut cache = self.index.lock();
            report.added = if self.store.is_complete() {
                self.store.add_incremental(&vectors, &paths)?
            } else {
                self.store.create(&vectors, &paths)?;
                vectors.len()
            };
            cache.invalidate();
        }

        for outcome in &report.outcomes {
            if let ItemOutcome::Embedded { path, .. } = outcome {
                self.registry.register_indexed(path);
            }
        }
        Ok(report)
    }

    /// Embed one image, preferring the cached vector for its content
    fn embed_image(&self, path: &Path) -> ItemOutcome {
        let failed = |reason: String| {
            warn!("Error processing {}: {}", path.display(), reason);
            ItemOutcome::Failed {
                path: path.to_path_buf(),
                reason,
            }
        };

        let hash = match calculate_file_hash(path) {
            Ok(hash) => hash,
            Err(e) => return failed(e.to_string()),
        };
        self.registry.register_hash(&hash);
        let resolved = resolve_path(path);

        match self.embeddings.get(&hash) {
            Ok(Some(cached)) if !cached.vector.is_empty() => {
                debug!("Reusing cached embedding for {}", path.display());
                return ItemOutcome::Embedded {
                    path: path.to_path_buf(),
                    resolved,
                    hash,
                    vector: cached.vector,
                    reused: true,
                };
            }
            Ok(_) => {}
            Err(e) => warn!("Embedding cache lookup failed: {}", e),
        }

        let vector = match self.embedder.embed_image(path) {
            Ok(vector) if vector.is_empty() => return failed("empty embedding".to_string()),
            Ok(vector) => vector,
            Err(e) => return failed(e.to_string()),
        };

        let entry = CachedEmbedding::new(vector, resolved.clone());
        if let Err(e) = self.embeddings.insert(&hash, &entry) {
            warn!("Failed to cache embedding for {}: {}", path.display(), e);
        }

        ItemOutcome::Embedded {
            path: path.to_path_buf(),
            resolved,
            hash,
            vector: entry.vector,
            reused: false,
        }
    }

    /// Valid images in the image directory that are not in the index
    fn unprocessed_images(&self) -> Result<Vec<PathBuf>> {
        let images = discover_images(&self.config.images_dir)?;
        Ok(images
            .into_iter()
            .filter(|path| !self.registry.is_path_indexed(path))
            .filter(|path| {
                let valid = is_valid_image(path);
                if !valid {
                    warn!("Skipping invalid image: {}", path.display());
                }
                valid
            })
            .collect())
    }

    /// After a run, pick up images that arrived while it was in flight
    fn reschedule_if_pending(self: &Arc<Self>) {
        if !self.has_new_images.swap(false, Ordering::SeqCst) {
            return;
        }

        match self.unprocessed_images() {
            Ok(pending) if !pending.is_empty() => {
                info!("{} images arrived during indexing", pending.len());
                self.manager.add_new_images(pending.len());
                if self.config.auto_index {
                    self.start_indexing(false);
                } else {
                    self.has_new_images.store(true, Ordering::SeqCst);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to look for pending images: {}", e),
        }
    }

    fn load_index(self: &Arc<Self>) -> Option<Arc<LoadedIndex>> {
        let mut cache = self.index.lock();
        if let Some(loaded) = cache.fresh(self.config.cache_ttl) {
            return Some(loaded);
        }

        match self.store.load() {
            Ok(loaded) => {
                debug!("Loaded index with {} vectors", loaded.total_vector_count());
                let loaded = Arc::new(loaded);
                cache.store(Arc::clone(&loaded));
                Some(loaded)
            }
            Err(e) => {
                cache.invalidate();
                drop(cache);
                warn!("Error loading index: {}", e);
                if e.is_missing_artifact() {
                    info!("Index artifacts missing, scheduling indexing");
                    self.start_indexing(false);
                }
                None
            }
        }
    }

    fn search(self: &Arc<Self>, query: &str, top_k: usize) -> SearchResults {
        let Some(loaded) = self.load_index() else {
            return SearchResults::empty(query);
        };
        if !loaded.is_searchable() {
            info!("No valid index found, returning empty results");
            return SearchResults::empty(query);
        }

        let embedding = match self.embedder.embed_text(query) {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("Failed to embed query: {}", e);
                return SearchResults::empty(query);
            }
        };

        match loaded.search(&embedding, top_k) {
            Ok(images) => SearchResults {
                query: query.to_string(),
                images,
            },
            Err(e) => {
                warn!("Search failed: {}", e);
                SearchResults::empty(query)
            }
        }
    }

    fn upload(self: &Arc<Self>, files: Vec<UploadFile>) -> Result<UploadReport> {
        let mut report = UploadReport::default();

        for file in files {
            let Some(name) = upload_file_name(&file.name) else {
                report.skipped.push(SkippedUpload {
                    name: file.name,
                    reason: SkipReason::InvalidName,
                });
                continue;
            };

            if !is_image_file(Path::new(&name)) {
                report.skipped.push(SkippedUpload {
                    name: file.name,
                    reason: SkipReason::UnsupportedFormat,
                });
                continue;
            }

            let hash = match self.registry.register_upload(&file.bytes) {
                Ok(hash) => hash,
                Err(Error::DuplicateUpload(_)) => {
                    info!("Skipping duplicate upload {}", file.name);
                    report.skipped.push(SkippedUpload {
                        name: file.name,
                        reason: SkipReason::Duplicate,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            match write_unique(&self.config.images_dir, &name, &file.bytes) {
                Ok(path) => {
                    debug!("Stored upload at {}", path.display());
                    report.uploaded.push(path);
                }
                Err(e) => {
                    warn!("Failed to store upload {}: {}", file.name, e);
                    self.registry.forget_hash(&hash);
                    report.skipped.push(SkippedUpload {
                        name: file.name,
                        reason: SkipReason::WriteFailed,
                    });
                }
            }
        }

        if !report.uploaded.is_empty() {
            info!("Uploaded {} images", report.uploaded.len());
            self.manager.add_new_images(report.uploaded.len());
            self.has_new_images.store(true, Ordering::SeqCst);
            if self.config.auto_index {
                self.start_indexing(false);
            }
        }
        Ok(report)
    }

    fn notify_new_images(self: &Arc<Self>, paths: &[PathBuf]) -> usize {
        let mut fresh = 0;
        for path in paths {
            if !path.is_file() || !is_image_file(path) || self.registry.is_path_indexed(path) {
                continue;
            }
            match calculate_file_hash(path) {
                // Uploads registered their hash already.
                Ok(hash) if self.registry.register_hash(&hash) => fresh += 1,
                Ok(_) => {}
                Err(e) => warn!("Failed to hash {}: {}", path.display(), e),
            }
        }

        if fresh > 0 {
            info!("Detected {} new images", fresh);
            self.manager.add_new_images(fresh);
            self.has_new_images.store(true, Ordering::SeqCst);
            if self.config.auto_index {
                self.start_indexing(false);
            }
        }
        fresh
    }

    fn compact(&self) -> Result<usize> {
        let mut cache = self.index.lock();
        let removed = self.store.compact()?;
        cache.invalidate();
        Ok(removed)
    }

    fn rebuild(self: &Arc<Self>) -> Result<BatchReport> {
        if self.manager.get_status().is_indexing {
            return Err(Error::IndexingInProgress);
        }

        info!("Rebuilding index from {}", self.config.images_dir.display());
        {
            let mut cache = self.index.lock();
            self.store.remove()?;
            cache.invalidate();
        }
        self.registry.reset(&self.config.images_dir)?;
        self.manager.reset_error();
        self.run_indexing()
    }
}

/// File component of an uploaded name, if it has a usable one
fn upload_file_name(name: &str) -> Option<String> {
    let name = name.replace('\\', "/");
    let file_name = Path::new(&name).file_name()?.to_str()?.trim();
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return None;
    }
    Some(file_name.to_string())
}

/// Write `bytes` to `dir/name`, adding `_1`, `_2`, ... to the stem on clashes
fn write_unique(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let file_name = Path::new(name);
    let stem = file_name
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let extension = file_name.extension().and_then(|e| e.to_str());

    for counter in 0u32.. {
        let candidate = match (counter, extension) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{}_{}.{}", stem, n, ext),
            (n, None) => format!("{}_{}", stem, n),
        };
        let path = dir.join(&candidate);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::Io(e)),
        };
        if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
            let _ = std::fs::remove_file(&path);
            return Err(Error::Io(e));
        }
        return Ok(path);
    }

    Err(Error::Io(std::io::Error::other(format!(
        "No free file name for {}",
        name
    ))))
}

use crate::core::config::paths_file_for;
use crate::core::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info, warn};

/// File magic for the binary vector index
const INDEX_MAGIC: &[u8; 4] = b"PVIX";
const INDEX_VERSION: u32 = 1;
/// Magic, version, dimension and count
const HEADER_LEN: u64 = 4 + 4 + 4 + 8;

/// Canonical, symlink-free, absolute form of `path` with POSIX separators.
///
/// Falls back to a lexical absolute path when the file does not exist, so
/// entries for deleted files still compare equal to what was stored.
pub fn resolve_path(path: &Path) -> String {
    let resolved = std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf());
    to_posix(&resolved)
}

#[cfg(windows)]
fn to_posix(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(not(windows))]
fn to_posix(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn normalize_l2(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Flat inner-product index with explicit ids.
///
/// Vectors are stored row-major and unit-normalized on insert, so an inner
/// product search ranks by cosine similarity.
#[derive(Clone, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    ids: Vec<i64>,
    data: Vec<f32>,
}

impl std::fmt::Debug for FlatIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatIndex")
            .field("dim", &self.dim)
            .field("len", &self.ids.len())
            .finish()
    }
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ids: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Total number of stored vectors
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Normalize and append `vectors`, assigning ids `start_id..`.
    pub fn add_with_ids(&mut self, vectors: &[Vec<f32>], start_id: i64) -> Result<()> {
        for vector in vectors {
            self.check_dim(vector)?;
        }

        self.ids.reserve(vectors.len());
        self.data.reserve(vectors.len() * self.dim);
        for (offset, vector) in vectors.iter().enumerate() {
            let mut normalized = vector.clone();
            normalize_l2(&mut normalized);
            self.ids.push(start_id + offset as i64);
            self.data.extend_from_slice(&normalized);
        }
        Ok(())
    }

    /// Keep only the first `len` vectors
    pub fn truncate(&mut self, len: usize) {
        self.ids.truncate(len);
        self.data.truncate(len * self.dim);
    }

    /// Stored (normalized) vector at position `pos`
    pub fn reconstruct(&self, pos: usize) -> Option<&[f32]> {
        if pos >= self.ids.len() {
            return None;
        }
        Some(&self.data[pos * self.dim..(pos + 1) * self.dim])
    }

    /// Id stored at position `pos`
    pub fn id_at(&self, pos: usize) -> Option<i64> {
        self.ids.get(pos).copied()
    }

    /// Top-`k` ids by inner product with the normalized query, best first.
    /// Equal scores keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        self.check_dim(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        normalize_l2(&mut query);

        let mut heap: BinaryHeap<Scored> = BinaryHeap::with_capacity(k + 1);
        for pos in 0..self.len() {
            let score = inner_product(&query, &self.data[pos * self.dim..(pos + 1) * self.dim]);
            heap.push(Scored { pos, score });
            if heap.len() > k {
                heap.pop();
            }
        }

        // Ascending order of `Scored` is best-first.
        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|s| (self.ids[s.pos], s.score))
            .collect())
    }

    fn check_dim(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(INDEX_MAGIC)?;
        w.write_u32::<LittleEndian>(INDEX_VERSION)?;
        w.write_u32::<LittleEndian>(self.dim as u32)?;
        w.write_u64::<LittleEndian>(self.ids.len() as u64)?;
        for (pos, id) in self.ids.iter().enumerate() {
            w.write_i64::<LittleEndian>(*id)?;
            for x in &self.data[pos * self.dim..(pos + 1) * self.dim] {
                w.write_f32::<LittleEndian>(*x)?;
            }
        }
        Ok(())
    }

    /// Decode an index whose encoding is exactly `file_len` bytes long
    fn read_from<R: Read>(r: &mut R, file_len: u64) -> Result<Self> {
        let corrupt = |e: std::io::Error| Error::CorruptIndex(e.to_string());

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(corrupt)?;
        if &magic != INDEX_MAGIC {
            return Err(Error::CorruptIndex("bad magic".to_string()));
        }
        let version = r.read_u32::<LittleEndian>().map_err(corrupt)?;
        if version != INDEX_VERSION {
            return Err(Error::CorruptIndex(format!("unsupported version {}", version)));
        }
        let dim = r.read_u32::<LittleEndian>().map_err(corrupt)? as usize;
        let count = r.read_u64::<LittleEndian>().map_err(corrupt)? as usize;
        if dim == 0 && count > 0 {
            return Err(Error::CorruptIndex("zero dimension".to_string()));
        }
        let expected = (dim as u64)
            .checked_mul(4)
            .and_then(|row| row.checked_add(8))
            .and_then(|record| record.checked_mul(count as u64))
            .and_then(|body| body.checked_add(HEADER_LEN));
        if expected != Some(file_len) {
            return Err(Error::CorruptIndex(format!(
                "header claims {} vectors of dimension {} but the file has {} bytes",
                count, dim, file_len
            )));
        }

        let mut index = FlatIndex::new(dim);
        let mut row = vec![0f32; dim];
        for _ in 0..count {
            let id = r.read_i64::<LittleEndian>().map_err(corrupt)?;
            r.read_f32_into::<LittleEndian>(&mut row).map_err(corrupt)?;
            index.ids.push(id);
            index.data.extend_from_slice(&row);
        }
        Ok(index)
    }
}

/// Search candidate; orders worst-first so a max-heap evicts the worst.
struct Scored {
    pos: usize,
    score: f32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then(self.pos.cmp(&other.pos))
    }
}

/// A loaded index together with its parallel path list.
#[derive(Debug, Clone)]
pub struct LoadedIndex {
    pub index: FlatIndex,
    /// Line `i` of the path file: the resolved path for id `i`
    pub paths: Vec<String>,
}

impl LoadedIndex {
    pub fn total_vector_count(&self) -> usize {
        self.index.len()
    }

    /// Whether a search can return anything
    pub fn is_searchable(&self) -> bool {
        !self.index.is_empty() && !self.paths.is_empty()
    }

    /// Path for an internal id, if it is in range
    pub fn path_for_id(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.paths.get(i))
            .map(String::as_str)
    }

    /// Top-`k` paths for `query`, most similar first. Ids without a path
    /// entry are dropped.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<String>> {
        if self.index.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self.index.search(query, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|(id, _)| self.path_for_id(id).map(str::to_string))
            .collect())
    }
}

/// Owner of the on-disk index and its path list.
///
/// Every mutation writes both artifacts to temporary siblings first and only
/// then renames them into place, so a failed write leaves the previous pair
/// untouched.
#[derive(Debug, Clone)]
pub struct VectorIndexStore {
    index_path: PathBuf,
    paths_path: PathBuf,
}

impl VectorIndexStore {
    /// Store backed by `index_path` and its `.paths` sibling
    pub fn new(index_path: &Path) -> Self {
        Self {
            index_path: index_path.to_path_buf(),
            paths_path: paths_file_for(index_path),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn paths_path(&self) -> &Path {
        &self.paths_path
    }

    /// Whether the primary artifact exists
    pub fn exists(&self) -> bool {
        self.index_path.exists()
    }

    /// Whether both artifacts exist
    pub fn is_complete(&self) -> bool {
        self.index_path.exists() && self.paths_path.exists()
    }

    /// Build a fresh index from `vectors`, replacing whatever was on disk.
    ///
    /// The dimension is taken from the first vector. Repeated paths keep
    /// their first occurrence.
    pub fn create(&self, vectors: &[Vec<f32>], paths: &[String]) -> Result<()> {
        if vectors.len() != paths.len() {
            return Err(Error::LengthMismatch {
                vectors: vectors.len(),
                paths: paths.len(),
            });
        }
        let first = vectors.first().ok_or(Error::EmptyInput)?;

        let mut seen = HashSet::with_capacity(paths.len());
        let mut kept_vectors = Vec::with_capacity(vectors.len());
        let mut kept_paths = Vec::with_capacity(paths.len());
        for (vector, path) in vectors.iter().zip(paths) {
            let resolved = resolve_path(Path::new(path));
            if seen.insert(resolved.clone()) {
                kept_vectors.push(vector.clone());
                kept_paths.push(resolved);
            } else {
                warn!("Dropping repeated path from new index: {}", resolved);
            }
        }

        let mut index = FlatIndex::new(first.len());
        index.add_with_ids(&kept_vectors, 0)?;
        self.write_artifacts(&index, &kept_paths)?;

        info!(
            "Created index with {} vectors (dim {}) at {}",
            index.len(),
            index.dim(),
            self.index_path.display()
        );
        Ok(())
    }

    /// Read the index and its path list.
    ///
    /// A missing path list fails with [`Error::PathsMissing`], which still
    /// carries the loaded vectors with an empty path list.
    pub fn load(&self) -> Result<LoadedIndex> {
        let index = self.read_index()?;
        match self.read_paths()? {
            Some(paths) => {
                if paths.len() != index.len() {
                    warn!(
                        "Index has {} vectors but {} paths; run compaction to repair",
                        index.len(),
                        paths.len()
                    );
                }
                Ok(LoadedIndex { index, paths })
            }
            None => Err(Error::PathsMissing {
                path: self.paths_path.clone(),
                degraded: Box::new(LoadedIndex {
                    index,
                    paths: Vec::new(),
                }),
            }),
        }
    }

    /// Append vectors whose resolved path is not indexed yet.
    ///
    /// Returns how many were appended; re-adding a known path is a no-op.
    pub fn add_incremental(&self, vectors: &[Vec<f32>], paths: &[String]) -> Result<usize> {
        if vectors.len() != paths.len() {
            return Err(Error::LengthMismatch {
                vectors: vectors.len(),
                paths: paths.len(),
            });
        }
        if vectors.is_empty() {
            return Ok(0);
        }

        let LoadedIndex {
            mut index,
            paths: mut stored_paths,
        } = self.load()?;

        // New ids are positions in the path list, so both must line up first.
        let paired = index.len().min(stored_paths.len());
        if index.len() != stored_paths.len() {
            warn!(
                "Truncating index to {} paired entries before appending ({} vectors, {} paths)",
                paired,
                index.len(),
                stored_paths.len()
            );
            index.truncate(paired);
            stored_paths.truncate(paired);
        }

        let mut known: HashSet<String> = stored_paths.iter().cloned().collect();
        let mut new_vectors = Vec::new();
        let mut new_paths = Vec::new();
        for (vector, path) in vectors.iter().zip(paths) {
            let resolved = resolve_path(Path::new(path));
            if known.insert(resolved.clone()) {
                new_vectors.push(vector.clone());
                new_paths.push(resolved);
            } else {
                debug!("Already indexed, skipping: {}", resolved);
            }
        }

        if new_vectors.is_empty() {
            info!("No new unique images to add to index");
            return Ok(0);
        }

        let start_id = index.len() as i64;
        index.add_with_ids(&new_vectors, start_id)?;
        stored_paths.extend(new_paths);
        self.write_artifacts(&index, &stored_paths)?;

        info!(
            "Appended {} vectors to index (ids {}..{})",
            new_vectors.len(),
            start_id,
            index.len()
        );
        Ok(new_vectors.len())
    }

    /// Drop repeated paths (the earliest position is kept) and any vectors
    /// or paths without a counterpart, then re-densify ids.
    ///
    /// Returns the number of entries removed.
    pub fn compact(&self) -> Result<usize> {
        if !self.is_complete() {
            return Ok(0);
        }

        let index = self.read_index()?;
        let paths = self.read_paths()?.unwrap_or_default();
        let paired = index.len().min(paths.len());

        let mut seen = HashSet::with_capacity(paired);
        let mut kept_vectors = Vec::with_capacity(paired);
        let mut kept_paths = Vec::with_capacity(paired);
        for (pos, path) in paths.iter().enumerate().take(paired) {
            let resolved = resolve_path(Path::new(path));
            if !seen.insert(resolved.clone()) {
                continue;
            }
            if let Some(vector) = index.reconstruct(pos) {
                kept_vectors.push(vector.to_vec());
                kept_paths.push(resolved);
            }
        }

        let removed = index.len().max(paths.len()) - kept_paths.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut rebuilt = FlatIndex::new(index.dim());
        rebuilt.add_with_ids(&kept_vectors, 0)?;
        self.write_artifacts(&rebuilt, &kept_paths)?;

        info!(
            "Compacted index: removed {} entries, {} remain",
            removed,
            rebuilt.len()
        );
        Ok(removed)
    }

    /// Load the index and return the top-`k` paths for `query`
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<String>> {
        self.load()?.search(query, k)
    }

    /// Delete both artifacts
    pub fn remove(&self) -> Result<()> {
        for path in [&self.index_path, &self.paths_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_index(&self) -> Result<FlatIndex> {
        let file = match File::open(&self.index_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::IndexMissing(self.index_path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        FlatIndex::read_from(&mut BufReader::new(file), file_len)
    }

    fn read_paths(&self) -> Result<Option<Vec<String>>> {
        match std::fs::read_to_string(&self.paths_path) {
            Ok(content) => Ok(Some(
                content.lines().map(|line| line.trim().to_string()).collect(),
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_artifacts(&self, index: &FlatIndex, paths: &[String]) -> Result<()> {
        let dir = self
            .index_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut index_tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(index_tmp.as_file_mut());
            index.write_to(&mut writer)?;
            writer.flush()?;
        }
        index_tmp.as_file().sync_all()?;

        let mut paths_tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(paths_tmp.as_file_mut());
            for path in paths {
                writeln!(writer, "{}", path)?;
            }
            writer.flush()?;
        }
        paths_tmp.as_file().sync_all()?;

        // The old path list goes first: a crash part way leaves an
        // incomplete pair, never a new index beside a stale path list.
        let old_paths = SetAside::new(&self.paths_path, dir)?;
        let old_index = match SetAside::new(&self.index_path, dir) {
            Ok(old_index) => old_index,
            Err(e) => {
                old_paths.restore();
                return Err(e);
            }
        };

        let published = index_tmp
            .persist(&self.index_path)
            .and_then(|_| paths_tmp.persist(&self.paths_path));
        if let Err(e) = published {
            warn!("Failed to publish index, restoring previous artifacts: {}", e.error);
            old_index.restore();
            old_paths.restore();
            return Err(Error::Io(e.error));
        }
        Ok(())
    }
}

/// An artifact moved to a temp sibling while its replacement is published.
///
/// Dropping it deletes the old copy.
struct SetAside {
    original: PathBuf,
    backup: Option<TempPath>,
}

impl SetAside {
    fn new(original: &Path, dir: &Path) -> Result<Self> {
        let backup = if original.exists() {
            let backup = tempfile::Builder::new()
                .prefix(".old-")
                .tempfile_in(dir)?
                .into_temp_path();
            std::fs::rename(original, &backup)?;
            Some(backup)
        } else {
            None
        };
        Ok(Self {
            original: original.to_path_buf(),
            backup,
        })
    }

    /// Put the old artifact back, or remove the new one if there was none
    fn restore(self) {
        let result = match self.backup {
            Some(backup) => backup.persist(&self.original).map_err(|e| e.error),
            None => match std::fs::remove_file(&self.original) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };
        if let Err(e) = result {
            warn!("Failed to restore {}: {}", self.original.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(temp_dir: &TempDir) -> VectorIndexStore {
        VectorIndexStore::new(&temp_dir.path().join("index").join("vector.index"))
    }

    fn image_paths(temp_dir: &TempDir, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| resolve_path(&temp_dir.path().join(format!("img{}.png", i))))
            .collect()
    }

    #[test]
    fn test_normalize_l2() {
        let mut v = vec![3.0, 4.0];
        normalize_l2(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize_l2(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_resolve_path_is_absolute() {
        let resolved = resolve_path(Path::new("relative/missing.png"));
        assert!(Path::new(&resolved).is_absolute());
        assert!(resolved.ends_with("relative/missing.png"));
    }

    #[test]
    fn test_create_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 3);
        let vectors = vec![vec![1.0, 0.0, 0.0], vec![0.0, 2.0, 0.0], vec![0.0, 0.0, 3.0]];

        store.create(&vectors, &paths).unwrap();
        assert!(store.is_complete());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.paths, paths);
        assert_eq!(loaded.total_vector_count(), 3);
        assert_eq!(loaded.index.dim(), 3);
        assert_eq!(loaded.index.reconstruct(1).unwrap(), &[0.0, 1.0, 0.0]);
        assert_eq!(loaded.path_for_id(2), Some(paths[2].as_str()));
        assert_eq!(loaded.path_for_id(3), None);
        assert_eq!(loaded.path_for_id(-1), None);
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);

        assert!(matches!(store.create(&[], &[]), Err(Error::EmptyInput)));

        let paths = image_paths(&temp_dir, 2);
        let result = store.create(&[vec![1.0, 0.0], vec![1.0, 0.0, 0.0]], &paths);
        assert!(matches!(
            result,
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(!store.exists());

        let result = store.create(&[vec![1.0]], &paths);
        assert!(matches!(result, Err(Error::LengthMismatch { .. })));
    }

    #[test]
    fn test_load_missing_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        assert!(matches!(store.load(), Err(Error::IndexMissing(_))));

        let paths = image_paths(&temp_dir, 2);
        store
            .create(&[vec![1.0, 0.0], vec![0.0, 1.0]], &paths)
            .unwrap();
        std::fs::remove_file(store.paths_path()).unwrap();

        match store.load() {
            Err(Error::PathsMissing { degraded, .. }) => {
                assert_eq!(degraded.total_vector_count(), 2);
                assert!(degraded.paths.is_empty());
                assert!(!degraded.is_searchable());
            }
            other => panic!("expected PathsMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_load_corrupt_index() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        std::fs::create_dir_all(store.index_path().parent().unwrap()).unwrap();
        std::fs::write(store.index_path(), b"not an index").unwrap();
        std::fs::write(store.paths_path(), "").unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn test_load_rejects_header_larger_than_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        std::fs::create_dir_all(store.index_path().parent().unwrap()).unwrap();

        let mut header = Vec::new();
        header.extend_from_slice(INDEX_MAGIC);
        header.write_u32::<LittleEndian>(INDEX_VERSION).unwrap();
        header.write_u32::<LittleEndian>(u32::MAX).unwrap();
        header.write_u64::<LittleEndian>(1).unwrap();
        std::fs::write(store.index_path(), &header).unwrap();
        std::fs::write(store.paths_path(), "").unwrap();
        assert!(matches!(store.load(), Err(Error::CorruptIndex(_))));

        let mut huge_count = header[..8].to_vec();
        huge_count.write_u32::<LittleEndian>(2).unwrap();
        huge_count.write_u64::<LittleEndian>(u64::MAX).unwrap();
        std::fs::write(store.index_path(), &huge_count).unwrap();
        assert!(matches!(store.load(), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn test_load_rejects_trailing_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 1);
        store.create(&[vec![1.0, 0.0]], &paths).unwrap();

        let mut bytes = std::fs::read(store.index_path()).unwrap();
        assert_eq!(bytes.len() as u64, HEADER_LEN + 8 + 2 * 4);
        bytes.push(0);
        std::fs::write(store.index_path(), bytes).unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn test_set_aside_restores_previous_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("vector.index");
        std::fs::write(&file, b"old").unwrap();

        let aside = SetAside::new(&file, temp_dir.path()).unwrap();
        assert!(!file.exists());
        std::fs::write(&file, b"new").unwrap();
        aside.restore();
        assert_eq!(std::fs::read(&file).unwrap(), b"old");

        let fresh = temp_dir.path().join("vector.index.paths");
        let aside = SetAside::new(&fresh, temp_dir.path()).unwrap();
        std::fs::write(&fresh, b"new").unwrap();
        aside.restore();
        assert!(!fresh.exists());

        // Success path: the old copy is discarded.
        let aside = SetAside::new(&file, temp_dir.path()).unwrap();
        std::fs::write(&file, b"newer").unwrap();
        drop(aside);
        assert_eq!(std::fs::read(&file).unwrap(), b"newer");
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_create_replaces_both_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 3);

        store
            .create(&[vec![1.0, 0.0], vec![0.0, 1.0]], &paths[..2])
            .unwrap();
        store.create(&[vec![1.0, 1.0]], &paths[2..]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.paths, paths[2..].to_vec());
        assert_eq!(loaded.total_vector_count(), 1);

        let leftovers = std::fs::read_dir(store.index_path().parent().unwrap())
            .unwrap()
            .count();
        assert_eq!(leftovers, 2);
    }

    #[test]
    fn test_add_incremental_continues_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 4);

        store
            .create(&[vec![1.0, 0.0], vec![0.0, 1.0]], &paths[..2])
            .unwrap();
        let added = store
            .add_incremental(&[vec![1.0, 1.0], vec![-1.0, 0.0]], &paths[2..])
            .unwrap();
        assert_eq!(added, 2);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.paths, paths);
        assert_eq!(loaded.total_vector_count(), 4);
        assert_eq!(loaded.index.id_at(3), Some(3));
    }

    #[test]
    fn test_add_incremental_realigns_drifted_pair() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 4);

        store
            .create(
                &[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]],
                &paths[..3],
            )
            .unwrap();
        // A crash between the two renames left the old, shorter path list.
        std::fs::write(store.paths_path(), format!("{}\n{}\n", paths[0], paths[1])).unwrap();

        let added = store.add_incremental(&[vec![-1.0, 0.0]], &paths[3..]).unwrap();
        assert_eq!(added, 1);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.total_vector_count(), 3);
        assert_eq!(loaded.paths, vec![paths[0].clone(), paths[1].clone(), paths[3].clone()]);
        assert_eq!(loaded.search(&[-1.0, 0.0], 1).unwrap(), vec![paths[3].clone()]);
    }

    #[test]
    fn test_add_incremental_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 3);

        store.create(&[vec![1.0, 0.0]], &paths[..1]).unwrap();
        let batch = vec![vec![0.0, 1.0], vec![1.0, 1.0]];

        assert_eq!(store.add_incremental(&batch, &paths[1..]).unwrap(), 2);
        let once = store.load().unwrap();

        assert_eq!(store.add_incremental(&batch, &paths[1..]).unwrap(), 0);
        let twice = store.load().unwrap();

        assert_eq!(once.paths, twice.paths);
        assert_eq!(once.index, twice.index);
    }

    #[test]
    fn test_add_incremental_filters_within_batch() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 2);

        store.create(&[vec![1.0, 0.0]], &paths[..1]).unwrap();
        let repeated = vec![paths[0].clone(), paths[1].clone(), paths[1].clone()];
        let added = store
            .add_incremental(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]], &repeated)
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.load().unwrap().paths, paths);
    }

    #[test]
    fn test_add_incremental_requires_index() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 1);

        assert_eq!(store.add_incremental(&[], &[]).unwrap(), 0);
        assert!(matches!(
            store.add_incremental(&[vec![1.0]], &paths),
            Err(Error::IndexMissing(_))
        ));
    }

    #[test]
    fn test_add_incremental_dimension_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 2);

        store.create(&[vec![1.0, 0.0]], &paths[..1]).unwrap();
        let result = store.add_incremental(&[vec![1.0, 0.0, 0.0]], &paths[1..]);
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
        assert_eq!(store.load().unwrap().total_vector_count(), 1);
    }

    #[test]
    fn test_compact_removes_duplicates_keeping_earliest() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 2);
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];

        store
            .create(&vectors, &[paths[0].clone(), paths[1].clone(), "placeholder".into()])
            .unwrap();
        // Simulate drift: the third entry points at the first image again.
        let duplicated = format!("{}\n{}\n{}\n", paths[0], paths[1], paths[0]);
        std::fs::write(store.paths_path(), duplicated).unwrap();

        assert_eq!(store.compact().unwrap(), 1);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.paths, paths);
        assert_eq!(loaded.total_vector_count(), loaded.paths.len());
        assert_eq!(loaded.index.reconstruct(0).unwrap(), &[1.0, 0.0]);
        assert_eq!(loaded.index.id_at(1), Some(1));

        assert_eq!(store.compact().unwrap(), 0);
    }

    #[test]
    fn test_compact_repairs_count_drift() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 3);

        store
            .create(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]], &paths)
            .unwrap();
        std::fs::write(store.paths_path(), format!("{}\n{}\n", paths[0], paths[1])).unwrap();

        assert_eq!(store.compact().unwrap(), 1);
        let loaded = store.load().unwrap();
        assert_eq!(loaded.total_vector_count(), 2);
        assert_eq!(loaded.paths, paths[..2].to_vec());
    }

    #[test]
    fn test_compact_without_index_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        assert_eq!(store.compact().unwrap(), 0);
    }

    #[test]
    fn test_search_ranks_by_cosine() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 3);

        store
            .create(
                &[vec![0.0, 10.0], vec![1.0, 0.1], vec![5.0, 5.0]],
                &paths,
            )
            .unwrap();

        let results = store.search(&[2.0, 0.0], 2).unwrap();
        assert_eq!(results, vec![paths[1].clone(), paths[2].clone()]);

        let all = store.search(&[2.0, 0.0], 12).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2], paths[0]);
    }

    #[test]
    fn test_search_is_deterministic_with_ties() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 4);

        store
            .create(&[vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0], vec![2.0, 0.0]], &paths)
            .unwrap();
        let loaded = store.load().unwrap();

        let first = loaded.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(first, vec![paths[0].clone(), paths[1].clone(), paths[3].clone()]);
        for _ in 0..5 {
            assert_eq!(loaded.search(&[1.0, 0.0], 3).unwrap(), first);
        }
    }

    #[test]
    fn test_search_drops_ids_without_paths() {
        let mut index = FlatIndex::new(2);
        index
            .add_with_ids(&[vec![1.0, 0.0], vec![0.9, 0.1]], 0)
            .unwrap();
        let loaded = LoadedIndex {
            index,
            paths: vec!["/gallery/a.png".to_string()],
        };

        assert_eq!(loaded.search(&[1.0, 0.0], 5).unwrap(), vec!["/gallery/a.png"]);
    }

    #[test]
    fn test_search_empty_index() {
        let loaded = LoadedIndex {
            index: FlatIndex::new(2),
            paths: Vec::new(),
        };
        assert!(loaded.search(&[1.0, 0.0], 5).unwrap().is_empty());
        assert!(!loaded.is_searchable());
    }

    #[test]
    fn test_remove_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let paths = image_paths(&temp_dir, 1);

        store.create(&[vec![1.0]], &paths).unwrap();
        store.remove().unwrap();
        assert!(!store.exists());
        assert!(!store.paths_path().exists());
        store.remove().unwrap();
    }
}

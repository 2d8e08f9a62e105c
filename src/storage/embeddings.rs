use crate::core::config::Config;
use crate::core::error::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::time::SystemTime;
use tracing::info;

/// Table definition for cached embeddings
/// Key: content hash, Value: JSON serialized CachedEmbedding
const EMBEDDINGS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("embeddings");

/// Table for cache metadata
const META_TABLE: TableDefinition<&str, &str> = TableDefinition::new("meta");

// If the stored model id differs from the embedder's, every cached vector is stale.
const META_MODEL_ID_KEY: &str = "model_id";

/// An embedding remembered by content hash
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedEmbedding {
    pub vector: Vec<f32>,
    /// Path the content had when it was embedded
    pub path: String,
    /// Unix timestamp of the embedding
    pub embedded_at: u64,
}

impl CachedEmbedding {
    pub fn new(vector: Vec<f32>, path: String) -> Self {
        Self {
            vector,
            path,
            embedded_at: SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Database(format!("Failed to serialize embedding: {}", e)))
    }

    fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Database(format!("Failed to deserialize embedding: {}", e)))
    }
}

/// Embeddings keyed by content hash, so rebuilds only embed new content
pub struct EmbeddingCache {
    db: Database,
}

impl EmbeddingCache {
    /// Open or create the cache, clearing it if it was filled by another model
    pub fn open(config: &Config, model_id: &str) -> Result<Self> {
        if let Some(parent) = config.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&config.state_path).map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("lock") {
                Error::Database("Embedding cache is locked. Another picvec process may be running. Close other instances and try again.".to_string())
            } else {
                Error::Database(format!("Failed to open embedding cache: {}", e))
            }
        })?;

        let cache = Self { db };
        match cache.model_id()? {
            Some(stored) if stored == model_id => {}
            Some(stored) => {
                info!(
                    "Embedding model changed ({} -> {}), clearing cache",
                    stored, model_id
                );
                cache.reset(model_id)?;
            }
            None => cache.reset(model_id)?,
        }
        Ok(cache)
    }

    /// Look up the embedding for a content hash
    pub fn get(&self, hash: &str) -> Result<Option<CachedEmbedding>> {
        let read_txn = self.db.begin_read().map_err(|e| {
            Error::Database(format!("Failed to begin read transaction: {}", e))
        })?;

        let table = read_txn.open_table(EMBEDDINGS_TABLE).map_err(|e| {
            Error::Database(format!("Failed to open table: {}", e))
        })?;

        let json_str = match table.get(hash).map_err(|e| {
            Error::Database(format!("Failed to get embedding: {}", e))
        })? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };

        CachedEmbedding::from_json(&json_str).map(Some)
    }

    /// Store the embedding for a content hash
    pub fn insert(&self, hash: &str, embedding: &CachedEmbedding) -> Result<()> {
        let json_str = embedding.to_json()?;
        let write_txn = self.db.begin_write().map_err(|e| {
            Error::Database(format!("Failed to begin write transaction: {}", e))
        })?;

        {
            let mut table = write_txn.open_table(EMBEDDINGS_TABLE).map_err(|e| {
                Error::Database(format!("Failed to open table: {}", e))
            })?;
            table.insert(hash, json_str.as_str()).map_err(|e| {
                Error::Database(format!("Failed to insert embedding: {}", e))
            })?;
        }

        write_txn.commit().map_err(|e| {
            Error::Database(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(())
    }

    /// Number of cached embeddings
    pub fn len(&self) -> Result<u64> {
        let read_txn = self.db.begin_read().map_err(|e| {
            Error::Database(format!("Failed to begin read transaction: {}", e))
        })?;
        let table = read_txn.open_table(EMBEDDINGS_TABLE).map_err(|e| {
            Error::Database(format!("Failed to open table: {}", e))
        })?;
        table
            .len()
            .map_err(|e| Error::Database(format!("Failed to count embeddings: {}", e)))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn model_id(&self) -> Result<Option<String>> {
        let write_txn = self.db.begin_write().map_err(|e| {
            Error::Database(format!("Failed to begin write transaction: {}", e))
        })?;
        let stored = {
            let table = write_txn.open_table(META_TABLE).map_err(|e| {
                Error::Database(format!("Failed to open table: {}", e))
            })?;
            let value = table.get(META_MODEL_ID_KEY).map_err(|e| {
                Error::Database(format!("Failed to get model id: {}", e))
            })?;
            value.map(|guard| guard.value().to_string())
        };
        write_txn.commit().map_err(|e| {
            Error::Database(format!("Failed to commit transaction: {}", e))
        })?;
        Ok(stored)
    }

    /// Drop every cached embedding and record `model_id` as the owner
    fn reset(&self, model_id: &str) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(|e| {
            Error::Database(format!("Failed to begin write transaction: {}", e))
        })?;

        write_txn.delete_table(EMBEDDINGS_TABLE).map_err(|e| {
            Error::Database(format!("Failed to clear embeddings: {}", e))
        })?;
        {
            let _table = write_txn.open_table(EMBEDDINGS_TABLE).map_err(|e| {
                Error::Database(format!("Failed to open table: {}", e))
            })?;
            let mut meta = write_txn.open_table(META_TABLE).map_err(|e| {
                Error::Database(format!("Failed to open table: {}", e))
            })?;
            meta.insert(META_MODEL_ID_KEY, model_id).map_err(|e| {
                Error::Database(format!("Failed to store model id: {}", e))
            })?;
        }

        write_txn.commit().map_err(|e| {
            Error::Database(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(temp_dir: &TempDir) -> Config {
        let config = Config::new(Some(temp_dir.path().join("picvec"))).unwrap();
        config.init().unwrap();
        config
    }

    #[test]
    fn test_insert_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        let cache = EmbeddingCache::open(&config, "stub-v1").unwrap();
        assert!(cache.is_empty().unwrap());

        let entry = CachedEmbedding::new(vec![0.5, -0.5], "/gallery/cat.png".to_string());
        cache.insert("abc", &entry).unwrap();

        let found = cache.get("abc").unwrap().unwrap();
        assert_eq!(found.vector, vec![0.5, -0.5]);
        assert_eq!(found.path, "/gallery/cat.png");
        assert!(found.embedded_at > 0);
        assert!(cache.get("missing").unwrap().is_none());
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_survives_reopen_with_same_model() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        {
            let cache = EmbeddingCache::open(&config, "stub-v1").unwrap();
            cache
                .insert("abc", &CachedEmbedding::new(vec![1.0], "/a.png".to_string()))
                .unwrap();
        }

        let cache = EmbeddingCache::open(&config, "stub-v1").unwrap();
        assert!(cache.get("abc").unwrap().is_some());
    }

    #[test]
    fn test_model_change_clears_cache() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        {
            let cache = EmbeddingCache::open(&config, "stub-v1").unwrap();
            cache
                .insert("abc", &CachedEmbedding::new(vec![1.0], "/a.png".to_string()))
                .unwrap();
        }

        let cache = EmbeddingCache::open(&config, "stub-v2").unwrap();
        assert!(cache.get("abc").unwrap().is_none());
        assert!(cache.is_empty().unwrap());
    }
}

//! # Conversion Cache Module
//!
//! Cache concorrente fingerprint -> risultato di conversione.
//!
//! ## Chiave
//! `fingerprint = sha256(source path, target format, config hash)`, dove il
//! config hash riassume qualità e dimensione massima.
//!
//! ## Validità di una entry
//! Una entry è affidabile solo se:
//! 1. il file sorgente non è stato modificato dopo `source_modified`
//! 2. il file di output registrato esiste ancora
//! 3. `config_hash` coincide con quello corrente del converter
//!
//! Altrimenti viene rimossa e il file viene riconvertito.
//!
//! ## Concorrenza
//! La mappa è divisa in shard, ognuno protetto dal proprio `RwLock`: worker
//! diversi lavorano quasi sempre su shard diversi.
//!
//! ## Persistenza
//! Opzionale, come manifest JSON scritto in modo atomico.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::file_manager::FileManager;

const SHARD_COUNT: usize = 16;

/// A previously computed conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub output_path: PathBuf,
    pub output_size: u64,
    pub source_modified: SystemTime,
    pub config_hash: String,
}

impl CacheEntry {
    /// Check the trust conditions against the current source and settings.
    pub fn is_valid(
        &self,
        source_modified: SystemTime,
        expected_output: &Path,
        config_hash: &str,
    ) -> bool {
        if source_modified > self.source_modified {
            return false;
        }
        if !expected_output.exists() {
            return false;
        }
        self.config_hash == config_hash
    }
}

/// Hash of the settings that change the encoded bytes.
pub fn config_hash(quality: u8, max_dimension: u32) -> String {
    format!("{}_{}", quality, max_dimension)
}

/// Cache key for one (source, format, settings) combination.
pub fn fingerprint(source: &Path, format: &str, config_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(format.to_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(config_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Sharded concurrent map from fingerprint to [`CacheEntry`]
pub struct ConversionCache {
    shards: Vec<RwLock<HashMap<String, CacheEntry>>>,
}

impl Default for ConversionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, CacheEntry>> {
        // keys are hex digests, the first byte is already uniformly spread
        let index = u8::from_str_radix(key.get(..2).unwrap_or("0"), 16).unwrap_or(0) as usize;
        &self.shards[index % SHARD_COUNT]
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let shard = self.shard(key).read().unwrap_or_else(|e| e.into_inner());
        shard.get(key).cloned()
    }

    pub fn insert(&self, key: String, entry: CacheEntry) {
        let mut shard = self.shard(&key).write().unwrap_or_else(|e| e.into_inner());
        shard.insert(key, entry);
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut shard = self.shard(key).write().unwrap_or_else(|e| e.into_inner());
        shard.remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> HashMap<String, CacheEntry> {
        let mut all = HashMap::new();
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(|e| e.into_inner());
            all.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }

    /// Load a manifest; a missing or unreadable one yields an empty cache.
    pub async fn load(path: &Path) -> Self {
        let cache = Self::new();
        if !path.exists() {
            return cache;
        }
        let entries: HashMap<String, CacheEntry> = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring corrupt cache manifest {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) => {
                warn!("Could not read cache manifest {}: {}", path.display(), e);
                HashMap::new()
            }
        };
        debug!("Loaded {} cache entries from {}", entries.len(), path.display());
        for (key, entry) in entries {
            cache.insert(key, entry);
        }
        cache
    }

    /// Persist all entries atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || FileManager::atomic_write(&path, &content)).await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(output: &Path, modified: SystemTime) -> CacheEntry {
        CacheEntry {
            output_path: output.to_path_buf(),
            output_size: 42,
            source_modified: modified,
            config_hash: config_hash(80, 0),
        }
    }

    #[test]
    fn test_fingerprint_depends_on_every_input() {
        let base = fingerprint(Path::new("/a.png"), "webp", "80_0");
        assert_eq!(base, fingerprint(Path::new("/a.png"), "WEBP", "80_0"));
        assert_ne!(base, fingerprint(Path::new("/b.png"), "webp", "80_0"));
        assert_ne!(base, fingerprint(Path::new("/a.png"), "jpg", "80_0"));
        assert_ne!(base, fingerprint(Path::new("/a.png"), "webp", "90_0"));
    }

    #[test]
    fn test_entry_validity_rules() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("a.webp");
        std::fs::write(&output, b"out").unwrap();
        let recorded = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let e = entry(&output, recorded);

        assert!(e.is_valid(recorded, &output, "80_0"));
        assert!(e.is_valid(recorded - Duration::from_secs(5), &output, "80_0"));
        assert!(!e.is_valid(recorded + Duration::from_secs(1), &output, "80_0"));
        assert!(!e.is_valid(recorded, &output, "90_0"));
        assert!(!e.is_valid(recorded, &temp_dir.path().join("missing.webp"), "80_0"));
    }

    #[test]
    fn test_concurrent_inserts() {
        let cache = Arc::new(ConversionCache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = fingerprint(Path::new(&format!("/f{}_{}.png", t, i)), "jpg", "80_0");
                        cache.insert(key.clone(), entry(Path::new("/x"), SystemTime::UNIX_EPOCH));
                        assert!(cache.get(&key).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }

    #[tokio::test]
    async fn test_save_and_load_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join("cache.json");
        let cache = ConversionCache::new();
        let key = fingerprint(Path::new("/a.png"), "webp", "80_0");
        cache.insert(key.clone(), entry(Path::new("/a.webp"), SystemTime::UNIX_EPOCH));
        cache.save(&manifest).await.unwrap();

        let loaded = ConversionCache::load(&manifest).await;
        assert_eq!(loaded.get(&key), cache.get(&key));
        assert!(loaded.remove(&key).is_some());
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join("cache.json");
        std::fs::write(&manifest, b"{ not json").unwrap();
        assert!(ConversionCache::load(&manifest).await.is_empty());
    }
}

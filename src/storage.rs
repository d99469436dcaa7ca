//! ALFA Session Guard - Secure Storage
//!
//! The platform keystore is an opaque byte store. The guard seals everything
//! it writes here itself; implementations only have to persist bytes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{GuardError, GuardResult};

/// Confidentiality-protected key/value store supplied by the platform
#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn get(&self, key: &str) -> GuardResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: &[u8]) -> GuardResult<()>;

    /// Remove `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> GuardResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// IN-MEMORY
// ═══════════════════════════════════════════════════════════════════════════

/// Process-local storage for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn get(&self, key: &str) -> GuardResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> GuardResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> GuardResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FILESYSTEM
// ═══════════════════════════════════════════════════════════════════════════

/// One file per key under a root directory (desktop builds, CLI)
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Keys are hex-encoded so no key can escape the root directory
    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.sec", hex::encode(key.as_bytes())))
    }
}

#[async_trait]
impl SecureStorage for FileStorage {
    async fn get(&self, key: &str) -> GuardResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GuardError::Storage(e.to_string())),
        }
    }

    /// Write to a per-write temp file, fsync, then rename over the target.
    /// Concurrent writers never share a temp file; the last rename wins.
    async fn put(&self, key: &str, value: &[u8]) -> GuardResult<()> {
        fs::create_dir_all(&self.root).await?;

        let path = self.path_for(key);
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let written = async {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)
                .await?;
            file.write_all(value).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Overwrite with zeros before unlinking
    async fn delete(&self, key: &str) -> GuardResult<()> {
        let path = self.path_for(key);

        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if size > 0 {
            if let Ok(mut file) = OpenOptions::new().write(true).open(&path).await {
                let zeros = vec![0u8; size];
                let _ = file.write_all(&zeros).await;
                let _ = file.sync_all().await;
            }
        }

        fs::remove_file(&path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_storage_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.put("alfa.tokens", b"sealed blob").await.unwrap();
        assert_eq!(
            storage.get("alfa.tokens").await.unwrap().as_deref(),
            Some(b"sealed blob".as_slice())
        );

        storage.delete("alfa.tokens").await.unwrap();
        assert!(storage.get("alfa.tokens").await.unwrap().is_none());
        // Second delete is a no-op
        storage.delete("alfa.tokens").await.unwrap();
    }

    #[tokio::test]
    async fn test_traversal_keys_stay_in_root() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.put("../../escape", b"x").await.unwrap();
        assert!(storage.path_for("../../escape").starts_with(dir.path()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_to_one_key() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let values: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 64 + 37 * i as usize]).collect();

        for _ in 0..20 {
            let writes: Vec<_> = values
                .iter()
                .cloned()
                .map(|value| {
                    let storage = storage.clone();
                    tokio::spawn(async move { storage.put("alfa.session", &value).await })
                })
                .collect();
            for write in writes {
                write.await.unwrap().unwrap();
            }

            let stored = storage.get("alfa.session").await.unwrap().unwrap();
            assert!(values.contains(&stored));
        }

        // No temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        storage.put("k", b"v").await.unwrap();
        assert!(storage.contains("k"));
        storage.delete("k").await.unwrap();
        assert!(storage.is_empty());
    }
}

//! Durable JSON snapshot of the whole memory.
//!
//! One file holds every chat. Reads are forgiving (a missing or corrupt
//! snapshot means starting over), writes are not: the caller decides
//! whether a failed save matters.

use super::model::Memory;
use super::SharedMemory;
use crate::{KibitzError, Result};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub struct MemoryStore {
    file_path: PathBuf,
}

impl MemoryStore {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    /// Load the snapshot, or an empty memory if there is none to load.
    pub async fn load(&self) -> Memory {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Reading memory from {}: {}", self.file_path.display(), e);
                return Memory::new();
            }
        };

        match serde_json::from_str::<Memory>(&content) {
            Ok(memory) => {
                info!(
                    "Loaded memory for {} chats from {}",
                    memory.chats.len(),
                    self.file_path.display()
                );
                memory
            }
            Err(e) => {
                warn!("Parsing memory from {}: {}", self.file_path.display(), e);
                Memory::new()
            }
        }
    }

    /// Overwrite the snapshot with `memory`.
    pub async fn save(&self, memory: &Memory) -> Result<()> {
        let content = serde_json::to_string(memory)?;
        self.write(&content).await
    }

    /// Serialize under a read lock, then write without holding it.
    pub async fn save_shared(&self, memory: &SharedMemory) -> Result<()> {
        let content = {
            let memory = memory.read().await;
            serde_json::to_string(&*memory)?
        };
        self.write(&content).await
    }

    async fn write(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.persistence_error("creating directory", e))?;
            }
        }

        // Write next to the target and rename so a crash never leaves half a file
        let tmp_path = self.file_path.with_extension("json.tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|e| self.persistence_error("opening", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| self.persistence_error("writing", e))?;
        file.flush()
            .await
            .map_err(|e| self.persistence_error("flushing", e))?;
        drop(file);

        fs::rename(&tmp_path, &self.file_path)
            .await
            .map_err(|e| self.persistence_error("replacing", e))?;

        debug!("Saved memory to {} ({} bytes)", self.file_path.display(), content.len());
        Ok(())
    }

    fn persistence_error(&self, action: &str, e: std::io::Error) -> KibitzError {
        KibitzError::Persistence(format!("{} {}: {}", action, self.file_path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::new(temp_dir.path().join("memory.json"));
        assert_eq!(store.load().await, Memory::new());
    }

    #[tokio::test]
    async fn test_load_malformed_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("memory.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let store = MemoryStore::new(path);
        assert!(store.load().await.chats.is_empty());
    }

    #[tokio::test]
    async fn test_save_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("memory.json");
        let store = MemoryStore::new(path.clone());

        let mut memory = Memory::new();
        memory.get_or_create(-100).notes.push("hello".to_string());
        store.save(&memory).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_save_to_unwritable_location_fails() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        tokio::fs::write(&blocker, "x").await.unwrap();

        let store = MemoryStore::new(blocker.join("memory.json"));
        let err = store.save(&Memory::new()).await.unwrap_err();
        assert!(matches!(err, KibitzError::Persistence(_)));
    }
}

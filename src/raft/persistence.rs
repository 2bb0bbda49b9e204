use async_std::fs;
use async_std::path::{Path, PathBuf};
use async_std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use futures::AsyncWriteExt;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::raft::error::RaftError;

const STATE_PATH: &str = "state.pb.bin";
const STATE_TMP_PATH: &str = "state.pb.bin.tmp";

// Durable storage for a single member's state. The stored blob is opaque at
// this layer, callers are responsible for encoding and decoding it.
#[async_trait]
pub trait Persistence {
    // Replaces the stored state. Returns only once the blob is durable.
    async fn save_state(&self, blob: Bytes) -> Result<(), PersistenceError>;

    // Returns the last successfully saved blob, if any.
    async fn read_state(&self) -> Result<Option<Bytes>, PersistenceError>;
}

#[derive(Debug, Clone)]
pub enum PersistenceOptions {
    // Stores state in a file inside the supplied directory. If "wipe" is set,
    // any previously stored state is discarded on startup.
    Directory { path: String, wipe: bool },

    // Stores state in memory. The supplied handle can be kept around to
    // restart a member from the same state.
    Memory(MemoryPersistence),
}

pub async fn new(
    options: PersistenceOptions,
) -> Result<Box<dyn Persistence + Send + Sync>, PersistenceError> {
    match options {
        PersistenceOptions::Directory { path, wipe } => {
            Ok(Box::new(FilePersistence::new(path.as_str(), wipe).await?))
        }
        PersistenceOptions::Memory(memory) => Ok(Box::new(memory)),
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct PersistenceError {
    message: String,
}

impl PersistenceError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

impl From<PersistenceError> for RaftError {
    fn from(err: PersistenceError) -> Self {
        RaftError::Persistence(err.message)
    }
}

// Keeps the state in memory. Clones share the same underlying state, which is
// what makes it possible to "restart" a member from what it persisted.
#[derive(Debug, Clone)]
pub struct MemoryPersistence {
    state: Arc<Mutex<Option<Bytes>>>,
    fail_writes: Arc<AtomicBool>,
    write_delay_ms: Arc<AtomicU64>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        MemoryPersistence {
            state: Arc::new(Mutex::new(None)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            write_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    // Makes all subsequent writes fail (or succeed again). Used to exercise
    // the handling of broken storage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    // Makes every subsequent write take (at least) the supplied time before
    // the new state becomes visible. Models a slow disk.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_state(&self, blob: Bytes) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::new(
                "Injected failure writing state".to_string(),
            ));
        }
        let delay_ms = self.write_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms)).await;
        }
        *self.state.lock().await = Some(blob);
        Ok(())
    }

    async fn read_state(&self) -> Result<Option<Bytes>, PersistenceError> {
        Ok(self.state.lock().await.clone())
    }
}

struct FilePersistence {
    directory: PathBuf,
}

impl FilePersistence {
    async fn new(directory: &str, wipe: bool) -> Result<Self, PersistenceError> {
        create_dir_if_not_exists(directory).await?;
        let result = FilePersistence {
            directory: PathBuf::from(directory),
        };
        if wipe {
            result.remove_if_exists(STATE_PATH).await?;
            result.remove_if_exists(STATE_TMP_PATH).await?;
            info!(directory, "wiped persisted state");
        }
        info!(directory, "created file persistence");
        Ok(result)
    }

    async fn remove_if_exists(&self, filename: &str) -> Result<(), PersistenceError> {
        let path = self.directory.join(filename);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::new(format!(
                "Failed to remove file {:?} : {}",
                path, e
            ))),
        }
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    // Writes to a temporary file first and then renames it over the real one,
    // so that a crash mid-write leaves the previous state intact.
    async fn save_state(&self, blob: Bytes) -> Result<(), PersistenceError> {
        let tmp_path = self.directory.join(STATE_TMP_PATH);
        let path = self.directory.join(STATE_PATH);

        let mut file = fs::File::create(&tmp_path).await.map_err(|e| {
            PersistenceError::new(format!("Failed to open file {:?} : {}", tmp_path, e))
        })?;
        file.write_all(&blob).await.map_err(|e| {
            PersistenceError::new(format!("Failed to write to file {:?} : {}", tmp_path, e))
        })?;
        file.sync_all().await.map_err(|e| {
            PersistenceError::new(format!("Failed to sync file {:?} : {}", tmp_path, e))
        })?;
        drop(file);

        fs::rename(&tmp_path, &path).await.map_err(|e| {
            PersistenceError::new(format!("Failed to rename {:?} to {:?} : {}", tmp_path, path, e))
        })?;
        debug!(bytes = blob.len(), "saved state");
        Ok(())
    }

    async fn read_state(&self) -> Result<Option<Bytes>, PersistenceError> {
        let path = self.directory.join(STATE_PATH);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::new(format!(
                "Failed to read file {:?} : {}",
                path, e
            ))),
        }
    }
}

async fn create_dir_if_not_exists(directory: &str) -> Result<(), PersistenceError> {
    let dir_path = Path::new(directory);
    match fs::metadata(&dir_path).await {
        Ok(metadata) => {
            if metadata.is_dir() {
                Ok(())
            } else {
                Err(PersistenceError::new(format!(
                    "Path exists but is not a directory: {}",
                    directory
                )))
            }
        }
        Err(e) => {
            if e.kind() == ErrorKind::NotFound {
                fs::create_dir_all(directory).await.map_err(|e| {
                    PersistenceError::new(format!("Failed to create directory {}", e))
                })
            } else {
                Err(PersistenceError::new(format!(
                    "Unexpected filesystem error for {} : {}",
                    directory, e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let memory = MemoryPersistence::new();
        assert_eq!(memory.read_state().await.unwrap(), None);

        memory.save_state(Bytes::from("one")).await.unwrap();
        memory.save_state(Bytes::from("two")).await.unwrap();

        // Clones observe the same state.
        let other = memory.clone();
        assert_eq!(other.read_state().await.unwrap(), Some(Bytes::from("two")));
    }

    #[tokio::test]
    async fn test_memory_write_delay() {
        let memory = MemoryPersistence::new();
        memory.set_write_delay(Duration::from_millis(200));

        // A write abandoned halfway leaves the previous state in place.
        let write = memory.save_state(Bytes::from("slow"));
        assert!(tokio::time::timeout(Duration::from_millis(20), write).await.is_err());
        assert_eq!(memory.read_state().await.unwrap(), None);

        memory.save_state(Bytes::from("slow")).await.unwrap();
        assert_eq!(memory.read_state().await.unwrap(), Some(Bytes::from("slow")));
    }

    #[tokio::test]
    async fn test_memory_fail_writes() {
        let memory = MemoryPersistence::new();
        memory.save_state(Bytes::from("before")).await.unwrap();

        memory.set_fail_writes(true);
        assert!(memory.save_state(Bytes::from("after")).await.is_err());
        assert_eq!(memory.read_state().await.unwrap(), Some(Bytes::from("before")));

        memory.set_fail_writes(false);
        assert!(memory.save_state(Bytes::from("after")).await.is_ok());
    }

    #[tokio::test]
    async fn test_file_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = new(directory_options(&temp_dir, false)).await.unwrap();
        assert_eq!(persistence.read_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let persistence = new(directory_options(&temp_dir, false)).await.unwrap();
            persistence.save_state(Bytes::from("first")).await.unwrap();
            persistence.save_state(Bytes::from("second")).await.unwrap();
        }

        let persistence = new(directory_options(&temp_dir, false)).await.unwrap();
        assert_eq!(
            persistence.read_state().await.unwrap(),
            Some(Bytes::from("second"))
        );
    }

    #[tokio::test]
    async fn test_file_wipe() {
        let temp_dir = TempDir::new().unwrap();
        {
            let persistence = new(directory_options(&temp_dir, false)).await.unwrap();
            persistence.save_state(Bytes::from("stale")).await.unwrap();
        }

        let persistence = new(directory_options(&temp_dir, true)).await.unwrap();
        assert_eq!(persistence.read_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_creates_nested_directory() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        let options = PersistenceOptions::Directory {
            path: nested.to_str().unwrap().to_string(),
            wipe: false,
        };
        let persistence = new(options).await.unwrap();
        persistence.save_state(Bytes::from("x")).await.unwrap();
        assert!(nested.join(STATE_PATH).exists());
    }

    fn directory_options(temp_dir: &TempDir, wipe: bool) -> PersistenceOptions {
        PersistenceOptions::Directory {
            path: temp_dir.path().to_str().unwrap().to_string(),
            wipe,
        }
    }
}

//! Snapshot storage backends.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::RwLock;

use super::LedgerSnapshot;
use crate::{Error, Result};

/// Durable home of the ledger snapshot.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Option<LedgerSnapshot>>;

    /// Replace the stored snapshot with `snapshot`.
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()>;
}

/// In-memory store (for testing and ephemeral deployments).
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    snapshot: Arc<RwLock<Option<LedgerSnapshot>>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(Some(snapshot))),
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn current(&self) -> Option<LedgerSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        *self.snapshot.write().await = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sync mode for file writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// No explicit sync (OS buffering only).
    #[default]
    None,
    /// fsync the snapshot before it replaces the previous one.
    OnWrite,
}

/// Single JSON document on disk.
///
/// Each save writes a sibling `*.tmp` file and renames it over the target, so a
/// reader never observes a partially written snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    sync_mode: SyncMode,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_mode: SyncMode::default(),
        }
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "ledger.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

// ============================================================================
// File Operations (blocking, run via spawn_blocking)
// ============================================================================

fn read_snapshot_sync(path: &Path) -> Result<Option<LedgerSnapshot>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::persistence(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )));
        }
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
        Error::persistence(format!("Malformed snapshot {}: {}", path.display(), e))
    })?;
    Ok(Some(snapshot))
}

fn write_snapshot_sync(path: &Path, temp: &Path, body: &[u8], sync: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::persistence(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut file = std::fs::File::create(temp).map_err(|e| {
        Error::persistence(format!("Failed to open {} for writing: {}", temp.display(), e))
    })?;
    file.write_all(body)
        .map_err(|e| Error::persistence(format!("Write failed: {}", e)))?;
    if sync {
        file.sync_all()
            .map_err(|e| Error::persistence(format!("Sync failed: {}", e)))?;
    }
    drop(file);

    std::fs::rename(temp, path).map_err(|e| {
        Error::persistence(format!(
            "Failed to replace {}: {}",
            path.display(),
            e
        ))
    })
}

#[async_trait::async_trait]
impl SnapshotStore for JsonFileStore {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn load(&self) -> Result<Option<LedgerSnapshot>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_snapshot_sync(&path))
            .await
            .map_err(|e| Error::persistence(format!("Task join error: {}", e)))?
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path.clone();
        let temp = self.temp_path();
        let sync = self.sync_mode == SyncMode::OnWrite;
        tokio::task::spawn_blocking(move || write_snapshot_sync(&path, &temp, &body, sync))
            .await
            .map_err(|e| Error::persistence(format!("Task join error: {}", e)))?
    }
}

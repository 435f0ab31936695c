use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SnapkeepError};
use crate::model::{Source, Target};
use crate::storage::{ensure_active, Backend};
use crate::store::MetaStore;

/// In-memory storage backend for testing. Thread-safe via Mutex.
#[derive(Default)]
pub struct MemoryBackend {
    chunks: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn manifest_count(&self) -> usize {
        self.manifests.lock().unwrap().len()
    }
}

impl Backend for MemoryBackend {
    fn init(&mut self, _config: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn store_chunk(&self, cancel: &CancellationToken, hash: &str, data: &[u8]) -> Result<()> {
        ensure_active(cancel)?;
        self.chunks
            .lock()
            .unwrap()
            .entry(hash.to_string())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn load_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<Vec<u8>> {
        ensure_active(cancel)?;
        self.chunks
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| SnapkeepError::NotFound(format!("chunk {hash}")))
    }

    fn delete_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<()> {
        ensure_active(cancel)?;
        self.chunks
            .lock()
            .unwrap()
            .remove(hash)
            .map(|_| ())
            .ok_or_else(|| SnapkeepError::NotFound(format!("chunk {hash}")))
    }

    fn chunk_exists(&self, cancel: &CancellationToken, hash: &str) -> Result<bool> {
        ensure_active(cancel)?;
        Ok(self.chunks.lock().unwrap().contains_key(hash))
    }

    fn store_manifest(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        manifest: &[u8],
    ) -> Result<()> {
        ensure_active(cancel)?;
        self.manifests
            .lock()
            .unwrap()
            .insert(snapshot_id.to_string(), manifest.to_vec());
        Ok(())
    }

    fn load_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<Vec<u8>> {
        ensure_active(cancel)?;
        self.manifests
            .lock()
            .unwrap()
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| SnapkeepError::NotFound(format!("manifest {snapshot_id}")))
    }

    fn delete_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<()> {
        ensure_active(cancel)?;
        self.manifests
            .lock()
            .unwrap()
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| SnapkeepError::NotFound(format!("manifest {snapshot_id}")))
    }
}

/// Fresh in-memory metadata store.
pub fn memory_store() -> Arc<MetaStore> {
    Arc::new(MetaStore::open_in_memory().expect("failed to open in-memory store"))
}

/// Insert a target row directly, bypassing catalog validation.
pub fn seed_target(store: &MetaStore, name: &str) -> i64 {
    let now = Utc::now();
    store
        .insert_target(&Target {
            id: 0,
            name: name.to_string(),
            kind: "local".to_string(),
            config: HashMap::new(),
            created_at: now,
            updated_at: now,
        })
        .expect("failed to seed target")
}

/// Insert a source row pointing at `path`.
pub fn seed_source(
    store: &MetaStore,
    name: &str,
    path: &Path,
    exclusions: &[&str],
    target_id: Option<i64>,
) -> i64 {
    let now = Utc::now();
    store
        .insert_source(&Source {
            id: 0,
            name: name.to_string(),
            path: path.to_string_lossy().into_owned(),
            exclusions: exclusions.iter().map(|s| s.to_string()).collect(),
            target_id,
            schedule_id: None,
            created_at: now,
            updated_at: now,
        })
        .expect("failed to seed source")
}

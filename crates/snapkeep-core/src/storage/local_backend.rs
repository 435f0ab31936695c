//! Local-filesystem backend.
//!
//! Layout under the configured base path:
//!
//! ```text
//! <base>/chunks/<h[0..2]>/<h[2..4]>/<hash>
//! <base>/manifests/<snapshot_id>.json
//! ```
//!
//! The two-level fan-out keeps any single directory small even for very
//! large chunk populations.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SnapkeepError};
use crate::storage::{ensure_active, validate_hash, Backend};

#[derive(Default)]
pub struct LocalBackend {
    base_path: Option<PathBuf>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn base(&self) -> Result<&PathBuf> {
        self.base_path
            .as_ref()
            .ok_or_else(|| SnapkeepError::BackendInit("local backend not initialized".into()))
    }

    fn chunk_path(&self, hash: &str) -> Result<PathBuf> {
        validate_hash(hash)?;
        Ok(self
            .base()?
            .join("chunks")
            .join(&hash[..2])
            .join(&hash[2..4])
            .join(hash))
    }

    fn manifest_path(&self, snapshot_id: &str) -> Result<PathBuf> {
        Ok(self
            .base()?
            .join("manifests")
            .join(format!("{snapshot_id}.json")))
    }
}

impl Backend for LocalBackend {
    fn init(&mut self, config: &HashMap<String, String>) -> Result<()> {
        let path = config
            .get("path")
            .ok_or_else(|| SnapkeepError::BackendInit("path is required in config".into()))?;
        let base = PathBuf::from(path);

        for dir in ["chunks", "manifests"] {
            fs::create_dir_all(base.join(dir)).map_err(|e| {
                SnapkeepError::BackendInit(format!("failed to create {dir} directory: {e}"))
            })?;
        }

        self.base_path = Some(base);
        Ok(())
    }

    fn store_chunk(&self, cancel: &CancellationToken, hash: &str, data: &[u8]) -> Result<()> {
        ensure_active(cancel)?;
        let path = self.chunk_path(hash)?;

        // Dedup short-circuit: an existing object is never rewritten.
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SnapkeepError::BackendIo(format!("create chunk directory: {e}")))?;
        }
        fs::write(&path, data)
            .map_err(|e| SnapkeepError::BackendIo(format!("write chunk {hash}: {e}")))
    }

    fn load_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<Vec<u8>> {
        ensure_active(cancel)?;
        let path = self.chunk_path(hash)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapkeepError::NotFound(format!("chunk {hash}")))
            }
            Err(e) => Err(SnapkeepError::BackendIo(format!("read chunk {hash}: {e}"))),
        }
    }

    fn delete_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<()> {
        ensure_active(cancel)?;
        let path = self.chunk_path(hash)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapkeepError::NotFound(format!("chunk {hash}")))
            }
            Err(e) => Err(SnapkeepError::BackendIo(format!(
                "delete chunk {hash}: {e}"
            ))),
        }
    }

    fn chunk_exists(&self, cancel: &CancellationToken, hash: &str) -> Result<bool> {
        ensure_active(cancel)?;
        let path = self.chunk_path(hash)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SnapkeepError::BackendIo(format!(
                "stat chunk {hash}: {e}"
            ))),
        }
    }

    fn store_manifest(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        manifest: &[u8],
    ) -> Result<()> {
        ensure_active(cancel)?;
        let path = self.manifest_path(snapshot_id)?;
        fs::write(&path, manifest)
            .map_err(|e| SnapkeepError::BackendIo(format!("write manifest {snapshot_id}: {e}")))
    }

    fn load_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<Vec<u8>> {
        ensure_active(cancel)?;
        let path = self.manifest_path(snapshot_id)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapkeepError::NotFound(format!("manifest {snapshot_id}")))
            }
            Err(e) => Err(SnapkeepError::BackendIo(format!(
                "read manifest {snapshot_id}: {e}"
            ))),
        }
    }

    fn delete_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<()> {
        ensure_active(cancel)?;
        let path = self.manifest_path(snapshot_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapkeepError::NotFound(format!("manifest {snapshot_id}")))
            }
            Err(e) => Err(SnapkeepError::BackendIo(format!(
                "delete manifest {snapshot_id}: {e}"
            ))),
        }
    }
}

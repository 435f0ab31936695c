//! The backup engine: walk the source, apply exclusions, hash and chunk
//! each file, upload unseen chunks, emit the manifest.
//!
//! `run_backup` is a blocking call; callers run it on an executor that
//! permits blocking I/O and pass a cancellation token that is checked at
//! file boundaries and inside every backend operation. Per-file hashing
//! and chunking errors are local (the file is skipped with a warning);
//! backend errors are fatal to the snapshot.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunker::{hash_file, Chunker};
use crate::error::{Result, SnapkeepError};
use crate::manifest::{build_file_tree, FileNode, Manifest, ManifestFile};
use crate::model::{RunStatus, Snapshot, Source};
use crate::observability::Metrics;
use crate::storage::Backend;
use crate::store::MetaStore;

/// Progress log cadence, in files.
const PROGRESS_EVERY: i64 = 100;

struct WalkOutcome {
    files: Vec<ManifestFile>,
    total_bytes: i64,
    delta_bytes: i64,
}

pub struct BackupEngine {
    store: Arc<MetaStore>,
    metrics: Arc<Metrics>,
    chunker: Chunker,
}

impl BackupEngine {
    pub fn new(store: Arc<MetaStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            metrics,
            chunker: Chunker::default(),
        }
    }

    /// Override the chunk size (tests use small chunks).
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    /// Execute one backup of `source_id` into an initialized backend.
    /// Creates the snapshot record, transitions it to a terminal state,
    /// and returns the snapshot id on success.
    pub fn run_backup(
        &self,
        cancel: &CancellationToken,
        source_id: i64,
        backend: &dyn Backend,
    ) -> Result<i64> {
        let started = Instant::now();

        let source = self.store.source(source_id)?;
        let target_id = source.target_id.ok_or_else(|| {
            SnapkeepError::InvalidInput("source has no target configured".into())
        })?;

        let snapshot = Snapshot {
            id: 0,
            source_id,
            target_id,
            status: RunStatus::Running,
            file_count: 0,
            total_bytes: 0,
            delta_bytes: 0,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let snapshot_id = self.store.insert_snapshot(&snapshot)?;

        info!(snapshot_id, source_id, path = %source.path, "starting backup");

        match self.snapshot_source(cancel, &source, snapshot_id, backend) {
            Ok(outcome) => {
                let file_count = outcome.files.len() as i64;
                self.store.finish_snapshot(
                    snapshot_id,
                    RunStatus::Success,
                    file_count,
                    outcome.total_bytes,
                    outcome.delta_bytes,
                    None,
                )?;
                self.store.insert_snapshot_files(snapshot_id, &outcome.files)?;

                let duration = started.elapsed();
                self.metrics.record_backup(
                    source_id,
                    &source.name,
                    duration,
                    outcome.delta_bytes as u64,
                    outcome.total_bytes as u64,
                );
                info!(
                    snapshot_id,
                    files = file_count,
                    total_bytes = outcome.total_bytes,
                    delta_bytes = outcome.delta_bytes,
                    duration_ms = duration.as_millis() as u64,
                    "backup completed"
                );
                Ok(snapshot_id)
            }
            Err(e) => {
                // Keep the original error even if the status write fails.
                if let Err(update_err) = self.store.finish_snapshot(
                    snapshot_id,
                    RunStatus::Failed,
                    0,
                    0,
                    0,
                    Some(&e.to_string()),
                ) {
                    warn!(snapshot_id, error = %update_err, "failed to record snapshot failure");
                }
                self.metrics.record_backup_failure(source_id, &source.name);
                self.metrics.record_error("backup");
                error!(snapshot_id, error = %e, "backup failed");
                Err(e)
            }
        }
    }

    /// Walk the source tree, deduplicate chunks into the backend, and
    /// store the manifest. Fatal errors abort the whole snapshot.
    fn snapshot_source(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        snapshot_id: i64,
        backend: &dyn Backend,
    ) -> Result<WalkOutcome> {
        let root = Path::new(&source.path);
        let mut files: Vec<ManifestFile> = Vec::new();
        let mut total_bytes: i64 = 0;
        let mut delta_bytes: i64 = 0;

        for entry in walkdir::WalkDir::new(root).follow_links(false) {
            if cancel.is_cancelled() {
                return Err(SnapkeepError::Cancelled);
            }

            let entry = entry.map_err(|e| SnapkeepError::Io(e.into()))?;
            if entry.file_type().is_dir() {
                continue;
            }

            let rel_path = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if is_excluded(rel_path, &source.exclusions) {
                debug!(path = %rel_path.display(), "excluding file");
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to stat file, skipping");
                    continue;
                }
            };

            let file_hash = match hash_file(entry.path()) {
                Ok(h) => h,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to hash file, skipping");
                    continue;
                }
            };

            let chunks = match self.chunker.chunk_file(entry.path()) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to chunk file, skipping");
                    continue;
                }
            };

            let mut chunk_hashes = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                if !backend.chunk_exists(cancel, &chunk.hash)? {
                    backend.store_chunk(cancel, &chunk.hash, &chunk.data)?;
                    delta_bytes += chunk.size as i64;
                }
                total_bytes += chunk.size as i64;
                chunk_hashes.push(chunk.hash.clone());
            }

            let mod_time: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());

            files.push(ManifestFile {
                path: rel_path.to_string_lossy().into_owned(),
                size: metadata.len() as i64,
                hash: file_hash,
                chunks: chunk_hashes,
                mod_time,
            });

            if files.len() as i64 % PROGRESS_EVERY == 0 {
                info!(files = files.len(), bytes = total_bytes, "backup progress");
            }
        }

        let manifest = Manifest {
            snapshot_id,
            source_path: source.path.clone(),
            created_at: Utc::now(),
            files,
        };
        let manifest_json = serde_json::to_vec(&manifest)?;
        backend.store_manifest(cancel, &snapshot_id.to_string(), &manifest_json)?;

        Ok(WalkOutcome {
            files: manifest.files,
            total_bytes,
            delta_bytes,
        })
    }

    /// Raw manifest bytes for a snapshot, straight from the backend.
    pub fn manifest(
        &self,
        cancel: &CancellationToken,
        snapshot_id: i64,
        backend: &dyn Backend,
    ) -> Result<Vec<u8>> {
        // Verify the snapshot exists before asking the backend.
        self.store.snapshot(snapshot_id)?;
        backend.load_manifest(cancel, &snapshot_id.to_string())
    }

    /// Hierarchical file-tree view of a snapshot's manifest.
    pub fn file_tree(
        &self,
        cancel: &CancellationToken,
        snapshot_id: i64,
        backend: &dyn Backend,
    ) -> Result<FileNode> {
        let raw = self.manifest(cancel, snapshot_id, backend)?;
        let manifest: Manifest = serde_json::from_slice(&raw)?;
        Ok(build_file_tree(&manifest))
    }

    /// Reserved: rebuilding a file tree from a snapshot is not wired up
    /// yet. The manifest plus `load_chunk` make this straightforward for
    /// a future release.
    pub fn restore(
        &self,
        _cancel: &CancellationToken,
        _snapshot_id: i64,
        _backend: &dyn Backend,
    ) -> Result<()> {
        Err(SnapkeepError::Unsupported("restore".into()))
    }
}

/// True when the basename of `rel_path` matches any exclusion glob.
/// Invalid patterns are logged and ignored, never fatal.
fn is_excluded(rel_path: &Path, patterns: &[String]) -> bool {
    let Some(name) = rel_path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    patterns.iter().any(|raw| match glob::Pattern::new(raw) {
        Ok(pattern) => pattern.matches(name),
        Err(e) => {
            warn!(pattern = %raw, error = %e, "ignoring invalid exclusion pattern");
            false
        }
    })
}

//! Backup engine scenarios against the in-memory backend.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chunker::Chunker;
use crate::engine::BackupEngine;
use crate::error::{Result, SnapkeepError};
use crate::manifest::Manifest;
use crate::model::RunStatus;
use crate::observability::Metrics;
use crate::storage::Backend;
use crate::store::MetaStore;
use crate::testutil::{memory_store, seed_source, seed_target, MemoryBackend};

const HELLO_HASH: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn fixture() -> (Arc<MetaStore>, Arc<Metrics>, BackupEngine) {
    let store = memory_store();
    let metrics = Arc::new(Metrics::new());
    let engine = BackupEngine::new(store.clone(), metrics.clone());
    (store, metrics, engine)
}

fn load_manifest(backend: &dyn Backend, snapshot_id: i64) -> Manifest {
    let cancel = CancellationToken::new();
    let raw = backend
        .load_manifest(&cancel, &snapshot_id.to_string())
        .expect("manifest should be stored");
    serde_json::from_slice(&raw).expect("manifest should parse")
}

fn manifest_paths(manifest: &Manifest) -> HashSet<String> {
    manifest.files.iter().map(|f| f.path.clone()).collect()
}

#[test]
fn single_file_first_backup() {
    let (store, _metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s1", dir.path(), &[], Some(target_id));

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let snapshot_id = engine.run_backup(&cancel, source_id, &backend).unwrap();

    let snapshot = store.snapshot(snapshot_id).unwrap();
    assert_eq!(snapshot.status, RunStatus::Success);
    assert_eq!(snapshot.file_count, 1);
    assert_eq!(snapshot.total_bytes, 5);
    assert_eq!(snapshot.delta_bytes, 5);
    assert!(snapshot.completed_at.is_some());

    let manifest = load_manifest(&backend, snapshot_id);
    assert_eq!(manifest.snapshot_id, snapshot_id);
    assert_eq!(manifest.files.len(), 1);
    let entry = &manifest.files[0];
    assert_eq!(entry.path, "a.txt");
    assert_eq!(entry.size, 5);
    assert_eq!(entry.hash, HELLO_HASH);
    assert_eq!(entry.chunks, vec![HELLO_HASH.to_string()]);

    // Snapshot file rows mirror the manifest.
    let rows = store.snapshot_files(snapshot_id).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path, "a.txt");
    assert_eq!(rows[0].chunks, vec![HELLO_HASH.to_string()]);
}

#[test]
fn identical_files_are_deduplicated() {
    let (store, _metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("x")).unwrap();
    std::fs::create_dir(dir.path().join("y")).unwrap();
    std::fs::write(dir.path().join("x/f1"), b"hello").unwrap();
    std::fs::write(dir.path().join("y/f2"), b"hello").unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s2", dir.path(), &[], Some(target_id));

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let snapshot_id = engine.run_backup(&cancel, source_id, &backend).unwrap();

    let snapshot = store.snapshot(snapshot_id).unwrap();
    assert_eq!(snapshot.total_bytes, 10);
    assert_eq!(snapshot.delta_bytes, 5);
    // One physical object under the common hash.
    assert_eq!(backend.chunk_count(), 1);
}

#[test]
fn exclusion_globs_filter_by_basename() {
    let (store, _metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("keep.txt"), b"keep me").unwrap();
    std::fs::write(dir.path().join("skip.log"), b"skip me").unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s3", dir.path(), &["*.log"], Some(target_id));

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let snapshot_id = engine.run_backup(&cancel, source_id, &backend).unwrap();

    let manifest = load_manifest(&backend, snapshot_id);
    assert_eq!(manifest_paths(&manifest), HashSet::from(["keep.txt".to_string()]));

    // No chunk for the excluded content was stored.
    let skip_hash = crate::chunker::hash_bytes(b"skip me");
    assert!(!backend.chunk_exists(&cancel, &skip_hash).unwrap());
}

#[test]
fn chunk_boundaries_and_reassembly() {
    let (store, _metrics, engine) = fixture();
    let engine = engine.with_chunker(Chunker::new(1024));

    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..2 * 1024 + 7).map(|i| (i % 253) as u8).collect();
    std::fs::write(dir.path().join("big.bin"), &content).unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s4", dir.path(), &[], Some(target_id));

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let snapshot_id = engine.run_backup(&cancel, source_id, &backend).unwrap();

    let manifest = load_manifest(&backend, snapshot_id);
    let entry = &manifest.files[0];
    assert_eq!(entry.chunks.len(), 3);

    // Concatenating chunk contents in manifest order rebuilds the file.
    let mut rebuilt = Vec::new();
    for hash in &entry.chunks {
        rebuilt.extend(backend.load_chunk(&cancel, hash).unwrap());
    }
    assert_eq!(rebuilt, content);

    let tail = backend.load_chunk(&cancel, &entry.chunks[2]).unwrap();
    assert_eq!(tail.len(), 7);
}

/// Backend wrapper whose `store_chunk` fails on the Nth call.
struct FailingBackend {
    inner: MemoryBackend,
    fail_on: usize,
    stores: AtomicUsize,
}

impl FailingBackend {
    fn new(fail_on: usize) -> Self {
        Self {
            inner: MemoryBackend::new(),
            fail_on,
            stores: AtomicUsize::new(0),
        }
    }
}

impl Backend for FailingBackend {
    fn init(&mut self, config: &HashMap<String, String>) -> Result<()> {
        self.inner.init(config)
    }

    fn store_chunk(&self, cancel: &CancellationToken, hash: &str, data: &[u8]) -> Result<()> {
        let call = self.stores.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(SnapkeepError::BackendIo("injected store failure".into()));
        }
        self.inner.store_chunk(cancel, hash, data)
    }

    fn load_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<Vec<u8>> {
        self.inner.load_chunk(cancel, hash)
    }

    fn delete_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<()> {
        self.inner.delete_chunk(cancel, hash)
    }

    fn chunk_exists(&self, cancel: &CancellationToken, hash: &str) -> Result<bool> {
        self.inner.chunk_exists(cancel, hash)
    }

    fn store_manifest(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        manifest: &[u8],
    ) -> Result<()> {
        self.inner.store_manifest(cancel, snapshot_id, manifest)
    }

    fn load_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<Vec<u8>> {
        self.inner.load_manifest(cancel, snapshot_id)
    }

    fn delete_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<()> {
        self.inner.delete_manifest(cancel, snapshot_id)
    }
}

#[test]
fn store_failure_fails_the_snapshot() {
    let (store, metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("one.txt"), b"first contents").unwrap();
    std::fs::write(dir.path().join("two.txt"), b"second contents").unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s5", dir.path(), &[], Some(target_id));

    let backend = FailingBackend::new(2);
    let cancel = CancellationToken::new();
    let err = engine.run_backup(&cancel, source_id, &backend).unwrap_err();
    assert!(matches!(err, SnapkeepError::BackendIo(_)));

    let snapshot = store.snapshots_for_source(source_id).unwrap().remove(0);
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert!(snapshot.error.is_some());
    assert!(snapshot.completed_at.is_some());
    assert_eq!(metrics.error_count("backup"), 1);

    // No partial manifest was stored.
    assert!(backend
        .load_manifest(&cancel, &snapshot.id.to_string())
        .unwrap_err()
        .is_not_found());
}

#[test]
fn second_backup_after_changes() {
    let (store, _metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s6", dir.path(), &[], Some(target_id));

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let first = engine.run_backup(&cancel, source_id, &backend).unwrap();

    std::fs::write(dir.path().join("a.txt"), b"hello!").unwrap();
    std::fs::write(dir.path().join("b.txt"), b"world").unwrap();
    let second = engine.run_backup(&cancel, source_id, &backend).unwrap();

    let snapshot = store.snapshot(second).unwrap();
    assert_eq!(snapshot.file_count, 2);
    assert_eq!(snapshot.total_bytes, 11);
    // Both new contents were unseen by the target.
    assert_eq!(snapshot.delta_bytes, 11);

    // The prior snapshot is untouched and both manifests are retrievable.
    let prior = store.snapshot(first).unwrap();
    assert_eq!(prior.status, RunStatus::Success);
    assert_eq!(prior.file_count, 1);
    assert_eq!(prior.total_bytes, 5);

    let first_manifest = load_manifest(&backend, first);
    let second_manifest = load_manifest(&backend, second);
    assert_eq!(manifest_paths(&first_manifest), HashSet::from(["a.txt".to_string()]));
    assert_eq!(
        manifest_paths(&second_manifest),
        HashSet::from(["a.txt".to_string(), "b.txt".to_string()])
    );
}

#[cfg(unix)]
#[test]
fn unreadable_files_are_skipped_not_fatal() {
    let (store, _metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ok.txt"), b"fine").unwrap();
    // A dangling symlink fails at open time, which must skip the file
    // rather than abort the snapshot.
    std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("broken")).unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s-skip", dir.path(), &[], Some(target_id));

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let snapshot_id = engine.run_backup(&cancel, source_id, &backend).unwrap();

    let manifest = load_manifest(&backend, snapshot_id);
    assert_eq!(manifest_paths(&manifest), HashSet::from(["ok.txt".to_string()]));
}

#[test]
fn missing_source_is_not_found() {
    let (_store, _metrics, engine) = fixture();
    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let err = engine.run_backup(&cancel, 9999, &backend).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn source_without_target_is_rejected() {
    let (store, _metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    let source_id = seed_source(&store, "floating", dir.path(), &[], None);

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let err = engine.run_backup(&cancel, source_id, &backend).unwrap_err();
    assert!(matches!(err, SnapkeepError::InvalidInput(_)));
}

#[test]
fn cancellation_fails_the_snapshot() {
    let (store, _metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s-cancel", dir.path(), &[], Some(target_id));

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine.run_backup(&cancel, source_id, &backend).unwrap_err();
    assert!(matches!(err, SnapkeepError::Cancelled));

    let snapshot = store.snapshots_for_source(source_id).unwrap().remove(0);
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(snapshot.error.as_deref(), Some("operation cancelled"));
}

#[test]
fn manifest_and_file_tree_read_back() {
    let (store, _metrics, engine) = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/inner.txt"), b"inner").unwrap();
    std::fs::write(dir.path().join("root.txt"), b"root").unwrap();

    let target_id = seed_target(&store, "t1");
    let source_id = seed_source(&store, "s-tree", dir.path(), &[], Some(target_id));

    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let snapshot_id = engine.run_backup(&cancel, source_id, &backend).unwrap();

    let raw = engine.manifest(&cancel, snapshot_id, &backend).unwrap();
    let manifest: Manifest = serde_json::from_slice(&raw).unwrap();
    assert_eq!(manifest.files.len(), 2);

    let tree = engine.file_tree(&cancel, snapshot_id, &backend).unwrap();
    let names: HashSet<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, HashSet::from(["sub", "root.txt"]));
}

#[test]
fn restore_is_reserved() {
    let (_store, _metrics, engine) = fixture();
    let backend = MemoryBackend::new();
    let cancel = CancellationToken::new();
    let err = engine.restore(&cancel, 1, &backend).unwrap_err();
    assert!(matches!(err, SnapkeepError::Unsupported(_)));
}

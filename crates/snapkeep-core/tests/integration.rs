//! End-to-end lifecycle through the public API: catalog and job setup,
//! a backup run against the local backend, then manifest read-back.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use snapkeep_core::catalog::{Catalog, SourceParams, TargetParams};
use snapkeep_core::chunker::Chunker;
use snapkeep_core::engine::BackupEngine;
use snapkeep_core::jobs::JobService;
use snapkeep_core::manifest::{Manifest, NodeKind};
use snapkeep_core::model::RunStatus;
use snapkeep_core::observability::Metrics;
use snapkeep_core::storage::{Backend, Registry};
use snapkeep_core::store::MetaStore;

struct World {
    _workspace: tempfile::TempDir,
    store: Arc<MetaStore>,
    catalog: Catalog,
    metrics: Arc<Metrics>,
    source_dir: std::path::PathBuf,
    backend_dir: std::path::PathBuf,
}

fn setup() -> World {
    let workspace = tempfile::tempdir().unwrap();
    let source_dir = workspace.path().join("source");
    let backend_dir = workspace.path().join("backend");
    std::fs::create_dir_all(&source_dir).unwrap();
    std::fs::create_dir_all(&backend_dir).unwrap();

    let store = Arc::new(MetaStore::open(&workspace.path().join("data/meta.db")).unwrap());
    let registry = Arc::new(Registry::new());
    let catalog = Catalog::new(store.clone(), registry);
    let metrics = Arc::new(Metrics::new());

    World {
        _workspace: workspace,
        store,
        catalog,
        metrics,
        source_dir,
        backend_dir,
    }
}

fn local_target(world: &World) -> i64 {
    let mut config = HashMap::new();
    config.insert(
        "path".to_string(),
        world.backend_dir.to_string_lossy().into_owned(),
    );
    world
        .catalog
        .create_target(TargetParams {
            name: "disk".to_string(),
            kind: "local".to_string(),
            config,
        })
        .unwrap()
        .id
}

#[test]
fn full_backup_lifecycle_on_local_backend() {
    let world = setup();
    let target_id = local_target(&world);

    std::fs::create_dir_all(world.source_dir.join("nested")).unwrap();
    std::fs::write(world.source_dir.join("a.txt"), b"hello").unwrap();
    std::fs::write(world.source_dir.join("nested/b.txt"), b"world").unwrap();
    std::fs::write(world.source_dir.join("debug.log"), b"noise").unwrap();

    let source = world
        .catalog
        .create_source(SourceParams {
            name: "docs".to_string(),
            path: world.source_dir.to_string_lossy().into_owned(),
            exclusions: vec!["*.log".to_string()],
            target_id: Some(target_id),
            schedule_id: None,
        })
        .unwrap();

    // The transport layer owns the job lifecycle around the blocking
    // engine call.
    let jobs = JobService::new(world.store.clone());
    let job = jobs.create_backup(source.id).unwrap();
    jobs.update_status(job.id, RunStatus::Running, None).unwrap();

    let engine = BackupEngine::new(world.store.clone(), world.metrics.clone());
    let mut backend = world.catalog.backend_for_target(target_id).unwrap();
    let cancel = CancellationToken::new();

    let snapshot_id = engine
        .run_backup(&cancel, source.id, backend.as_ref())
        .unwrap();
    jobs.attach_snapshot(job.id, snapshot_id).unwrap();
    jobs.update_status(job.id, RunStatus::Success, None).unwrap();

    // Snapshot record.
    let snapshot = world.store.snapshot(snapshot_id).unwrap();
    assert_eq!(snapshot.status, RunStatus::Success);
    assert_eq!(snapshot.file_count, 2);
    assert_eq!(snapshot.total_bytes, 10);
    assert_eq!(snapshot.delta_bytes, 10);
    assert!(snapshot.completed_at.is_some());

    // Manifest on disk, with the excluded file absent.
    let manifest_path = world
        .backend_dir
        .join("manifests")
        .join(format!("{snapshot_id}.json"));
    assert!(manifest_path.is_file());
    let manifest: Manifest =
        serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
    let paths: HashSet<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert!(paths.contains("a.txt"));
    assert!(!paths.contains("debug.log"));

    // Tree view through the engine.
    let tree = engine.file_tree(&cancel, snapshot_id, backend.as_ref()).unwrap();
    assert_eq!(tree.name, "source");
    assert_eq!(tree.kind, NodeKind::Directory);
    let names: HashSet<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, HashSet::from(["a.txt", "nested"]));

    // Job audit trail.
    let job = jobs.job(job.id).unwrap();
    assert_eq!(job.status, RunStatus::Success);
    assert_eq!(job.snapshot_id, Some(snapshot_id));
    assert!(job.ended_at.is_some());

    // Metrics.
    let source_metrics = world.metrics.source(source.id).unwrap();
    assert_eq!(source_metrics.last_status, 1);
    assert_eq!(source_metrics.bytes_transferred_total, 10);

    backend.close();
}

#[test]
fn second_snapshot_reuses_existing_chunks() {
    let world = setup();
    let target_id = local_target(&world);

    std::fs::write(world.source_dir.join("stable.bin"), b"unchanging data").unwrap();

    let source = world
        .catalog
        .create_source(SourceParams {
            name: "stable".to_string(),
            path: world.source_dir.to_string_lossy().into_owned(),
            exclusions: vec![],
            target_id: Some(target_id),
            schedule_id: None,
        })
        .unwrap();

    let engine = BackupEngine::new(world.store.clone(), world.metrics.clone());
    let backend = world.catalog.backend_for_target(target_id).unwrap();
    let cancel = CancellationToken::new();

    let first = engine
        .run_backup(&cancel, source.id, backend.as_ref())
        .unwrap();
    let second = engine
        .run_backup(&cancel, source.id, backend.as_ref())
        .unwrap();

    let first_snapshot = world.store.snapshot(first).unwrap();
    let second_snapshot = world.store.snapshot(second).unwrap();

    assert_eq!(first_snapshot.delta_bytes, 15);
    assert_eq!(second_snapshot.total_bytes, 15);
    // Everything was already present at the target.
    assert_eq!(second_snapshot.delta_bytes, 0);

    // Both manifests are independently retrievable.
    assert!(engine.manifest(&cancel, first, backend.as_ref()).is_ok());
    assert!(engine.manifest(&cancel, second, backend.as_ref()).is_ok());

    // Exactly one chunk object exists in the store.
    let mut chunk_files = 0;
    for entry in walk(&world.backend_dir.join("chunks")) {
        if entry.is_file() {
            chunk_files += 1;
        }
    }
    assert_eq!(chunk_files, 1);
}

#[test]
fn multi_chunk_files_reassemble_from_the_backend() {
    let world = setup();
    let target_id = local_target(&world);

    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    std::fs::write(world.source_dir.join("large.bin"), &content).unwrap();

    let source = world
        .catalog
        .create_source(SourceParams {
            name: "large".to_string(),
            path: world.source_dir.to_string_lossy().into_owned(),
            exclusions: vec![],
            target_id: Some(target_id),
            schedule_id: None,
        })
        .unwrap();

    let engine = BackupEngine::new(world.store.clone(), world.metrics.clone())
        .with_chunker(Chunker::new(4096));
    let backend = world.catalog.backend_for_target(target_id).unwrap();
    let cancel = CancellationToken::new();

    let snapshot_id = engine
        .run_backup(&cancel, source.id, backend.as_ref())
        .unwrap();

    let raw = engine.manifest(&cancel, snapshot_id, backend.as_ref()).unwrap();
    let manifest: Manifest = serde_json::from_slice(&raw).unwrap();
    let entry = &manifest.files[0];
    assert_eq!(entry.chunks.len(), 3);

    let mut rebuilt = Vec::new();
    for hash in &entry.chunks {
        rebuilt.extend(backend.load_chunk(&cancel, hash).unwrap());
    }
    assert_eq!(rebuilt, content);
}

fn walk(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

//! Snapshot manifests and the hierarchical file-tree view built from them.
//!
//! The manifest is the authoritative content map of one snapshot, stored
//! as a single UTF-8 JSON document in the backend under the snapshot id.
//! Concatenating the chunks referenced by any entry, in order, reproduces
//! the file whose SHA-256 equals the entry's `hash`.

use std::path::{Path, MAIN_SEPARATOR};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Complete file list of one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub snapshot_id: i64,
    pub source_path: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

/// One file entry in a manifest. `path` is relative to the source root
/// with OS-native separators; `chunks` lists chunk hashes in byte order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: i64,
    pub hash: String,
    pub chunks: Vec<String>,
    pub mod_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
}

/// Node of the in-memory presentation tree derived from a manifest.
#[derive(Debug, Clone, Serialize)]
pub struct FileNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

impl FileNode {
    fn directory(name: String) -> Self {
        Self {
            name,
            kind: NodeKind::Directory,
            size: None,
            mod_time: None,
            children: Vec::new(),
        }
    }

    fn file(name: String, size: i64, mod_time: DateTime<Utc>) -> Self {
        Self {
            name,
            kind: NodeKind::File,
            size: Some(size),
            mod_time: Some(mod_time),
            children: Vec::new(),
        }
    }

    /// Find or create a directory child named `name`.
    fn child_dir(&mut self, name: &str) -> &mut FileNode {
        let pos = self
            .children
            .iter()
            .position(|c| c.kind == NodeKind::Directory && c.name == name);
        match pos {
            Some(i) => &mut self.children[i],
            None => {
                self.children.push(FileNode::directory(name.to_string()));
                self.children.last_mut().unwrap()
            }
        }
    }
}

/// Build the presentation tree for a manifest: one root directory named
/// after the basename of `source_path`, interior directories created on
/// demand, each manifest entry inserted as a leaf. Empty and `.` path
/// components are elided.
pub fn build_file_tree(manifest: &Manifest) -> FileNode {
    let root_name = Path::new(&manifest.source_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| manifest.source_path.clone());
    let mut root = FileNode::directory(root_name);

    for file in &manifest.files {
        let components: Vec<&str> = file
            .path
            .split(MAIN_SEPARATOR)
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();
        let Some((leaf, dirs)) = components.split_last() else {
            continue;
        };

        let mut node = &mut root;
        for dir in dirs {
            node = node.child_dir(dir);
        }
        node.children
            .push(FileNode::file((*leaf).to_string(), file.size, file.mod_time));
    }

    root
}

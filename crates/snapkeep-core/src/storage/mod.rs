//! Pluggable object-store backends for chunks and manifests.

pub mod local_backend;
pub mod s3_backend;
pub mod sftp_backend;

pub(crate) mod runtime;

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SnapkeepError};

/// Uniform storage interface every target type implements.
///
/// A backend instance is uninitialized until `init` succeeds; afterwards
/// all other operations are callable. Chunk hashes are lowercase hex
/// SHA-256 strings; the backend is the sole authority on chunk presence.
/// Every I/O operation takes the caller's cancellation token and returns
/// `SnapkeepError::Cancelled` once it has fired.
pub trait Backend: Send {
    /// Validate and absorb the type-specific configuration map. This is
    /// the only place raw config is inspected.
    fn init(&mut self, config: &HashMap<String, String>) -> Result<()>;

    /// Store a chunk under its hash. Idempotent: re-storing an existing
    /// hash is a cheap no-op, never an error.
    fn store_chunk(&self, cancel: &CancellationToken, hash: &str, data: &[u8]) -> Result<()>;

    /// Load a chunk's bytes, or `NotFound`.
    fn load_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<Vec<u8>>;

    /// Remove a chunk. `NotFound` if absent.
    fn delete_chunk(&self, cancel: &CancellationToken, hash: &str) -> Result<()>;

    /// True iff a prior `store_chunk` for this hash succeeded and no
    /// `delete_chunk` has since.
    fn chunk_exists(&self, cancel: &CancellationToken, hash: &str) -> Result<bool>;

    /// Store a snapshot manifest, overwriting any previous version.
    fn store_manifest(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        manifest: &[u8],
    ) -> Result<()>;

    /// Load the last-stored manifest bytes, or `NotFound`.
    fn load_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<Vec<u8>>;

    /// Remove a manifest. `NotFound` if absent.
    fn delete_manifest(&self, cancel: &CancellationToken, snapshot_id: &str) -> Result<()>;

    /// Release backing resources. Idempotent; never fails observably.
    fn close(&mut self) {}
}

/// Bail out once the caller's token has fired.
pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SnapkeepError::Cancelled);
    }
    Ok(())
}

/// Reject hashes too short for the two-level fan-out layout.
pub(crate) fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() < 4 {
        return Err(SnapkeepError::InvalidInput(format!(
            "invalid chunk hash '{hash}': too short"
        )));
    }
    Ok(())
}

type BackendFactory = fn() -> Box<dyn Backend>;

/// Process-wide map from target-type tag to backend factory. Initialized
/// once at startup and read-only afterwards; new backends are added by
/// registration, never by dynamic loading.
pub struct Registry {
    factories: HashMap<String, BackendFactory>,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("local", || Box::new(local_backend::LocalBackend::new()));
        registry.register("s3", || Box::new(s3_backend::S3Backend::new()));
        registry.register("sftp", || Box::new(sftp_backend::SftpBackend::new()));
        registry
    }

    pub fn register(&mut self, kind: &str, factory: BackendFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    /// Instantiate and initialize a backend for `kind`. `init` failures
    /// propagate unchanged.
    pub fn create(&self, kind: &str, config: &HashMap<String, String>) -> Result<Box<dyn Backend>> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            SnapkeepError::InvalidInput(format!("unknown backend type: {kind}"))
        })?;
        let mut backend = factory();
        backend.init(config)?;
        Ok(backend)
    }

    pub fn is_supported(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Supported type tags, sorted for stable presentation.
    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_builtin_types() {
        let registry = Registry::new();
        assert!(registry.is_supported("local"));
        assert!(registry.is_supported("s3"));
        assert!(registry.is_supported("sftp"));
        assert!(!registry.is_supported("tape"));
        assert_eq!(registry.supported_types(), vec!["local", "s3", "sftp"]);
    }

    #[test]
    fn create_rejects_unknown_type() {
        let registry = Registry::new();
        let err = registry.create("tape", &HashMap::new()).err().unwrap();
        assert!(matches!(err, SnapkeepError::InvalidInput(_)));
    }

    #[test]
    fn create_propagates_init_failure() {
        let registry = Registry::new();
        // local backend requires a `path` key
        let err = registry.create("local", &HashMap::new()).err().unwrap();
        assert!(matches!(err, SnapkeepError::BackendInit(_)));
    }

    #[test]
    fn create_initializes_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let mut config = HashMap::new();
        config.insert("path".to_string(), dir.path().to_string_lossy().into_owned());
        let backend = registry.create("local", &config);
        assert!(backend.is_ok());
        assert!(dir.path().join("chunks").is_dir());
        assert!(dir.path().join("manifests").is_dir());
    }

    #[test]
    fn short_hashes_are_rejected() {
        assert!(validate_hash("abc").is_err());
        assert!(validate_hash("abcd").is_ok());
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        assert!(ensure_active(&token).is_ok());
        token.cancel();
        assert!(matches!(
            ensure_active(&token),
            Err(SnapkeepError::Cancelled)
        ));
    }
}

//! Validated management operations for sources and targets.
//!
//! The metadata store is plain CRUD; this layer enforces the invariants
//! (non-empty names, an existing source path, a registered target type
//! whose configuration actually initializes a backend) and resolves a
//! target row to a live backend instance for the engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::error::{Result, SnapkeepError};
use crate::model::{Source, Target};
use crate::storage::{Backend, Registry};
use crate::store::MetaStore;

/// Caller-supplied fields for creating or updating a source.
#[derive(Debug, Clone)]
pub struct SourceParams {
    pub name: String,
    pub path: String,
    pub exclusions: Vec<String>,
    pub target_id: Option<i64>,
    pub schedule_id: Option<i64>,
}

/// Caller-supplied fields for creating or updating a target.
#[derive(Debug, Clone)]
pub struct TargetParams {
    pub name: String,
    pub kind: String,
    pub config: HashMap<String, String>,
}

pub struct Catalog {
    store: Arc<MetaStore>,
    registry: Arc<Registry>,
}

impl Catalog {
    pub fn new(store: Arc<MetaStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    fn validate_source(params: &SourceParams) -> Result<()> {
        if params.name.is_empty() {
            return Err(SnapkeepError::InvalidInput("source name is required".into()));
        }
        if !Path::new(&params.path).exists() {
            return Err(SnapkeepError::InvalidPath(params.path.clone()));
        }
        Ok(())
    }

    /// Validate target params by initializing (and immediately closing)
    /// a backend for them, so bad configurations are rejected at
    /// creation time rather than at first backup.
    fn validate_target(&self, params: &TargetParams) -> Result<()> {
        if params.name.is_empty() {
            return Err(SnapkeepError::InvalidInput("target name is required".into()));
        }
        if !self.registry.is_supported(&params.kind) {
            return Err(SnapkeepError::InvalidInput(format!(
                "unsupported backend type: {}",
                params.kind
            )));
        }
        let mut backend = self.registry.create(&params.kind, &params.config)?;
        backend.close();
        Ok(())
    }

    pub fn create_source(&self, params: SourceParams) -> Result<Source> {
        Self::validate_source(&params)?;
        let now = Utc::now();
        let mut source = Source {
            id: 0,
            name: params.name,
            path: params.path,
            exclusions: params.exclusions,
            target_id: params.target_id,
            schedule_id: params.schedule_id,
            created_at: now,
            updated_at: now,
        };
        source.id = self.store.insert_source(&source).inspect_err(|e| {
            error!(name = %source.name, error = %e, "failed to create source");
        })?;
        info!(id = source.id, name = %source.name, "source created");
        Ok(source)
    }

    pub fn source(&self, id: i64) -> Result<Source> {
        self.store.source(id)
    }

    pub fn sources(&self) -> Result<Vec<Source>> {
        self.store.sources()
    }

    pub fn update_source(&self, id: i64, params: SourceParams) -> Result<Source> {
        Self::validate_source(&params)?;
        let mut source = self.store.source(id)?;
        source.name = params.name;
        source.path = params.path;
        source.exclusions = params.exclusions;
        source.target_id = params.target_id;
        source.schedule_id = params.schedule_id;
        self.store.update_source(&source).inspect_err(|e| {
            error!(id, error = %e, "failed to update source");
        })?;
        info!(id, name = %source.name, "source updated");
        self.store.source(id)
    }

    pub fn delete_source(&self, id: i64) -> Result<()> {
        self.store.delete_source(id).inspect_err(|e| {
            error!(id, error = %e, "failed to delete source");
        })?;
        info!(id, "source deleted");
        Ok(())
    }

    pub fn create_target(&self, params: TargetParams) -> Result<Target> {
        self.validate_target(&params)?;
        let now = Utc::now();
        let mut target = Target {
            id: 0,
            name: params.name,
            kind: params.kind,
            config: params.config,
            created_at: now,
            updated_at: now,
        };
        target.id = self.store.insert_target(&target).inspect_err(|e| {
            error!(name = %target.name, error = %e, "failed to create target");
        })?;
        info!(id = target.id, name = %target.name, kind = %target.kind, "target created");
        Ok(target)
    }

    pub fn target(&self, id: i64) -> Result<Target> {
        self.store.target(id)
    }

    pub fn targets(&self) -> Result<Vec<Target>> {
        self.store.targets()
    }

    pub fn update_target(&self, id: i64, params: TargetParams) -> Result<Target> {
        self.validate_target(&params)?;
        let mut target = self.store.target(id)?;
        target.name = params.name;
        target.kind = params.kind;
        target.config = params.config;
        self.store.update_target(&target).inspect_err(|e| {
            error!(id, error = %e, "failed to update target");
        })?;
        info!(id, name = %target.name, "target updated");
        self.store.target(id)
    }

    pub fn delete_target(&self, id: i64) -> Result<()> {
        self.store.delete_target(id).inspect_err(|e| {
            error!(id, error = %e, "failed to delete target");
        })?;
        info!(id, "target deleted");
        Ok(())
    }

    /// Resolve a target row to an initialized backend instance. The
    /// caller owns the handle and must `close` it when done.
    pub fn backend_for_target(&self, id: i64) -> Result<Box<dyn Backend>> {
        let target = self.store.target(id)?;
        self.registry.create(&target.kind, &target.config)
    }
}

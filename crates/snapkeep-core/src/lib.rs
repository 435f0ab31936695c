//! Content-addressed, deduplicating file backup engine.
//!
//! Registered sources (local directory trees) are backed up to pluggable
//! object-store targets as immutable snapshots: each file becomes a
//! sequence of fixed-size chunks addressed by SHA-256, stored once per
//! target no matter how often the content repeats. The crate provides the
//! chunker, the backend abstraction (local filesystem, S3-compatible,
//! SFTP), the snapshot pipeline, the manifest format with its file-tree
//! view, the SQLite metadata store and the job audit trail. Transport,
//! authentication and scheduling live in the embedding application.

pub mod catalog;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod manifest;
pub mod model;
pub mod observability;
pub mod storage;
pub mod store;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;

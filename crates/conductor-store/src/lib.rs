//! Durable, concurrent-safe storage for projects, tasks and workers.
//!
//! State lives in plain JSON files under a data directory, one registry file
//! for projects and one task file per project. Every file is guarded by an
//! exclusive sidecar lock held only for the duration of a read-modify-write,
//! and writes are atomic (tempfile + rename), so several engine tasks and
//! HTTP handlers can share the store without a database server.

pub mod error;
pub mod lock;
pub mod models;
pub mod paths;
pub mod store;

pub use error::StoreError;
pub use store::Store;

//! Live-system API - where managed objects actually exist.
//!
//! The engine only talks to the [`LiveSystem`] trait. Two adapters ship
//! with the crate:
//! - [`MemoryLiveSystem`]: in-process store with fault injection, for tests
//! - [`FsLiveSystem`]: one JSON document per object under a state directory

pub mod fs;
pub mod memory;

pub use fs::FsLiveSystem;
pub use memory::MemoryLiveSystem;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::object::{ManagedObject, ObjectKey, OwnerRef};

/// How dependents of a deleted object are handled by the live system.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PropagationPolicy {
    /// Dependents are removed before the object itself.
    #[default]
    Foreground,
    /// The object is removed at once, dependents are cleaned up later.
    Background,
    /// Dependents are left in place.
    Orphan,
}

/// Errors reported by a live system.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),

    #[error("already exists: {0}")]
    AlreadyExists(ObjectKey),

    /// Optimistic concurrency check failed.
    #[error("conflict on {key}: expected version {expected}, got {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("invalid object key: {0}")]
    InvalidKey(ObjectKey),

    #[error("live system unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Access to the objects of the target system.
///
/// Implementations attribute objects to owners through
/// [`ManagedObject::owner`] so that `list` can scope garbage collection.
#[async_trait]
pub trait LiveSystem: Send + Sync {
    /// Fetch an object, `None` if it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, LiveError>;

    /// All objects attributed to `owner`.
    async fn list(&self, owner: &OwnerRef) -> Result<Vec<ManagedObject>, LiveError>;

    /// Create a new object and return it as stored.
    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, LiveError>;

    /// Replace an existing object. `object.resource_version` must match the
    /// stored version. Status is kept by the live system.
    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, LiveError>;

    async fn delete(&self, key: &ObjectKey, propagation: PropagationPolicy)
    -> Result<(), LiveError>;
}

//! helmsman - dependency-ordered reconciliation of managed objects.
//!
//! Given an owner (an application instance), a [`Renderer`] that produces
//! its desired objects and a [`DependencyManifest`] that orders them, the
//! [`Engine`] converges a [`LiveSystem`] in one pass:
//!
//! - **Garbage collection**: owned objects that are no longer desired are deleted
//! - **Scheduling**: one task per desired object, run in dependency order
//!   with bounded concurrency
//! - **Reconciliation**: each task creates or updates its object, then
//!   probes it for readiness; dependents wait until it is ready
//!
//! The [`Controller`] repeats passes until cancelled.

pub mod audit;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod gc;
pub mod graph;
pub mod live;
pub mod manifest;
pub mod object;
pub mod reconciler;
pub mod render;
pub mod scheduler;

pub use audit::AuditLogger;
pub use cancel::{CancelHandle, CancelToken};
pub use config::{ControllerConfig, EngineConfig};
pub use controller::{Backoff, Controller};
pub use engine::{Engine, PendingObject, ReconcileResult};
pub use error::ReconcileError;
pub use live::{FsLiveSystem, LiveError, LiveSystem, MemoryLiveSystem, PropagationPolicy};
pub use manifest::{DependencyManifest, FileManifestSource, ManifestSource, StaticManifest};
pub use object::{ManagedObject, ObjectKey, OwnerRef};
pub use reconciler::{EnsureOutcome, ObjectReconciler, ReadinessRegistry, Reconciler};
pub use render::{DirectoryRenderer, Renderer, StaticRenderer};
pub use scheduler::{Scheduler, TaskId, TaskOutcome, TaskState};

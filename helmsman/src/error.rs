//! Error types for a reconciliation pass.

pub use crate::graph::GraphError;
pub use crate::live::LiveError;
pub use crate::manifest::ManifestError;
pub use crate::scheduler::SchedulerError;

/// Why a pass failed. Partial readiness is not an error.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Desired state could not be rendered; nothing was mutated.
    #[error("failed to render desired objects: {0:#}")]
    Render(anyhow::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Listing live objects for garbage collection failed; nothing was mutated.
    #[error("failed to list live objects: {0}")]
    List(#[source] LiveError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl ReconcileError {
    /// Whether the pass was stopped by cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconcileError::Scheduler(SchedulerError::Cancelled))
    }
}

/// Result type for a reconciliation pass.
pub type Result<T> = std::result::Result<T, ReconcileError>;

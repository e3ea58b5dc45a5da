//! Engine and control-loop configuration.

use std::time::Duration;

use crate::live::PropagationPolicy;

/// Tuning for a single reconciliation pass.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of reconcile tasks in flight.
    pub concurrency: usize,
    /// Requeue delay reported when some object is not ready yet.
    pub not_ready_requeue: Duration,
    /// Deletion policy used for orphaned objects.
    pub propagation: PropagationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            not_ready_requeue: Duration::from_secs(10),
            propagation: PropagationPolicy::Foreground,
        }
    }
}

/// Timing of the [`Controller`](crate::controller::Controller) loop.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay between passes once converged.
    pub resync_interval: Duration,
    /// First delay after a failed pass; doubles per consecutive failure.
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(300),
            error_backoff_base: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(300),
        }
    }
}

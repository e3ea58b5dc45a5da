//! Wires manifest ordering constraints into a [`Scheduler`].

use std::collections::HashMap;

use tracing::debug;

use crate::manifest::DependencyManifest;
use crate::object::ObjectKey;
use crate::scheduler::{Scheduler, SchedulerError, TaskId};

/// Counts from one wiring pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GraphStats {
    /// Edges added to the scheduler.
    pub edges: usize,
    /// Pairs dropped because one side is not desired in this pass.
    pub skipped_missing: usize,
    /// Pairs naming the same object on both sides.
    pub skipped_self: usize,
    /// Pairs already present.
    pub duplicates: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle through {task}")]
    Cycle { task: String },
}

/// Add one `child -> parent` edge per expanded manifest pair whose both
/// ends have a task in `tasks`, then reject cyclic graphs.
///
/// Objects missing from `tasks` are not desired in this pass; constraints
/// naming them are ignored rather than treated as errors.
pub fn wire(
    scheduler: &mut Scheduler,
    manifest: &DependencyManifest,
    tasks: &HashMap<ObjectKey, TaskId>,
) -> Result<GraphStats, GraphError> {
    let mut stats = GraphStats::default();

    for (child, parent) in manifest.edges() {
        if child == parent {
            debug!(object = %child, "Ignoring self-dependency");
            stats.skipped_self += 1;
            continue;
        }

        let (Some(&child_task), Some(&parent_task)) = (tasks.get(&child), tasks.get(&parent))
        else {
            debug!(%child, %parent, "Dependency names an object that is not desired, skipping");
            stats.skipped_missing += 1;
            continue;
        };

        if scheduler.depends_on(child_task, parent_task) {
            stats.edges += 1;
        } else {
            stats.duplicates += 1;
        }
    }

    match scheduler.check_acyclic() {
        Ok(()) => Ok(stats),
        Err(SchedulerError::Cycle { task }) => Err(GraphError::Cycle { task }),
        // check_acyclic reports nothing else
        Err(other) => Err(GraphError::Cycle {
            task: other.to_string(),
        }),
    }
}

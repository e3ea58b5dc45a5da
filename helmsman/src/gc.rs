//! Garbage collection of objects that left the desired set.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::live::{LiveError, LiveSystem};
use crate::object::{ObjectKey, OwnerRef};
use crate::reconciler::Reconciler;

/// Outcome of one collection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    /// Owned objects that are still desired.
    pub kept: usize,
    pub deleted: Vec<ObjectKey>,
    /// Orphans whose deletion failed, with the error text.
    pub failed: Vec<(ObjectKey, String)>,
}

/// Delete every object owned by `owner` whose key is not in `desired`.
///
/// Deletion is best effort: failures are logged and reported, never
/// returned. Only a failed `list` is an error, and then nothing is deleted.
pub async fn collect<R>(
    reconciler: &R,
    live: &dyn LiveSystem,
    owner: &OwnerRef,
    desired: &BTreeSet<ObjectKey>,
) -> Result<GcReport, LiveError>
where
    R: Reconciler + ?Sized,
{
    let known: BTreeSet<ObjectKey> = live
        .list(owner)
        .await?
        .iter()
        .map(|o| o.key())
        .collect();

    let mut report = GcReport {
        kept: known.intersection(desired).count(),
        ..Default::default()
    };

    for key in known.difference(desired) {
        info!("Pruning {}", key);
        match reconciler.finalize(key).await {
            Ok(()) => report.deleted.push(key.clone()),
            Err(e) => {
                warn!("Failed to prune {}: {:#}", key, e);
                report.failed.push((key.clone(), format!("{:#}", e)));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::MemoryLiveSystem;
    use crate::live::memory::Operation;
    use crate::object::ManagedObject;
    use crate::reconciler::{ObjectReconciler, ReadinessRegistry};
    use serde_json::json;
    use std::sync::Arc;

    fn owned(key: &str, owner: &str) -> ManagedObject {
        ManagedObject::new(key.parse().unwrap(), json!({})).with_owner(OwnerRef::new("App", owner))
    }

    #[tokio::test]
    async fn test_collect_deletes_only_owned_orphans() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.insert(owned("Pod/keep", "demo")).await;
        live.insert(owned("Pod/orphan", "demo")).await;
        live.insert(owned("Pod/foreign", "other")).await;
        let reconciler = ObjectReconciler::new(live.clone(), ReadinessRegistry::new());

        let desired: BTreeSet<ObjectKey> = ["Pod/keep".parse().unwrap()].into();
        let report = collect(&reconciler, &*live, &OwnerRef::new("App", "demo"), &desired)
            .await
            .unwrap();

        assert_eq!(report.kept, 1);
        assert_eq!(report.deleted, vec![ObjectKey::new("Pod", "orphan")]);
        assert!(report.failed.is_empty());
        assert_eq!(
            live.keys().await,
            vec![ObjectKey::new("Pod", "foreign"), ObjectKey::new("Pod", "keep")]
        );
    }

    #[tokio::test]
    async fn test_delete_failures_are_reported_not_returned() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.insert(owned("Pod/a", "demo")).await;
        live.insert(owned("Pod/b", "demo")).await;
        live.fail_on(Operation::Delete, Some(ObjectKey::new("Pod", "a")), "forbidden")
            .await;
        let reconciler = ObjectReconciler::new(live.clone(), ReadinessRegistry::new());

        let report = collect(
            &reconciler,
            &*live,
            &OwnerRef::new("App", "demo"),
            &BTreeSet::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.deleted, vec![ObjectKey::new("Pod", "b")]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("forbidden"));
    }

    #[tokio::test]
    async fn test_list_failure_deletes_nothing() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.insert(owned("Pod/a", "demo")).await;
        live.fail_on(Operation::List, None, "timeout").await;
        let reconciler = ObjectReconciler::new(live.clone(), ReadinessRegistry::new());

        let err = collect(
            &reconciler,
            &*live,
            &OwnerRef::new("App", "demo"),
            &BTreeSet::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LiveError::Unavailable(_)));
        assert_eq!(live.count_calls(Operation::Delete).await, 0);
    }
}

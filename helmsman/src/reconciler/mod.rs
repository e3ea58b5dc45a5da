//! Reconcilers for managed objects.
//!
//! A reconciler compares desired state (from the renderer) with actual state
//! (from the live system) and takes actions to converge.

pub mod readiness;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

pub use readiness::{NotReady, ReadinessProbe, ReadinessRegistry};

use crate::audit::AuditLogger;
use crate::live::{LiveError, LiveSystem, PropagationPolicy};
use crate::object::{ManagedObject, ObjectKey};
use crate::scheduler::TaskOutcome;

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The desired-state type.
    type Spec: Send + Sync;
    /// The status type reported per reconcile.
    type Status: Send;

    /// Reconcile the resource - compare desired vs actual state and take action.
    async fn reconcile(&self, spec: &Self::Spec) -> Result<Self::Status>;

    /// Handle resource deletion (finalization).
    async fn finalize(&self, key: &ObjectKey) -> Result<()>;
}

/// What [`ObjectReconciler::ensure`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
}

impl EnsureOutcome {
    pub fn created(self) -> bool {
        self == EnsureOutcome::Created
    }
}

/// Reconciler that makes one live object match its desired definition, then
/// probes it for readiness.
pub struct ObjectReconciler {
    live: Arc<dyn LiveSystem>,
    readiness: Arc<ReadinessRegistry>,
    propagation: PropagationPolicy,
    audit: AuditLogger,
}

impl ObjectReconciler {
    pub fn new(live: Arc<dyn LiveSystem>, readiness: ReadinessRegistry) -> Self {
        Self {
            live,
            readiness: Arc::new(readiness),
            propagation: PropagationPolicy::default(),
            audit: AuditLogger::new_noop(),
        }
    }

    pub fn with_propagation(mut self, propagation: PropagationPolicy) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn readiness(&self) -> &ReadinessRegistry {
        &self.readiness
    }

    /// Create or update the live object so it carries `desired`'s definition.
    ///
    /// Live status and resource version are kept on update, so drift in
    /// status alone never causes a write. Errors from the live system are
    /// returned unmodified.
    pub async fn ensure(&self, desired: &ManagedObject) -> Result<EnsureOutcome, LiveError> {
        let key = desired.key();

        let Some(live) = self.live.get(&key).await? else {
            self.live.create(desired).await?;
            info!("Created {}", key);
            self.audit.object_created(desired.owner.as_ref(), &key);
            return Ok(EnsureOutcome::Created);
        };

        if desired.matches(&live) {
            debug!(object = %key, "Object up to date");
            return Ok(EnsureOutcome::Unchanged);
        }

        let mut next = desired.clone();
        next.resource_version = live.resource_version;
        next.status = live.status;
        // Live annotations survive unless the desired object overrides them.
        let mut annotations = live.annotations;
        annotations.extend(desired.annotations.clone());
        next.annotations = annotations;

        self.live.update(&next).await?;
        info!("Updated {}", key);
        self.audit.object_updated(desired.owner.as_ref(), &key);
        Ok(EnsureOutcome::Updated)
    }

    /// Re-read the live object and run its readiness probe.
    pub async fn probe(&self, key: &ObjectKey) -> Result<TaskOutcome, LiveError> {
        match self.live.get(key).await? {
            Some(live) => Ok(match self.readiness.check(&live) {
                Ok(()) => TaskOutcome::Ready,
                Err(NotReady(reason)) => TaskOutcome::NotReady(reason),
            }),
            None => Ok(TaskOutcome::NotReady(format!(
                "{} not found after ensure",
                key
            ))),
        }
    }
}

#[async_trait]
impl Reconciler for ObjectReconciler {
    type Spec = ManagedObject;
    type Status = TaskOutcome;

    async fn reconcile(&self, spec: &Self::Spec) -> Result<Self::Status> {
        let key = spec.key();
        debug!("Reconciling {}", key);

        self.ensure(spec)
            .await
            .with_context(|| format!("failed to ensure {}", key))?;
        let outcome = self
            .probe(&key)
            .await
            .with_context(|| format!("failed to read back {}", key))?;

        if let TaskOutcome::NotReady(reason) = &outcome {
            info!("{} not ready: {}", key, reason);
        }
        Ok(outcome)
    }

    async fn finalize(&self, key: &ObjectKey) -> Result<()> {
        match self.live.delete(key, self.propagation).await {
            // Already gone
            Ok(()) | Err(LiveError::NotFound(_)) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::MemoryLiveSystem;
    use crate::live::memory::Operation;
    use crate::object::OwnerRef;
    use serde_json::json;

    fn desired(spec: serde_json::Value) -> ManagedObject {
        ManagedObject::new(ObjectKey::new("Deployment", "api"), spec)
            .with_owner(OwnerRef::new("App", "demo"))
    }

    fn reconciler(live: &Arc<MemoryLiveSystem>) -> ObjectReconciler {
        ObjectReconciler::new(live.clone(), ReadinessRegistry::kubernetes())
    }

    #[tokio::test]
    async fn test_ensure_creates_then_is_idempotent() {
        let live = Arc::new(MemoryLiveSystem::new());
        let reconciler = reconciler(&live);
        let object = desired(json!({"replicas": 2}));

        assert!(reconciler.ensure(&object).await.unwrap().created());
        assert_eq!(
            reconciler.ensure(&object).await.unwrap(),
            EnsureOutcome::Unchanged
        );
        assert_eq!(live.count_calls(Operation::Create).await, 1);
        assert_eq!(live.count_calls(Operation::Update).await, 0);
    }

    #[tokio::test]
    async fn test_ensure_updates_drift_and_keeps_status() {
        let live = Arc::new(MemoryLiveSystem::new());
        let reconciler = reconciler(&live);
        reconciler.ensure(&desired(json!({"replicas": 2}))).await.unwrap();
        let key = ObjectKey::new("Deployment", "api");
        live.set_status(&key, json!({"readyReplicas": 2})).await;

        let outcome = reconciler
            .ensure(&desired(json!({"replicas": 3})))
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);

        let stored = live.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.spec, json!({"replicas": 3}));
        assert_eq!(stored.status, Some(json!({"readyReplicas": 2})));
    }

    #[tokio::test]
    async fn test_ensure_updates_changed_annotation() {
        let live = Arc::new(MemoryLiveSystem::new());
        let reconciler = reconciler(&live);
        let key = ObjectKey::new("Deployment", "api");
        reconciler
            .ensure(&desired(json!({})).with_annotation("team", "blue"))
            .await
            .unwrap();
        live.set_status(&key, json!({"readyReplicas": 1})).await;

        let outcome = reconciler
            .ensure(&desired(json!({})).with_annotation("team", "red"))
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
        let stored = live.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.annotations.get("team").map(String::as_str), Some("red"));

        // Annotations added by the live system alone never cause a write.
        let mut drifted = stored.clone();
        drifted
            .annotations
            .insert("helmsman.io/updated-at".into(), "later".into());
        live.insert(drifted).await;
        assert_eq!(
            reconciler
                .ensure(&desired(json!({})).with_annotation("team", "red"))
                .await
                .unwrap(),
            EnsureOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_service_ready_once_ip_is_allocated() {
        let live = Arc::new(MemoryLiveSystem::new());
        let reconciler = reconciler(&live);
        let key = ObjectKey::new("Service", "api");
        let service = ManagedObject::new(key.clone(), json!({"ports": [80]}))
            .with_owner(OwnerRef::new("App", "demo"));

        let first = reconciler.reconcile(&service).await.unwrap();
        assert!(matches!(first, TaskOutcome::NotReady(_)));

        live.set_status(&key, json!({"clusterIP": "10.0.0.7"})).await;
        assert_eq!(reconciler.reconcile(&service).await.unwrap(), TaskOutcome::Ready);
        assert_eq!(live.count_calls(Operation::Update).await, 0);
    }

    #[tokio::test]
    async fn test_ensure_returns_live_errors() {
        let live = Arc::new(MemoryLiveSystem::new());
        live.fail_on(
            Operation::Get,
            Some(ObjectKey::new("Deployment", "api")),
            "apiserver down",
        )
        .await;
        let err = reconciler(&live)
            .ensure(&desired(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_reconcile_reports_readiness() {
        let live = Arc::new(MemoryLiveSystem::new());
        let reconciler = reconciler(&live);
        let object = desired(json!({"replicas": 1}));

        let outcome = reconciler.reconcile(&object).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::NotReady(_)));

        live.set_status(&object.key(), json!({"readyReplicas": 1}))
            .await;
        assert_eq!(reconciler.reconcile(&object).await.unwrap(), TaskOutcome::Ready);
    }

    #[tokio::test]
    async fn test_finalize_tolerates_missing() {
        let live = Arc::new(MemoryLiveSystem::new());
        let reconciler = reconciler(&live).with_propagation(PropagationPolicy::Orphan);
        reconciler.ensure(&desired(json!({}))).await.unwrap();

        let key = ObjectKey::new("Deployment", "api");
        reconciler.finalize(&key).await.unwrap();
        reconciler.finalize(&key).await.unwrap();
        assert!(live.keys().await.is_empty());
    }
}

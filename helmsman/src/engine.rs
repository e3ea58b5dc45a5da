//! Orchestration entry point - one reconciliation pass per call.
//!
//! A pass renders the desired objects, prunes owned objects that are no
//! longer desired, builds a task per desired object, wires the manifest's
//! ordering into the scheduler and runs it. The result is the most severe
//! outcome: a failure beats partial readiness, which beats convergence.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::ReconcileError;
use crate::gc;
use crate::graph;
use crate::live::LiveSystem;
use crate::manifest::ManifestSource;
use crate::object::OwnerRef;
use crate::reconciler::{ObjectReconciler, ReadinessRegistry, Reconciler};
use crate::render::Renderer;
use crate::scheduler::{RunReport, Scheduler, SchedulerError};

/// An object that held up convergence in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingObject {
    /// Object key in `Kind/name` form.
    pub object: String,
    pub reason: String,
}

/// Successful outcome of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Every desired object exists, matches and is ready.
    Converged,
    /// Some objects are not ready yet; try again after `retry_after`.
    PartiallyReady {
        retry_after: Duration,
        pending: Vec<PendingObject>,
    },
}

impl ReconcileResult {
    /// Delay before the next pass: zero once converged.
    pub fn requeue_after(&self) -> Duration {
        match self {
            ReconcileResult::Converged => Duration::ZERO,
            ReconcileResult::PartiallyReady { retry_after, .. } => *retry_after,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, ReconcileResult::Converged)
    }

    fn from_report(report: &RunReport, retry_after: Duration) -> Self {
        if report.is_complete() {
            return ReconcileResult::Converged;
        }

        let mut pending: Vec<PendingObject> = report
            .not_ready
            .iter()
            .map(|(object, reason)| PendingObject {
                object: object.clone(),
                reason: reason.clone(),
            })
            .collect();
        pending.extend(report.blocked.iter().map(|object| PendingObject {
            object: object.clone(),
            reason: "waiting for a dependency to become ready".to_string(),
        }));
        ReconcileResult::PartiallyReady {
            retry_after,
            pending,
        }
    }
}

/// Reconciliation engine for one live system.
pub struct Engine {
    renderer: Arc<dyn Renderer>,
    manifests: Arc<dyn ManifestSource>,
    live: Arc<dyn LiveSystem>,
    reconciler: Arc<ObjectReconciler>,
    config: EngineConfig,
    audit: AuditLogger,
}

impl Engine {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        manifests: Arc<dyn ManifestSource>,
        live: Arc<dyn LiveSystem>,
        readiness: ReadinessRegistry,
        config: EngineConfig,
    ) -> Self {
        let reconciler = ObjectReconciler::new(live.clone(), readiness)
            .with_propagation(config.propagation);
        Self {
            renderer,
            manifests,
            live,
            reconciler: Arc::new(reconciler),
            config,
            audit: AuditLogger::new_noop(),
        }
    }

    /// Record mutations and pass results with `audit`.
    pub fn with_audit(self, audit: AuditLogger) -> Self {
        let readiness = self.reconciler.readiness().clone();
        let reconciler = ObjectReconciler::new(self.live.clone(), readiness)
            .with_propagation(self.config.propagation)
            .with_audit(audit.clone());
        Self {
            reconciler: Arc::new(reconciler),
            audit,
            ..self
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one reconciliation pass for `owner`.
    pub async fn reconcile(
        &self,
        owner: &OwnerRef,
        cancel: &CancelToken,
    ) -> Result<ReconcileResult, ReconcileError> {
        let pass_id = Uuid::new_v4().to_string();
        let span = info_span!("reconcile", owner = %owner, pass = %pass_id);

        async {
            let result = self.run_pass(owner, cancel).await;
            match &result {
                Ok(ReconcileResult::Converged) => {
                    info!("Converged");
                    self.audit.pass_converged(owner, &pass_id);
                }
                Ok(ReconcileResult::PartiallyReady {
                    retry_after,
                    pending,
                }) => {
                    info!(
                        "Partially ready, {} object(s) pending, retry in {:?}",
                        pending.len(),
                        retry_after
                    );
                    self.audit.pass_partially_ready(owner, &pass_id, pending.len());
                }
                Err(e) if e.is_cancelled() => {
                    warn!("Pass cancelled");
                }
                Err(e) => {
                    warn!("Pass failed: {:#}", e);
                    self.audit.pass_failed(owner, &pass_id, &format!("{:#}", e));
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_pass(
        &self,
        owner: &OwnerRef,
        cancel: &CancelToken,
    ) -> Result<ReconcileResult, ReconcileError> {
        let desired = self
            .renderer
            .desired_objects(owner)
            .await
            .map_err(ReconcileError::Render)?;
        let manifest = self.manifests.load().await?;
        info!("Reconciling {} desired object(s)", desired.len());

        // A cancelled pass makes no changes, pruning included.
        if cancel.is_cancelled() {
            return Err(ReconcileError::Scheduler(SchedulerError::Cancelled));
        }

        let desired_keys: BTreeSet<_> = desired.keys().cloned().collect();
        let gc_report = gc::collect(&*self.reconciler, &*self.live, owner, &desired_keys)
            .await
            .map_err(ReconcileError::List)?;
        for key in &gc_report.deleted {
            self.audit.object_deleted(owner, key);
        }
        for (key, reason) in &gc_report.failed {
            self.audit.object_delete_failed(owner, key, reason);
        }

        let mut scheduler = Scheduler::new(self.config.concurrency);
        let mut tasks = HashMap::with_capacity(desired.len());
        for (key, object) in desired {
            let reconciler = Arc::clone(&self.reconciler);
            let object = Arc::new(object);
            let id = scheduler.add_task(key.to_string(), move || async move {
                reconciler.reconcile(&object).await
            });
            tasks.insert(key, id);
        }

        let stats = graph::wire(&mut scheduler, &manifest, &tasks)?;
        debug!(
            edges = stats.edges,
            skipped = stats.skipped_missing,
            "Wired task graph"
        );

        let report = scheduler.run(cancel).await?;
        Ok(ReconcileResult::from_report(
            &report,
            self.config.not_ready_requeue,
        ))
    }
}

//! Readiness probes, keyed by object kind.
//!
//! A probe inspects the live object after it was ensured and decides whether
//! dependents may proceed. Kinds without a registered probe are always ready.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::object::ManagedObject;

/// Why an object is not ready yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct NotReady(pub String);

impl NotReady {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub type ReadinessProbe = Arc<dyn Fn(&ManagedObject) -> Result<(), NotReady> + Send + Sync>;

/// Kind-to-probe lookup table.
#[derive(Clone, Default)]
pub struct ReadinessRegistry {
    probes: HashMap<String, ReadinessProbe>,
}

impl fmt::Debug for ReadinessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.probes.keys().collect();
        kinds.sort();
        f.debug_struct("ReadinessRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl ReadinessRegistry {
    /// Empty registry: every kind is ready.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the probes for the built-in Kubernetes workload kinds.
    pub fn kubernetes() -> Self {
        Self::new()
            .with("Pod", pod_ready)
            .with("Service", service_ready)
            .with("ReplicationController", replicas_ready)
            .with("Deployment", replicas_ready)
            .with("StatefulSet", replicas_ready)
            .with("ReplicaSet", replicas_ready)
            .with("DaemonSet", daemon_set_ready)
            .with("Job", job_complete)
    }

    /// Register (or replace) the probe for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, probe: F)
    where
        F: Fn(&ManagedObject) -> Result<(), NotReady> + Send + Sync + 'static,
    {
        self.probes.insert(kind.into(), Arc::new(probe));
    }

    pub fn with<F>(mut self, kind: impl Into<String>, probe: F) -> Self
    where
        F: Fn(&ManagedObject) -> Result<(), NotReady> + Send + Sync + 'static,
    {
        self.register(kind, probe);
        self
    }

    pub fn has_probe(&self, kind: &str) -> bool {
        self.probes.contains_key(kind)
    }

    pub fn check(&self, live: &ManagedObject) -> Result<(), NotReady> {
        match self.probes.get(&live.kind) {
            Some(probe) => probe(live),
            None => Ok(()),
        }
    }
}

fn condition<'a>(object: &'a ManagedObject, kind: &str) -> Option<&'a Value> {
    object
        .status_field("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
}

fn condition_true(object: &ManagedObject, kind: &str) -> bool {
    condition(object, kind)
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        == Some("True")
}

fn count(value: Option<&Value>) -> Option<i64> {
    value.and_then(Value::as_i64)
}

/// Pod: the `Ready` condition is `True`.
pub fn pod_ready(pod: &ManagedObject) -> Result<(), NotReady> {
    if condition_true(pod, "Ready") {
        Ok(())
    } else {
        Err(NotReady::new(format!("pod {} is not ready", pod.name)))
    }
}

/// Service: a cluster IP is allocated, in `status` or pinned in `spec`
/// (headless services excepted), and a load balancer has at least one
/// ingress point.
pub fn service_ready(svc: &ManagedObject) -> Result<(), NotReady> {
    let cluster_ip = svc
        .status_field("clusterIP")
        .or_else(|| svc.spec_field("clusterIP"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if cluster_ip != "None" && cluster_ip.is_empty() {
        return Err(NotReady::new(format!(
            "service {} has no cluster IP yet",
            svc.name
        )));
    }

    let is_load_balancer = svc.spec_field("type").and_then(Value::as_str) == Some("LoadBalancer");
    let has_ingress = svc
        .status_field("loadBalancer.ingress")
        .and_then(Value::as_array)
        .is_some_and(|ingress| !ingress.is_empty());
    if is_load_balancer && !has_ingress {
        return Err(NotReady::new(format!(
            "load balancer for service {} has no ingress yet",
            svc.name
        )));
    }
    Ok(())
}

/// Replicated workloads: `status.readyReplicas` has caught up with
/// `spec.replicas` (which defaults to 1).
pub fn replicas_ready(object: &ManagedObject) -> Result<(), NotReady> {
    let desired = count(object.spec_field("replicas")).unwrap_or(1);
    let ready = count(object.status_field("readyReplicas")).unwrap_or(0);
    if ready >= desired {
        Ok(())
    } else {
        Err(NotReady::new(format!(
            "{} {}: {}/{} replicas ready",
            object.kind, object.name, ready, desired
        )))
    }
}

/// DaemonSet: every scheduled pod is ready.
pub fn daemon_set_ready(ds: &ManagedObject) -> Result<(), NotReady> {
    let Some(desired) = count(ds.status_field("desiredNumberScheduled")) else {
        return Err(NotReady::new(format!(
            "daemon set {} has not been scheduled yet",
            ds.name
        )));
    };
    let ready = count(ds.status_field("numberReady")).unwrap_or(0);
    if ready >= desired {
        Ok(())
    } else {
        Err(NotReady::new(format!(
            "daemon set {}: {}/{} pods ready",
            ds.name, ready, desired
        )))
    }
}

/// Job: the `Complete` condition is `True`. A failed job stays not ready
/// and carries the failure reason.
pub fn job_complete(job: &ManagedObject) -> Result<(), NotReady> {
    if condition_true(job, "Complete") {
        return Ok(());
    }
    if condition_true(job, "Failed") {
        let reason = condition(job, "Failed")
            .and_then(|c| c.get("message").or_else(|| c.get("reason")))
            .and_then(Value::as_str)
            .unwrap_or("unknown reason");
        return Err(NotReady::new(format!("job {} failed: {}", job.name, reason)));
    }
    Err(NotReady::new(format!("job {} has not completed", job.name)))
}

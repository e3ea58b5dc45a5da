//! Audit trail for mutations made on behalf of an owner.
//!
//! Entries are emitted as tracing events under the `audit` target, so they can
//! be routed separately with an `EnvFilter` such as `audit=info`.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::object::{ObjectKey, OwnerRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Audit,
    Info,
    Warn,
}

/// One recorded audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub level: LogLevel,
    pub message: String,
    pub object_ids: Vec<String>,
}

/// Audit logger for reconciliation events.
#[derive(Clone, Default)]
pub struct AuditLogger {
    enabled: bool,
    recorded: Option<Arc<Mutex<Vec<AuditEntry>>>>,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self {
            enabled: true,
            recorded: None,
        }
    }

    pub fn new_noop() -> Self {
        Self::default()
    }

    /// Logger that also keeps every entry in memory, see [`entries`](Self::entries).
    pub fn recording() -> Self {
        Self {
            enabled: true,
            recorded: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        match &self.recorded {
            Some(recorded) => recorded
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            None => Vec::new(),
        }
    }

    fn log(&self, level: LogLevel, message: String, object_ids: Vec<String>) {
        if !self.enabled {
            return;
        }

        let ids = object_ids.join(",");
        match level {
            LogLevel::Audit | LogLevel::Info => info!(target: "audit", ids = %ids, "{}", message),
            LogLevel::Warn => warn!(target: "audit", ids = %ids, "{}", message),
        }

        if let Some(recorded) = &self.recorded {
            recorded
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(AuditEntry {
                    level,
                    message,
                    object_ids,
                });
        }
    }

    // Object events
    pub fn object_created(&self, owner: Option<&OwnerRef>, key: &ObjectKey) {
        self.log(
            LogLevel::Audit,
            format!("Object created: {}", key),
            ids(owner, Some(key)),
        );
    }

    pub fn object_updated(&self, owner: Option<&OwnerRef>, key: &ObjectKey) {
        self.log(
            LogLevel::Audit,
            format!("Object updated: {}", key),
            ids(owner, Some(key)),
        );
    }

    pub fn object_deleted(&self, owner: &OwnerRef, key: &ObjectKey) {
        self.log(
            LogLevel::Audit,
            format!("Orphan deleted: {}", key),
            ids(Some(owner), Some(key)),
        );
    }

    pub fn object_delete_failed(&self, owner: &OwnerRef, key: &ObjectKey, reason: &str) {
        self.log(
            LogLevel::Warn,
            format!("Orphan delete failed: {}: {}", key, reason),
            ids(Some(owner), Some(key)),
        );
    }

    // Pass events
    pub fn pass_converged(&self, owner: &OwnerRef, pass_id: &str) {
        self.log(
            LogLevel::Info,
            format!("Pass {} converged", pass_id),
            ids(Some(owner), None),
        );
    }

    pub fn pass_partially_ready(&self, owner: &OwnerRef, pass_id: &str, pending: usize) {
        self.log(
            LogLevel::Info,
            format!("Pass {} partially ready, {} object(s) pending", pass_id, pending),
            ids(Some(owner), None),
        );
    }

    pub fn pass_failed(&self, owner: &OwnerRef, pass_id: &str, error: &str) {
        self.log(
            LogLevel::Warn,
            format!("Pass {} failed: {}", pass_id, error),
            ids(Some(owner), None),
        );
    }
}

fn ids(owner: Option<&OwnerRef>, key: Option<&ObjectKey>) -> Vec<String> {
    owner
        .map(ToString::to_string)
        .into_iter()
        .chain(key.map(ToString::to_string))
        .collect()
}

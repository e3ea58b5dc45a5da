//! In-memory live system.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{LiveError, LiveSystem, PropagationPolicy};
use crate::object::{ManagedObject, ObjectKey, OwnerRef};

/// Live-system operation, used for fault injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
}

/// One recorded call against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Operation,
    pub key: Option<ObjectKey>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, ManagedObject>,
    next_version: u64,
    /// Status assigned to newly created objects, by kind.
    create_status: HashMap<String, Value>,
    failures: HashMap<(Operation, Option<ObjectKey>), String>,
    calls: Vec<Call>,
}

impl MemoryState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn record(&mut self, op: Operation, key: Option<&ObjectKey>) -> Result<(), LiveError> {
        self.calls.push(Call {
            op,
            key: key.cloned(),
        });
        match self.failures.get(&(op, key.cloned())) {
            Some(message) => Err(LiveError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }
}

/// Live system kept entirely in memory.
///
/// Resource versions are assigned from one counter; updates carrying a stale
/// version fail with [`LiveError::Conflict`].
#[derive(Default)]
pub struct MemoryLiveSystem {
    state: Mutex<MemoryState>,
}

impl MemoryLiveSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as-is, bypassing create semantics.
    pub async fn insert(&self, mut object: ManagedObject) -> ManagedObject {
        let mut state = self.state.lock().await;
        object.resource_version = state.bump();
        state.objects.insert(object.key(), object.clone());
        object
    }

    /// Overwrite the status of a stored object, as the target system would.
    /// Returns `false` if the object does not exist.
    pub async fn set_status(&self, key: &ObjectKey, status: Value) -> bool {
        let mut state = self.state.lock().await;
        match state.objects.get_mut(key) {
            Some(object) => {
                object.status = Some(status);
                true
            }
            None => false,
        }
    }

    /// Give every object of `kind` this status when it is created.
    pub async fn set_create_status(&self, kind: impl Into<String>, status: Value) {
        self.state
            .lock()
            .await
            .create_status
            .insert(kind.into(), status);
    }

    /// Make `op` fail with [`LiveError::Unavailable`]. A `None` key targets
    /// `list`, which has no object key.
    pub async fn fail_on(&self, op: Operation, key: Option<ObjectKey>, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .failures
            .insert((op, key), message.into());
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count_calls(&self, op: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    pub async fn snapshot(&self) -> Vec<ManagedObject> {
        self.state.lock().await.objects.values().cloned().collect()
    }

    pub async fn keys(&self) -> Vec<ObjectKey> {
        self.state.lock().await.objects.keys().cloned().collect()
    }
}

#[async_trait]
impl LiveSystem for MemoryLiveSystem {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, LiveError> {
        let mut state = self.state.lock().await;
        state.record(Operation::Get, Some(key))?;
        Ok(state.objects.get(key).cloned())
    }

    async fn list(&self, owner: &OwnerRef) -> Result<Vec<ManagedObject>, LiveError> {
        let mut state = self.state.lock().await;
        state.record(Operation::List, None)?;
        Ok(state
            .objects
            .values()
            .filter(|o| o.is_owned_by(owner))
            .cloned()
            .collect())
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, LiveError> {
        let key = object.key();
        let mut state = self.state.lock().await;
        state.record(Operation::Create, Some(&key))?;
        if state.objects.contains_key(&key) {
            return Err(LiveError::AlreadyExists(key));
        }

        let mut stored = object.clone();
        stored.resource_version = state.bump();
        stored.status = state.create_status.get(&key.kind).cloned();
        debug!(object = %key, version = stored.resource_version, "Created object");
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, LiveError> {
        let key = object.key();
        let mut state = self.state.lock().await;
        state.record(Operation::Update, Some(&key))?;

        let (current_version, current_status) = match state.objects.get(&key) {
            Some(current) => (current.resource_version, current.status.clone()),
            None => return Err(LiveError::NotFound(key)),
        };
        if current_version != object.resource_version {
            return Err(LiveError::Conflict {
                key,
                expected: object.resource_version,
                actual: current_version,
            });
        }

        let mut stored = object.clone();
        stored.resource_version = state.bump();
        stored.status = current_status;
        debug!(object = %key, version = stored.resource_version, "Updated object");
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        key: &ObjectKey,
        propagation: PropagationPolicy,
    ) -> Result<(), LiveError> {
        let mut state = self.state.lock().await;
        state.record(Operation::Delete, Some(key))?;
        match state.objects.remove(key) {
            Some(_) => {
                debug!(object = %key, ?propagation, "Deleted object");
                Ok(())
            }
            None => Err(LiveError::NotFound(key.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str) -> ManagedObject {
        ManagedObject::new(ObjectKey::new("Pod", name), json!({"image": "busybox"}))
            .with_owner(OwnerRef::new("App", "demo"))
    }

    #[tokio::test]
    async fn test_create_get_list_delete() {
        let live = MemoryLiveSystem::new();
        let created = live.create(&pod("a")).await.unwrap();
        assert_eq!(created.resource_version, 1);
        assert!(matches!(
            live.create(&pod("a")).await,
            Err(LiveError::AlreadyExists(_))
        ));

        let fetched = live.get(&ObjectKey::new("Pod", "a")).await.unwrap();
        assert_eq!(fetched, Some(created));

        live.insert(
            ManagedObject::new(ObjectKey::new("Pod", "stranger"), json!({}))
                .with_owner(OwnerRef::new("App", "other")),
        )
        .await;
        let owned = live.list(&OwnerRef::new("App", "demo")).await.unwrap();
        assert_eq!(owned.len(), 1);

        live.delete(&ObjectKey::new("Pod", "a"), PropagationPolicy::Background)
            .await
            .unwrap();
        assert!(matches!(
            live.delete(&ObjectKey::new("Pod", "a"), PropagationPolicy::Background)
                .await,
            Err(LiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_status_and_checks_version() {
        let live = MemoryLiveSystem::new();
        live.set_create_status("Pod", json!({"phase": "Pending"}))
            .await;
        let created = live.create(&pod("a")).await.unwrap();
        assert_eq!(created.status, Some(json!({"phase": "Pending"})));

        let mut change = created.clone();
        change.spec = json!({"image": "busybox:1.36"});
        change.status = None;
        let updated = live.update(&change).await.unwrap();
        assert_eq!(updated.status, Some(json!({"phase": "Pending"})));
        assert!(updated.resource_version > created.resource_version);

        // `change` still carries the old version.
        let err = live.update(&change).await.unwrap_err();
        assert!(matches!(err, LiveError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let live = MemoryLiveSystem::new();
        let key = ObjectKey::new("Pod", "a");
        live.fail_on(Operation::Create, Some(key.clone()), "quota exceeded")
            .await;
        assert!(matches!(
            live.create(&pod("a")).await,
            Err(LiveError::Unavailable(msg)) if msg == "quota exceeded"
        ));

        live.clear_failures().await;
        live.create(&pod("a")).await.unwrap();
        assert_eq!(live.count_calls(Operation::Create).await, 2);
        assert!(live.set_status(&key, json!({"ready": true})).await);
        assert!(!live.set_status(&ObjectKey::new("Pod", "zz"), json!({})).await);
    }
}

//! File-backed live system.
//!
//! Layout: `<root>/<kind>/<name>.json`, one pretty-printed [`ManagedObject`]
//! per file. Writes go to a temp file first and are renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{LiveError, LiveSystem, PropagationPolicy};
use crate::object::{ManagedObject, ObjectKey, OwnerRef};

pub const CREATED_AT_ANNOTATION: &str = "helmsman.io/created-at";
pub const UPDATED_AT_ANNOTATION: &str = "helmsman.io/updated-at";

/// Live system persisted as JSON files under a state directory.
pub struct FsLiveSystem {
    root: PathBuf,
    // Serializes read-check-write sequences for create/update/delete.
    write_lock: Mutex<()>,
}

impl FsLiveSystem {
    /// Open (and create if needed) a state directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, LiveError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ObjectKey) -> Result<PathBuf, LiveError> {
        let valid = |s: &str| !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\']);
        if !valid(&key.kind) || !valid(&key.name) {
            return Err(LiveError::InvalidKey(key.clone()));
        }
        Ok(self.root.join(&key.kind).join(format!("{}.json", key.name)))
    }

    async fn read(&self, path: &Path) -> Result<Option<ManagedObject>, LiveError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, object: &ManagedObject) -> Result<(), LiveError> {
        let dir = path
            .parent()
            .ok_or_else(|| LiveError::InvalidKey(object.key()))?;
        fs::create_dir_all(dir).await?;

        let json = serde_json::to_vec_pretty(object)?;
        let tmp = dir.join(format!(".{}.{}.tmp", object.name, Uuid::new_v4()));
        fs::write(&tmp, &json).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl LiveSystem for FsLiveSystem {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, LiveError> {
        let path = self.path_for(key)?;
        self.read(&path).await
    }

    async fn list(&self, owner: &OwnerRef) -> Result<Vec<ManagedObject>, LiveError> {
        let mut owned = Vec::new();
        let mut kinds = fs::read_dir(&self.root).await?;
        while let Some(kind_dir) = kinds.next_entry().await? {
            if !kind_dir.file_type().await?.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(kind_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match self.read(&path).await {
                    Ok(Some(object)) if object.is_owned_by(owner) => owned.push(object),
                    Ok(_) => {}
                    // Removed between read_dir and read
                    Err(LiveError::Io(e)) if e.kind() == ErrorKind::NotFound => {}
                    Err(LiveError::Serialization(e)) => {
                        warn!(path = %path.display(), "Skipping unreadable object file: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        owned.sort_by_key(ManagedObject::key);
        Ok(owned)
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, LiveError> {
        let key = object.key();
        let path = self.path_for(&key)?;
        let _guard = self.write_lock.lock().await;

        if fs::try_exists(&path).await? {
            return Err(LiveError::AlreadyExists(key));
        }

        let now = Utc::now().to_rfc3339();
        let mut stored = object.clone();
        stored.resource_version = 1;
        stored.status = None;
        stored
            .annotations
            .insert(CREATED_AT_ANNOTATION.to_string(), now.clone());
        stored
            .annotations
            .insert(UPDATED_AT_ANNOTATION.to_string(), now);

        self.write(&path, &stored).await?;
        debug!(object = %key, path = %path.display(), "Created object");
        Ok(stored)
    }

    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, LiveError> {
        let key = object.key();
        let path = self.path_for(&key)?;
        let _guard = self.write_lock.lock().await;

        let Some(current) = self.read(&path).await? else {
            return Err(LiveError::NotFound(key));
        };
        if current.resource_version != object.resource_version {
            return Err(LiveError::Conflict {
                key,
                expected: object.resource_version,
                actual: current.resource_version,
            });
        }

        let mut stored = object.clone();
        stored.resource_version = current.resource_version + 1;
        stored.status = current.status;
        if let Some(created) = current.annotations.get(CREATED_AT_ANNOTATION) {
            stored
                .annotations
                .insert(CREATED_AT_ANNOTATION.to_string(), created.clone());
        }
        stored
            .annotations
            .insert(UPDATED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());

        self.write(&path, &stored).await?;
        debug!(object = %key, version = stored.resource_version, "Updated object");
        Ok(stored)
    }

    async fn delete(
        &self,
        key: &ObjectKey,
        propagation: PropagationPolicy,
    ) -> Result<(), LiveError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(object = %key, ?propagation, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(LiveError::NotFound(key.clone())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owned(kind: &str, name: &str, owner: &str) -> ManagedObject {
        ManagedObject::new(ObjectKey::new(kind, name), json!({"replicas": 1}))
            .with_owner(OwnerRef::new("App", owner))
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let live = FsLiveSystem::open(dir.path()).await.unwrap();

        let created = live.create(&owned("Deployment", "api", "demo")).await.unwrap();
        assert_eq!(created.resource_version, 1);
        assert!(created.annotations.contains_key(CREATED_AT_ANNOTATION));
        assert!(dir.path().join("Deployment").join("api.json").exists());

        let fetched = live
            .get(&ObjectKey::new("Deployment", "api"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, created);
        assert!(
            live.get(&ObjectKey::new("Deployment", "missing"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_keeps_status() {
        let dir = tempfile::tempdir().unwrap();
        let live = FsLiveSystem::open(dir.path()).await.unwrap();
        let created = live.create(&owned("Deployment", "api", "demo")).await.unwrap();

        // Status written behind our back, as an external controller would.
        let path = dir.path().join("Deployment").join("api.json");
        let mut on_disk = created.clone();
        on_disk.status = Some(json!({"readyReplicas": 1}));
        std::fs::write(&path, serde_json::to_vec(&on_disk).unwrap()).unwrap();

        let mut change = created.clone();
        change.spec = json!({"replicas": 3});
        let updated = live.update(&change).await.unwrap();
        assert_eq!(updated.resource_version, 2);
        assert_eq!(updated.status, Some(json!({"readyReplicas": 1})));
        assert_eq!(
            updated.annotations.get(CREATED_AT_ANNOTATION),
            created.annotations.get(CREATED_AT_ANNOTATION)
        );

        let stale = live.update(&change).await.unwrap_err();
        assert!(matches!(stale, LiveError::Conflict { expected: 1, actual: 2, .. }));
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        let live = FsLiveSystem::open(dir.path()).await.unwrap();
        live.create(&owned("Service", "api", "demo")).await.unwrap();
        live.create(&owned("Deployment", "api", "demo")).await.unwrap();
        live.create(&owned("Deployment", "other", "someone-else"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("Service").join("junk.json"), "{not json").unwrap();

        let keys: Vec<String> = live
            .list(&OwnerRef::new("App", "demo"))
            .await
            .unwrap()
            .iter()
            .map(|o| o.key().to_string())
            .collect();
        assert_eq!(keys, vec!["Deployment/api", "Service/api"]);
    }

    #[tokio::test]
    async fn test_delete_and_invalid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let live = FsLiveSystem::open(dir.path()).await.unwrap();
        live.create(&owned("Job", "migrate", "demo")).await.unwrap();

        let key = ObjectKey::new("Job", "migrate");
        live.delete(&key, PropagationPolicy::Foreground).await.unwrap();
        assert!(matches!(
            live.delete(&key, PropagationPolicy::Foreground).await,
            Err(LiveError::NotFound(_))
        ));

        let sneaky = ObjectKey::new("Job", "../escape");
        assert!(matches!(live.get(&sneaky).await, Err(LiveError::InvalidKey(_))));
    }
}

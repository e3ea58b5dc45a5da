//! Renderers produce the desired objects for an owner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::object::{ManagedObject, ObjectKey, OwnerRef};

/// Source of desired state.
///
/// Every returned object carries `owner`; keys are unique by construction.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn desired_objects(&self, owner: &OwnerRef)
    -> Result<BTreeMap<ObjectKey, ManagedObject>>;
}

/// Collect objects into a map, stamping `owner` and rejecting duplicates.
pub fn index_objects<I>(owner: &OwnerRef, objects: I) -> Result<BTreeMap<ObjectKey, ManagedObject>>
where
    I: IntoIterator<Item = ManagedObject>,
{
    let mut desired = BTreeMap::new();
    for mut object in objects {
        if object.kind.is_empty() || object.name.is_empty() {
            bail!("object is missing kind or name");
        }
        object.owner = Some(owner.clone());
        let key = object.key();
        if desired.insert(key.clone(), object).is_some() {
            bail!("duplicate desired object {}", key);
        }
    }
    Ok(desired)
}

/// Renders the object definitions found in a directory.
///
/// Every `*.yaml`/`*.yml` file may hold several `---` separated documents;
/// a `*.json` file holds one object or an array of objects. Other files are
/// ignored. Files are read in name order.
#[derive(Debug, Clone)]
pub struct DirectoryRenderer {
    dir: PathBuf,
}

impl DirectoryRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read {}", self.dir.display()))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_object_file = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml" | "json")
            );
            if is_object_file && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Box<ManagedObject>),
    Many(Vec<ManagedObject>),
}

fn parse_file(path: &Path, text: &str) -> Result<Vec<ManagedObject>> {
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let parsed: OneOrMany = serde_json::from_str(text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        return Ok(match parsed {
            OneOrMany::One(object) => vec![*object],
            OneOrMany::Many(objects) => objects,
        });
    }

    let mut objects = Vec::new();
    for (idx, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let object = Option::<ManagedObject>::deserialize(document)
            .with_context(|| format!("failed to parse {} (document {})", path.display(), idx))?;
        // Empty documents, e.g. a trailing `---`
        objects.extend(object);
    }
    Ok(objects)
}

#[async_trait]
impl Renderer for DirectoryRenderer {
    async fn desired_objects(
        &self,
        owner: &OwnerRef,
    ) -> Result<BTreeMap<ObjectKey, ManagedObject>> {
        let mut objects = Vec::new();
        for path in self.files().await? {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let parsed = parse_file(&path, &text)?;
            debug!(path = %path.display(), count = parsed.len(), "Loaded object definitions");
            objects.extend(parsed);
        }
        index_objects(owner, objects)
    }
}

/// Renderer over a fixed, replaceable set of objects.
#[derive(Debug, Default)]
pub struct StaticRenderer {
    objects: RwLock<Vec<ManagedObject>>,
}

impl StaticRenderer {
    pub fn new(objects: Vec<ManagedObject>) -> Self {
        Self {
            objects: RwLock::new(objects),
        }
    }

    /// Replace the desired set for subsequent passes.
    pub async fn set_objects(&self, objects: Vec<ManagedObject>) {
        *self.objects.write().await = objects;
    }
}

#[async_trait]
impl Renderer for StaticRenderer {
    async fn desired_objects(
        &self,
        owner: &OwnerRef,
    ) -> Result<BTreeMap<ObjectKey, ManagedObject>> {
        let objects = self.objects.read().await.clone();
        index_objects(owner, objects)
    }
}

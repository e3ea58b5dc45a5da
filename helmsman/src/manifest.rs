//! Dependency manifest - groups of objects and the order between groups.
//!
//! The YAML form has two top-level mappings:
//!
//! ```yaml
//! groupings:
//!   config: [ConfigMap/app, Secret/app-tls]
//!   backend: [Deployment/api, Service/api]
//! dependencies:
//!   - obj: backend
//!     isDependentOn: [config]
//!   - obj: Deployment/web
//!     isDependentOn: [backend]
//! ```
//!
//! A name with no entry in `groupings` stands for the single object it names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::object::ObjectKey;

/// Errors from loading or parsing a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// One ordering constraint: `obj` waits for every group in `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub obj: String,
    #[serde(rename = "isDependentOn", alias = "dependsOn", default)]
    pub depends_on: Vec<String>,
}

/// Declarative grouping and ordering over managed objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    #[serde(rename = "groupings", default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl DependencyManifest {
    pub fn from_yaml_str(text: &str) -> Result<Self, ManifestError> {
        // An empty document is an empty manifest.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml_string(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Add or replace a group.
    pub fn group<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .insert(name.into(), members.into_iter().map(Into::into).collect());
        self
    }

    /// Add an ordering constraint.
    pub fn depend<I, S>(mut self, obj: impl Into<String>, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.push(Dependency {
            obj: obj.into(),
            depends_on: depends_on.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Object keys a group stands for.
    ///
    /// Unknown group names fall back to a singleton group naming one object.
    /// Members that are not of the form `Kind/name` are skipped with a warning.
    pub fn resolve(&self, group: &str) -> Vec<ObjectKey> {
        let members: Vec<&str> = match self.groups.get(group) {
            Some(members) => members.iter().map(String::as_str).collect(),
            None => vec![group],
        };

        members
            .into_iter()
            .filter_map(|member| match member.parse::<ObjectKey>() {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(group, "Skipping manifest entry: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Expand every constraint into `(child, parent)` object pairs.
    ///
    /// Pairs may name objects that are not desired in a pass; callers skip
    /// those. Duplicates are kept.
    pub fn edges(&self) -> Vec<(ObjectKey, ObjectKey)> {
        let mut edges = Vec::new();
        for dependency in &self.dependencies {
            let children = self.resolve(&dependency.obj);
            let parents: Vec<ObjectKey> = dependency
                .depends_on
                .iter()
                .flat_map(|group| self.resolve(group))
                .collect();

            for child in &children {
                for parent in &parents {
                    edges.push((child.clone(), parent.clone()));
                }
            }
        }
        edges
    }
}

/// Where a pass gets its dependency manifest from.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn load(&self) -> Result<DependencyManifest, ManifestError>;
}

/// Manifest read from a YAML file on every load.
#[derive(Debug, Clone)]
pub struct FileManifestSource {
    path: PathBuf,
}

impl FileManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn load(&self) -> Result<DependencyManifest, ManifestError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ManifestError::Io {
                path: self.path.clone(),
                source,
            })?;
        DependencyManifest::from_yaml_str(&text)
    }
}

/// Manifest compiled into the binary or built in memory.
#[derive(Debug, Clone)]
pub enum StaticManifest {
    /// YAML text, typically from `include_str!`. Parsed on each load.
    Embedded(&'static str),
    Value(DependencyManifest),
}

#[async_trait]
impl ManifestSource for StaticManifest {
    async fn load(&self) -> Result<DependencyManifest, ManifestError> {
        match self {
            StaticManifest::Embedded(text) => DependencyManifest::from_yaml_str(text),
            StaticManifest::Value(manifest) => Ok(manifest.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
groupings:
  config: [ConfigMap/app, Secret/app-tls]
  backend:
    - Deployment/api
    - Service/api
dependencies:
  - obj: backend
    isDependentOn: [config]
  - obj: Deployment/web
    isDependentOn: [backend, Job/migrate]
"#;

    fn key(s: &str) -> ObjectKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let manifest = DependencyManifest::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(manifest.groups.len(), 2);
        assert_eq!(manifest.dependencies.len(), 2);
        assert_eq!(manifest.dependencies[1].depends_on, vec!["backend", "Job/migrate"]);
    }

    #[test]
    fn test_empty_document_is_empty_manifest() {
        let manifest = DependencyManifest::from_yaml_str("  \n").unwrap();
        assert_eq!(manifest, DependencyManifest::default());
    }

    #[test]
    fn test_parse_error() {
        let err = DependencyManifest::from_yaml_str("groupings: [not, a, map]").unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_)));
    }

    #[test]
    fn test_resolve_singleton_fallback() {
        let manifest = DependencyManifest::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(manifest.resolve("Job/migrate"), vec![key("Job/migrate")]);
        assert_eq!(
            manifest.resolve("config"),
            vec![key("ConfigMap/app"), key("Secret/app-tls")]
        );
        // Neither a group nor a key.
        assert!(manifest.resolve("nonsense").is_empty());
    }

    #[test]
    fn test_edges_cross_product() {
        let manifest = DependencyManifest::from_yaml_str(SAMPLE).unwrap();
        let edges = manifest.edges();

        // backend(2) x config(2) + web(1) x (backend(2) + migrate(1))
        assert_eq!(edges.len(), 7);
        assert!(edges.contains(&(key("Service/api"), key("Secret/app-tls"))));
        assert!(edges.contains(&(key("Deployment/web"), key("Job/migrate"))));
        assert!(edges.contains(&(key("Deployment/web"), key("Service/api"))));
    }

    #[test]
    fn test_builder_matches_yaml() {
        let built = DependencyManifest::default()
            .group("config", ["ConfigMap/app", "Secret/app-tls"])
            .group("backend", ["Deployment/api", "Service/api"])
            .depend("backend", ["config"])
            .depend("Deployment/web", ["backend", "Job/migrate"]);
        assert_eq!(built, DependencyManifest::from_yaml_str(SAMPLE).unwrap());

        let text = built.to_yaml_string().unwrap();
        assert!(text.contains("groupings:"));
        assert!(text.contains("isDependentOn:"));
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let manifest = FileManifestSource::new(&path).load().await.unwrap();
        assert_eq!(manifest.dependencies.len(), 2);

        let missing = FileManifestSource::new(dir.path().join("missing.yaml"));
        assert!(matches!(missing.load().await, Err(ManifestError::Io { .. })));
    }

    #[tokio::test]
    async fn test_static_sources() {
        let embedded = StaticManifest::Embedded(SAMPLE).load().await.unwrap();
        let value = StaticManifest::Value(embedded.clone()).load().await.unwrap();
        assert_eq!(embedded, value);
    }
}

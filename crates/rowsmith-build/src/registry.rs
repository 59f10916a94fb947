use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rowsmith_core::BuildError;
use rowsmith_resources::{resource_from_config, Resource, ResourceConfig};
use rowsmith_storage::HttpFetcher;
use serde::Deserialize;
use tokio::fs;

const RESERVED_PREFIX: &str = "_rowsmith_";

/// The project file: which database to build and the resources feeding it,
/// in declaration order.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRegistry {
    pub project: String,
    pub database: PathBuf,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

impl ProjectRegistry {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        if self.database.as_os_str().is_empty() {
            return Err(BuildError::Config(format!(
                "project `{}` names no database file",
                self.project
            )));
        }
        let mut seen = HashSet::new();
        for config in &self.resources {
            let name = config.name.trim();
            if name.is_empty() {
                return Err(BuildError::Config("resource with an empty name".to_string()));
            }
            if name.starts_with(RESERVED_PREFIX) {
                return Err(BuildError::Config(format!(
                    "resource `{name}` uses the reserved `{RESERVED_PREFIX}` prefix"
                )));
            }
            if !seen.insert(name) {
                return Err(BuildError::Config(format!("resource `{name}` is declared twice")));
            }
        }
        Ok(())
    }

    /// Relative database paths resolve against the project root.
    pub fn database_path(&self, root: &Path) -> PathBuf {
        if self.database.is_absolute() {
            self.database.clone()
        } else {
            root.join(&self.database)
        }
    }

    pub fn instantiate(&self, root: &Path, http: Arc<HttpFetcher>) -> Vec<Box<dyn Resource>> {
        self.resources
            .iter()
            .filter(|config| config.enabled)
            .map(|config| resource_from_config(config.clone(), root, Arc::clone(&http)))
            .collect()
    }

    pub fn declared_names(&self) -> Vec<String> {
        self.resources.iter().map(|config| config.name.clone()).collect()
    }

    pub fn disabled_names(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|config| !config.enabled)
            .map(|config| config.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsmith_storage::HttpClientConfig;

    const PROJECT: &str = r#"
project: legal
database: legal.db
resources:
  - name: docs
    natural_key: [id]
    source: { kind: json_file, path: data/docs.json }
    fragments:
      parent_key: id
      text_field: content
  - name: archive
    enabled: false
    source: { kind: json_file, path: data/archive.json }
"#;

    fn parse(text: &str) -> ProjectRegistry {
        serde_yaml::from_str(text).expect("yaml")
    }

    #[tokio::test]
    async fn loads_and_splits_enabled_from_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rowsmith.yaml");
        tokio::fs::write(&path, PROJECT).await.expect("write");

        let registry = ProjectRegistry::load(&path).await.expect("load");
        assert_eq!(registry.project, "legal");
        assert_eq!(registry.database_path(dir.path()), dir.path().join("legal.db"));
        assert_eq!(registry.disabled_names(), vec!["archive".to_string()]);
        assert_eq!(registry.declared_names(), vec!["docs".to_string(), "archive".to_string()]);

        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("client"));
        let resources = registry.instantiate(dir.path(), http);
        let names: Vec<&str> = resources.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["docs"]);
        assert_eq!(resources[0].natural_key(), ["id".to_string()]);
    }

    #[tokio::test]
    async fn missing_file_reports_its_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.yaml");
        let err = ProjectRegistry::load(&path).await.expect_err("missing");
        assert!(format!("{err:#}").contains("absent.yaml"));
    }

    #[test]
    fn duplicate_and_reserved_names_are_rejected() {
        let mut registry = parse(PROJECT);
        registry.resources[1].name = "docs".to_string();
        assert!(matches!(registry.validate(), Err(BuildError::Config(msg)) if msg.contains("twice")));

        let mut registry = parse(PROJECT);
        registry.resources[0].name = "_rowsmith_schemas".to_string();
        assert!(matches!(registry.validate(), Err(BuildError::Config(msg)) if msg.contains("reserved")));

        let mut registry = parse(PROJECT);
        registry.resources[0].name = "  ".to_string();
        assert!(registry.validate().is_err());
    }

    #[test]
    fn absolute_database_path_is_kept() {
        let mut registry = parse(PROJECT);
        registry.database = PathBuf::from("/var/data/legal.db");
        assert_eq!(
            registry.database_path(Path::new("/srv/project")),
            PathBuf::from("/var/data/legal.db")
        );
    }
}

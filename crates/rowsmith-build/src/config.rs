use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rowsmith_core::DEFAULT_SAMPLE_SIZE;
use rowsmith_storage::{BlobStore, FsBlobStore, HttpBlobStore, RemoteConfig};

use crate::orchestrator::FailurePolicy;

/// Where the database file is synced from and published to.
#[derive(Debug, Clone)]
pub enum RemoteTarget {
    Http(RemoteConfig),
    Directory(PathBuf),
}

/// Everything a build reads from the environment, read once.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub project_root: PathBuf,
    pub project_file: PathBuf,
    pub sample_size: usize,
    pub sync_timeout: Duration,
    pub sync_required: bool,
    pub failure_policy: FailurePolicy,
    pub reports_dir: Option<PathBuf>,
    pub remote: Option<RemoteTarget>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            project_file: PathBuf::from("rowsmith.yaml"),
            sample_size: DEFAULT_SAMPLE_SIZE,
            sync_timeout: Duration::from_secs(30),
            sync_required: false,
            failure_policy: FailurePolicy::ContinueOnFailure,
            reports_dir: None,
            remote: None,
        }
    }
}

impl BuildConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let continue_on_failure = lookup("ROWSMITH_CONTINUE_ON_FAILURE")
            .map(|v| is_truthy(&v))
            .unwrap_or(true);

        let remote = match (
            lookup("ROWSMITH_REMOTE_DIR"),
            lookup("ROWSMITH_REMOTE_ENDPOINT"),
            lookup("ROWSMITH_REMOTE_BUCKET"),
        ) {
            (Some(dir), _, _) => Some(RemoteTarget::Directory(PathBuf::from(dir))),
            (None, Some(endpoint), Some(bucket)) => {
                let mut remote = RemoteConfig::new(endpoint, bucket);
                remote.token = lookup("ROWSMITH_REMOTE_TOKEN");
                Some(RemoteTarget::Http(remote))
            }
            _ => None,
        };

        Self {
            project_root: lookup("ROWSMITH_PROJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.project_root),
            project_file: lookup("ROWSMITH_PROJECT_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.project_file),
            sample_size: lookup("ROWSMITH_SAMPLE_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.sample_size),
            sync_timeout: lookup("ROWSMITH_SYNC_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sync_timeout),
            sync_required: lookup("ROWSMITH_SYNC_REQUIRED")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            failure_policy: if continue_on_failure {
                FailurePolicy::ContinueOnFailure
            } else {
                FailurePolicy::StopOnFirstFailure
            },
            reports_dir: lookup("ROWSMITH_REPORTS_DIR").map(PathBuf::from),
            remote,
        }
    }

    pub fn project_path(&self) -> PathBuf {
        self.project_root.join(&self.project_file)
    }

    pub fn blob_store(&self) -> anyhow::Result<Option<Arc<dyn BlobStore>>> {
        Ok(match &self.remote {
            None => None,
            Some(RemoteTarget::Directory(dir)) => Some(Arc::new(FsBlobStore::new(dir.clone()))),
            Some(RemoteTarget::Http(remote)) => Some(Arc::new(HttpBlobStore::new(remote.clone())?)),
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rowsmith_core::{BuildError, ResourceError, DEFAULT_SAMPLE_SIZE};
use rowsmith_resources::Resource;
use rowsmith_storage::{database_blob_path, write_atomically, BlobStore, Database};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};

use crate::new_build_id;
use crate::runner::{BuildContext, ResourceOutcome, ResourceRunner};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Attempt every resource and report all failures at the end.
    #[default]
    ContinueOnFailure,
    /// Skip the remaining resources after the first failed one.
    StopOnFirstFailure,
}

/// Shared flag checked between resources. A producer already running is
/// never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub force_schema_reset: bool,
    pub sync_before_build: bool,
    /// Build only these resources, in declaration order. `None` builds all.
    pub resources: Option<Vec<String>>,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Init,
    Sync,
    Processing,
    Finalized,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    NotRequested,
    NoRemoteConfigured,
    Downloaded { bytes: u64 },
    RemoteAbsent,
    TimedOut,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build_id: String,
    pub database: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sync: SyncOutcome,
    pub outcomes: Vec<ResourceOutcome>,
    pub success: bool,
    pub cancelled: bool,
}

impl BuildReport {
    pub fn outcome(&self, resource: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.resource == resource)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }
}

enum Planned<'r> {
    Run(&'r dyn Resource),
    Disabled(String),
    Unknown(String),
}

/// Sequences resources against one database file:
/// `INIT -> (SYNC) -> PROCESSING* -> FINALIZED | ABORTED`.
pub struct BuildOrchestrator {
    database_path: PathBuf,
    resources: Vec<Box<dyn Resource>>,
    disabled: Vec<String>,
    declared: Vec<String>,
    blob: Option<Arc<dyn BlobStore>>,
    sample_size: usize,
    sync_timeout: Duration,
    sync_required: bool,
    failure_policy: FailurePolicy,
}

impl BuildOrchestrator {
    pub fn new(database_path: impl Into<PathBuf>, resources: Vec<Box<dyn Resource>>) -> Self {
        Self {
            database_path: database_path.into(),
            resources,
            disabled: Vec::new(),
            declared: Vec::new(),
            blob: None,
            sample_size: DEFAULT_SAMPLE_SIZE,
            sync_timeout: Duration::from_secs(30),
            sync_required: false,
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_blob_store(mut self, blob: Arc<dyn BlobStore>) -> Self {
        self.blob = Some(blob);
        self
    }

    /// Declared but disabled resources; reported as skipped.
    pub fn with_disabled(mut self, names: Vec<String>) -> Self {
        self.disabled = names;
        self
    }

    /// Every declared name, enabled or not, in project file order. Names
    /// missing from it run after the declared ones.
    pub fn with_declaration_order(mut self, names: Vec<String>) -> Self {
        self.declared = names;
        self
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Make a remote transport failure during sync abort the build.
    pub fn with_sync_required(mut self, required: bool) -> Self {
        self.sync_required = required;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name()).collect()
    }

    /// `Err` only when the build is aborted: the database cannot be opened or
    /// written, or a mandatory sync failed in transport.
    pub async fn build(&self, request: BuildRequest) -> Result<BuildReport, BuildError> {
        let build_id = new_build_id();
        let span = info_span!("build", build_id = %build_id);
        self.run_build(build_id, request).instrument(span).await
    }

    async fn run_build(
        &self,
        build_id: String,
        request: BuildRequest,
    ) -> Result<BuildReport, BuildError> {
        let started_at = Utc::now();
        enter(BuildPhase::Init);
        if let Some(parent) = self
            .database_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.aborted(self.storage_access(err.to_string())))?;
        }

        let sync = if request.sync_before_build {
            enter(BuildPhase::Sync);
            self.sync_database().await.map_err(|err| self.aborted(err))?
        } else {
            SyncOutcome::NotRequested
        };

        let db = Database::open(&self.database_path)
            .await
            .map_err(|err| self.aborted(self.storage_access(err.to_string())))?;

        enter(BuildPhase::Processing);
        let runner = ResourceRunner::new(&db, self.sample_size, request.force_schema_reset);
        let mut context = BuildContext::default();
        let mut outcomes = Vec::new();
        let mut cancelled = false;
        let mut halted = false;

        for planned in self.plan(request.resources.as_deref()) {
            let name = match &planned {
                Planned::Run(resource) => resource.name().to_string(),
                Planned::Disabled(name) | Planned::Unknown(name) => name.clone(),
            };
            if request.cancel.is_cancelled() {
                if !cancelled {
                    warn!(next = %name, "build cancelled; remaining resources skipped");
                }
                cancelled = true;
                outcomes.push(ResourceOutcome::skipped(&name, "build cancelled"));
                continue;
            }
            if halted {
                outcomes.push(ResourceOutcome::skipped(&name, "stopped after an earlier failure"));
                continue;
            }

            let outcome = match planned {
                Planned::Run(resource) => match runner.run(resource, &build_id, &mut context).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        db.close().await;
                        return Err(self.aborted(err));
                    }
                },
                Planned::Disabled(name) => {
                    info!(resource = %name, "resource disabled; skipped");
                    ResourceOutcome::skipped(&name, "disabled")
                }
                Planned::Unknown(name) => {
                    error!(resource = %name, "unknown resource requested");
                    ResourceOutcome::failed(
                        &name,
                        Vec::new(),
                        ResourceError::UnknownResource {
                            resource: name.clone(),
                        },
                        0,
                    )
                }
            };
            if outcome.is_failed() && self.failure_policy == FailurePolicy::StopOnFirstFailure {
                halted = true;
            }
            outcomes.push(outcome);
        }
        db.close().await;

        let failed = outcomes.iter().filter(|o| o.is_failed()).count();
        let success = failed == 0 && !cancelled;
        enter(BuildPhase::Finalized);
        info!(
            resources = outcomes.len(),
            failed,
            cancelled,
            success,
            "build finished"
        );

        Ok(BuildReport {
            build_id,
            database: self.database_path.display().to_string(),
            started_at,
            finished_at: Utc::now(),
            sync,
            outcomes,
            success,
            cancelled,
        })
    }

    /// Declaration order always wins; a subset only filters it. Names matching
    /// nothing are appended so they show up as failures.
    fn plan(&self, subset: Option<&[String]>) -> Vec<Planned<'_>> {
        let wanted = |name: &str| subset.map_or(true, |names| names.iter().any(|n| n == name));
        let mut order: Vec<&str> = Vec::new();
        let names = self
            .declared
            .iter()
            .map(String::as_str)
            .chain(self.resources.iter().map(|r| r.name()))
            .chain(self.disabled.iter().map(String::as_str));
        for name in names {
            if !order.contains(&name) {
                order.push(name);
            }
        }

        let mut planned = Vec::new();
        for name in order.into_iter().filter(|name| wanted(name)) {
            if let Some(resource) = self.resources.iter().find(|r| r.name() == name) {
                planned.push(Planned::Run(resource.as_ref()));
            } else if self.disabled.iter().any(|d| d == name) {
                planned.push(Planned::Disabled(name.to_string()));
            }
        }

        if let Some(names) = subset {
            for name in names {
                let known = self.resources.iter().any(|r| r.name() == name)
                    || self.disabled.contains(name);
                if !known {
                    planned.push(Planned::Unknown(name.clone()));
                }
            }
        }
        planned
    }

    async fn sync_database(&self) -> Result<SyncOutcome, BuildError> {
        let Some(blob) = &self.blob else {
            if self.sync_required {
                return Err(BuildError::RemoteSync(
                    "sync requested but no remote is configured".to_string(),
                ));
            }
            warn!("sync requested but no remote is configured; using local database");
            return Ok(SyncOutcome::NoRemoteConfigured);
        };

        let remote_path = database_blob_path(&self.database_path);
        match tokio::time::timeout(self.sync_timeout, blob.get(&remote_path)).await {
            Err(_) => {
                warn!(path = %remote_path, timeout_secs = self.sync_timeout.as_secs(), "remote sync timed out; treating remote copy as absent");
                Ok(SyncOutcome::TimedOut)
            }
            Ok(Ok(None)) => {
                info!(path = %remote_path, "no remote copy; using local database");
                Ok(SyncOutcome::RemoteAbsent)
            }
            Ok(Ok(Some(bytes))) => {
                write_atomically(&self.database_path, &bytes)
                    .await
                    .map_err(|err| self.storage_access(format!("{err:#}")))?;
                info!(path = %remote_path, bytes = bytes.len(), "replaced local database with remote copy");
                Ok(SyncOutcome::Downloaded {
                    bytes: bytes.len() as u64,
                })
            }
            Ok(Err(err)) if self.sync_required => Err(BuildError::RemoteSync(err.to_string())),
            Ok(Err(err)) => {
                warn!(error = %err, "remote sync failed; continuing with local database");
                Ok(SyncOutcome::Failed {
                    message: err.to_string(),
                })
            }
        }
    }

    fn storage_access(&self, message: String) -> BuildError {
        BuildError::StorageAccess {
            path: self.database_path.display().to_string(),
            message,
        }
    }

    fn aborted(&self, err: BuildError) -> BuildError {
        enter(BuildPhase::Aborted);
        error!(error = %err, "build aborted");
        err
    }
}

fn enter(phase: BuildPhase) {
    info!(phase = ?phase, "build phase");
}

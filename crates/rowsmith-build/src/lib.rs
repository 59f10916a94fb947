//! Build pipeline: project registry, per-resource runner, orchestrator, publish.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rowsmith_core::{FreshnessEntry, SchemaLedgerEntry};
use rowsmith_storage::{database_blob_path, BlobStore, Database, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod runner;

pub use config::{BuildConfig, RemoteTarget};
pub use orchestrator::{
    BuildOrchestrator, BuildPhase, BuildReport, BuildRequest, CancelFlag, FailurePolicy,
    SyncOutcome,
};
pub use registry::ProjectRegistry;
pub use report::{render_summary, write_report};
pub use runner::{
    BuildContext, ResourceOutcome, ResourceRunner, ResourceStatus, TableOutcome, TableStatus,
};

pub const CRATE_NAME: &str = "rowsmith-build";

/// `build_<YYYYmmdd_HHMMSS>_<8 hex>`, sortable by start time.
pub fn new_build_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("build_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Upload the database file to the well-known path the sync step reads.
pub async fn publish_database(blob: &dyn BlobStore, database_path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(database_path)
        .await
        .with_context(|| format!("reading {}", database_path.display()))?;
    let remote_path = database_blob_path(database_path);
    blob.put(&remote_path, &bytes)
        .await
        .with_context(|| format!("uploading {}", remote_path))?;
    info!(path = %remote_path, bytes = bytes.len(), "database published");
    Ok(remote_path)
}

/// Load the project file named by `config` and build it.
pub async fn run_build(config: &BuildConfig, request: BuildRequest) -> Result<BuildReport> {
    let registry = ProjectRegistry::load(&config.project_path()).await?;
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default())?);

    let mut orchestrator = BuildOrchestrator::new(
        registry.database_path(&config.project_root),
        registry.instantiate(&config.project_root, http),
    )
    .with_disabled(registry.disabled_names())
    .with_declaration_order(registry.declared_names())
    .with_sample_size(config.sample_size)
    .with_sync_timeout(config.sync_timeout)
    .with_sync_required(config.sync_required)
    .with_failure_policy(config.failure_policy);
    if let Some(blob) = config.blob_store()? {
        orchestrator = orchestrator.with_blob_store(blob);
    }

    let report = orchestrator
        .build(request)
        .await
        .with_context(|| format!("building project `{}`", registry.project))?;

    if let Some(dir) = &config.reports_dir {
        let written = write_report(&report, dir).await?;
        info!(dir = %written.display(), "build report written");
    }
    Ok(report)
}

pub async fn run_build_from_env(request: BuildRequest) -> Result<BuildReport> {
    run_build(&BuildConfig::from_env(), request).await
}

pub async fn deploy(config: &BuildConfig) -> Result<String> {
    let registry = ProjectRegistry::load(&config.project_path()).await?;
    let blob = config
        .blob_store()?
        .context("deploy needs ROWSMITH_REMOTE_DIR or ROWSMITH_REMOTE_ENDPOINT and ROWSMITH_REMOTE_BUCKET")?;
    publish_database(blob.as_ref(), &registry.database_path(&config.project_root)).await
}

pub async fn deploy_from_env() -> Result<String> {
    deploy(&BuildConfig::from_env()).await
}

/// Ledger contents of the project database.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub database: PathBuf,
    pub schemas: Vec<SchemaLedgerEntry>,
    pub freshness: Vec<FreshnessEntry>,
}

impl ProjectStatus {
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty() && self.freshness.is_empty()
    }
}

pub async fn project_status(config: &BuildConfig) -> Result<ProjectStatus> {
    let registry = ProjectRegistry::load(&config.project_path()).await?;
    status_of(&registry.database_path(&config.project_root)).await
}

pub async fn status_from_env() -> Result<ProjectStatus> {
    project_status(&BuildConfig::from_env()).await
}

/// A database that has never been built yields an empty status rather
/// than being created.
pub async fn status_of(database_path: &Path) -> Result<ProjectStatus> {
    if !tokio::fs::try_exists(database_path).await.unwrap_or(false) {
        warn!(path = %database_path.display(), "database not built yet");
        return Ok(ProjectStatus {
            database: database_path.to_path_buf(),
            schemas: Vec::new(),
            freshness: Vec::new(),
        });
    }
    let db = Database::open(database_path)
        .await
        .with_context(|| format!("opening {}", database_path.display()))?;
    let schemas = db.schema_ledger().all().await.context("reading schema ledger")?;
    let freshness = db
        .freshness_ledger()
        .all()
        .await
        .context("reading freshness ledger")?;
    db.close().await;
    Ok(ProjectStatus {
        database: database_path.to_path_buf(),
        schemas,
        freshness,
    })
}

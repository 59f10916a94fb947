//! Applies one resource's batches to its tables under the schema ledger's rules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rowsmith_core::{
    BuildError, Classification, FreshnessEntry, RecordBatch, ResourceError, SchemaSignature,
};
use rowsmith_resources::Resource;
use rowsmith_storage::{
    add_missing_columns, count_rows, create_table, delete_groups, drop_table, ensure_unique_key,
    insert_records, table_exists, Database, SchemaAcknowledgement, StoreError, TableHandle,
};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Raw main batches of the resources processed so far in one build, keyed by
/// resource name. An entry lives only while its resource is being processed.
#[derive(Debug, Default)]
pub struct BuildContext {
    batches: HashMap<String, Arc<RecordBatch>>,
}

impl BuildContext {
    pub fn insert(&mut self, resource: &str, batch: Arc<RecordBatch>) {
        self.batches.insert(resource.to_string(), batch);
    }

    pub fn get(&self, resource: &str) -> Option<Arc<RecordBatch>> {
        self.batches.get(resource).cloned()
    }

    pub fn discard(&mut self, resource: &str) {
        self.batches.remove(resource);
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// First batch ever accepted; schema locked at version 1.
    New,
    Unchanged,
    Migrated,
    Reset,
    /// Empty batch; nothing written.
    Skipped,
}

impl TableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Unchanged => "unchanged",
            Self::Migrated => "migrated",
            Self::Reset => "reset",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub status: TableStatus,
    pub version: Option<i64>,
    pub records_written: u64,
    pub row_count: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns_added: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Success,
    Skipped,
    Failed,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    pub resource: String,
    pub status: ResourceStatus,
    pub tables: Vec<TableOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResourceError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub duration_ms: i64,
}

impl ResourceOutcome {
    fn applied(resource: &str, tables: Vec<TableOutcome>, duration_ms: i64) -> Self {
        let status = if tables.iter().all(|t| t.status == TableStatus::Skipped) {
            ResourceStatus::Skipped
        } else {
            ResourceStatus::Success
        };
        Self {
            resource: resource.to_string(),
            status,
            tables,
            error: None,
            suggestion: None,
            skip_reason: None,
            duration_ms,
        }
    }

    pub fn failed(
        resource: &str,
        tables: Vec<TableOutcome>,
        error: ResourceError,
        duration_ms: i64,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            status: ResourceStatus::Failed,
            tables,
            suggestion: error.suggestion().map(str::to_string),
            error: Some(error),
            skip_reason: None,
            duration_ms,
        }
    }

    pub fn skipped(resource: &str, reason: impl Into<String>) -> Self {
        Self {
            resource: resource.to_string(),
            status: ResourceStatus::Skipped,
            tables: Vec::new(),
            error: None,
            suggestion: None,
            skip_reason: Some(reason.into()),
            duration_ms: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ResourceStatus::Failed
    }

    pub fn table(&self, name: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.table == name)
    }
}

enum ApplyError {
    Resource(ResourceError),
    Fatal(BuildError),
}

impl From<ResourceError> for ApplyError {
    fn from(err: ResourceError) -> Self {
        Self::Resource(err)
    }
}

/// How a batch lands in its table. Decided before any write happens.
enum WritePlan {
    Lock,
    Keep { version: i64 },
    Migrate,
    Reset,
}

impl WritePlan {
    fn status(&self) -> TableStatus {
        match self {
            Self::Lock => TableStatus::New,
            Self::Keep { .. } => TableStatus::Unchanged,
            Self::Migrate => TableStatus::Migrated,
            Self::Reset => TableStatus::Reset,
        }
    }
}

struct TableJob<'j> {
    table: &'j str,
    batch: RecordBatch,
    natural_key: &'j [String],
    group_column: Option<&'j str>,
    existing: Option<&'j TableHandle>,
}

struct Applied {
    version: i64,
    records_written: u64,
    row_count: i64,
    columns_added: Vec<String>,
}

/// Runs one resource at a time against the build's database.
///
/// Producers and migration callables are awaited before a table's
/// transaction opens; the transaction then covers DDL, inserts and both
/// ledger writes, so a failed table leaves no partial state behind.
#[derive(Debug)]
pub struct ResourceRunner<'db> {
    db: &'db Database,
    sample_size: usize,
    force_schema_reset: bool,
}

impl<'db> ResourceRunner<'db> {
    pub fn new(db: &'db Database, sample_size: usize, force_schema_reset: bool) -> Self {
        Self {
            db,
            sample_size: sample_size.max(1),
            force_schema_reset,
        }
    }

    /// Resource-local failures come back as a failed outcome. `Err` means the
    /// database itself is unusable and the build must stop.
    pub async fn run(
        &self,
        resource: &dyn Resource,
        build_id: &str,
        context: &mut BuildContext,
    ) -> Result<ResourceOutcome, BuildError> {
        let name = resource.name().to_string();
        let span = info_span!("resource", resource = %name);
        let outcome = self
            .run_resource(resource, build_id, context)
            .instrument(span)
            .await;
        context.discard(&name);
        outcome
    }

    async fn run_resource(
        &self,
        resource: &dyn Resource,
        build_id: &str,
        context: &mut BuildContext,
    ) -> Result<ResourceOutcome, BuildError> {
        let started = Instant::now();
        let name = resource.name();
        let mut tables = Vec::new();

        match self
            .run_tables(resource, build_id, context, started, &mut tables)
            .await
        {
            Ok(()) => {
                let outcome = ResourceOutcome::applied(name, tables, elapsed_ms(started));
                info!(status = ?outcome.status, duration_ms = outcome.duration_ms, "resource done");
                Ok(outcome)
            }
            Err(ApplyError::Resource(err)) => {
                error!(error = %err, "resource failed");
                Ok(ResourceOutcome::failed(name, tables, err, elapsed_ms(started)))
            }
            Err(ApplyError::Fatal(err)) => Err(err),
        }
    }

    async fn run_tables(
        &self,
        resource: &dyn Resource,
        build_id: &str,
        context: &mut BuildContext,
        started: Instant,
        tables: &mut Vec<TableOutcome>,
    ) -> Result<(), ApplyError> {
        let name = resource.name();
        let existing = self
            .db
            .existing_table(name)
            .await
            .map_err(|err| self.store_failure(name, err))?;

        let raw = resource
            .fetch_data(existing.as_ref())
            .run()
            .await
            .map_err(|err| producer_failure(name, err))?;
        let raw = Arc::new(raw);
        context.insert(name, Arc::clone(&raw));
        let batch = resource
            .transform_data(raw.as_ref().clone())
            .map_err(|err| producer_failure(name, err))?;
        debug!(records = batch.len(), "main batch ready");

        let main = self
            .apply_table(
                resource,
                TableJob {
                    table: name,
                    batch,
                    natural_key: resource.natural_key(),
                    group_column: None,
                    existing: existing.as_ref(),
                },
                build_id,
                started,
            )
            .await?;
        tables.push(main);

        let fragments_table = resource.fragments_table();
        let existing_fragments = self
            .db
            .existing_table(&fragments_table)
            .await
            .map_err(|err| self.store_failure(&fragments_table, err))?;
        let Some(task) = resource.fetch_fragments(existing_fragments.as_ref(), context.get(name))
        else {
            return Ok(());
        };
        let raw = task.run().await.map_err(|err| producer_failure(name, err))?;
        let batch = resource
            .transform_fragments(raw)
            .map_err(|err| producer_failure(name, err))?;
        debug!(records = batch.len(), "fragments batch ready");

        let fragments = self
            .apply_table(
                resource,
                TableJob {
                    table: &fragments_table,
                    batch,
                    natural_key: resource.fragments_natural_key(),
                    group_column: resource.fragments_group_column(),
                    existing: existing_fragments.as_ref(),
                },
                build_id,
                started,
            )
            .await?;
        tables.push(fragments);
        Ok(())
    }

    async fn apply_table(
        &self,
        resource: &dyn Resource,
        job: TableJob<'_>,
        build_id: &str,
        started: Instant,
    ) -> Result<TableOutcome, ApplyError> {
        let TableJob {
            table,
            batch,
            natural_key,
            group_column,
            existing,
        } = job;
        let ledger = self.db.schema_ledger();

        if batch.is_empty() {
            let stored = ledger
                .get(table)
                .await
                .map_err(|err| self.store_failure(table, err))?;
            let row_count = match existing {
                Some(handle) => handle
                    .count()
                    .await
                    .map_err(|err| self.store_failure(table, err))?,
                None => 0,
            };
            warn!(table, "producer returned no records; table left untouched");
            return Ok(TableOutcome {
                table: table.to_string(),
                status: TableStatus::Skipped,
                version: stored.map(|entry| entry.version),
                records_written: 0,
                row_count,
                columns_added: Vec::new(),
            });
        }

        let signature = SchemaSignature::infer(&batch, self.sample_size);
        if signature.is_empty() {
            return Err(ResourceError::EmptySchema {
                table: table.to_string(),
            }
            .into());
        }
        // Columns first seen past the sample still get created; they are not
        // part of the locked signature.
        let mut columns = signature.clone();
        columns.extend_missing(&SchemaSignature::infer(&batch, batch.len()));
        if let Some(missing) = natural_key
            .iter()
            .map(String::as_str)
            .chain(group_column)
            .find(|column| !columns.contains(column))
        {
            return Err(ResourceError::InvalidOutput {
                table: table.to_string(),
                message: format!("key column '{missing}' is absent from the batch"),
            }
            .into());
        }
        debug!(table, columns = columns.len(), fingerprint = %signature.fingerprint(), "signature inferred");

        let classification = ledger
            .classify(table, &signature)
            .await
            .map_err(|err| self.store_failure(table, err))?;
        let plan = match classification {
            Classification::New => WritePlan::Lock,
            Classification::Unchanged(entry) => WritePlan::Keep {
                version: entry.version,
            },
            Classification::Conflict(entry) => {
                let delta = entry.signature.diff(&signature);
                if self.force_schema_reset {
                    warn!(table, stored_version = entry.version, %delta, "schema changed; resetting table");
                    WritePlan::Reset
                } else {
                    let handle = existing.cloned().unwrap_or_else(|| self.db.table(table));
                    let Some(migration) = resource.migrate_schema(&handle, &delta) else {
                        warn!(table, stored_version = entry.version, %delta, "schema conflict");
                        return Err(ResourceError::SchemaConflict {
                            table: table.to_string(),
                            stored_version: entry.version,
                            delta: delta.clone(),
                        }
                        .into());
                    };
                    match migration.run().await {
                        Ok(true) => {
                            info!(table, stored_version = entry.version, %delta, "migration accepted new schema");
                            WritePlan::Migrate
                        }
                        Ok(false) => {
                            return Err(ResourceError::MigrationFailed {
                                table: table.to_string(),
                                reason: "migration callable returned false".to_string(),
                            }
                            .into())
                        }
                        Err(err) => {
                            return Err(ResourceError::MigrationFailed {
                                table: table.to_string(),
                                reason: format!("{err:#}"),
                            }
                            .into())
                        }
                    }
                }
            }
        };

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|err| self.store_failure(table, err))?;
        let applied = self
            .write_table(
                &mut tx,
                table,
                &plan,
                &signature,
                &columns,
                &batch,
                natural_key,
                group_column,
                build_id,
                started,
            )
            .await
            .map_err(|err| self.store_failure(table, err))?;
        tx.commit()
            .await
            .map_err(|err| self.store_failure(table, StoreError::from(err)))?;

        let status = plan.status();
        info!(
            table,
            status = ?status,
            version = applied.version,
            written = applied.records_written,
            rows = applied.row_count,
            "table applied"
        );
        Ok(TableOutcome {
            table: table.to_string(),
            status,
            version: Some(applied.version),
            records_written: applied.records_written,
            row_count: applied.row_count,
            columns_added: applied.columns_added,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_table(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        plan: &WritePlan,
        signature: &SchemaSignature,
        columns: &SchemaSignature,
        batch: &RecordBatch,
        natural_key: &[String],
        group_column: Option<&str>,
        build_id: &str,
        started: Instant,
    ) -> Result<Applied, StoreError> {
        let mut columns_added = Vec::new();
        if matches!(plan, WritePlan::Reset) {
            drop_table(conn, table).await?;
            create_table(conn, table, columns, natural_key).await?;
        } else if table_exists(conn, table).await? {
            columns_added = add_missing_columns(conn, table, columns).await?;
            ensure_unique_key(conn, table, natural_key).await?;
            if let Some(column) = group_column {
                delete_groups(conn, table, column, batch).await?;
            }
        } else {
            create_table(conn, table, columns, natural_key).await?;
        }

        let records_written = insert_records(conn, table, batch, natural_key).await?;

        let ledger = self.db.schema_ledger();
        let version = match plan {
            WritePlan::Lock => {
                ledger
                    .commit(conn, table, signature, SchemaAcknowledgement::FirstLock)
                    .await?
            }
            WritePlan::Keep { version } => *version,
            WritePlan::Migrate => {
                ledger
                    .commit(conn, table, signature, SchemaAcknowledgement::Migrated)
                    .await?
            }
            WritePlan::Reset => {
                ledger
                    .commit(conn, table, signature, SchemaAcknowledgement::ForcedReset)
                    .await?
            }
        };

        let row_count = count_rows(conn, table).await?;
        self.db
            .freshness_ledger()
            .record(
                conn,
                &FreshnessEntry {
                    table_name: table.to_string(),
                    last_updated: Utc::now(),
                    record_count: row_count,
                    build_id: build_id.to_string(),
                    duration_ms: elapsed_ms(started),
                },
            )
            .await?;

        Ok(Applied {
            version,
            records_written,
            row_count,
            columns_added,
        })
    }

    fn store_failure(&self, table: &str, err: StoreError) -> ApplyError {
        if err.is_fatal() {
            return ApplyError::Fatal(BuildError::StorageAccess {
                path: self.db.path().display().to_string(),
                message: err.to_string(),
            });
        }
        ApplyError::Resource(match err {
            StoreError::MissingKeyColumn { table, column } => ResourceError::InvalidOutput {
                table,
                message: format!("natural key column '{column}' is missing or null in a record"),
            },
            StoreError::EmptySchema { table } => ResourceError::EmptySchema { table },
            other => ResourceError::TableWrite {
                table: table.to_string(),
                message: other.to_string(),
            },
        })
    }
}

fn producer_failure(resource: &str, err: anyhow::Error) -> ApplyError {
    ApplyError::Resource(ResourceError::ProducerExecution {
        resource: resource.to_string(),
        message: format!("{err:#}"),
    })
}

pub(crate) fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsmith_core::record;
    use rowsmith_resources::FnResource;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn context_entries_are_discarded() {
        let mut context = BuildContext::default();
        context.insert("docs", Arc::new(vec![record([("id", json!(1))])]));
        assert_eq!(context.get("docs").map(|b| b.len()), Some(1));
        context.discard("docs");
        assert!(context.is_empty());
    }

    #[test]
    fn failed_outcome_carries_suggestion() {
        let outcome = ResourceOutcome::failed(
            "r",
            Vec::new(),
            ResourceError::MigrationFailed {
                table: "r".into(),
                reason: "no".into(),
            },
            3,
        );
        assert!(outcome.is_failed());
        assert!(outcome.suggestion.is_some());
    }

    #[tokio::test]
    async fn empty_first_batch_creates_nothing() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("r.db")).await.expect("open");
        let runner = ResourceRunner::new(&db, 100, false);
        let resource = FnResource::from_sync("empty", |_| Ok(Vec::new()));
        let mut context = BuildContext::default();

        let outcome = runner.run(&resource, "b1", &mut context).await.expect("run");
        assert_eq!(outcome.status, ResourceStatus::Skipped);
        assert_eq!(outcome.tables[0].status, TableStatus::Skipped);
        assert_eq!(outcome.tables[0].version, None);
        assert!(db.existing_table("empty").await.expect("lookup").is_none());
        assert!(db.freshness_ledger().get("empty").await.expect("get").is_none());
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn producer_error_is_a_failed_outcome() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("r.db")).await.expect("open");
        let runner = ResourceRunner::new(&db, 100, false);
        let resource = FnResource::from_async("broken", |_| async {
            Err(anyhow::anyhow!("upstream returned 503"))
        });

        let outcome = runner
            .run(&resource, "b1", &mut BuildContext::default())
            .await
            .expect("run");
        assert!(outcome.is_failed());
        assert!(matches!(
            outcome.error,
            Some(ResourceError::ProducerExecution { ref message, .. }) if message.contains("503")
        ));
        assert!(outcome.tables.is_empty());
    }

    #[tokio::test]
    async fn missing_key_column_is_invalid_output() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("r.db")).await.expect("open");
        let runner = ResourceRunner::new(&db, 100, false);
        let resource = FnResource::from_sync("keyed", |_| Ok(vec![record([("name", json!("x"))])]))
            .with_natural_key(["id"]);

        let outcome = runner
            .run(&resource, "b1", &mut BuildContext::default())
            .await
            .expect("run");
        assert!(matches!(outcome.error, Some(ResourceError::InvalidOutput { .. })));
        assert!(db.existing_table("keyed").await.expect("lookup").is_none());
        assert!(db.schema_ledger().get("keyed").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn columns_past_the_sample_are_created_but_not_locked() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("r.db")).await.expect("open");
        let runner = ResourceRunner::new(&db, 1, false);

        let first = FnResource::from_sync("rows", |_| {
            Ok(vec![
                record([("id", json!(1))]),
                record([("id", json!(2)), ("late", json!("x"))]),
            ])
        });
        let outcome = runner
            .run(&first, "b1", &mut BuildContext::default())
            .await
            .expect("run");
        assert_eq!(outcome.tables[0].status, TableStatus::New);
        let columns: Vec<String> = db
            .table("rows")
            .columns()
            .await
            .expect("columns")
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(columns.contains(&"late".to_string()));
        let stored = db.schema_ledger().get("rows").await.expect("get").expect("entry");
        assert!(!stored.signature.contains("late"));
    }
}

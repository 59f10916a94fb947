//! SQLite storage, schema/freshness ledgers and remote blob access for rowsmith.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};

mod blob;
mod http;
mod ledger;
mod table;

pub use blob::{
    database_blob_path, write_atomically, BlobError, BlobStore, FsBlobStore, HttpBlobStore,
    RemoteConfig,
};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use ledger::{
    FreshnessLedger, SchemaAcknowledgement, SchemaHistoryEntry, SchemaLedger,
    FRESHNESS_LEDGER_TABLE, SCHEMA_HISTORY_TABLE, SCHEMA_LEDGER_TABLE,
};
pub use table::{
    add_missing_columns, count_rows, create_table, delete_groups, drop_table, ensure_unique_key,
    insert_records, quote_ident, table_columns, table_exists, TableColumn, TableHandle,
};

pub const CRATE_NAME: &str = "rowsmith-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("ledger row for '{table}' is unreadable: {message}")]
    CorruptLedger { table: String, message: String },
    #[error("refusing to replace schema of '{table}' (version {version}) without an explicit resolution")]
    UnacknowledgedSchemaChange { table: String, version: i64 },
    #[error("cannot lock a schema for '{table}' from an empty batch")]
    EmptySchema { table: String },
    #[error("natural key column '{column}' missing from a record for '{table}'")]
    MissingKeyColumn { table: String, column: String },
    #[error("'{table}' already holds {groups} group(s) of rows sharing a natural key ({columns}); remove the duplicates or rerun with force schema reset")]
    DuplicateKeyRows {
        table: String,
        columns: String,
        groups: i64,
    },
}

// Primary result codes that mean the database file itself is unusable.
const SQLITE_READONLY: i32 = 8;
const SQLITE_IOERR: i32 = 10;
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_FULL: i32 = 13;
const SQLITE_CANTOPEN: i32 = 14;
const SQLITE_NOTADB: i32 = 26;

impl StoreError {
    /// Whether the failure concerns the database file rather than one statement.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Sql(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::Configuration(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db_err) => db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| {
                        matches!(
                            code & 0xff,
                            SQLITE_READONLY
                                | SQLITE_IOERR
                                | SQLITE_CORRUPT
                                | SQLITE_FULL
                                | SQLITE_CANTOPEN
                                | SQLITE_NOTADB
                        )
                    })
                    .unwrap_or(false),
                _ => false,
            },
            _ => false,
        }
    }
}

/// The build's database file. A single pooled connection owns it for the
/// lifetime of the value.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    pool: SqlitePool,
}

impl Database {
    /// Open or create the database file and make sure the ledger tables exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Rollback journal keeps the database in one file, which is what gets uploaded.
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { path, pool };
        db.schema_ledger().ensure().await?;
        db.freshness_ledger().ensure().await?;
        info!(path = %db.path.display(), "database opened");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Handle for `name`, whether or not the table exists yet.
    pub fn table(&self, name: &str) -> TableHandle {
        TableHandle::new(self.pool.clone(), name)
    }

    /// Handle for `name` only if the table already exists.
    pub async fn existing_table(&self, name: &str) -> Result<Option<TableHandle>, StoreError> {
        let handle = self.table(name);
        Ok(if handle.exists().await? { Some(handle) } else { None })
    }

    pub fn schema_ledger(&self) -> SchemaLedger {
        SchemaLedger::new(self.pool.clone())
    }

    pub fn freshness_ledger(&self) -> FreshnessLedger {
        FreshnessLedger::new(self.pool.clone())
    }

    /// Start the transaction one table's apply step runs in.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// User tables, excluding the ledgers and SQLite internals.
    pub async fn user_tables(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '\\_rowsmith\\_%' ESCAPE '\\' \
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        debug!(count = names.len(), "listed user tables");
        Ok(names)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_file_and_ledgers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("project.db");
        let db = Database::open(&path).await.expect("open");
        assert!(path.exists());

        let ledgers: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '\\_rowsmith%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .expect("list");
        assert_eq!(
            ledgers,
            vec![
                SCHEMA_HISTORY_TABLE.to_string(),
                SCHEMA_LEDGER_TABLE.to_string(),
                FRESHNESS_LEDGER_TABLE.to_string(),
            ]
        );
        assert!(db.user_tables().await.expect("user tables").is_empty());
        assert!(db.existing_table("docs").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn opening_a_non_database_file_fails() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0x42u8; 4096]).expect("write garbage");
        assert!(Database::open(&path).await.is_err());
    }

    #[test]
    fn unacknowledged_change_is_not_fatal() {
        let err = StoreError::UnacknowledgedSchemaChange {
            table: "t".into(),
            version: 2,
        };
        assert!(!err.is_fatal());
    }
}

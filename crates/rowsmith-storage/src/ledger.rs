//! Persistent schema and freshness ledgers kept alongside the user tables.

use chrono::{DateTime, Utc};
use rowsmith_core::{Classification, FreshnessEntry, SchemaLedgerEntry, SchemaSignature};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::StoreError;

pub const SCHEMA_LEDGER_TABLE: &str = "_rowsmith_schemas";
pub const SCHEMA_HISTORY_TABLE: &str = "_rowsmith_schema_history";
pub const FRESHNESS_LEDGER_TABLE: &str = "_rowsmith_updates";

/// Why a signature is being written to the ledger.
///
/// Replacing a stored fingerprint requires `Migrated` or `ForcedReset`;
/// `FirstLock` only ever creates version 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaAcknowledgement {
    FirstLock,
    Migrated,
    ForcedReset,
}

impl SchemaAcknowledgement {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstLock => "first_lock",
            Self::Migrated => "migrated",
            Self::ForcedReset => "forced_reset",
        }
    }
}

/// One accepted signature version, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaHistoryEntry {
    pub table_name: String,
    pub version: i64,
    pub signature_hash: String,
    pub acknowledgement: String,
    pub recorded_at: DateTime<Utc>,
}

type SchemaRow = (String, i64, String, String, String, String);

#[derive(Debug, Clone)]
pub struct SchemaLedger {
    pool: SqlitePool,
}

impl SchemaLedger {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn ensure(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {SCHEMA_LEDGER_TABLE} (
               table_name TEXT PRIMARY KEY,
               version INTEGER NOT NULL,
               signature_hash TEXT NOT NULL,
               column_definitions TEXT NOT NULL,
               column_kinds TEXT NOT NULL,
               created_at TEXT NOT NULL,
               updated_at TEXT NOT NULL
             )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {SCHEMA_HISTORY_TABLE} (
               table_name TEXT NOT NULL,
               version INTEGER NOT NULL,
               signature_hash TEXT NOT NULL,
               column_kinds TEXT NOT NULL,
               acknowledgement TEXT NOT NULL,
               recorded_at TEXT NOT NULL,
               PRIMARY KEY (table_name, version)
             )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, table: &str) -> Result<Option<SchemaLedgerEntry>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::get_with(&mut conn, table).await
    }

    pub async fn all(&self) -> Result<Vec<SchemaLedgerEntry>, StoreError> {
        let rows: Vec<SchemaRow> = sqlx::query_as(&format!(
            "SELECT table_name, version, signature_hash, column_kinds, created_at, updated_at
             FROM {SCHEMA_LEDGER_TABLE} ORDER BY table_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// NEW when nothing is stored, UNCHANGED on an equal fingerprint,
    /// CONFLICT otherwise.
    pub async fn classify(
        &self,
        table: &str,
        signature: &SchemaSignature,
    ) -> Result<Classification, StoreError> {
        let classification = match self.get(table).await? {
            None => Classification::New,
            Some(entry) if entry.signature_hash == signature.fingerprint() => {
                Classification::Unchanged(entry)
            }
            Some(entry) => Classification::Conflict(entry),
        };
        debug!(table, outcome = classification.label(), "classified signature");
        Ok(classification)
    }

    /// Record `signature` as the accepted schema of `table` and return its version.
    ///
    /// An equal fingerprint is a no-op. A differing one bumps the version by
    /// exactly one, and only with a `Migrated` or `ForcedReset` acknowledgement.
    pub async fn commit(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        signature: &SchemaSignature,
        acknowledgement: SchemaAcknowledgement,
    ) -> Result<i64, StoreError> {
        if signature.is_empty() {
            return Err(StoreError::EmptySchema {
                table: table.to_string(),
            });
        }

        let hash = signature.fingerprint();
        let kinds = serde_json::to_string(signature).map_err(|err| StoreError::CorruptLedger {
            table: table.to_string(),
            message: err.to_string(),
        })?;
        let definitions = serde_json::to_string(&signature.column_definitions()).map_err(|err| {
            StoreError::CorruptLedger {
                table: table.to_string(),
                message: err.to_string(),
            }
        })?;
        let now = Utc::now().to_rfc3339();

        let version = match Self::get_with(conn, table).await? {
            Some(existing) if existing.signature_hash == hash => return Ok(existing.version),
            Some(existing) => {
                if acknowledgement == SchemaAcknowledgement::FirstLock {
                    return Err(StoreError::UnacknowledgedSchemaChange {
                        table: table.to_string(),
                        version: existing.version,
                    });
                }
                let version = existing.version + 1;
                sqlx::query(&format!(
                    "UPDATE {SCHEMA_LEDGER_TABLE}
                     SET version = ?, signature_hash = ?, column_definitions = ?,
                         column_kinds = ?, updated_at = ?
                     WHERE table_name = ?"
                ))
                .bind(version)
                .bind(&hash)
                .bind(&definitions)
                .bind(&kinds)
                .bind(&now)
                .bind(table)
                .execute(&mut *conn)
                .await?;
                version
            }
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {SCHEMA_LEDGER_TABLE}
                     (table_name, version, signature_hash, column_definitions, column_kinds, created_at, updated_at)
                     VALUES (?, 1, ?, ?, ?, ?, ?)"
                ))
                .bind(table)
                .bind(&hash)
                .bind(&definitions)
                .bind(&kinds)
                .bind(&now)
                .bind(&now)
                .execute(&mut *conn)
                .await?;
                1
            }
        };

        // A table can be reset after its ledger row was removed by hand; the
        // history keeps the first row written for each version.
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {SCHEMA_HISTORY_TABLE}
             (table_name, version, signature_hash, column_kinds, acknowledgement, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(table)
        .bind(version)
        .bind(&hash)
        .bind(&kinds)
        .bind(acknowledgement.as_str())
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        info!(table, version, acknowledgement = acknowledgement.as_str(), "schema ledger committed");
        Ok(version)
    }

    /// Every accepted version of `table`, oldest first.
    pub async fn history(&self, table: &str) -> Result<Vec<SchemaHistoryEntry>, StoreError> {
        let rows: Vec<(String, i64, String, String, String)> = sqlx::query_as(&format!(
            "SELECT table_name, version, signature_hash, acknowledgement, recorded_at
             FROM {SCHEMA_HISTORY_TABLE} WHERE table_name = ? ORDER BY version"
        ))
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(table_name, version, signature_hash, acknowledgement, recorded_at)| {
                Ok(SchemaHistoryEntry {
                    recorded_at: parse_timestamp(&table_name, &recorded_at)?,
                    table_name,
                    version,
                    signature_hash,
                    acknowledgement,
                })
            })
            .collect()
    }

    async fn get_with(
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<Option<SchemaLedgerEntry>, StoreError> {
        let row: Option<SchemaRow> = sqlx::query_as(&format!(
            "SELECT table_name, version, signature_hash, column_kinds, created_at, updated_at
             FROM {SCHEMA_LEDGER_TABLE} WHERE table_name = ?"
        ))
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(entry_from_row).transpose()
    }
}

fn entry_from_row(row: SchemaRow) -> Result<SchemaLedgerEntry, StoreError> {
    let (table_name, version, signature_hash, kinds, created_at, updated_at) = row;
    let signature: SchemaSignature =
        serde_json::from_str(&kinds).map_err(|err| StoreError::CorruptLedger {
            table: table_name.clone(),
            message: err.to_string(),
        })?;
    Ok(SchemaLedgerEntry {
        created_at: parse_timestamp(&table_name, &created_at)?,
        updated_at: parse_timestamp(&table_name, &updated_at)?,
        table_name,
        version,
        signature_hash,
        signature,
    })
}

fn parse_timestamp(table: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::CorruptLedger {
            table: table.to_string(),
            message: format!("bad timestamp {raw:?}: {err}"),
        })
}

#[derive(Debug, Clone)]
pub struct FreshnessLedger {
    pool: SqlitePool,
}

impl FreshnessLedger {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn ensure(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {FRESHNESS_LEDGER_TABLE} (
               table_name TEXT PRIMARY KEY,
               last_updated TEXT NOT NULL,
               record_count INTEGER NOT NULL,
               build_id TEXT NOT NULL,
               duration_ms INTEGER NOT NULL
             )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert the latest completed build of a table.
    pub async fn record(
        &self,
        conn: &mut SqliteConnection,
        entry: &FreshnessEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {FRESHNESS_LEDGER_TABLE}
             (table_name, last_updated, record_count, build_id, duration_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (table_name) DO UPDATE SET
               last_updated = excluded.last_updated,
               record_count = excluded.record_count,
               build_id = excluded.build_id,
               duration_ms = excluded.duration_ms"
        ))
        .bind(&entry.table_name)
        .bind(entry.last_updated.to_rfc3339())
        .bind(entry.record_count)
        .bind(&entry.build_id)
        .bind(entry.duration_ms)
        .execute(&mut *conn)
        .await?;
        debug!(table = %entry.table_name, records = entry.record_count, "freshness recorded");
        Ok(())
    }

    pub async fn get(&self, table: &str) -> Result<Option<FreshnessEntry>, StoreError> {
        let row: Option<(String, String, i64, String, i64)> = sqlx::query_as(&format!(
            "SELECT table_name, last_updated, record_count, build_id, duration_ms
             FROM {FRESHNESS_LEDGER_TABLE} WHERE table_name = ?"
        ))
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        row.map(freshness_from_row).transpose()
    }

    pub async fn all(&self) -> Result<Vec<FreshnessEntry>, StoreError> {
        let rows: Vec<(String, String, i64, String, i64)> = sqlx::query_as(&format!(
            "SELECT table_name, last_updated, record_count, build_id, duration_ms
             FROM {FRESHNESS_LEDGER_TABLE} ORDER BY table_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(freshness_from_row).collect()
    }
}

fn freshness_from_row(row: (String, String, i64, String, i64)) -> Result<FreshnessEntry, StoreError> {
    let (table_name, last_updated, record_count, build_id, duration_ms) = row;
    Ok(FreshnessEntry {
        last_updated: parse_timestamp(&table_name, &last_updated)?,
        table_name,
        record_count,
        build_id,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use rowsmith_core::ColumnKind;
    use tempfile::tempdir;

    fn price_signature(kind: ColumnKind) -> SchemaSignature {
        SchemaSignature::from_columns([("id", ColumnKind::Integer), ("price", kind)])
    }

    #[tokio::test]
    async fn classify_walks_new_unchanged_conflict() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("l.db")).await.expect("open");
        let ledger = db.schema_ledger();
        let v1 = price_signature(ColumnKind::Integer);

        assert_eq!(ledger.classify("r", &v1).await.expect("classify"), Classification::New);

        let mut conn = db.pool().acquire().await.expect("conn");
        let version = ledger
            .commit(&mut conn, "r", &v1, SchemaAcknowledgement::FirstLock)
            .await
            .expect("commit");
        drop(conn);
        assert_eq!(version, 1);

        assert!(matches!(
            ledger.classify("r", &v1).await.expect("classify"),
            Classification::Unchanged(entry) if entry.version == 1
        ));
        assert!(matches!(
            ledger.classify("r", &price_signature(ColumnKind::Real)).await.expect("classify"),
            Classification::Conflict(entry) if entry.signature == v1
        ));
    }

    #[tokio::test]
    async fn differing_fingerprint_needs_acknowledgement() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("l.db")).await.expect("open");
        let ledger = db.schema_ledger();
        let mut conn = db.pool().acquire().await.expect("conn");
        ledger
            .commit(&mut conn, "r", &price_signature(ColumnKind::Integer), SchemaAcknowledgement::FirstLock)
            .await
            .expect("first");

        let err = ledger
            .commit(&mut conn, "r", &price_signature(ColumnKind::Real), SchemaAcknowledgement::FirstLock)
            .await
            .expect_err("must refuse");
        assert!(matches!(err, StoreError::UnacknowledgedSchemaChange { version: 1, .. }));
        drop(conn);

        let stored = ledger.get("r").await.expect("get").expect("entry");
        assert_eq!(stored.version, 1);
        assert_eq!(stored.signature, price_signature(ColumnKind::Integer));
    }

    #[tokio::test]
    async fn versions_increase_by_one_per_accepted_change() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("l.db")).await.expect("open");
        let ledger = db.schema_ledger();
        let mut conn = db.pool().acquire().await.expect("conn");

        let shapes = [
            price_signature(ColumnKind::Integer),
            price_signature(ColumnKind::Real),
            price_signature(ColumnKind::Real),
            price_signature(ColumnKind::Text),
            price_signature(ColumnKind::Json),
        ];
        let mut versions = Vec::new();
        for (i, shape) in shapes.iter().enumerate() {
            let ack = if i == 0 {
                SchemaAcknowledgement::FirstLock
            } else if i % 2 == 0 {
                SchemaAcknowledgement::ForcedReset
            } else {
                SchemaAcknowledgement::Migrated
            };
            versions.push(ledger.commit(&mut conn, "r", shape, ack).await.expect("commit"));
        }
        drop(conn);

        assert_eq!(versions, vec![1, 2, 2, 3, 4]);
        let history = ledger.history("r").await.expect("history");
        assert_eq!(
            history.iter().map(|h| h.version).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(history[0].acknowledgement, "first_lock");
        assert_eq!(history[1].acknowledgement, "migrated");
        assert_eq!(history[2].acknowledgement, "migrated");
        assert_eq!(history[3].acknowledgement, "forced_reset");
        assert_eq!(ledger.all().await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn empty_signature_is_never_committed() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("l.db")).await.expect("open");
        let ledger = db.schema_ledger();
        let mut conn = db.pool().acquire().await.expect("conn");
        let err = ledger
            .commit(&mut conn, "r", &SchemaSignature::default(), SchemaAcknowledgement::FirstLock)
            .await
            .expect_err("empty");
        assert!(matches!(err, StoreError::EmptySchema { .. }));
    }

    #[tokio::test]
    async fn freshness_upsert_keeps_latest_only() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("l.db")).await.expect("open");
        let ledger = db.freshness_ledger();
        let first = FreshnessEntry {
            table_name: "r".into(),
            last_updated: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            record_count: 3,
            build_id: "build_a".into(),
            duration_ms: 12,
        };
        let second = FreshnessEntry {
            record_count: 5,
            build_id: "build_b".into(),
            ..first.clone()
        };

        let mut conn = db.pool().acquire().await.expect("conn");
        ledger.record(&mut conn, &first).await.expect("first");
        ledger.record(&mut conn, &second).await.expect("second");
        ledger.record(&mut conn, &second).await.expect("repeat");
        drop(conn);

        assert_eq!(ledger.get("r").await.expect("get"), Some(second.clone()));
        assert_eq!(ledger.all().await.expect("all"), vec![second]);
        assert_eq!(ledger.get("missing").await.expect("get"), None);
    }
}

//! Core record model, schema shape analysis and error taxonomy for rowsmith.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

mod error;
mod shape;

pub use error::{BuildError, ResourceError};
pub use shape::{
    ColumnKind, RetypedColumn, SchemaSignature, SignatureDelta, DEFAULT_SAMPLE_SIZE,
    EMPTY_SIGNATURE_FINGERPRINT,
};

pub const CRATE_NAME: &str = "rowsmith-core";

/// One loosely-typed row as returned by a producer. Keys are column names.
pub type Record = serde_json::Map<String, JsonValue>;

/// Ordered rows produced for one table in one build.
pub type RecordBatch = Vec<Record>;

/// Suffix appended to a resource name to form its fragments table.
pub const FRAGMENTS_SUFFIX: &str = "_fragments";

pub fn fragments_table_name(resource: &str) -> String {
    format!("{resource}{FRAGMENTS_SUFFIX}")
}

/// Latest accepted schema for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaLedgerEntry {
    pub table_name: String,
    pub version: i64,
    pub signature_hash: String,
    pub signature: SchemaSignature,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Most recent completed build of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessEntry {
    pub table_name: String,
    pub last_updated: DateTime<Utc>,
    pub record_count: i64,
    pub build_id: String,
    pub duration_ms: i64,
}

/// Outcome of comparing an incoming signature with the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    New,
    Unchanged(SchemaLedgerEntry),
    Conflict(SchemaLedgerEntry),
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Unchanged(_) => "unchanged",
            Self::Conflict(_) => "conflict",
        }
    }
}

/// Build a record from `(column, value)` pairs. Mostly useful in producers and tests.
pub fn record<I, K>(pairs: I) -> Record
where
    I: IntoIterator<Item = (K, JsonValue)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

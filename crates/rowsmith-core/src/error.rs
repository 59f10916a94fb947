use serde::Serialize;
use thiserror::Error;

use crate::SignatureDelta;

/// Failures local to one resource. They are reported in that resource's
/// outcome and never abort the rest of the build.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceError {
    #[error("table '{table}' has never received data; an empty batch cannot lock a schema")]
    EmptySchema { table: String },

    #[error("schema conflict on '{table}' (stored version {stored_version}): {delta}")]
    SchemaConflict {
        table: String,
        stored_version: i64,
        delta: SignatureDelta,
    },

    #[error("migration failed for '{table}': {reason}")]
    MigrationFailed { table: String, reason: String },

    #[error("producer for '{resource}' failed: {message}")]
    ProducerExecution { resource: String, message: String },

    #[error("invalid output for '{table}': {message}")]
    InvalidOutput { table: String, message: String },

    #[error("writing table '{table}' failed: {message}")]
    TableWrite { table: String, message: String },

    #[error("no resource named '{resource}' is declared")]
    UnknownResource { resource: String },
}

impl ResourceError {
    pub fn table(&self) -> &str {
        match self {
            Self::EmptySchema { table }
            | Self::SchemaConflict { table, .. }
            | Self::MigrationFailed { table, .. }
            | Self::InvalidOutput { table, .. }
            | Self::TableWrite { table, .. } => table,
            Self::ProducerExecution { resource, .. } | Self::UnknownResource { resource } => resource,
        }
    }

    /// Resolution hint shown next to the failure.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::SchemaConflict { .. } => Some(
                "add a migration callable for this resource, rerun with force schema reset, \
                 or delete the table to rebuild it from scratch",
            ),
            Self::MigrationFailed { .. } => Some(
                "fix the migration callable so it returns true, or rerun with force schema reset",
            ),
            Self::TableWrite { .. } => Some("inspect the table for conflicting rows and clean it up manually"),
            Self::UnknownResource { .. } => Some("check the resource name against the project file"),
            Self::EmptySchema { .. } | Self::ProducerExecution { .. } | Self::InvalidOutput { .. } => None,
        }
    }
}

/// Infrastructure failures. `StorageAccess` aborts a build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cannot access database {path}: {message}")]
    StorageAccess { path: String, message: String },

    #[error("remote sync failed: {0}")]
    RemoteSync(String),

    #[error("configuration error: {0}")]
    Config(String),
}

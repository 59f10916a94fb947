//! Resource contract, execution abstraction and the built-in resource kinds.

use std::sync::Arc;

use rowsmith_core::{fragments_table_name, RecordBatch, SignatureDelta};
use rowsmith_storage::TableHandle;

mod declared;
mod function;
mod task;

pub use declared::{
    fragment_records, resource_from_config, split_sentences, DeclaredResource, FragmentConfig,
    ResourceConfig, SourceConfig,
};
pub use function::FnResource;
pub use task::Task;

pub const CRATE_NAME: &str = "rowsmith-resources";

/// Producers report failures as `anyhow` errors; the runner turns them into
/// a failed outcome for the resource.
pub type ProducerResult<T> = anyhow::Result<T>;

/// A named unit of data production. The name is also the main table name.
///
/// Producers receive `None` when their table does not exist yet. The fragment
/// producer additionally receives the raw main batch fetched earlier in the
/// same build, or `None` when no main batch is available.
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;

    /// Columns rows are upserted on. Empty means append.
    fn natural_key(&self) -> &[String] {
        &[]
    }

    fn fetch_data<'a>(
        &'a self,
        existing: Option<&'a TableHandle>,
    ) -> Task<'a, ProducerResult<RecordBatch>>;

    fn transform_data(&self, batch: RecordBatch) -> ProducerResult<RecordBatch> {
        Ok(batch)
    }

    /// `None` when the resource has no fragments table.
    fn fetch_fragments<'a>(
        &'a self,
        _existing: Option<&'a TableHandle>,
        _context: Option<Arc<RecordBatch>>,
    ) -> Option<Task<'a, ProducerResult<RecordBatch>>> {
        None
    }

    fn transform_fragments(&self, batch: RecordBatch) -> ProducerResult<RecordBatch> {
        Ok(batch)
    }

    fn fragments_natural_key(&self) -> &[String] {
        &[]
    }

    /// Column naming the parent of each fragment. When set, every parent in
    /// the batch has its stored fragments replaced as a whole, so rows past
    /// the new last position do not linger.
    fn fragments_group_column(&self) -> Option<&str> {
        None
    }

    /// `None` when no migration callable is declared. `Ok(true)` accepts the
    /// new signature for `existing`.
    fn migrate_schema<'a>(
        &'a self,
        _existing: &'a TableHandle,
        _delta: &'a SignatureDelta,
    ) -> Option<Task<'a, ProducerResult<bool>>> {
        None
    }

    fn fragments_table(&self) -> String {
        fragments_table_name(self.name())
    }
}

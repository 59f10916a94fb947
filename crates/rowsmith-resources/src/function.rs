use std::future::Future;
use std::sync::Arc;

use rowsmith_core::{RecordBatch, SignatureDelta};
use rowsmith_storage::TableHandle;

use crate::{ProducerResult, Resource, Task};

type MainProducer =
    Box<dyn Fn(Option<TableHandle>) -> Task<'static, ProducerResult<RecordBatch>> + Send + Sync>;
type FragmentProducer = Box<
    dyn Fn(Option<TableHandle>, Option<Arc<RecordBatch>>) -> Task<'static, ProducerResult<RecordBatch>>
        + Send
        + Sync,
>;
type Migration =
    Box<dyn Fn(TableHandle, SignatureDelta) -> Task<'static, ProducerResult<bool>> + Send + Sync>;
type Transform = Box<dyn Fn(RecordBatch) -> ProducerResult<RecordBatch> + Send + Sync>;

/// A resource assembled from closures.
///
/// ```ignore
/// let docs = FnResource::from_async("docs", |_existing| async { Ok(fetch_docs().await?) })
///     .with_natural_key(["id"])
///     .with_fragments_sync(|_existing, main| Ok(split(main)));
/// ```
pub struct FnResource {
    name: String,
    natural_key: Vec<String>,
    fragments_natural_key: Vec<String>,
    fragments_group_column: Option<String>,
    main: MainProducer,
    fragments: Option<FragmentProducer>,
    migration: Option<Migration>,
    transform: Option<Transform>,
    fragments_transform: Option<Transform>,
}

impl FnResource {
    fn with_main(name: impl Into<String>, main: MainProducer) -> Self {
        Self {
            name: name.into(),
            natural_key: Vec::new(),
            fragments_natural_key: Vec::new(),
            fragments_group_column: None,
            main,
            fragments: None,
            migration: None,
            transform: None,
            fragments_transform: None,
        }
    }

    /// Producer that computes its batch immediately.
    pub fn from_sync<F>(name: impl Into<String>, producer: F) -> Self
    where
        F: Fn(Option<&TableHandle>) -> ProducerResult<RecordBatch> + Send + Sync + 'static,
    {
        Self::with_main(
            name,
            Box::new(move |existing: Option<TableHandle>| {
                Task::ready(producer(existing.as_ref()))
            }),
        )
    }

    /// Producer that returns a future, e.g. one fanning out many requests.
    pub fn from_async<F, Fut>(name: impl Into<String>, producer: F) -> Self
    where
        F: Fn(Option<TableHandle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProducerResult<RecordBatch>> + Send + 'static,
    {
        Self::with_main(
            name,
            Box::new(move |existing: Option<TableHandle>| {
                Task::pending(producer(existing))
            }),
        )
    }

    pub fn with_fragments_sync<F>(mut self, producer: F) -> Self
    where
        F: Fn(Option<&TableHandle>, Option<&RecordBatch>) -> ProducerResult<RecordBatch>
            + Send
            + Sync
            + 'static,
    {
        self.fragments = Some(Box::new(
            move |existing: Option<TableHandle>, context: Option<Arc<RecordBatch>>| {
                Task::ready(producer(existing.as_ref(), context.as_deref()))
            },
        ));
        self
    }

    pub fn with_fragments_async<F, Fut>(mut self, producer: F) -> Self
    where
        F: Fn(Option<TableHandle>, Option<Arc<RecordBatch>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProducerResult<RecordBatch>> + Send + 'static,
    {
        self.fragments = Some(Box::new(
            move |existing: Option<TableHandle>, context: Option<Arc<RecordBatch>>| {
                Task::pending(producer(existing, context))
            },
        ));
        self
    }

    pub fn with_migration<F, Fut>(mut self, migration: F) -> Self
    where
        F: Fn(TableHandle, SignatureDelta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProducerResult<bool>> + Send + 'static,
    {
        self.migration = Some(Box::new(move |existing: TableHandle, delta: SignatureDelta| {
            Task::pending(migration(existing, delta))
        }));
        self
    }

    pub fn with_migration_sync<F>(mut self, migration: F) -> Self
    where
        F: Fn(&TableHandle, &SignatureDelta) -> ProducerResult<bool> + Send + Sync + 'static,
    {
        self.migration = Some(Box::new(move |existing: TableHandle, delta: SignatureDelta| {
            Task::ready(migration(&existing, &delta))
        }));
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(RecordBatch) -> ProducerResult<RecordBatch> + Send + Sync + 'static,
    {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn with_fragments_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(RecordBatch) -> ProducerResult<RecordBatch> + Send + Sync + 'static,
    {
        self.fragments_transform = Some(Box::new(transform));
        self
    }

    pub fn with_natural_key<I, K>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.natural_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fragments_natural_key<I, K>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.fragments_natural_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fragments_grouped_by(mut self, column: impl Into<String>) -> Self {
        self.fragments_group_column = Some(column.into());
        self
    }
}

impl std::fmt::Debug for FnResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnResource")
            .field("name", &self.name)
            .field("natural_key", &self.natural_key)
            .field("fragments", &self.fragments.is_some())
            .field("migration", &self.migration.is_some())
            .finish_non_exhaustive()
    }
}

impl Resource for FnResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn natural_key(&self) -> &[String] {
        &self.natural_key
    }

    fn fetch_data<'a>(
        &'a self,
        existing: Option<&'a TableHandle>,
    ) -> Task<'a, ProducerResult<RecordBatch>> {
        (self.main)(existing.cloned())
    }

    fn transform_data(&self, batch: RecordBatch) -> ProducerResult<RecordBatch> {
        match &self.transform {
            Some(transform) => transform(batch),
            None => Ok(batch),
        }
    }

    fn fetch_fragments<'a>(
        &'a self,
        existing: Option<&'a TableHandle>,
        context: Option<Arc<RecordBatch>>,
    ) -> Option<Task<'a, ProducerResult<RecordBatch>>> {
        self.fragments
            .as_ref()
            .map(|producer| producer(existing.cloned(), context))
    }

    fn transform_fragments(&self, batch: RecordBatch) -> ProducerResult<RecordBatch> {
        match &self.fragments_transform {
            Some(transform) => transform(batch),
            None => Ok(batch),
        }
    }

    fn fragments_natural_key(&self) -> &[String] {
        &self.fragments_natural_key
    }

    fn fragments_group_column(&self) -> Option<&str> {
        self.fragments_group_column.as_deref()
    }

    fn migrate_schema<'a>(
        &'a self,
        existing: &'a TableHandle,
        delta: &'a SignatureDelta,
    ) -> Option<Task<'a, ProducerResult<bool>>> {
        self.migration
            .as_ref()
            .map(|migration| migration(existing.clone(), delta.clone()))
    }
}

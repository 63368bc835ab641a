//! Binding of a domain record type to the generic job store.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;

use execq_core::{JobV2, JobVersion};

use crate::executors::ExecutorRegistry;
use crate::jobs::{InMemoryJobStore, JobRecord, JobStore, PostgresJobStore, StoreOptions};

use super::handler::QueueHandler;

/// Capacity the executor reported on dequeue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub num_cpus: Option<u32>,
    pub memory: Option<String>,
    pub disk_space: Option<String>,
}

/// What the transformer knows about the executor asking for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformContext {
    /// Newest job shape the executor can parse.
    pub max_version: JobVersion,
    pub resources: ResourceMetadata,
}

impl Default for TransformContext {
    fn default() -> Self {
        Self {
            max_version: JobVersion::LATEST,
            resources: ResourceMetadata::default(),
        }
    }
}

/// A domain record could not be turned into a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransformError(String);

impl TransformError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Pure function from a dequeued record to the job handed to an executor.
///
/// Produces the richest (V2) shape; the handler downgrades it for older
/// executors. Must also register every secret it embeds in the job's
/// redaction map.
pub trait RecordTransformer: Send + Sync + 'static {
    type Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn transform(
        &self,
        record: &JobRecord<Self::Record>,
        ctx: &TransformContext,
    ) -> Result<JobV2, TransformError>;
}

/// Transformer built from a closure.
pub struct FnTransformer<R, F> {
    f: F,
    _record: PhantomData<fn() -> R>,
}

pub fn transformer_fn<R, F>(f: F) -> FnTransformer<R, F>
where
    F: Fn(&JobRecord<R>, &TransformContext) -> Result<JobV2, TransformError>,
{
    FnTransformer {
        f,
        _record: PhantomData,
    }
}

impl<R, F> RecordTransformer for FnTransformer<R, F>
where
    R: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    F: Fn(&JobRecord<R>, &TransformContext) -> Result<JobV2, TransformError> + Send + Sync + 'static,
{
    type Record = R;

    fn transform(&self, record: &JobRecord<R>, ctx: &TransformContext) -> Result<JobV2, TransformError> {
        (self.f)(record, ctx)
    }
}

/// One logical queue: store policy plus transformer.
pub struct QueueAdapter<T> {
    options: StoreOptions,
    transformer: T,
}

impl<T: RecordTransformer> QueueAdapter<T> {
    pub fn new(name: impl Into<String>, transformer: T) -> Self {
        Self {
            options: StoreOptions::new(name),
            transformer,
        }
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_stalled_max_age(mut self, age: Duration) -> Self {
        self.options = self.options.with_stalled_max_age(age);
        self
    }

    pub fn with_max_num_resets(mut self, max: u32) -> Self {
        self.options = self.options.with_max_num_resets(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.options.queue
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn transformer(&self) -> &T {
        &self.transformer
    }

    pub fn in_memory_store(&self) -> InMemoryJobStore<T::Record> {
        InMemoryJobStore::new(self.options.clone())
    }

    pub fn postgres_store(&self, pool: Arc<PgPool>) -> PostgresJobStore<T::Record> {
        PostgresJobStore::from_shared(pool, self.options.clone())
    }

    pub fn into_handler<S>(self, store: S, registry: Arc<dyn ExecutorRegistry>) -> QueueHandler<S, T>
    where
        S: JobStore<T::Record>,
    {
        QueueHandler::new(self.options.queue, store, self.transformer, registry)
    }
}

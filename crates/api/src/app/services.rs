use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use execq_infra::jobs::{JobStore, JobStoreError, ensure_schema};
use execq_infra::queue::QueueHandler;
use execq_infra::queues::{IndexingRecord, IndexingTransformer, indexing_queue};
use execq_infra::workers::{ResetterConfig, ResetterHandle, StalledJobResetter};
use execq_infra::{ExecutorRegistry, InMemoryExecutorRegistry, PostgresExecutorRegistry, ServiceConfig};

use crate::app::errors;

/// Store behind the indexing queue (in-memory or Postgres, chosen at startup).
pub type IndexingStore = Arc<dyn JobStore<IndexingRecord>>;
pub type IndexingHandler = QueueHandler<IndexingStore, IndexingTransformer>;

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("failed to connect to database: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("failed to prepare database schema: {0}")]
    Schema(#[from] JobStoreError),
}

/// Everything the HTTP layer needs, shared across requests.
pub struct AppServices {
    executor_secret: String,
    admin_token: Option<String>,
    registry: Arc<dyn ExecutorRegistry>,
    queues: BTreeMap<String, Arc<IndexingHandler>>,
}

impl AppServices {
    /// Services backed by in-memory stores (dev/test).
    pub fn in_memory(config: &ServiceConfig) -> Self {
        let registry: Arc<dyn ExecutorRegistry> = Arc::new(InMemoryExecutorRegistry::new());
        let adapter = indexing_queue(config.frontend.clone())
            .with_stalled_max_age(config.stalled_max_age)
            .with_max_num_resets(config.max_num_resets);
        let store: IndexingStore = Arc::new(adapter.in_memory_store());
        let indexing = adapter.into_handler(store, registry.clone());

        Self::assemble(config, registry, indexing)
    }

    /// Services backed by Postgres at `database_url`.
    pub async fn postgres(config: &ServiceConfig, database_url: &str) -> Result<Self, ServicesError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        ensure_schema(&pool).await?;
        let pool: Arc<PgPool> = Arc::new(pool);

        let registry: Arc<dyn ExecutorRegistry> = Arc::new(PostgresExecutorRegistry::from_shared(pool.clone()));
        let adapter = indexing_queue(config.frontend.clone())
            .with_stalled_max_age(config.stalled_max_age)
            .with_max_num_resets(config.max_num_resets);
        let store: IndexingStore = Arc::new(adapter.postgres_store(pool));
        let indexing = adapter.into_handler(store, registry.clone());

        Ok(Self::assemble(config, registry, indexing))
    }

    fn assemble(config: &ServiceConfig, registry: Arc<dyn ExecutorRegistry>, indexing: IndexingHandler) -> Self {
        let mut queues = BTreeMap::new();
        queues.insert(indexing.name().to_string(), Arc::new(indexing));
        Self {
            executor_secret: config.executor_secret.clone(),
            admin_token: config.admin_token.clone(),
            registry,
            queues,
        }
    }

    pub fn executor_secret(&self) -> &str {
        &self.executor_secret
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    pub fn registry(&self) -> &Arc<dyn ExecutorRegistry> {
        &self.registry
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Look up a queue by name, or produce the 404 response for it.
    pub fn queue(&self, name: &str) -> Result<&Arc<IndexingHandler>, axum::response::Response> {
        self.queues.get(name).ok_or_else(|| {
            errors::json_error(StatusCode::NOT_FOUND, "unknown_queue", format!("unknown queue {name:?}"))
        })
    }

    /// Start one stalled-job resetter per queue.
    pub fn spawn_resetters(&self, interval: Duration) -> Vec<ResetterHandle> {
        self.queues
            .iter()
            .map(|(name, handler)| {
                let store: IndexingStore = handler.store().clone();
                let handle = StalledJobResetter::<_, IndexingRecord>::new(store).spawn(
                    ResetterConfig::default()
                        .with_interval(interval)
                        .with_name(format!("{name}-stalled-reset")),
                );
                info!(queue = %name, interval_secs = interval.as_secs(), "started stalled job resetter");
                handle
            })
            .collect()
    }
}

/// Build services for `config`: Postgres when `DATABASE_URL` is set, in-memory otherwise.
pub async fn build_services(config: &ServiceConfig) -> Result<AppServices, ServicesError> {
    match &config.database_url {
        Some(url) => {
            info!("using postgres job stores");
            AppServices::postgres(config, url).await
        }
        None => {
            info!("DATABASE_URL not set; using in-memory job stores");
            Ok(AppServices::in_memory(config))
        }
    }
}


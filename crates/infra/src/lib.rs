//! Infrastructure layer: job stores, queue handling, background workers,
//! configuration.

pub mod clock;
pub mod config;
pub mod executors;
pub mod jobs;
pub mod queue;
pub mod queues;
pub mod workers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ServiceConfig};
pub use executors::{
    ExecutorHeartbeat, ExecutorInfo, ExecutorRegistry, InMemoryExecutorRegistry,
    PostgresExecutorRegistry, RegistryError,
};

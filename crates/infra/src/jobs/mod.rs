//! Durable job records and the store contract.
//!
//! ## Design
//!
//! - One record per unit of work, owned by at most one executor at a time
//! - Every mutation by an executor is gated on it still owning the record
//! - Liveness is tracked by heartbeats; stalled records are reset a bounded
//!   number of times before they are errored
//! - Cancellation always ends in a terminal state: a queued record fails at
//!   once, a processing one fails when its executor stops heartbeating
//!
//! ## Components
//!
//! - `JobRecord`: store-owned record wrapping a domain payload
//! - `JobStore`: persistence contract (in-memory or Postgres)
//! - `StoreOptions`: per-queue stall policy

pub mod in_memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use in_memory::InMemoryJobStore;
pub use postgres::{PostgresJobStore, SCHEMA, ensure_schema};
pub use store::{JobStore, JobStoreError};
pub use types::{
    CANCELED_FAILURE_MESSAGE, DEFAULT_MAX_NUM_RESETS, DEFAULT_RESET_FAILURE_MESSAGE,
    DEFAULT_STALLED_MAX_AGE, JobRecord, QueueStats, RecordState, ResetOutcome, StalledRecord,
    StoreOptions,
};

//! Generic queue plumbing: record transformation, liveness reconciliation and
//! the executor-facing handler.

pub mod adapter;
pub mod handler;
pub mod heartbeat;

pub use adapter::{
    FnTransformer, QueueAdapter, RecordTransformer, ResourceMetadata, TransformContext,
    TransformError, transformer_fn,
};
pub use handler::{DequeueParams, QueueError, QueueHandler};
pub use heartbeat::{HeartbeatOutcome, reconcile};

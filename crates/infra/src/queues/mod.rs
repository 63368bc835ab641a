//! Concrete queues served by this service.

pub mod indexing;

pub use indexing::{
    BlobRef, FrontendCredentials, IndexingRecord, IndexingTransformer, PreIndexStep, indexing_queue,
};

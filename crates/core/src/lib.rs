//! `execq-core` — protocol building blocks shared by the queue server and its executors.
//!
//! This crate contains **pure protocol** types (no store or transport concerns).

pub mod error;
pub mod execution_log;
pub mod id;
pub mod job;
pub mod redaction;
pub mod version;

pub use error::{ProtocolError, ProtocolResult};
pub use execution_log::ExecutionLogEntry;
pub use id::{ExecutionLogEntryId, RecordId};
pub use job::{CliStep, DockerStep, Job, JobSpec, JobV1, JobV2, JobVersion, TextFile, VirtualFile};
pub use redaction::{PASSWORD_PLACEHOLDER, RedactionMap, USERNAME_PLACEHOLDER};
pub use version::max_supported_version;

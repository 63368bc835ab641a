//! Background workers.

pub mod stalled_reset;

pub use stalled_reset::{ResetterConfig, ResetterHandle, ResetterStats, StalledJobResetter};

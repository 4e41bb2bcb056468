//! Profiling core modules
//!
//! Everything between a loaded [`RawProfileData`](crate::model::RawProfileData)
//! and a finished [`ProfileData`](crate::analysis::ProfileData):
//! - Ingestion options
//! - Progress reporting and cancellation
//! - Stack resolution with per-stack caching
//! - The sample pass and the performance-counter pass

pub mod counter_processor;
pub mod options;
pub mod progress;
pub mod sample_processor;
pub mod stack_resolver;

// Re-export common types
pub use options::ProfileOptions;
pub use progress::{
    CancellationToken, ChannelProgress, NoProgress, ProgressReporter, ProgressStage, ProgressUpdate,
};
pub use sample_processor::{ingest, IngestStats, SampleProcessor};
pub use stack_resolver::{
    ResolvedFrame, ResolvedFunction, ResolvedStack, ResolverStats, StackResolver,
    KERNEL_ADDRESS_START,
};

//! # Shared Trace Records (Producer ↔ Engine)
//!
//! Defines the record schema of a recorded sampling trace. A trace file is a
//! JSON-lines stream of [`TraceRecord`] values, one per line, in the order the
//! tracer observed them. Producers (trace converters, test fixtures) and the
//! `callscope` engine share these types so both sides agree on field names and
//! defaults.
//!
//! ## Record Ordering
//!
//! The stream is replayed strictly in order. Two orderings matter:
//!
//! 1. **Images before samples** - an image must be announced before samples
//!    whose instruction pointers fall into it are attributed to it.
//! 2. **Samples before stack walks** - a [`StackWalkRecord`] is attached to the
//!    most recent sample taken on the same processor (or, failing that, the
//!    most recent sample of the same process/thread/processor context).
//!
//! ## Key Types
//!
//! - [`TraceRecord`] - Tagged union of every record kind
//! - [`SampleRecord`] - One timer-driven CPU sample
//! - [`StackWalkRecord`] - The call stack captured for the preceding sample
//! - [`CounterRecord`] - One hardware performance-counter overflow

use serde::{Deserialize, Serialize};

// ============================================================================
// Shared Constants
// ============================================================================

/// Longest stack for which the engine keeps a reusable scratch buffer.
///
/// Deeper stacks are still accepted, they just allocate their own buffer
/// while being assembled.
pub const MAX_FRAME_NUMBER: usize = 256;

/// Number of samples processed between two progress/cancellation checks.
pub const DEFAULT_PROGRESS_BATCH: usize = 10_000;

/// Default sampling interval when the trace does not announce one (1ms).
pub const DEFAULT_SAMPLING_INTERVAL_NS: u64 = 1_000_000;

/// Allowed deviation from the sampling interval before a gap between two
/// samples on one processor is treated as lost samples.
pub const SAMPLING_ERROR_MARGIN: f64 = 1.1;

// ============================================================================
// Records
// ============================================================================

/// Every record kind that can appear in a trace stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceRecord {
    /// Trace-wide settings, usually the first line.
    Header(HeaderRecord),
    Process(ProcessRecord),
    Thread(ThreadRecord),
    Image(ImageRecord),
    Sample(SampleRecord),
    StackWalk(StackWalkRecord),
    CounterInfo(CounterInfoRecord),
    Counter(CounterRecord),
}

/// Trace-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    /// Timer sampling interval in nanoseconds.
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_ns: u64,

    /// Name of the machine the trace was recorded on.
    #[serde(default)]
    pub machine: String,
}

fn default_sampling_interval() -> u64 {
    DEFAULT_SAMPLING_INTERVAL_NS
}

/// A process that was alive during the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    #[serde(default)]
    pub parent_pid: u32,
    pub name: String,
    #[serde(default)]
    pub image_file_name: String,
    #[serde(default)]
    pub command_line: String,
}

/// A thread that belongs to a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub pid: u32,
    pub tid: u32,
    #[serde(default)]
    pub name: String,
}

/// A binary image mapped into a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub pid: u32,
    pub base_address: u64,
    pub size: u64,
    /// Preferred load address recorded in the binary headers.
    #[serde(default)]
    pub default_base_address: u64,
    pub file_path: String,
    #[serde(default)]
    pub original_file_name: Option<String>,
    #[serde(default)]
    pub timestamp: u32,
    #[serde(default)]
    pub checksum: u32,
}

/// A timer-driven CPU sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub pid: u32,
    pub tid: u32,
    #[serde(default)]
    pub cpu: u32,
    pub ip: u64,
    pub time_ns: u64,
    /// Explicit weight. When absent the weight is derived from the time
    /// elapsed since the previous sample on the same processor.
    #[serde(default)]
    pub weight_ns: Option<u64>,
    /// Sample taken while executing a deferred procedure call or an
    /// interrupt service routine.
    #[serde(default)]
    pub is_kernel: bool,
}

/// The call stack captured for the sample that precedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackWalkRecord {
    pub pid: u32,
    pub tid: u32,
    #[serde(default)]
    pub cpu: u32,
    /// Instruction pointers, innermost (top) frame first.
    pub frames: Vec<u64>,
}

/// Definition of a hardware performance counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterInfoRecord {
    pub id: i16,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub frequency: u32,
}

/// One performance-counter overflow event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub pid: u32,
    pub tid: u32,
    #[serde(default)]
    pub cpu: u32,
    pub ip: u64,
    pub time_ns: u64,
    pub counter_id: i16,
}

//! Sample and performance-counter records.

use serde::{Deserialize, Serialize};

use crate::domain::{ContextHandle, Duration, StackHandle, Timestamp};

/// One CPU sample.
///
/// Everything except `stack` is fixed when the sample is stored. The stack
/// walk usually arrives as a separate event after the sample, so `stack`
/// starts as `StackHandle::NONE` and is patched in place later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub ip: u64,
    pub time: Timestamp,
    pub weight: Duration,
    pub stack: StackHandle,
    pub context: ContextHandle,
    /// Taken while running a deferred procedure call or interrupt routine.
    pub is_kernel: bool,
}

impl Sample {
    #[must_use]
    pub fn new(
        ip: u64,
        time: Timestamp,
        weight: Duration,
        context: ContextHandle,
        is_kernel: bool,
    ) -> Self {
        Self { ip, time, weight, stack: StackHandle::NONE, context, is_kernel }
    }

    #[must_use]
    pub fn has_stack(&self) -> bool {
        !self.stack.is_none()
    }
}

/// Definition of a hardware performance counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceCounterInfo {
    pub id: i16,
    /// Position in the order counters were announced.
    pub number: usize,
    pub name: String,
    pub description: String,
    pub frequency: u32,
}

/// A counter overflow at `ip`. Not stack-resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceCounterEvent {
    pub ip: u64,
    pub time: Timestamp,
    pub context: ContextHandle,
    pub counter_id: i16,
}

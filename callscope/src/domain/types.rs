//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the many small integers flowing through the
//! engine apart: a thread table handle cannot be passed where a context
//! handle is expected, and a process id is never confused with a handle into
//! the process table.

// Time conversions intentionally lose precision for display
#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

// =============================================================================
// TABLE HANDLES
// =============================================================================

/// A 1-based index into one of the profile tables.
///
/// Handle `0` is reserved for "none" (for example an unresolved sample stack),
/// so the first inserted entity gets handle `1`.
pub trait Handle: Copy + Eq + std::hash::Hash {
    /// Build the handle for the entry stored at `offset` (0-based).
    ///
    /// # Panics
    /// Panics if the offset does not fit in a `u32`.
    fn from_offset(offset: usize) -> Self;

    /// The 0-based storage offset, or `None` for the reserved handle `0`.
    fn offset(self) -> Option<usize>;
}

macro_rules! table_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
            Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            /// The reserved "no entity" handle.
            pub const NONE: Self = Self(0);

            #[must_use]
            pub fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl Handle for $name {
            fn from_offset(offset: usize) -> Self {
                let raw = u32::try_from(offset + 1).expect(concat!($label, " table overflow"));
                Self(raw)
            }

            fn offset(self) -> Option<usize> {
                (self.0 as usize).checked_sub(1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }
    };
}

table_handle!(
    /// Handle into the process table.
    ProcessHandle,
    "Process"
);
table_handle!(
    /// Handle into the thread table.
    ThreadHandle,
    "Thread"
);
table_handle!(
    /// Handle into the image table.
    ImageHandle,
    "Image"
);
table_handle!(
    /// Handle into the context table. Every sample and stack carries one.
    ContextHandle,
    "Context"
);
table_handle!(
    /// Handle into the stack table. `StackHandle::NONE` marks a sample whose
    /// stack walk has not been seen (yet).
    StackHandle,
    "Stack"
);
table_handle!(
    /// Handle into the sample store.
    SampleHandle,
    "Sample"
);

// =============================================================================
// OS IDENTIFIERS
// =============================================================================

/// Process ID as recorded by the tracer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID as recorded by the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Logical processor number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

// =============================================================================
// FUNCTION IDENTITY
// =============================================================================

/// Identifies a loaded module (one per distinct image binary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module#{}", self.0)
    }
}

/// Cross-module function identity: the owning module plus the function's
/// number inside that module's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId {
    pub module: ModuleId,
    pub number: u32,
}

impl FunctionId {
    #[must_use]
    pub fn new(module: ModuleId, number: u32) -> Self {
        Self { module, number }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function#{}.{}", self.module.0, self.number)
    }
}

/// Unique id of a registered call-tree node. Ids start at 1 per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node#{}", self.0)
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Timestamp in nanoseconds since the start of the trace.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Convert to seconds (f64)
    #[must_use]
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Convert to milliseconds (f64)
    #[must_use]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is later.
    #[must_use]
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_seconds())
    }
}

/// Duration in nanoseconds. Sample weights and every accumulated
/// inclusive/exclusive weight use this type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Duration(pub u64);

impl Duration {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn from_millis(ms: u64) -> Self {
        Self(ms * 1_000_000)
    }

    /// Convert to milliseconds (f64)
    #[must_use]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Convert to seconds (f64)
    #[must_use]
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Share of `total` in percent (0.0 - 100.0).
    #[must_use]
    pub fn percentage_of(self, total: Duration) -> f64 {
        if total.0 == 0 {
            0.0
        } else {
            (self.0 as f64 / total.0 as f64) * 100.0
        }
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sum for Duration {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.as_millis();
        if ms >= 1000.0 {
            write!(f, "{:.2}s", self.as_seconds())
        } else {
            write!(f, "{ms:.2}ms")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_one_based() {
        let first = ContextHandle::from_offset(0);
        assert_eq!(first, ContextHandle(1));
        assert_eq!(first.offset(), Some(0));
        assert_eq!(ContextHandle::NONE.offset(), None);
        assert!(StackHandle::NONE.is_none());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(SampleHandle(7).to_string(), "Sample#7");
        assert_eq!(Pid(1234).to_string(), "PID:1234");
        assert_eq!(FunctionId::new(ModuleId(2), 9).to_string(), "Function#2.9");
    }

    #[test]
    fn test_duration_arithmetic() {
        let total: Duration =
            [Duration::from_millis(10), Duration::from_millis(5)].into_iter().sum();
        assert_eq!(total, Duration::from_millis(15));

        let mut d = Duration::ZERO;
        d += Duration(3);
        assert_eq!(d, Duration(3));
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(Duration(5_000_000).to_string(), "5.00ms");
        assert_eq!(Duration(1_500_000_000).to_string(), "1.50s");
    }

    #[test]
    fn test_percentage_of() {
        assert!((Duration(25).percentage_of(Duration(100)) - 25.0).abs() < f64::EPSILON);
        assert!(Duration(25).percentage_of(Duration::ZERO).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timestamp_since() {
        assert_eq!(Timestamp(10).saturating_since(Timestamp(4)), Duration(6));
        assert_eq!(Timestamp(4).saturating_since(Timestamp(10)), Duration::ZERO);
    }
}

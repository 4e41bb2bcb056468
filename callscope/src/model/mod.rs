//! Raw trace model: flat entity tables, the interned stack store and the
//! sample/counter streams.

pub mod entities;
pub mod raw_profile;
pub mod samples;
pub mod stacks;
pub mod table;

pub use entities::{Context, Image, Process, Thread};
pub use raw_profile::RawProfileData;
pub use samples::{PerformanceCounterEvent, PerformanceCounterInfo, Sample};
pub use stacks::{FrameArena, FrameArrayId, Stack, StackTable};
pub use table::{EntityTable, FxHashMap, FxHashSet, FxIndexMap, FxIndexSet};

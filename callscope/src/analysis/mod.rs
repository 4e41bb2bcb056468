//! Aggregated profile data
//!
//! Ingestion folds every sample into two structures:
//!
//! - **`function_profile`** - one [`FunctionProfileData`] per function with
//!   inclusive/exclusive weight and per-line, per-instruction, callee,
//!   caller and counter histograms
//! - **`profile_data`** - [`ProfileData`], the function table plus module
//!   totals, counter definitions, the [`CallTree`](crate::calltree::CallTree)
//!   and the module load report

pub mod function_profile;
pub mod profile_data;

pub use function_profile::{CounterValue, FunctionProfileData, PerformanceCounterSet};
pub use profile_data::{FunctionEntry, ProfileData, ProfileDataState};

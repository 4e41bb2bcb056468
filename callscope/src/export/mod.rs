//! Profile export functionality
//!
//! - **`profile_file`** - versioned JSON document for saving and reloading an
//!   ingested profile
//! - **`report`** - plain-text summary for the terminal

pub mod profile_file;
pub mod report;

pub use profile_file::{
    export_profile, import_profile, load_profile, save_profile, PROFILE_FORMAT_VERSION,
};
pub use report::{write_report, ReportOptions};

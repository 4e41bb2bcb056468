//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::domain::Pid;
use crate::export::ReportOptions;
use crate::profiling::ProfileOptions;
use crate::symbolization::{FileSystemLocator, LocalSymbolSource};

#[derive(Parser, Debug)]
#[command(
    name = "callscope",
    about = "Aggregate a recorded sampling trace into a call tree and function profile",
    after_help = "\
EXAMPLES:
    callscope trace.jsonl                         Profile the busiest process
    callscope trace.jsonl --pid 1234 --tree-depth 6
    callscope trace.jsonl --symbol-path ./target/release --export app.profile.json
    callscope --load app.profile.json             Report a saved profile"
)]
pub struct Args {
    /// Recorded trace (JSON lines)
    #[arg(value_name = "TRACE", required_unless_present = "load")]
    pub trace: Option<PathBuf>,

    /// Process to profile (default: the process with the most samples)
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Keep samples taken in interrupt and deferred-procedure context
    #[arg(long)]
    pub include_kernel: bool,

    /// Directory searched for binaries by file name (repeatable)
    #[arg(long = "symbol-path", value_name = "DIR")]
    pub symbol_paths: Vec<PathBuf>,

    /// Directory holding perf-map files for JIT-compiled code
    #[arg(long, value_name = "DIR")]
    pub perf_map_dir: Option<PathBuf>,

    /// Save the ingested profile to FILE
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Report a saved profile instead of ingesting a trace
    #[arg(long, value_name = "FILE", conflicts_with_all = ["trace", "export"])]
    pub load: Option<PathBuf>,

    /// Rows per report table
    #[arg(long, default_value = "20")]
    pub top: usize,

    /// Call tree levels to print (0 = no tree)
    #[arg(long, default_value = "0")]
    pub tree_depth: usize,

    /// Skip the counter pass
    #[arg(long)]
    pub no_counters: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    #[must_use]
    pub fn profile_options(&self) -> ProfileOptions {
        ProfileOptions {
            main_process: self.pid.map(Pid),
            include_kernel: self.include_kernel,
            process_counters: !self.no_counters,
            ..ProfileOptions::default()
        }
    }

    #[must_use]
    pub fn report_options(&self) -> ReportOptions {
        ReportOptions { top: self.top, tree_depth: self.tree_depth, ..ReportOptions::default() }
    }

    #[must_use]
    pub fn symbol_source(&self) -> LocalSymbolSource {
        let locator = FileSystemLocator::new(self.symbol_paths.clone());
        LocalSymbolSource::new(locator, self.perf_map_dir.clone())
    }
}

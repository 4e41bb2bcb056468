//! Ingestion settings.

use callscope_common::DEFAULT_PROGRESS_BATCH;

use crate::domain::Pid;

/// What to ingest and how often to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileOptions {
    /// Process whose samples are aggregated. `None` picks the process with
    /// the most samples.
    pub main_process: Option<Pid>,
    /// Keep samples taken in interrupt or deferred-procedure context.
    pub include_kernel: bool,
    /// Samples between two progress reports / cancellation checks.
    pub batch_size: usize,
    /// Run the performance-counter pass.
    pub process_counters: bool,
    /// Fold instruction weights into source lines after ingestion.
    pub compute_source_lines: bool,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            main_process: None,
            include_kernel: false,
            batch_size: DEFAULT_PROGRESS_BATCH,
            process_counters: true,
            compute_source_lines: true,
        }
    }
}

impl ProfileOptions {
    /// Batch size with a zero value treated as one.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

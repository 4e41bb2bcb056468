//! Progress reporting and cooperative cancellation.
//!
//! Ingestion pushes a [`ProgressUpdate`] every batch of samples and polls a
//! [`CancellationToken`] at the same points. Reporters are fire-and-forget:
//! the pipeline never waits on them and ignores what they do.

use crossbeam_channel::{Sender, TrySendError};
use log::warn;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::domain::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStage {
    TraceLoading,
    SampleProcessing,
    CounterProcessing,
    SourceLineProcessing,
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::TraceLoading => "loading trace",
            Self::SampleProcessing => "processing samples",
            Self::CounterProcessing => "processing counters",
            Self::SourceLineProcessing => "mapping source lines",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: ProgressStage,
    pub total: usize,
    pub current: usize,
}

impl ProgressUpdate {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.current as f64 / self.total as f64) * 100.0
        }
    }
}

/// Receives progress updates from the ingestion thread.
pub trait ProgressReporter {
    fn report(&mut self, update: ProgressUpdate);
}

impl<F: FnMut(ProgressUpdate)> ProgressReporter for F {
    fn report(&mut self, update: ProgressUpdate) {
        self(update);
    }
}

/// Discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&mut self, _update: ProgressUpdate) {}
}

/// Forwards updates over a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: Sender<ProgressUpdate>,
}

impl ChannelProgress {
    #[must_use]
    pub fn new(tx: Sender<ProgressUpdate>) -> Self {
        Self { tx }
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&mut self, update: ProgressUpdate) {
        if let Err(TrySendError::Disconnected(_)) = self.tx.try_send(update) {
            log::trace!("progress receiver gone, dropping {:?}", update.stage);
        }
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Batch boundary bookkeeping shared by every ingestion stage.
pub(crate) struct Checkpoint<'a, R: ?Sized> {
    reporter: &'a mut R,
    cancel: &'a CancellationToken,
    batch_size: usize,
}

impl<'a, R: ProgressReporter + ?Sized> Checkpoint<'a, R> {
    pub(crate) fn new(
        reporter: &'a mut R,
        cancel: &'a CancellationToken,
        batch_size: usize,
    ) -> Self {
        Self { reporter, cancel, batch_size: batch_size.max(1) }
    }

    /// Check for cancellation and report progress when `index` starts a batch.
    pub(crate) fn tick(
        &mut self,
        stage: ProgressStage,
        index: usize,
        total: usize,
    ) -> Result<(), IngestError> {
        if index % self.batch_size == 0 {
            self.check(stage, index, total)?;
        }
        Ok(())
    }

    /// Unconditional check, used at the end of a stage.
    pub(crate) fn check(
        &mut self,
        stage: ProgressStage,
        current: usize,
        total: usize,
    ) -> Result<(), IngestError> {
        if self.cancel.is_cancelled() {
            warn!("cancelled while {stage} ({current}/{total})");
            return Err(IngestError::Cancelled);
        }
        self.reporter.report(ProgressUpdate { stage, total, current });
        Ok(())
    }
}

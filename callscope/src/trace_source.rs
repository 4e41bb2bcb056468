//! Recorded trace loading
//!
//! Replays a JSON-lines stream of [`TraceRecord`]s into a [`RawProfileData`].
//! Records are applied strictly in order; see `callscope_common` for the
//! ordering a producer must respect.
//!
//! Two details of the replay matter for the numbers ingestion produces:
//!
//! - A sample without an explicit weight weighs the time since the previous
//!   sample on the same processor. Gaps longer than the sampling interval
//!   (plus a margin) mean lost samples and fall back to one interval.
//! - A stack walk belongs to the last sample taken on its processor, or
//!   failing that to the last sample of its context. A walk that matches
//!   neither is dropped.

use callscope_common::{
    CounterInfoRecord, CounterRecord, ImageRecord, ProcessRecord, SampleRecord, StackWalkRecord,
    ThreadRecord, TraceRecord, DEFAULT_PROGRESS_BATCH, SAMPLING_ERROR_MARGIN,
};
use log::{debug, info};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::domain::{
    ContextHandle, CpuId, Duration, IngestError, Pid, SampleHandle, Tid, Timestamp,
};
use crate::model::{
    Context, FxHashMap, Image, PerformanceCounterEvent, PerformanceCounterInfo, Process,
    RawProfileData, Sample, Thread,
};
use crate::profiling::progress::Checkpoint;
use crate::profiling::{CancellationToken, ProgressReporter, ProgressStage};

/// Replay statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub records: usize,
    pub samples: usize,
    /// Idle-thread samples not stored.
    pub idle_skipped: usize,
    pub stacks_attached: usize,
    /// Stack walks with no matching sample.
    pub stacks_dropped: usize,
}

/// Load the trace at `path`.
///
/// # Errors
/// `TraceOpenFailed` if the file cannot be opened, `InvalidTrace` for a
/// malformed line, `Cancelled` if `cancel` fires while reading.
pub fn load_trace<R>(
    path: &Path,
    reporter: &mut R,
    cancel: &CancellationToken,
) -> Result<(RawProfileData, LoadStats), IngestError>
where
    R: ProgressReporter + ?Sized,
{
    let open_failed = |e: std::io::Error| IngestError::TraceOpenFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let file = File::open(path).map_err(open_failed)?;
    let total_bytes = file.metadata().map_err(open_failed)?.len();

    info!("Loading trace {}", path.display());
    let total_bytes = usize::try_from(total_bytes).unwrap_or(usize::MAX);
    read_trace(BufReader::new(file), total_bytes, reporter, cancel)
}

/// Replay a trace from any buffered reader. `total_bytes` is only used for
/// progress.
///
/// # Errors
/// As [`load_trace`], minus `TraceOpenFailed`.
pub fn read_trace<B, R>(
    mut reader: B,
    total_bytes: usize,
    reporter: &mut R,
    cancel: &CancellationToken,
) -> Result<(RawProfileData, LoadStats), IngestError>
where
    B: BufRead,
    R: ProgressReporter + ?Sized,
{
    let mut checkpoint = Checkpoint::new(reporter, cancel, 1);
    let mut loader = TraceLoader::new();
    let mut line = String::new();
    let mut line_number = 0usize;
    let mut bytes_read = 0usize;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_number += 1;
        bytes_read += read;

        if line_number % DEFAULT_PROGRESS_BATCH == 1 {
            let done = bytes_read.min(total_bytes);
            checkpoint.check(ProgressStage::TraceLoading, done, total_bytes)?;
        }

        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let record: TraceRecord = serde_json::from_str(text)
            .map_err(|e| IngestError::InvalidTrace { line: line_number, reason: e.to_string() })?;
        loader.apply(record);
    }

    checkpoint.check(ProgressStage::TraceLoading, total_bytes, total_bytes)?;
    let (raw, stats) = loader.finish();
    info!(
        "Loaded {} records: {} samples, {} stacks attached, {} dropped",
        stats.records, stats.samples, stats.stacks_attached, stats.stacks_dropped
    );
    Ok((raw, stats))
}

/// Applies records to a [`RawProfileData`] under construction.
#[derive(Debug, Default)]
pub struct TraceLoader {
    raw: RawProfileData,
    last_sample_on_cpu: FxHashMap<CpuId, SampleHandle>,
    last_sample_in_context: FxHashMap<ContextHandle, SampleHandle>,
    last_time_on_cpu: FxHashMap<CpuId, Timestamp>,
    stats: LoadStats,
}

impl TraceLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, record: TraceRecord) {
        self.stats.records += 1;
        match record {
            TraceRecord::Header(header) => {
                self.raw.set_sampling_interval(Duration(header.sampling_interval_ns));
            }
            TraceRecord::Process(process) => self.add_process(process),
            TraceRecord::Thread(thread) => self.add_thread(thread),
            TraceRecord::Image(image) => self.add_image(image),
            TraceRecord::Sample(sample) => self.add_sample(&sample),
            TraceRecord::StackWalk(walk) => self.add_stack_walk(&walk),
            TraceRecord::CounterInfo(counter) => self.add_counter_info(counter),
            TraceRecord::Counter(event) => self.add_counter_event(&event),
        }
    }

    #[must_use]
    pub fn finish(self) -> (RawProfileData, LoadStats) {
        (self.raw, self.stats)
    }

    fn add_process(&mut self, record: ProcessRecord) {
        let mut process = Process::new(Pid(record.pid));
        process.parent_pid = Pid(record.parent_pid);
        process.name = record.name;
        process.image_file_name = record.image_file_name;
        process.command_line = record.command_line;
        self.raw.add_process(process);
    }

    fn add_thread(&mut self, record: ThreadRecord) {
        self.raw.add_thread_to_process(Thread {
            pid: Pid(record.pid),
            tid: Tid(record.tid),
            name: record.name,
        });
    }

    fn add_image(&mut self, record: ImageRecord) {
        let image = Image {
            base_address: record.base_address,
            size: record.size,
            default_base_address: record.default_base_address,
            file_path: record.file_path,
            original_file_name: record.original_file_name,
            timestamp: record.timestamp,
            checksum: record.checksum,
        };
        debug!("{}: image {} at {:#x}", Pid(record.pid), image.module_name(), image.base_address);
        self.raw.add_image_to_process(Pid(record.pid), image);
    }

    fn context(&mut self, pid: u32, tid: u32, cpu: u32) -> ContextHandle {
        self.raw.get_or_create_process(Pid(pid));
        self.raw.add_context(Context::new(Pid(pid), Tid(tid), CpuId(cpu)))
    }

    fn add_sample(&mut self, record: &SampleRecord) {
        let cpu = CpuId(record.cpu);
        let time = Timestamp(record.time_ns);
        let weight = self.sample_weight(cpu, time, record.weight_ns);

        // The idle thread's samples only matter for kernel attribution.
        if record.tid == 0 && !record.is_kernel {
            self.stats.idle_skipped += 1;
            return;
        }

        let context = self.context(record.pid, record.tid, record.cpu);
        let sample = Sample::new(record.ip, time, weight, context, record.is_kernel);
        let handle = self.raw.add_sample(sample);
        self.last_sample_on_cpu.insert(cpu, handle);
        self.last_sample_in_context.insert(context, handle);
        self.stats.samples += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample_weight(&mut self, cpu: CpuId, time: Timestamp, explicit: Option<u64>) -> Duration {
        let previous = self.last_time_on_cpu.insert(cpu, time);
        if let Some(ns) = explicit {
            return Duration(ns);
        }

        let interval = self.raw.sampling_interval();
        match previous {
            Some(previous) if time > previous => {
                let elapsed = time.saturating_since(previous);
                if elapsed.0 as f64 > interval.0 as f64 * SAMPLING_ERROR_MARGIN {
                    interval
                } else {
                    elapsed
                }
            }
            _ => interval,
        }
    }

    fn add_stack_walk(&mut self, record: &StackWalkRecord) {
        let depth = record.frames.iter().rposition(|&ip| ip != 0).map_or(0, |last| last + 1);
        if depth == 0 {
            self.stats.stacks_dropped += 1;
            return;
        }

        let context = self.context(record.pid, record.tid, record.cpu);
        let frames = &record.frames[..depth];
        let stack = self.raw.add_stack_with(depth, context, |buffer| {
            buffer.copy_from_slice(frames);
        });

        let on_cpu = self.last_sample_on_cpu.get(&CpuId(record.cpu)).copied();
        let in_context = self.last_sample_in_context.get(&context).copied();
        let mut attach =
            |sample: SampleHandle| self.raw.try_set_sample_stack(sample, stack, context);
        let attached = on_cpu.is_some_and(&mut attach) || in_context.is_some_and(&mut attach);

        if attached {
            self.stats.stacks_attached += 1;
        } else {
            self.stats.stacks_dropped += 1;
        }
    }

    fn add_counter_info(&mut self, record: CounterInfoRecord) {
        self.raw.add_performance_counter(PerformanceCounterInfo {
            id: record.id,
            number: 0,
            name: record.name,
            description: record.description,
            frequency: record.frequency,
        });
    }

    fn add_counter_event(&mut self, record: &CounterRecord) {
        let context = self.context(record.pid, record.tid, record.cpu);
        self.raw.add_counter_event(PerformanceCounterEvent {
            ip: record.ip,
            time: Timestamp(record.time_ns),
            context,
            counter_id: record.counter_id,
        });
    }
}

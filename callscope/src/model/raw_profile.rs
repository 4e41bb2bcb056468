//! The raw, unaggregated contents of a trace.
//!
//! [`RawProfileData`] owns every table the trace source fills while replaying
//! events: processes, threads, images, contexts, interned stacks, samples and
//! performance-counter events. Cross references between records are handles,
//! never pointers, so the whole structure stays compact across millions of
//! samples.
//!
//! Construction is single-threaded (`&mut self`); once built, the data is
//! shared read-only between ingestion workers.

use log::debug;

use super::entities::{Context, Image, Process, Thread};
use super::samples::{PerformanceCounterEvent, PerformanceCounterInfo, Sample};
use super::stacks::{Stack, StackTable};
use super::table::{EntityTable, FxHashMap, FxIndexMap};
use crate::domain::{
    ContextHandle, Duration, Handle, ImageHandle, Pid, ProcessHandle, SampleHandle, StackHandle,
    ThreadHandle,
};

#[derive(Debug)]
pub struct RawProfileData {
    processes: FxIndexMap<Pid, Process>,
    threads: EntityTable<Thread, ThreadHandle>,
    images: EntityTable<Image, ImageHandle>,
    contexts: EntityTable<Context, ContextHandle>,
    stacks: StackTable,
    samples: Vec<Sample>,
    counters: Vec<PerformanceCounterInfo>,
    counter_events: Vec<PerformanceCounterEvent>,
    sampling_interval: Duration,
}

impl Default for RawProfileData {
    fn default() -> Self {
        Self {
            processes: FxIndexMap::default(),
            threads: EntityTable::new(),
            images: EntityTable::new(),
            contexts: EntityTable::new(),
            stacks: StackTable::new(),
            samples: Vec::new(),
            counters: Vec::new(),
            counter_events: Vec::new(),
            sampling_interval: Duration(callscope_common::DEFAULT_SAMPLING_INTERVAL_NS),
        }
    }
}

impl RawProfileData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sampling_interval(&self) -> Duration {
        self.sampling_interval
    }

    pub fn set_sampling_interval(&mut self, interval: Duration) {
        self.sampling_interval = interval;
    }

    // =========================================================================
    // PROCESSES
    // =========================================================================

    /// Add or refresh a process. Images and threads already attributed to an
    /// existing process with the same pid are kept.
    pub fn add_process(&mut self, process: Process) -> ProcessHandle {
        let entry = self.processes.entry(process.pid);
        let offset = entry.index();
        let existing = entry.or_insert_with(|| Process::new(process.pid));
        existing.parent_pid = process.parent_pid;
        existing.name = process.name;
        existing.image_file_name = process.image_file_name;
        existing.command_line = process.command_line;
        ProcessHandle::from_offset(offset)
    }

    pub fn get_or_create_process(&mut self, pid: Pid) -> &mut Process {
        self.processes.entry(pid).or_insert_with(|| Process::new(pid))
    }

    #[must_use]
    pub fn find_process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// # Panics
    /// Panics if `handle` is out of range.
    #[must_use]
    pub fn process(&self, handle: ProcessHandle) -> &Process {
        handle
            .offset()
            .and_then(|offset| self.processes.get_index(offset))
            .map_or_else(|| panic!("{handle} out of range"), |(_, process)| process)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Process owning the most samples, used when no process was requested.
    #[must_use]
    pub fn busiest_process(&self) -> Option<Pid> {
        let mut counts: FxHashMap<Pid, usize> = FxHashMap::default();
        for sample in &self.samples {
            *counts.entry(self.contexts.find(sample.context).pid).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|&(pid, count)| (count, std::cmp::Reverse(pid)))
            .map(|(pid, _)| pid)
    }

    // =========================================================================
    // THREADS, IMAGES, CONTEXTS
    // =========================================================================

    pub fn add_thread(&mut self, thread: Thread) -> ThreadHandle {
        self.threads.add(thread)
    }

    pub fn add_thread_to_process(&mut self, thread: Thread) -> ThreadHandle {
        let pid = thread.pid;
        let handle = self.threads.add(thread);
        self.get_or_create_process(pid).add_thread(handle);
        handle
    }

    #[must_use]
    pub fn find_thread(&self, handle: ThreadHandle) -> &Thread {
        self.threads.find(handle)
    }

    pub fn add_image(&mut self, image: Image) -> ImageHandle {
        self.images.add(image)
    }

    pub fn add_image_to_process(&mut self, pid: Pid, image: Image) -> ImageHandle {
        debug!("{pid}: image {} at 0x{:x}", image.module_name(), image.base_address);
        let handle = self.images.add(image);
        self.get_or_create_process(pid).add_image(handle);
        handle
    }

    #[must_use]
    pub fn find_image(&self, handle: ImageHandle) -> &Image {
        self.images.find(handle)
    }

    pub fn images(&self) -> impl Iterator<Item = (ImageHandle, &Image)> {
        self.images.iter()
    }

    /// Images loaded in `pid`, in load order.
    pub fn process_images(&self, pid: Pid) -> impl Iterator<Item = (ImageHandle, &Image)> {
        self.processes
            .get(&pid)
            .map(Process::images)
            .unwrap_or_default()
            .iter()
            .map(|&handle| (handle, self.images.find(handle)))
    }

    pub fn add_context(&mut self, context: Context) -> ContextHandle {
        self.contexts.add(context)
    }

    #[must_use]
    pub fn find_context(&self, handle: ContextHandle) -> &Context {
        self.contexts.find(handle)
    }

    // =========================================================================
    // STACKS
    // =========================================================================

    /// Intern `frames` (innermost first) as a stack of `context`.
    pub fn add_stack(&mut self, frames: &[u64], context: ContextHandle) -> StackHandle {
        let pid = self.contexts.find(context).pid;
        self.stacks.add(pid, frames, context)
    }

    /// Intern a stack assembled in a reused scratch buffer; see
    /// [`StackTable::add_with`].
    pub fn add_stack_with<F>(
        &mut self,
        frame_count: usize,
        context: ContextHandle,
        fill: F,
    ) -> StackHandle
    where
        F: FnOnce(&mut [u64]),
    {
        let pid = self.contexts.find(context).pid;
        self.stacks.add_with(pid, frame_count, context, fill)
    }

    #[must_use]
    pub fn find_stack(&self, handle: StackHandle) -> &Stack {
        self.stacks.find(handle)
    }

    /// Frames of the stack `handle`, innermost first.
    #[must_use]
    pub fn stack_frames(&self, handle: StackHandle) -> &[u64] {
        self.stacks.frames(self.stacks.find(handle))
    }

    #[must_use]
    pub fn stacks(&self) -> &StackTable {
        &self.stacks
    }

    // =========================================================================
    // SAMPLES
    // =========================================================================

    /// # Panics
    /// Panics if the sample has no context.
    pub fn add_sample(&mut self, sample: Sample) -> SampleHandle {
        assert!(!sample.context.is_none(), "sample without context");
        self.samples.push(sample);
        SampleHandle::from_offset(self.samples.len() - 1)
    }

    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// # Panics
    /// Panics if `handle` is out of range.
    #[must_use]
    pub fn find_sample(&self, handle: SampleHandle) -> &Sample {
        handle
            .offset()
            .and_then(|offset| self.samples.get(offset))
            .unwrap_or_else(|| panic!("{handle} out of range ({} samples)", self.samples.len()))
    }

    /// Attach `stack` to a stored sample, provided the sample was recorded
    /// in `context`. Returns `false` (and changes nothing) otherwise.
    pub fn try_set_sample_stack(
        &mut self,
        sample: SampleHandle,
        stack: StackHandle,
        context: ContextHandle,
    ) -> bool {
        let Some(slot) = sample.offset().and_then(|offset| self.samples.get_mut(offset)) else {
            return false;
        };

        if slot.context != context {
            return false;
        }

        slot.stack = stack;
        true
    }

    // =========================================================================
    // PERFORMANCE COUNTERS
    // =========================================================================

    pub fn add_performance_counter(&mut self, mut counter: PerformanceCounterInfo) {
        counter.number = self.counters.len();
        self.counters.push(counter);
    }

    #[must_use]
    pub fn performance_counters(&self) -> &[PerformanceCounterInfo] {
        &self.counters
    }

    /// # Panics
    /// Panics if the event has no context.
    pub fn add_counter_event(&mut self, event: PerformanceCounterEvent) -> usize {
        assert!(!event.context.is_none(), "counter event without context");
        self.counter_events.push(event);
        self.counter_events.len()
    }

    #[must_use]
    pub fn counter_events(&self) -> &[PerformanceCounterEvent] {
        &self.counter_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CpuId, Tid, Timestamp};

    fn context(profile: &mut RawProfileData, pid: u32, tid: u32) -> ContextHandle {
        profile.add_context(Context::new(Pid(pid), Tid(tid), CpuId(0)))
    }

    fn sample(ctx: ContextHandle) -> Sample {
        Sample::new(0x1000, Timestamp(0), Duration::from_millis(1), ctx, false)
    }

    #[test]
    fn test_add_sample_returns_one_based_handles() {
        let mut profile = RawProfileData::new();
        let ctx = context(&mut profile, 1, 1);
        assert_eq!(profile.add_sample(sample(ctx)), SampleHandle(1));
        assert_eq!(profile.add_sample(sample(ctx)), SampleHandle(2));
    }

    #[test]
    #[should_panic(expected = "sample without context")]
    fn test_sample_without_context_panics() {
        let mut profile = RawProfileData::new();
        profile.add_sample(sample(ContextHandle::NONE));
    }

    #[test]
    fn test_try_set_sample_stack_checks_context() {
        let mut profile = RawProfileData::new();
        let ctx_a = context(&mut profile, 1, 1);
        let ctx_b = context(&mut profile, 1, 2);
        let handle = profile.add_sample(sample(ctx_a));
        let stack = profile.add_stack(&[0x1000, 0x2000], ctx_a);

        assert!(!profile.try_set_sample_stack(handle, stack, ctx_b));
        assert!(!profile.find_sample(handle).has_stack());

        assert!(profile.try_set_sample_stack(handle, stack, ctx_a));
        assert_eq!(profile.find_sample(handle).stack, stack);
    }

    #[test]
    fn test_try_set_sample_stack_rejects_none_handle() {
        let mut profile = RawProfileData::new();
        let ctx = context(&mut profile, 1, 1);
        let stack = profile.add_stack(&[1], ctx);
        assert!(!profile.try_set_sample_stack(SampleHandle::NONE, stack, ctx));
    }

    #[test]
    fn test_identical_stacks_in_same_context_are_interned() {
        let mut profile = RawProfileData::new();
        let ctx = context(&mut profile, 4, 4);
        let first = profile.add_stack(&[0xA, 0xB, 0xC], ctx);
        let second = profile.add_stack_with(3, ctx, |buf| buf.copy_from_slice(&[0xA, 0xB, 0xC]));

        assert_eq!(first, second);
        assert_eq!(profile.find_stack(first), profile.find_stack(second));
        assert_eq!(profile.stacks().distinct_frame_arrays(), 1);
    }

    #[test]
    fn test_images_attach_to_process_once() {
        let mut profile = RawProfileData::new();
        let image = Image {
            base_address: 0x4000,
            size: 0x1000,
            default_base_address: 0,
            file_path: "/bin/app".to_string(),
            original_file_name: None,
            timestamp: 0,
            checksum: 0,
        };
        let a = profile.add_image_to_process(Pid(9), image.clone());
        let b = profile.add_image_to_process(Pid(9), image);
        assert_eq!(a, b);
        assert_eq!(profile.process_images(Pid(9)).count(), 1);
        assert_eq!(profile.process_images(Pid(10)).count(), 0);
    }

    #[test]
    fn test_add_process_keeps_attached_entities() {
        let mut profile = RawProfileData::new();
        profile.add_thread_to_process(Thread { pid: Pid(5), tid: Tid(50), name: String::new() });

        let mut named = Process::new(Pid(5));
        named.name = "server".to_string();
        let handle = profile.add_process(named);

        let process = profile.process(handle);
        assert_eq!(process.name, "server");
        assert_eq!(process.threads().len(), 1);
    }

    #[test]
    fn test_busiest_process() {
        let mut profile = RawProfileData::new();
        let a = context(&mut profile, 1, 1);
        let b = context(&mut profile, 2, 2);
        profile.add_sample(sample(a));
        profile.add_sample(sample(b));
        profile.add_sample(sample(b));
        assert_eq!(profile.busiest_process(), Some(Pid(2)));
    }
}

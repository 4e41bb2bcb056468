//! # Sample Ingestion
//!
//! Folds the samples of one process into a [`ProfileData`].
//!
//! ## Passes
//!
//! 1. **Samples** - every sample of the main process adds to the total
//!    weight; samples with a stack also feed the per-function table and the
//!    call tree.
//! 2. **Counters** - performance-counter events are attributed to their
//!    module and function (optional, see [`ProfileOptions`]).
//! 3. **Source lines** - instruction weights are folded into line weights
//!    through each module's debug info (optional).
//!
//! Every pass polls the cancellation token at batch boundaries and at its
//! end. A cancelled ingestion returns [`IngestError::Cancelled`] and no data.
//!
//! ## Attribution rules
//!
//! Per function, a sample counts once however often the function recurs on
//! the stack: inclusive weight, instruction weight and the callee edge are
//! added on the first (innermost) occurrence only. Caller edges are added
//! for every pair of adjacent resolved frames. Exclusive weight goes to the
//! innermost resolved frame. An unresolved frame breaks the adjacency.
//!
//! The call tree links resolved frames across unresolved gaps, root first.

use log::{debug, info};

use super::counter_processor::process_counters;
use super::options::ProfileOptions;
use super::progress::{CancellationToken, Checkpoint, ProgressReporter, ProgressStage};
use super::stack_resolver::{ResolvedFrame, ResolvedStack, ResolverStats, StackResolver};
use crate::analysis::ProfileData;
use crate::calltree::CallTreeNode;
use crate::domain::{Duration, FunctionId, IngestError, Pid};
use crate::model::{FxHashSet, RawProfileData};
use crate::symbolization::{ModuleRegistry, SymbolSource};
use std::sync::Arc;

/// Counters collected while ingesting, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub main_process: Pid,
    /// Samples in the trace, any process.
    pub samples: usize,
    pub other_process: usize,
    pub kernel_skipped: usize,
    pub without_stack: usize,
    /// Samples whose stack was walked.
    pub attributed: usize,
    pub counter_events: usize,
    pub resolver: ResolverStats,
}

/// Ingest `raw` with debug info from `source`.
///
/// # Errors
/// `Cancelled` if `cancel` fires, `NoSamples` if the profiled process has
/// no samples.
pub fn ingest<S, R>(
    raw: &RawProfileData,
    source: S,
    options: &ProfileOptions,
    reporter: &mut R,
    cancel: &CancellationToken,
) -> Result<ProfileData, IngestError>
where
    S: SymbolSource,
    R: ProgressReporter + ?Sized,
{
    SampleProcessor::new(raw, source, options).run(reporter, cancel).map(|(profile, _)| profile)
}

/// One ingestion run. Owns the resolver caches and the profile being built.
pub struct SampleProcessor<'a, S> {
    raw: &'a RawProfileData,
    options: &'a ProfileOptions,
    resolver: StackResolver<'a, S>,
    profile: ProfileData,
    stats: IngestStats,
    /// Functions already credited for the current sample.
    visited: FxHashSet<FunctionId>,
}

impl<'a, S: SymbolSource> SampleProcessor<'a, S> {
    pub fn new(raw: &'a RawProfileData, source: S, options: &'a ProfileOptions) -> Self {
        Self {
            raw,
            options,
            resolver: StackResolver::new(raw, ModuleRegistry::new(source)),
            profile: ProfileData::new(),
            stats: IngestStats::default(),
            visited: FxHashSet::default(),
        }
    }

    /// Run every pass.
    ///
    /// # Errors
    /// See [`ingest`].
    pub fn run<R>(
        mut self,
        reporter: &mut R,
        cancel: &CancellationToken,
    ) -> Result<(ProfileData, IngestStats), IngestError>
    where
        R: ProgressReporter + ?Sized,
    {
        let raw = self.raw;
        let main_pid = self
            .options
            .main_process
            .or_else(|| raw.busiest_process())
            .ok_or(IngestError::NoSamples(Pid::default()))?;
        self.stats.main_process = main_pid;
        info!("Profiling {main_pid}: {} samples in trace", raw.samples().len());

        let mut checkpoint = Checkpoint::new(reporter, cancel, self.options.effective_batch_size());

        // === SAMPLES ===
        self.process_samples(main_pid, &mut checkpoint)?;
        if self.stats.samples - self.stats.other_process == 0 {
            return Err(IngestError::NoSamples(main_pid));
        }

        // === COUNTERS ===
        if self.options.process_counters && !raw.counter_events().is_empty() {
            self.stats.counter_events = process_counters(
                raw,
                main_pid,
                &mut self.resolver,
                &mut self.profile,
                &mut checkpoint,
            )?;
        }

        // === SOURCE LINES ===
        if self.options.compute_source_lines {
            self.process_source_lines(&mut checkpoint)?;
        }

        self.stats.resolver = self.resolver.stats();
        let Self { mut profile, resolver, stats, .. } = self;
        profile.set_module_report(resolver.into_modules().into_report());

        info!(
            "Ingested {} samples into {} functions, {} call tree nodes",
            stats.attributed,
            profile.function_count(),
            profile.call_tree().node_count()
        );
        Ok((profile, stats))
    }

    fn process_samples<R>(
        &mut self,
        main_pid: Pid,
        checkpoint: &mut Checkpoint<'_, R>,
    ) -> Result<(), IngestError>
    where
        R: ProgressReporter + ?Sized,
    {
        let raw = self.raw;
        let samples = raw.samples();
        let total = samples.len();
        self.stats.samples = total;

        for (index, sample) in samples.iter().enumerate() {
            checkpoint.tick(ProgressStage::SampleProcessing, index, total)?;

            if raw.find_context(sample.context).pid != main_pid {
                self.stats.other_process += 1;
                continue;
            }
            if sample.is_kernel && !self.options.include_kernel {
                self.stats.kernel_skipped += 1;
                continue;
            }

            self.profile.total_weight += sample.weight;
            if !sample.has_stack() {
                self.stats.without_stack += 1;
                continue;
            }

            self.profile.profile_weight += sample.weight;
            self.stats.attributed += 1;

            let stack = self.resolver.resolve(sample.stack);
            self.add_function_weights(&stack, sample.weight);
            self.add_call_tree_sample(&stack, sample.weight);
        }

        checkpoint.check(ProgressStage::SampleProcessing, total, total)?;
        debug!(
            "samples: {} attributed, {} without stack, {} kernel skipped, {} other process",
            self.stats.attributed,
            self.stats.without_stack,
            self.stats.kernel_skipped,
            self.stats.other_process
        );
        Ok(())
    }

    fn add_function_weights(&mut self, stack: &ResolvedStack, weight: Duration) {
        let profile = &mut self.profile;
        self.visited.clear();

        let mut module_counted = false;
        let mut exclusive_counted = false;
        let mut callee: Option<FunctionId> = None;

        for frame in &stack.frames {
            if !module_counted {
                if let Some(module) = frame.module {
                    profile.add_module_sample(module, weight);
                    module_counted = true;
                }
            }

            let Some(function) = &frame.function else {
                callee = None;
                continue;
            };

            let first_visit = self.visited.insert(function.id);
            let data = profile.get_or_create_function_profile(function.id, &function.debug_info);
            if first_visit {
                data.add_instruction_sample(frame.function_offset().unwrap_or(0), weight);
                data.weight += weight;
                if let Some(callee) = callee {
                    data.add_child_sample(callee, weight);
                }
            }
            if !exclusive_counted {
                data.exclusive_weight += weight;
                exclusive_counted = true;
            }

            if let Some(callee) = callee {
                if let Some(callee_data) = profile.function_profile_mut(callee) {
                    callee_data.add_caller_sample(function.id, weight);
                }
            }
            callee = Some(function.id);
        }
    }

    fn add_call_tree_sample(&self, stack: &ResolvedStack, weight: Duration) {
        let tree = self.profile.call_tree();
        let mut parent: Option<(Arc<CallTreeNode>, &ResolvedFrame)> = None;

        for frame in stack.frames.iter().rev() {
            let Some(function) = &frame.function else {
                continue;
            };

            let node = match &parent {
                None => tree.add_root_node(&function.debug_info, function.id),
                Some((parent_node, parent_frame)) => {
                    let node = tree.add_child_node(parent_node, &function.debug_info, function.id);
                    parent_node.add_call_site(&node, parent_frame.frame_rva, weight);
                    node
                }
            };
            node.accumulate_weight(weight);
            node.set_kind_if_unset(frame.kind);
            parent = Some((node, frame));
        }

        if let Some((leaf, _)) = parent {
            leaf.accumulate_exclusive_weight(weight);
        }
    }

    fn process_source_lines<R>(
        &mut self,
        checkpoint: &mut Checkpoint<'_, R>,
    ) -> Result<(), IngestError>
    where
        R: ProgressReporter + ?Sized,
    {
        let mut functions: Vec<FunctionId> = self.profile.functions().map(|(id, _)| id).collect();
        functions.sort_unstable();
        let total = functions.len();

        for (index, function) in functions.into_iter().enumerate() {
            checkpoint.tick(ProgressStage::SourceLineProcessing, index, total)?;

            let module = self.resolver.modules().module(function.module);
            let Some(provider) = module.debug_info().provider() else {
                continue;
            };
            if let Some(data) = self.profile.function_profile_mut(function) {
                data.process_source_lines(provider);
            }
        }

        checkpoint.check(ProgressStage::SourceLineProcessing, total, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CpuId, SymbolError, Tid, Timestamp};
    use crate::model::{Context, Image, Sample};
    use crate::symbolization::{
        BinaryDescriptor, DebugInfo, FunctionDebugInfo, LoadedDebugInfo, NativeDebugInfo,
    };

    const BASE: u64 = 0x1_0000;

    struct Functions;

    impl SymbolSource for Functions {
        fn load(
            &self,
            _image: &Image,
            _binary: &BinaryDescriptor,
        ) -> Result<LoadedDebugInfo, SymbolError> {
            let functions = ["a", "b", "c"]
                .iter()
                .enumerate()
                .map(|(i, name)| FunctionDebugInfo::new(*name, 0x100 * (i as u64 + 1), 0x80))
                .collect();
            Ok(LoadedDebugInfo {
                debug_info: DebugInfo::Native(NativeDebugInfo::from_functions(functions)),
                binary_path: None,
            })
        }
    }

    fn raw_with_stacks(stacks: &[&[u64]], pid: Pid) -> RawProfileData {
        let mut raw = RawProfileData::new();
        raw.add_image_to_process(pid, Image {
            base_address: BASE,
            size: 0x1000,
            default_base_address: 0,
            file_path: "/bin/app".to_string(),
            original_file_name: None,
            timestamp: 0,
            checksum: 0,
        });
        let context = raw.add_context(Context::new(pid, Tid(pid.0), CpuId(0)));
        for (i, frames) in stacks.iter().enumerate() {
            let stack = raw.add_stack(frames, context);
            let sample = raw.add_sample(Sample::new(
                frames[0],
                Timestamp(i as u64),
                Duration::from_millis(1),
                context,
                false,
            ));
            assert!(raw.try_set_sample_stack(sample, stack, context));
        }
        raw
    }

    fn id_of(profile: &ProfileData, name: &str) -> FunctionId {
        profile.functions().find(|(_, data)| data.name() == name).map(|(id, _)| id).unwrap()
    }

    #[test]
    fn test_unresolved_frame_breaks_caller_edge() {
        // a <- ??? <- b, innermost first.
        let raw = raw_with_stacks(&[&[BASE + 0x110, BASE + 0x900, BASE + 0x210]], Pid(1));
        let options = ProfileOptions::default();
        let profile =
            ingest(&raw, Functions, &options, &mut |_| {}, &CancellationToken::new()).unwrap();

        let a = id_of(&profile, "a");
        let b = id_of(&profile, "b");
        assert!(!profile.get_function_profile(a).unwrap().has_callers());
        assert!(!profile.get_function_profile(b).unwrap().has_callees());

        // The call tree still links b -> a.
        let root = profile.call_tree().find_root_node(b).unwrap();
        assert_eq!(root.children()[0].function(), a);
    }

    #[test]
    fn test_no_samples_in_requested_process() {
        let raw = raw_with_stacks(&[&[BASE + 0x110]], Pid(1));
        let options = ProfileOptions { main_process: Some(Pid(2)), ..ProfileOptions::default() };
        let result = ingest(&raw, Functions, &options, &mut |_| {}, &CancellationToken::new());
        assert!(matches!(result, Err(IngestError::NoSamples(Pid(2)))));
    }

    #[test]
    fn test_stats_and_module_weight() {
        let raw = raw_with_stacks(&[&[BASE + 0x110], &[BASE + 0x110], &[0x10]], Pid(3));
        let options = ProfileOptions::default();
        let (profile, stats) = SampleProcessor::new(&raw, Functions, &options)
            .run(&mut |_| {}, &CancellationToken::new())
            .unwrap();

        assert_eq!(stats.main_process, Pid(3));
        assert_eq!(stats.attributed, 3);
        assert_eq!(stats.resolver.stack_hits, 1);
        assert_eq!(profile.profile_weight, Duration::from_millis(3));

        let (module, weight) = profile.sorted_module_weights()[0];
        assert_eq!(weight, Duration::from_millis(2));
        assert!(profile.module_report().find(module).is_some());
        assert_eq!(profile.module_name(module), "app");
    }
}

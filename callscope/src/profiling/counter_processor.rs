//! Performance-counter pass.
//!
//! Counter events carry a single instruction pointer and no stack. Each
//! event of the main process adds one to its module's counter set and,
//! when the address resolves to a function, to the counter set of that
//! instruction.

use log::debug;

use super::progress::{Checkpoint, ProgressReporter, ProgressStage};
use super::stack_resolver::StackResolver;
use crate::analysis::ProfileData;
use crate::domain::{IngestError, Pid};
use crate::model::RawProfileData;
use crate::symbolization::SymbolSource;

/// Attribute the counter events of `main_pid`. Returns how many were
/// attributed to a module.
pub(crate) fn process_counters<S, R>(
    raw: &RawProfileData,
    main_pid: Pid,
    resolver: &mut StackResolver<'_, S>,
    profile: &mut ProfileData,
    checkpoint: &mut Checkpoint<'_, R>,
) -> Result<usize, IngestError>
where
    S: SymbolSource,
    R: ProgressReporter + ?Sized,
{
    for counter in raw.performance_counters() {
        profile.register_performance_counter(counter.clone());
    }

    let events = raw.counter_events();
    let total = events.len();
    let mut attributed = 0;

    for (index, event) in events.iter().enumerate() {
        checkpoint.tick(ProgressStage::CounterProcessing, index, total)?;

        let pid = raw.find_context(event.context).pid;
        if pid != main_pid {
            continue;
        }

        let frame = resolver.resolve_ip(event.ip, pid);
        let Some(module) = frame.module else {
            continue;
        };
        profile.add_module_counter(module, event.counter_id, 1);
        attributed += 1;

        if let (Some(function), Some(offset)) = (&frame.function, frame.function_offset()) {
            profile
                .get_or_create_function_profile(function.id, &function.debug_info)
                .add_counter_sample(offset, event.counter_id, 1);
        }
    }

    checkpoint.check(ProgressStage::CounterProcessing, total, total)?;
    debug!("counters: {attributed} of {total} events attributed");
    Ok(attributed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CpuId, SymbolError, Tid, Timestamp};
    use crate::model::{Context, Image, PerformanceCounterEvent, PerformanceCounterInfo};
    use crate::profiling::{CancellationToken, NoProgress};
    use crate::symbolization::{
        BinaryDescriptor, DebugInfo, FunctionDebugInfo, LoadedDebugInfo, ModuleRegistry,
        NativeDebugInfo,
    };

    struct OneFunction;

    impl SymbolSource for OneFunction {
        fn load(
            &self,
            _image: &Image,
            _binary: &BinaryDescriptor,
        ) -> Result<LoadedDebugInfo, SymbolError> {
            Ok(LoadedDebugInfo {
                debug_info: DebugInfo::Native(NativeDebugInfo::from_functions(vec![
                    FunctionDebugInfo::new("hot_loop", 0x40, 0x40),
                ])),
                binary_path: None,
            })
        }
    }

    #[test]
    fn test_counters_attributed_to_module_and_instruction() {
        let mut raw = RawProfileData::new();
        raw.add_image_to_process(Pid(1), Image {
            base_address: 0x1000,
            size: 0x100,
            default_base_address: 0,
            file_path: "/bin/bench".to_string(),
            original_file_name: None,
            timestamp: 0,
            checksum: 0,
        });
        let mine = raw.add_context(Context::new(Pid(1), Tid(1), CpuId(0)));
        let other = raw.add_context(Context::new(Pid(2), Tid(2), CpuId(0)));
        raw.add_performance_counter(PerformanceCounterInfo {
            id: 3,
            number: 0,
            name: "BranchMispredictions".to_string(),
            description: String::new(),
            frequency: 4096,
        });
        let events =
            [(0x1048, mine), (0x1048, mine), (0x1010, mine), (0x1048, other), (0x9000, mine)];
        for (ip, context) in events {
            raw.add_counter_event(PerformanceCounterEvent {
                ip,
                time: Timestamp(0),
                context,
                counter_id: 3,
            });
        }

        let mut resolver = StackResolver::new(&raw, ModuleRegistry::new(OneFunction));
        let mut profile = ProfileData::new();
        let token = CancellationToken::new();
        let mut reporter = NoProgress;
        let mut checkpoint = Checkpoint::new(&mut reporter, &token, 2);

        let attributed =
            process_counters(&raw, Pid(1), &mut resolver, &mut profile, &mut checkpoint).unwrap();
        assert_eq!(attributed, 3);
        assert_eq!(profile.get_performance_counter(3).unwrap().name, "BranchMispredictions");

        let module = resolver.modules().modules()[0].id;
        assert_eq!(profile.module_counters(module).unwrap().find_counter_value(3), 3);

        let (_, hot) = profile.functions().next().unwrap();
        assert_eq!(hot.compute_function_counters().find_counter_value(3), 2);
        assert_eq!(hot.instruction_counters[&0x8].find_counter_value(3), 2);
    }
}

//! Stack resolution
//!
//! Turns the raw instruction pointers of an interned stack into frames that
//! know their image, module, image-relative address and function. Identical
//! stacks are interned by the trace, so each [`StackHandle`] is resolved once
//! and shared; individual frames are cached by `(pid, ip)` because most
//! stacks share their outer frames.

use std::sync::Arc;

use crate::calltree::NodeKind;
use crate::domain::{ContextHandle, FunctionId, ImageHandle, ModuleId, Pid, StackHandle};
use crate::model::{FxHashMap, RawProfileData};
use crate::symbolization::{
    DebugInfoKind, FunctionDebugInfo, ImageResolver, ModuleRegistry, SymbolSource,
};

/// Lowest address of the kernel half of a canonical 64-bit address space.
pub const KERNEL_ADDRESS_START: u64 = 0xffff_8000_0000_0000;

#[derive(Debug, Clone)]
pub struct ResolvedFunction {
    pub id: FunctionId,
    pub debug_info: Arc<FunctionDebugInfo>,
}

/// One resolved frame. Frames outside every image, or inside an image with
/// no matching function, keep `function` empty.
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub ip: u64,
    pub image: Option<ImageHandle>,
    pub module: Option<ModuleId>,
    /// `ip` relative to the image base, zero without an image.
    pub frame_rva: u64,
    pub function: Option<ResolvedFunction>,
    pub kind: NodeKind,
}

impl ResolvedFrame {
    fn unresolved(ip: u64) -> Self {
        Self {
            ip,
            image: None,
            module: None,
            frame_rva: 0,
            function: None,
            kind: kind_for_address(ip),
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.function.is_some()
    }

    /// Offset of the frame inside its function.
    #[must_use]
    pub fn function_offset(&self) -> Option<u64> {
        self.function
            .as_ref()
            .map(|function| self.frame_rva.saturating_sub(function.debug_info.rva))
    }
}

/// Frames of one stack, innermost first.
#[derive(Debug, Clone)]
pub struct ResolvedStack {
    pub context: ContextHandle,
    pub frames: Vec<ResolvedFrame>,
}

impl ResolvedStack {
    /// Module of the innermost frame that lies in an image.
    #[must_use]
    pub fn first_module(&self) -> Option<ModuleId> {
        self.frames.iter().find_map(|frame| frame.module)
    }

    pub fn resolved_frames(&self) -> impl DoubleEndedIterator<Item = &ResolvedFrame> {
        self.frames.iter().filter(|frame| frame.is_resolved())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub stack_hits: u64,
    pub stack_misses: u64,
    pub frame_hits: u64,
    pub frame_misses: u64,
}

/// Caching stack resolver for one ingestion thread.
pub struct StackResolver<'a, S> {
    profile: &'a RawProfileData,
    images: ImageResolver<'a>,
    modules: ModuleRegistry<S>,
    stacks: FxHashMap<StackHandle, Arc<ResolvedStack>>,
    frames: FxHashMap<(Pid, u64), ResolvedFrame>,
    stats: ResolverStats,
}

impl<'a, S: SymbolSource> StackResolver<'a, S> {
    pub fn new(profile: &'a RawProfileData, modules: ModuleRegistry<S>) -> Self {
        Self {
            profile,
            images: ImageResolver::new(profile),
            modules,
            stacks: FxHashMap::default(),
            frames: FxHashMap::default(),
            stats: ResolverStats::default(),
        }
    }

    pub fn resolve(&mut self, handle: StackHandle) -> Arc<ResolvedStack> {
        if let Some(resolved) = self.stacks.get(&handle) {
            self.stats.stack_hits += 1;
            return Arc::clone(resolved);
        }
        self.stats.stack_misses += 1;

        let profile = self.profile;
        let context = profile.find_stack(handle).context;
        let pid = profile.find_context(context).pid;
        let frames = profile
            .stack_frames(handle)
            .iter()
            .map(|&ip| self.resolve_ip(ip, pid))
            .collect();

        let resolved = Arc::new(ResolvedStack { context, frames });
        self.stacks.insert(handle, Arc::clone(&resolved));
        resolved
    }

    /// Resolve a single address in the process `pid`.
    pub fn resolve_ip(&mut self, ip: u64, pid: Pid) -> ResolvedFrame {
        if let Some(frame) = self.frames.get(&(pid, ip)) {
            self.stats.frame_hits += 1;
            return frame.clone();
        }
        self.stats.frame_misses += 1;

        let frame = self.resolve_uncached(ip, pid);
        self.frames.insert((pid, ip), frame.clone());
        frame
    }

    fn resolve_uncached(&mut self, ip: u64, pid: Pid) -> ResolvedFrame {
        let mut frame = ResolvedFrame::unresolved(ip);
        let Some(handle) = self.images.find_image_in_process(ip, pid) else {
            return frame;
        };

        let profile = self.profile;
        let image = profile.find_image(handle);
        let module = self.modules.module_for_image(handle, image);

        frame.image = Some(handle);
        frame.module = Some(module.id);
        frame.frame_rva = ip - image.base_address;
        if module.debug_info().kind() == DebugInfoKind::Managed {
            frame.kind = NodeKind::Managed;
        }

        if let Some(debug_info) = module.find_debug_function_info(frame.frame_rva) {
            let id = module.resolve_function(&debug_info);
            frame.function = Some(ResolvedFunction { id, debug_info });
        }
        frame
    }

    #[must_use]
    pub fn modules(&self) -> &ModuleRegistry<S> {
        &self.modules
    }

    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    #[must_use]
    pub fn into_modules(self) -> ModuleRegistry<S> {
        self.modules
    }
}

fn kind_for_address(ip: u64) -> NodeKind {
    if ip >= KERNEL_ADDRESS_START {
        NodeKind::NativeKernel
    } else {
        NodeKind::NativeUser
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CpuId, SymbolError, Tid};
    use crate::model::{Context, Image};
    use crate::symbolization::{BinaryDescriptor, DebugInfo, LoadedDebugInfo, NativeDebugInfo};

    struct FixedSource;

    impl SymbolSource for FixedSource {
        fn load(
            &self,
            _image: &Image,
            _binary: &BinaryDescriptor,
        ) -> Result<LoadedDebugInfo, SymbolError> {
            let functions = vec![
                FunctionDebugInfo::new("main", 0x100, 0x40),
                FunctionDebugInfo::new("work", 0x200, 0x40),
            ];
            Ok(LoadedDebugInfo {
                debug_info: DebugInfo::Native(NativeDebugInfo::from_functions(functions)),
                binary_path: None,
            })
        }
    }

    fn profile() -> (RawProfileData, StackHandle) {
        let mut profile = RawProfileData::new();
        profile.add_image_to_process(Pid(7), Image {
            base_address: 0x40_0000,
            size: 0x1000,
            default_base_address: 0,
            file_path: "/bin/app".to_string(),
            original_file_name: None,
            timestamp: 0,
            checksum: 0,
        });
        let context = profile.add_context(Context::new(Pid(7), Tid(7), CpuId(0)));
        let stack = profile.add_stack(&[0x40_0210, 0x9_0000, 0x40_0104], context);
        (profile, stack)
    }

    #[test]
    fn test_resolves_frames_innermost_first() {
        let (profile, stack) = profile();
        let mut resolver = StackResolver::new(&profile, ModuleRegistry::new(FixedSource));

        let resolved = resolver.resolve(stack);
        assert_eq!(resolved.frames.len(), 3);

        let top = &resolved.frames[0];
        assert_eq!(top.frame_rva, 0x210);
        assert_eq!(top.function.as_ref().unwrap().debug_info.name, "work");
        assert_eq!(top.function_offset(), Some(0x10));
        assert_eq!(top.kind, NodeKind::NativeUser);

        // Outside every image.
        assert!(resolved.frames[1].image.is_none());
        assert!(!resolved.frames[1].is_resolved());

        assert_eq!(resolved.frames[2].function.as_ref().unwrap().debug_info.name, "main");
        assert_eq!(resolved.resolved_frames().count(), 2);
        assert!(resolved.first_module().is_some());
    }

    #[test]
    fn test_stack_cache_shares_resolution() {
        let (profile, stack) = profile();
        let mut resolver = StackResolver::new(&profile, ModuleRegistry::new(FixedSource));

        let first = resolver.resolve(stack);
        let second = resolver.resolve(stack);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.stats().stack_hits, 1);
        assert_eq!(resolver.stats().stack_misses, 1);
        assert_eq!(resolver.modules().modules().len(), 1);
    }

    #[test]
    fn test_kernel_addresses_are_classified() {
        let profile = RawProfileData::new();
        let mut resolver = StackResolver::new(&profile, ModuleRegistry::new(FixedSource));
        let frame = resolver.resolve_ip(0xffff_ffff_8100_0000, Pid(1));
        assert_eq!(frame.kind, NodeKind::NativeKernel);
        assert!(!frame.is_resolved());
    }
}

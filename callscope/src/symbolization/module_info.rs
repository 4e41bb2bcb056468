//! Per-image module metadata and the module load report.
//!
//! The first time ingestion meets an image, the [`ModuleRegistry`] asks its
//! [`SymbolSource`] for debug info and caches the outcome, good or bad, for
//! every later frame in that image. Images of the same binary share one
//! module. Load problems never abort ingestion: they are recorded in the
//! [`ModuleReport`] and the module's frames stay unresolved.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::debug_info::{DebugInfo, DebugInfoKind, DebugInfoProvider, FunctionDebugInfo};
use super::locator::{BinaryDescriptor, BinaryLocator, FileSystemLocator};
use super::native::NativeDebugInfo;
use super::perf_map::{is_perf_map, ManagedDebugInfo};
use crate::domain::{FunctionId, ImageHandle, ModuleId, SymbolError};
use crate::model::{FxHashMap, Image};

// =============================================================================
// SYMBOL SOURCES
// =============================================================================

/// Debug info obtained for one binary.
pub struct LoadedDebugInfo {
    pub debug_info: DebugInfo,
    pub binary_path: Option<PathBuf>,
}

/// Produces the debug info for a binary. Called once per distinct binary.
pub trait SymbolSource {
    /// # Errors
    /// `SymbolError::BinaryNotFound` when there is no local copy, any other
    /// error when the copy could not be read.
    fn load(
        &self,
        image: &Image,
        binary: &BinaryDescriptor,
    ) -> Result<LoadedDebugInfo, SymbolError>;
}

/// Reads binaries and perf maps from the local file system.
#[derive(Debug, Clone, Default)]
pub struct LocalSymbolSource<L = FileSystemLocator> {
    locator: L,
    perf_map_dir: Option<PathBuf>,
}

impl<L: BinaryLocator> LocalSymbolSource<L> {
    pub fn new(locator: L, perf_map_dir: Option<PathBuf>) -> Self {
        Self { locator, perf_map_dir }
    }

    fn locate_perf_map(&self, binary: &BinaryDescriptor) -> Option<PathBuf> {
        self.perf_map_dir
            .as_ref()
            .map(|dir| dir.join(&binary.image_name))
            .filter(|path| path.is_file())
            .or_else(|| self.locator.locate(binary))
    }
}

impl<L: BinaryLocator> SymbolSource for LocalSymbolSource<L> {
    fn load(
        &self,
        image: &Image,
        binary: &BinaryDescriptor,
    ) -> Result<LoadedDebugInfo, SymbolError> {
        if is_perf_map(&image.file_path) {
            let path = self
                .locate_perf_map(binary)
                .ok_or_else(|| SymbolError::BinaryNotFound(binary.image_name.clone()))?;
            let managed = ManagedDebugInfo::load(&path, image.base_address)?;
            return Ok(LoadedDebugInfo {
                debug_info: DebugInfo::Managed(managed),
                binary_path: Some(path),
            });
        }

        let path = self
            .locator
            .locate(binary)
            .ok_or_else(|| SymbolError::BinaryNotFound(binary.image_name.clone()))?;
        let native = NativeDebugInfo::load(&path).map_err(|e| SymbolError::DebugInfoLoadFailed {
            binary: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(LoadedDebugInfo { debug_info: DebugInfo::Native(native), binary_path: Some(path) })
    }
}

// =============================================================================
// MODULE REPORT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModuleLoadState {
    Loaded,
    NotFound,
    Failed(String),
}

/// Outcome of loading one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub module: ModuleId,
    pub binary: BinaryDescriptor,
    pub state: ModuleLoadState,
    pub binary_path: Option<String>,
    pub debug_info: DebugInfoKind,
    pub function_count: usize,
}

/// Post-hoc summary of every module ingestion touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReport {
    modules: Vec<ModuleStatus>,
}

impl ModuleReport {
    pub fn record(&mut self, status: ModuleStatus) {
        self.modules.push(status);
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleStatus] {
        &self.modules
    }

    #[must_use]
    pub fn find(&self, module: ModuleId) -> Option<&ModuleStatus> {
        self.modules.iter().find(|status| status.module == module)
    }

    pub fn loaded(&self) -> impl Iterator<Item = &ModuleStatus> {
        self.modules.iter().filter(|status| status.state == ModuleLoadState::Loaded)
    }

    pub fn not_found(&self) -> impl Iterator<Item = &ModuleStatus> {
        self.modules.iter().filter(|status| status.state == ModuleLoadState::NotFound)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ModuleStatus> {
        self.modules.iter().filter(|status| matches!(status.state, ModuleLoadState::Failed(_)))
    }
}

// =============================================================================
// MODULE INFO
// =============================================================================

/// Numbers the functions of one module as they are first resolved.
#[derive(Debug, Default)]
struct FunctionTable {
    by_rva: FxHashMap<u64, u32>,
    by_name: FxHashMap<String, u32>,
    entries: Vec<Arc<FunctionDebugInfo>>,
}

/// A binary with its debug info and function numbering.
#[derive(Debug)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub name: String,
    pub binary: BinaryDescriptor,
    debug_info: DebugInfo,
    functions: FunctionTable,
}

impl ModuleInfo {
    #[must_use]
    pub fn new(id: ModuleId, binary: BinaryDescriptor, debug_info: DebugInfo) -> Self {
        Self {
            id,
            name: binary.image_name.clone(),
            binary,
            debug_info,
            functions: FunctionTable::default(),
        }
    }

    #[must_use]
    pub fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }

    #[must_use]
    pub fn has_debug_info(&self) -> bool {
        self.debug_info.provider().is_some()
    }

    /// Named function record covering `rva`, if the debug info has one.
    #[must_use]
    pub fn find_debug_function_info(&self, rva: u64) -> Option<Arc<FunctionDebugInfo>> {
        self.debug_info
            .provider()?
            .find_function_by_rva(rva)
            .filter(|info| !info.name.is_empty() && !info.is_unknown())
    }

    /// Function identity of `info` within this module.
    ///
    /// Records are matched by start RVA. A record without a range (a public
    /// symbol naming an address inside an already numbered function) is
    /// matched by name to the function that covers it. Ranged records with
    /// equal names at different RVAs stay distinct functions.
    pub fn resolve_function(&mut self, info: &Arc<FunctionDebugInfo>) -> FunctionId {
        let table = &mut self.functions;

        if let Some(&number) = table.by_rva.get(&info.rva) {
            return FunctionId::new(self.id, number);
        }

        if info.size == 0 {
            let alias = table
                .by_name
                .get(&info.name)
                .copied()
                .filter(|&number| table.entries[number as usize].contains(info.rva));
            if let Some(number) = alias {
                table.by_rva.insert(info.rva, number);
                return FunctionId::new(self.id, number);
            }
        }

        let number = u32::try_from(table.entries.len()).unwrap_or(u32::MAX);
        table.entries.push(Arc::clone(info));
        table.by_rva.insert(info.rva, number);
        table.by_name.entry(info.name.clone()).or_insert(number);
        FunctionId::new(self.id, number)
    }

    /// Debug record behind a function number handed out by this module.
    #[must_use]
    pub fn function_debug_info(&self, number: u32) -> Option<&Arc<FunctionDebugInfo>> {
        self.functions.entries.get(number as usize)
    }

    #[must_use]
    pub fn resolved_function_count(&self) -> usize {
        self.functions.entries.len()
    }
}

// =============================================================================
// MODULE REGISTRY
// =============================================================================

/// Caches one [`ModuleInfo`] per binary and maps images onto them.
pub struct ModuleRegistry<S> {
    source: S,
    modules: Vec<ModuleInfo>,
    by_binary: FxHashMap<BinaryDescriptor, ModuleId>,
    by_image: FxHashMap<ImageHandle, ModuleId>,
    report: ModuleReport,
}

impl<S: SymbolSource> ModuleRegistry<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            modules: Vec::new(),
            by_binary: FxHashMap::default(),
            by_image: FxHashMap::default(),
            report: ModuleReport::default(),
        }
    }

    /// Module for `image`, loading its debug info on first use.
    pub fn module_for_image(&mut self, handle: ImageHandle, image: &Image) -> &mut ModuleInfo {
        let id = match self.by_image.get(&handle) {
            Some(&id) => id,
            None => {
                let binary = BinaryDescriptor::from_image(image);
                let id = match self.by_binary.get(&binary) {
                    Some(&id) => id,
                    None => self.load_module(image, binary),
                };
                self.by_image.insert(handle, id);
                id
            }
        };
        self.module_mut(id)
    }

    fn load_module(&mut self, image: &Image, binary: BinaryDescriptor) -> ModuleId {
        let id = ModuleId(u32::try_from(self.modules.len() + 1).unwrap_or(u32::MAX));

        let (debug_info, binary_path, state) = match self.source.load(image, &binary) {
            Ok(loaded) => (loaded.debug_info, loaded.binary_path, ModuleLoadState::Loaded),
            Err(SymbolError::BinaryNotFound(name)) => {
                debug!("{name}: binary not found, frames stay unresolved");
                (DebugInfo::Unavailable, None, ModuleLoadState::NotFound)
            }
            Err(e) => {
                warn!("{binary}: {e}");
                (DebugInfo::Unavailable, None, ModuleLoadState::Failed(e.to_string()))
            }
        };

        self.report.record(ModuleStatus {
            module: id,
            binary: binary.clone(),
            state,
            binary_path: binary_path.map(|path| path.display().to_string()),
            debug_info: debug_info.kind(),
            function_count: debug_info.function_count(),
        });

        self.by_binary.insert(binary.clone(), id);
        self.modules.push(ModuleInfo::new(id, binary, debug_info));
        id
    }

    /// # Panics
    /// Panics if `id` was not handed out by this registry.
    #[must_use]
    pub fn module(&self, id: ModuleId) -> &ModuleInfo {
        &self.modules[(id.0 as usize) - 1]
    }

    fn module_mut(&mut self, id: ModuleId) -> &mut ModuleInfo {
        &mut self.modules[(id.0 as usize) - 1]
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    #[must_use]
    pub fn report(&self) -> &ModuleReport {
        &self.report
    }

    #[must_use]
    pub fn into_report(self) -> ModuleReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingSource {
        loads: Cell<usize>,
    }

    impl SymbolSource for CountingSource {
        fn load(
            &self,
            image: &Image,
            binary: &BinaryDescriptor,
        ) -> Result<LoadedDebugInfo, SymbolError> {
            self.loads.set(self.loads.get() + 1);
            match image.file_path.as_str() {
                "/missing.so" => Err(SymbolError::BinaryNotFound(binary.image_name.clone())),
                "/broken.so" => Err(SymbolError::DebugInfoLoadFailed {
                    binary: binary.image_name.clone(),
                    reason: "truncated".to_string(),
                }),
                _ => Ok(LoadedDebugInfo {
                    debug_info: DebugInfo::Native(NativeDebugInfo::from_functions(vec![
                        FunctionDebugInfo::new("main", 0x100, 0x50),
                    ])),
                    binary_path: Some(PathBuf::from(&image.file_path)),
                }),
            }
        }
    }

    fn image(path: &str, base: u64) -> Image {
        Image {
            base_address: base,
            size: 0x1000,
            default_base_address: 0,
            file_path: path.to_string(),
            original_file_name: None,
            timestamp: 0,
            checksum: 0,
        }
    }

    #[test]
    fn test_module_loaded_once_per_binary() {
        let mut registry = ModuleRegistry::new(CountingSource { loads: Cell::new(0) });
        let a = registry.module_for_image(ImageHandle(1), &image("/bin/app", 0x1000)).id;
        let b = registry.module_for_image(ImageHandle(1), &image("/bin/app", 0x1000)).id;
        assert_eq!(a, b);
        assert_eq!(registry.source.loads.get(), 1);
        assert_eq!(registry.report().loaded().count(), 1);
    }

    #[test]
    fn test_load_failures_are_reported_not_raised() {
        let mut registry = ModuleRegistry::new(CountingSource { loads: Cell::new(0) });
        let missing = registry.module_for_image(ImageHandle(1), &image("/missing.so", 0x1000));
        assert!(!missing.has_debug_info());
        let broken = registry.module_for_image(ImageHandle(2), &image("/broken.so", 0x8000));
        assert!(broken.find_debug_function_info(0x100).is_none());

        let report = registry.report();
        assert_eq!(report.not_found().count(), 1);
        assert_eq!(report.failed().count(), 1);
        let failed = report.failed().next().unwrap();
        assert_eq!(failed.debug_info, DebugInfoKind::Unavailable);
    }

    #[test]
    fn test_resolve_function_numbers_by_rva() {
        let binary = BinaryDescriptor::from_image(&image("/bin/app", 0));
        let mut module = ModuleInfo::new(ModuleId(1), binary, DebugInfo::Unavailable);

        let foo = Arc::new(FunctionDebugInfo::new("foo", 0x10, 8));
        let bar = Arc::new(FunctionDebugInfo::new("bar", 0x20, 8));

        let foo_id = module.resolve_function(&foo);
        let bar_id = module.resolve_function(&bar);
        assert_ne!(foo_id, bar_id);
        assert_eq!(module.resolve_function(&foo), foo_id);
        assert_eq!(module.function_debug_info(bar_id.number).unwrap().name, "bar");
        assert_eq!(module.resolved_function_count(), 2);
    }

    #[test]
    fn test_same_name_at_other_rva_is_another_function() {
        let binary = BinaryDescriptor::from_image(&image("/bin/app", 0));
        let mut module = ModuleInfo::new(ModuleId(1), binary, DebugInfo::Unavailable);

        let first = Arc::new(FunctionDebugInfo::new("core::ptr::drop_in_place", 0x200, 0x40));
        let second = Arc::new(FunctionDebugInfo::new("core::ptr::drop_in_place", 0x300, 0x40));

        let first_id = module.resolve_function(&first);
        let second_id = module.resolve_function(&second);
        assert_ne!(first_id, second_id);
        assert_eq!(module.resolved_function_count(), 2);
    }

    #[test]
    fn test_rangeless_alias_matches_covering_function() {
        let binary = BinaryDescriptor::from_image(&image("/bin/app", 0));
        let mut module = ModuleInfo::new(ModuleId(1), binary, DebugInfo::Unavailable);

        let foo_id = module.resolve_function(&Arc::new(FunctionDebugInfo::new("foo", 0x10, 8)));
        let inside = Arc::new(FunctionDebugInfo::new("foo", 0x14, 0));
        let outside = Arc::new(FunctionDebugInfo::new("foo", 0x40, 0));

        assert_eq!(module.resolve_function(&inside), foo_id);
        assert_ne!(module.resolve_function(&outside), foo_id);
        assert_eq!(module.resolved_function_count(), 2);
    }

    #[test]
    fn test_local_source_reports_missing_binary() {
        let source = LocalSymbolSource::new(FileSystemLocator::default(), None);
        let img = image("/nonexistent/libghost.so", 0);
        let result = source.load(&img, &BinaryDescriptor::from_image(&img));
        assert!(matches!(result, Err(SymbolError::BinaryNotFound(_))));
    }

    #[test]
    fn test_local_source_loads_perf_map() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("perf-42.map");
        std::fs::write(&map_path, "5000 20 Jitted::Run\n").unwrap();

        let perf_map_dir = Some(dir.path().to_path_buf());
        let source = LocalSymbolSource::new(FileSystemLocator::default(), perf_map_dir);
        let img = image("/tmp/perf-42.map", 0x4000);
        let loaded = source.load(&img, &BinaryDescriptor::from_image(&img)).unwrap();
        assert_eq!(loaded.debug_info.kind(), DebugInfoKind::Managed);
        let provider = loaded.debug_info.provider().unwrap();
        assert_eq!(provider.find_function_by_rva(0x1005).unwrap().name, "Jitted::Run");
    }
}

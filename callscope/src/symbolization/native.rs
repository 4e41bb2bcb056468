use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::debug;
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use super::debug_info::{DebugInfoProvider, FunctionDebugInfo, SourceLine};
use crate::domain::SymbolError;

/// Debug info read from an ELF binary: function ranges from the symbol
/// tables, source lines from DWARF when present.
///
/// Line lookups are cached since the same return addresses recur across
/// many samples.
pub struct NativeDebugInfo {
    functions: Vec<Arc<FunctionDebugInfo>>,
    lines: Option<Context<EndianRcSlice<RunTimeEndian>>>,
    line_cache: RefCell<HashMap<u64, Option<SourceLine>>>,
}

impl NativeDebugInfo {
    /// Load symbols and (if available) DWARF line info from `binary_path`.
    ///
    /// # Errors
    /// Returns an error if the binary cannot be read or parsed. Missing DWARF
    /// is not an error, the module just has no source lines.
    pub fn load<P: AsRef<Path>>(binary_path: P) -> Result<Self, SymbolError> {
        let binary_data = fs::read(binary_path.as_ref())?;
        let obj_file = object::File::parse(&*binary_data)?;

        let functions = collect_functions(&obj_file);

        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let lines = match gimli::Dwarf::load(&load_section).and_then(Context::from_dwarf) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                debug!("{}: no usable DWARF ({e})", binary_path.as_ref().display());
                None
            }
        };

        debug!("{}: {} functions", binary_path.as_ref().display(), functions.len());
        Ok(Self { functions, lines, line_cache: RefCell::new(HashMap::new()) })
    }

    /// Build from an already sorted function list (no line info).
    #[must_use]
    pub fn from_functions(mut functions: Vec<FunctionDebugInfo>) -> Self {
        functions.sort_by_key(|f| f.rva);
        Self {
            functions: functions.into_iter().map(Arc::new).collect(),
            lines: None,
            line_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Demangle a Rust symbol name. The hash suffix is kept: generic
    /// instances share a path and differ only there.
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        demangle(symbol).to_string()
    }
}

/// Sized text symbols, demangled, sorted by address, one per address.
fn collect_functions(obj_file: &object::File<'_>) -> Vec<Arc<FunctionDebugInfo>> {
    let mut symbols: Vec<_> = obj_file.symbols().collect();
    if symbols.is_empty() {
        // Stripped binary, fall back to the exported symbols.
        symbols = obj_file.dynamic_symbols().collect();
    }

    let mut functions: Vec<FunctionDebugInfo> = symbols
        .iter()
        .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.size() > 0)
        .filter_map(|symbol| {
            let name = symbol.name().ok()?;
            let size = u32::try_from(symbol.size()).ok()?;
            let name = NativeDebugInfo::demangle_symbol(name);
            Some(FunctionDebugInfo::new(name, symbol.address(), size))
        })
        .collect();

    functions.sort_by_key(|f| (f.rva, std::cmp::Reverse(f.size)));
    functions.dedup_by_key(|f| f.rva);
    functions.into_iter().map(Arc::new).collect()
}

impl DebugInfoProvider for NativeDebugInfo {
    fn sorted_functions(&self) -> &[Arc<FunctionDebugInfo>] {
        &self.functions
    }

    fn find_source_line_by_rva(&self, rva: u64) -> Option<SourceLine> {
        // Check cache first
        if let Some(cached) = self.line_cache.borrow().get(&rva) {
            return cached.clone();
        }

        let resolved = self.lines.as_ref().and_then(|ctx| {
            let location = ctx.find_location(rva).ok().flatten()?;
            Some(SourceLine {
                rva,
                line: location.line?,
                column: location.column.unwrap_or(0),
                file: location.file.map(std::string::ToString::to_string),
            })
        });

        self.line_cache.borrow_mut().insert(rva, resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_rust_symbol() {
        let first =
            NativeDebugInfo::demangle_symbol("_ZN4core3ptr13drop_in_place17h0123456789abcdefE");
        let second =
            NativeDebugInfo::demangle_symbol("_ZN4core3ptr13drop_in_place17hfedcba9876543210E");
        assert_eq!(first, "core::ptr::drop_in_place::h0123456789abcdef");
        assert_ne!(first, second);
        assert_eq!(NativeDebugInfo::demangle_symbol("main"), "main");
    }

    #[test]
    fn test_from_functions_sorts_by_rva() {
        let info = NativeDebugInfo::from_functions(vec![
            FunctionDebugInfo::new("late", 0x300, 0x10),
            FunctionDebugInfo::new("early", 0x100, 0x10),
        ]);
        let names: Vec<_> = info.sorted_functions().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
        assert_eq!(info.find_function_by_rva(0x305).unwrap().name, "late");
        assert!(info.find_source_line_by_rva(0x305).is_none());
    }

    #[test]
    fn test_load_missing_binary_fails() {
        assert!(NativeDebugInfo::load("/nonexistent/binary").is_err());
    }
}

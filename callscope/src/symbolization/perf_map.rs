//! Debug info for JIT-compiled (managed) code.
//!
//! Runtimes that generate code at run time publish it in a perf map: a text
//! file with one `START SIZE NAME` line per method, addresses in hex. The
//! trace records the JIT region as an image named after the map file
//! (`perf-<pid>.map`), so method ranges are rebased onto that image.

use log::debug;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::debug_info::{DebugInfoProvider, FunctionDebugInfo, SourceLine};
use crate::domain::SymbolError;

pub struct ManagedDebugInfo {
    functions: Vec<Arc<FunctionDebugInfo>>,
}

impl ManagedDebugInfo {
    /// Parse the perf map at `path`, converting absolute method addresses to
    /// offsets from `image_base`. Methods below the base are dropped.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a line is malformed.
    pub fn load<P: AsRef<Path>>(path: P, image_base: u64) -> Result<Self, SymbolError> {
        let content = fs::read_to_string(path.as_ref())?;
        let info = Self::parse(&content, image_base)?;
        debug!("{}: {} JIT methods", path.as_ref().display(), info.functions.len());
        Ok(info)
    }

    /// # Errors
    /// Returns `MalformedSymbolMap` for a line that is not `START SIZE NAME`.
    pub fn parse(content: &str, image_base: u64) -> Result<Self, SymbolError> {
        let mut functions = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed =
                || SymbolError::MalformedSymbolMap { line: index + 1, content: line.to_string() };

            let mut parts = line.splitn(3, char::is_whitespace);
            let (Some(start), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(malformed());
            };

            let start = parse_hex(start).ok_or_else(malformed)?;
            let size = parse_hex(size).and_then(|s| u32::try_from(s).ok()).ok_or_else(malformed)?;

            let Some(rva) = start.checked_sub(image_base) else {
                continue;
            };

            let mut function = FunctionDebugInfo::new(name.trim(), rva, size);
            function.id = i64::try_from(functions.len()).unwrap_or(i64::MAX);
            functions.push(function);
        }

        Ok(Self::from_functions(functions))
    }

    /// Build from in-memory method records (already rebased).
    #[must_use]
    pub fn from_functions(mut functions: Vec<FunctionDebugInfo>) -> Self {
        functions.sort_by_key(|f| f.rva);
        Self { functions: functions.into_iter().map(Arc::new).collect() }
    }
}

fn parse_hex(text: &str) -> Option<u64> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}

impl DebugInfoProvider for ManagedDebugInfo {
    fn sorted_functions(&self) -> &[Arc<FunctionDebugInfo>] {
        &self.functions
    }

    fn find_source_line_by_rva(&self, _rva: u64) -> Option<SourceLine> {
        None
    }

    // Re-JIT can leave an older method body overlapping a newer one.
    fn has_overlapping_functions(&self) -> bool {
        true
    }
}

/// Whether an image path names a perf map rather than a binary.
#[must_use]
pub fn is_perf_map(path: &str) -> bool {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("perf-") && name.ends_with(".map"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_perf_map() {
        let map = "\
7f0000001000 40 Program::Main()
7f0000001040 20 Program::<Run>b__0_0(int)
# comment
7f0000000800 10 below_base
";
        let info = ManagedDebugInfo::parse(map, 0x7f00_0000_1000).unwrap();
        let funcs = info.sorted_functions();
        assert_eq!(funcs.len(), 2);
        assert_eq!(funcs[0].name, "Program::Main()");
        assert_eq!(funcs[0].rva, 0);
        assert_eq!(funcs[1].rva, 0x40);
        assert_eq!(funcs[1].size, 0x20);
        assert_eq!(info.find_function_by_rva(0x45).unwrap().name, "Program::<Run>b__0_0(int)");
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        let err = ManagedDebugInfo::parse("zzzz 10 f\n", 0).err().unwrap();
        assert!(matches!(err, SymbolError::MalformedSymbolMap { line: 1, .. }));
    }

    #[test]
    fn test_is_perf_map() {
        assert!(is_perf_map("/tmp/perf-1234.map"));
        assert!(!is_perf_map("/usr/lib/libc.so.6"));
        assert!(!is_perf_map("/tmp/perf-data.json"));
    }
}

//! Function and source-line debug records, and the provider capability.
//!
//! A [`DebugInfoProvider`] answers "which function owns this RVA" and "which
//! source line". Providers only have to hand out their functions sorted by
//! start RVA; the lookup itself is the shared binary search in
//! [`FunctionDebugInfo::binary_search`].

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::native::NativeDebugInfo;
use super::perf_map::ManagedDebugInfo;

/// How many enclosing candidates to inspect when ranges overlap.
const MAX_OVERLAP_SCAN: usize = 10;

// =============================================================================
// SOURCE LINES
// =============================================================================

/// A source line mapped to the code starting at `rva`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLine {
    pub rva: u64,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

// =============================================================================
// FUNCTION DEBUG INFO
// =============================================================================

/// Debug record of one function: its name and address range inside the
/// module, plus optional source lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDebugInfo {
    /// Provider specific id (method token for managed code), -1 if none.
    pub id: i64,
    pub name: String,
    pub rva: u64,
    pub size: u32,
    #[serde(default)]
    pub optimization_level: i16,
    /// Provider specific secondary id (re-JIT generation), -1 if none.
    #[serde(default = "no_id")]
    pub auxiliary_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Sorted by `rva`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_lines: Vec<SourceLine>,
}

fn no_id() -> i64 {
    -1
}

impl FunctionDebugInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, rva: u64, size: u32) -> Self {
        Self {
            id: -1,
            name: name.into(),
            rva,
            size,
            optimization_level: 0,
            auxiliary_id: -1,
            source_file: None,
            source_lines: Vec::new(),
        }
    }

    #[must_use]
    pub fn start_rva(&self) -> u64 {
        self.rva
    }

    /// Last RVA covered by the function (inclusive).
    #[must_use]
    pub fn end_rva(&self) -> u64 {
        self.rva.saturating_add(u64::from(self.size)).saturating_sub(1).max(self.rva)
    }

    #[must_use]
    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.start_rva() && rva <= self.end_rva()
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.rva == 0 && self.size == 0
    }

    #[must_use]
    pub fn has_source_lines(&self) -> bool {
        !self.source_lines.is_empty()
    }

    /// Line mapped at `rva`, or the closest one before it.
    #[must_use]
    pub fn find_nearest_line(&self, rva: u64) -> Option<&SourceLine> {
        let after = self.source_lines.partition_point(|line| line.rva <= rva);
        after.checked_sub(1).map(|index| &self.source_lines[index])
    }

    pub fn add_source_line(&mut self, line: SourceLine) {
        let index = self.source_lines.partition_point(|existing| existing.rva <= line.rva);
        self.source_lines.insert(index, line);
    }

    /// Find the function containing `rva` in `functions` (sorted by start).
    ///
    /// Hand-written assembly can produce several entry points inside one
    /// function:
    ///
    /// ```text
    /// |F1------------------|
    ///      |F2----|
    ///                |F3|
    /// ```
    ///
    /// With `has_overlapping` set, an address inside F2 or F3 resolves to F1,
    /// the outer function covering the whole range.
    #[must_use]
    pub fn binary_search(
        functions: &[Arc<FunctionDebugInfo>],
        rva: u64,
        has_overlapping: bool,
    ) -> Option<&Arc<FunctionDebugInfo>> {
        let mut low = 0usize;
        let mut high = functions.len();

        while low < high {
            let mid = low + (high - low) / 2;
            let candidate = &functions[mid];

            if rva < candidate.start_rva() {
                high = mid;
            } else if rva > candidate.end_rva() {
                low = mid + 1;
            } else {
                if has_overlapping {
                    let outer = functions[..mid].iter().rev().take(MAX_OVERLAP_SCAN).find(|other| {
                        other.contains(rva)
                            && (other.start_rva() != candidate.start_rva()
                                || other.size > candidate.size)
                    });
                    if outer.is_some() {
                        return outer;
                    }
                }
                return Some(candidate);
            }
        }

        None
    }
}

impl PartialEq for FunctionDebugInfo {
    fn eq(&self, other: &Self) -> bool {
        self.rva == other.rva
            && self.size == other.size
            && self.id == other.id
            && self.auxiliary_id == other.auxiliary_id
    }
}

impl Eq for FunctionDebugInfo {}

impl Hash for FunctionDebugInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rva.hash(state);
        self.size.hash(state);
        self.id.hash(state);
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Resolves module-relative addresses to functions and source lines.
pub trait DebugInfoProvider {
    /// All functions, sorted by start RVA.
    fn sorted_functions(&self) -> &[Arc<FunctionDebugInfo>];

    fn find_source_line_by_rva(&self, rva: u64) -> Option<SourceLine>;

    /// Whether function ranges may nest (assembly entry points).
    fn has_overlapping_functions(&self) -> bool {
        false
    }

    fn find_function_by_rva(&self, rva: u64) -> Option<Arc<FunctionDebugInfo>> {
        let functions = self.sorted_functions();
        FunctionDebugInfo::binary_search(functions, rva, self.has_overlapping_functions()).cloned()
    }
}

/// Which provider serves a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugInfoKind {
    Native,
    Managed,
    Unavailable,
}

/// Debug info of one module, selected once when the module is first seen.
pub enum DebugInfo {
    /// ELF symbols with optional DWARF line tables.
    Native(NativeDebugInfo),
    /// JIT-compiled code described by a perf map.
    Managed(ManagedDebugInfo),
    Unavailable,
}

impl DebugInfo {
    #[must_use]
    pub fn kind(&self) -> DebugInfoKind {
        match self {
            Self::Native(_) => DebugInfoKind::Native,
            Self::Managed(_) => DebugInfoKind::Managed,
            Self::Unavailable => DebugInfoKind::Unavailable,
        }
    }

    #[must_use]
    pub fn provider(&self) -> Option<&dyn DebugInfoProvider> {
        match self {
            Self::Native(native) => Some(native),
            Self::Managed(managed) => Some(managed),
            Self::Unavailable => None,
        }
    }

    #[must_use]
    pub fn function_count(&self) -> usize {
        self.provider().map_or(0, |provider| provider.sorted_functions().len())
    }
}

impl std::fmt::Debug for DebugInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DebugInfo::{:?}({} functions)", self.kind(), self.function_count())
    }
}

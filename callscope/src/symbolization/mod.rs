//! # Symbol Resolution and Address Translation
//!
//! Sample stacks are lists of raw instruction pointers such as
//! `0x55f3a2b4c780`. Before they can be aggregated per function, every
//! address has to go through three steps:
//!
//! ```text
//! 1. IP → image          ImageResolver (per-process sorted ranges)
//!    0x55f3a2b4c780  ──► /usr/bin/server loaded at 0x55f3a2b4c000
//!
//! 2. image → module      ModuleRegistry (debug info loaded once per binary)
//!    /usr/bin/server ──► ModuleInfo { debug_info: Native, ... }
//!
//! 3. RVA → function      DebugInfoProvider + binary search
//!    rva = ip - base = 0x780 ──► FunctionDebugInfo "server::handle_request"
//! ```
//!
//! ## Debug-Info Providers
//!
//! Which provider serves a module is decided once, when its image is first
//! met, and cached with the module:
//!
//! - **Native**: ELF symbol tables (`object`) for function ranges, DWARF
//!   (`gimli` + `addr2line`) for source lines, Rust names demangled with
//!   `rustc-demangle`.
//! - **Managed**: JIT-compiled code described by a `perf-<pid>.map` file.
//! - **Unavailable**: the binary was not found or could not be read. Frames
//!   in such modules stay unresolved.
//!
//! ## PIE and Relative Addresses
//!
//! Position-independent executables are loaded at a random base address on
//! every run, while symbol tables describe addresses relative to the start
//! of the binary. Subtracting the image base from a runtime address gives
//! the RVA the debug info understands:
//!
//! ```text
//! Runtime Address = Base Address + RVA
//! RVA             = Runtime Address - Base Address
//! ```
//!
//! ## Failure Handling
//!
//! Nothing in this module aborts ingestion. A missing binary or unreadable
//! debug info is recorded in the [`ModuleReport`] (`NotFound` / `Failed`)
//! and the frames of that module are dropped from function attribution.
//!
//! ## Module Structure
//!
//! - **`image_resolver`**: per-thread IP → image lookup with a last-hit cache
//! - **`debug_info`**: function/source-line records and the provider trait
//! - **`native`**: ELF + DWARF provider
//! - **`perf_map`**: JIT perf-map provider
//! - **`locator`**: finds a local copy of a binary
//! - **`module_info`**: module cache, function numbering and load report

pub mod debug_info;
pub mod image_resolver;
pub mod locator;
pub mod module_info;
pub mod native;
pub mod perf_map;

pub use debug_info::{DebugInfo, DebugInfoKind, DebugInfoProvider, FunctionDebugInfo, SourceLine};
pub use image_resolver::{ImageIndex, ImageResolver};
pub use locator::{BinaryDescriptor, BinaryLocator, FileSystemLocator};
pub use module_info::{
    LoadedDebugInfo, LocalSymbolSource, ModuleInfo, ModuleLoadState, ModuleRegistry, ModuleReport,
    ModuleStatus, SymbolSource,
};
pub use native::NativeDebugInfo;
pub use perf_map::ManagedDebugInfo;

//! # callscope - Sampling Trace Aggregation Engine
//!
//! callscope turns a recorded sampling trace (CPU samples, stack walks,
//! image loads, performance-counter events) into an aggregated profile: a
//! per-function table of inclusive/exclusive weights with instruction,
//! source line, caller and callee breakdowns, plus a call tree keyed by
//! call path.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               Recorded trace (JSON lines, see                   │
//! │                   callscope-common records)                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ trace_source
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  RawProfileData (model)                                         │
//! │  • processes, threads, images, contexts (interned tables)       │
//! │  • samples, interned stacks, counter events                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ profiling
//!                         ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Stack cache  │──▶│ Symbolization│──▶│ Module report│
//! │ (per stack)  │   │ image→module │   │ loaded/missing│
//! └──────┬───────┘   │ →function    │   └──────────────┘
//!        │           └──────────────┘
//!        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ProfileData (analysis)                                         │
//! │  • FunctionProfileData per function                             │
//! │  • CallTree (calltree)                                          │
//! │  • module weights, counters                                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ export
//!                         ▼
//!            text report / persisted JSON profile
//! ```
//!
//! ## Module Structure
//!
//! - [`domain`]: handles, identifiers, weights and error types
//! - [`model`]: interned entity tables and the raw trace store
//! - [`trace_source`]: replays a trace file into a [`model::RawProfileData`]
//! - [`symbolization`]: IP → image → module → function resolution
//!   - native debug info from ELF/DWARF via `object` and `addr2line`
//!   - perf-map files for JIT-compiled code
//! - [`profiling`]: the ingestion pipeline, progress and cancellation
//! - [`calltree`]: concurrent call tree with combined-node queries
//! - [`analysis`]: per-function and whole-profile aggregates
//! - [`export`]: persisted profile format and the text report
//! - [`cli`]: command-line arguments
//!
//! ## Typical Usage
//!
//! ```bash
//! # Aggregate the busiest process of a trace
//! callscope trace.jsonl --symbol-path ./target/release
//!
//! # Save the profile and print the call tree 8 levels deep
//! callscope trace.jsonl --pid 1234 --export app.profile.json --tree-depth 8
//!
//! # Report a saved profile
//! callscope --load app.profile.json
//! ```

// Expose modules for testing
pub mod analysis;
pub mod calltree;
pub mod cli;
pub mod domain;
pub mod export;
pub mod model;
pub mod profiling;
pub mod symbolization;
pub mod trace_source;

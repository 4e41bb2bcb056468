//! Plain-text profile report.

use std::io::{self, Write};

use crate::analysis::ProfileData;
use crate::symbolization::ModuleLoadState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    /// Rows per table.
    pub top: usize,
    /// Call tree levels to print, 0 to skip the tree.
    pub tree_depth: usize,
    /// Source lines listed under each top function.
    pub lines_per_function: usize,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self { top: 20, tree_depth: 0, lines_per_function: 3 }
    }
}

/// Write the report for `profile`.
///
/// # Errors
/// Returns any error of `out`.
pub fn write_report<W: Write>(
    profile: &ProfileData,
    options: &ReportOptions,
    out: &mut W,
) -> io::Result<()> {
    let tree = profile.call_tree();

    // === SUMMARY ===
    writeln!(
        out,
        "Profile weight: {} of {} sampled",
        profile.profile_weight, profile.total_weight
    )?;
    writeln!(
        out,
        "Functions: {}, call tree nodes: {}",
        profile.function_count(),
        tree.node_count()
    )?;

    // === FUNCTIONS ===
    writeln!(out)?;
    writeln!(out, "Top functions (self time)")?;
    writeln!(out, "{:>10} {:>7} {:>10} {:>7}  {}", "self", "%", "total", "%", "function")?;
    for (function, data) in profile.get_sorted_functions().into_iter().take(options.top) {
        writeln!(
            out,
            "{:>10} {:>6.2}% {:>10} {:>6.2}%  {} [{}]",
            data.exclusive_weight.to_string(),
            data.exclusive_weight.percentage_of(profile.profile_weight),
            data.weight.to_string(),
            data.weight.percentage_of(profile.profile_weight),
            data.name(),
            profile.module_name(function.module)
        )?;

        for (line, weight) in data.hottest_lines().into_iter().take(options.lines_per_function) {
            let file = data.source_file.as_deref().unwrap_or("?");
            writeln!(out, "{:>30}  {file}:{line} {weight}", "")?;
        }

        for counter in data.compute_function_counters().iter() {
            let name = profile
                .get_performance_counter(counter.counter_id)
                .map_or("counter", |info| info.name.as_str());
            writeln!(out, "{:>30}  {name}: {}", "", counter.value)?;
        }
    }

    // === MODULES ===
    writeln!(out)?;
    writeln!(out, "Top modules")?;
    for (module, weight) in profile.sorted_module_weights().into_iter().take(options.top) {
        writeln!(
            out,
            "{:>10} {:>6.2}%  {}",
            weight.to_string(),
            weight.percentage_of(profile.total_weight),
            profile.module_name(module)
        )?;
    }

    // === CALL TREE ===
    if options.tree_depth > 0 {
        writeln!(out)?;
        out.write_all(tree.print(options.tree_depth).as_bytes())?;
    }

    // === MODULE REPORT ===
    let report = profile.module_report();
    let missing: Vec<_> = report.not_found().chain(report.failed()).collect();
    writeln!(out)?;
    writeln!(
        out,
        "Modules: {} loaded, {} without debug info",
        report.loaded().count(),
        missing.len()
    )?;
    for status in missing {
        match &status.state {
            ModuleLoadState::Failed(reason) => writeln!(out, "  {}: {reason}", status.binary)?,
            _ => writeln!(out, "  {}: not found", status.binary)?,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Duration, FunctionId, ModuleId};
    use crate::symbolization::FunctionDebugInfo;
    use std::sync::Arc;

    #[test]
    fn test_report_lists_functions_by_self_time() {
        let mut profile = ProfileData::new();
        profile.profile_weight = Duration::from_millis(10);
        profile.total_weight = Duration::from_millis(10);

        let parse = Arc::new(FunctionDebugInfo::new("parse", 0x10, 0x10));
        let emit = Arc::new(FunctionDebugInfo::new("emit", 0x20, 0x10));
        let parse_id = FunctionId::new(ModuleId(1), 0);
        let emit_id = FunctionId::new(ModuleId(1), 1);
        profile.get_or_create_function_profile(parse_id, &parse).exclusive_weight =
            Duration::from_millis(2);
        profile.get_or_create_function_profile(emit_id, &emit).exclusive_weight =
            Duration::from_millis(8);

        let mut out = Vec::new();
        write_report(&profile, &ReportOptions::default(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let emit_at = text.find("emit").unwrap();
        let parse_at = text.find("parse").unwrap();
        assert!(emit_at < parse_at);
        assert!(text.contains("80.00%"));
        assert!(text.contains("Modules: 0 loaded, 0 without debug info"));
    }
}

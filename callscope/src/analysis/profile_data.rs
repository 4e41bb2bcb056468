//! Whole-profile aggregate: function table, module totals, counters and the
//! call tree.

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::function_profile::{map_as_pairs, FunctionProfileData, PerformanceCounterSet};
use crate::calltree::{CallTree, CallTreeState};
use crate::domain::{Duration, ExportError, FunctionId, ModuleId};
use crate::model::{FxHashMap, PerformanceCounterInfo};
use crate::symbolization::{FunctionDebugInfo, ModuleReport};

/// Result of ingesting a trace.
#[derive(Debug, Default)]
pub struct ProfileData {
    /// Weight of the samples attributed to the profiled process.
    pub profile_weight: Duration,
    /// Weight of every sample considered, with or without a stack.
    pub total_weight: Duration,
    functions: FxHashMap<FunctionId, FunctionProfileData>,
    module_weights: BTreeMap<ModuleId, Duration>,
    module_counters: BTreeMap<ModuleId, PerformanceCounterSet>,
    /// Sorted by id.
    performance_counters: Vec<PerformanceCounterInfo>,
    call_tree: CallTree,
    module_report: ModuleReport,
}

impl ProfileData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // === FUNCTIONS ===

    #[must_use]
    pub fn get_function_profile(&self, function: FunctionId) -> Option<&FunctionProfileData> {
        self.functions.get(&function)
    }

    #[must_use]
    pub fn has_function_profile(&self, function: FunctionId) -> bool {
        self.functions.contains_key(&function)
    }

    pub fn get_or_create_function_profile(
        &mut self,
        function: FunctionId,
        debug_info: &Arc<FunctionDebugInfo>,
    ) -> &mut FunctionProfileData {
        self.functions
            .entry(function)
            .or_insert_with(|| FunctionProfileData::new(Arc::clone(debug_info)))
    }

    pub(crate) fn function_profile_mut(
        &mut self,
        function: FunctionId,
    ) -> Option<&mut FunctionProfileData> {
        self.functions.get_mut(&function)
    }

    #[must_use]
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &FunctionProfileData)> {
        self.functions.iter().map(|(id, profile)| (*id, profile))
    }

    /// Functions by exclusive weight, heaviest first.
    #[must_use]
    pub fn get_sorted_functions(&self) -> Vec<(FunctionId, &FunctionProfileData)> {
        let mut functions: Vec<_> = self.functions().collect();
        functions.sort_by(|a, b| {
            b.1.exclusive_weight
                .cmp(&a.1.exclusive_weight)
                .then(b.1.weight.cmp(&a.1.weight))
                .then(a.0.cmp(&b.0))
        });
        functions
    }

    /// Functions by inclusive weight, heaviest first.
    #[must_use]
    pub fn get_sorted_functions_by_weight(&self) -> Vec<(FunctionId, &FunctionProfileData)> {
        let mut functions: Vec<_> = self.functions().collect();
        functions.sort_by(|a, b| b.1.weight.cmp(&a.1.weight).then(a.0.cmp(&b.0)));
        functions
    }

    /// Fraction of the profile weight.
    #[must_use]
    pub fn scale_function_weight(&self, weight: Duration) -> f64 {
        scale(weight, self.profile_weight)
    }

    // === MODULES ===

    pub fn add_module_sample(&mut self, module: ModuleId, weight: Duration) {
        *self.module_weights.entry(module).or_default() += weight;
    }

    pub fn add_module_counter(&mut self, module: ModuleId, counter_id: i16, value: u64) {
        self.module_counters.entry(module).or_default().add_counter_sample(counter_id, value);
    }

    #[must_use]
    pub fn module_weight(&self, module: ModuleId) -> Duration {
        self.module_weights.get(&module).copied().unwrap_or_default()
    }

    /// Modules by weight, heaviest first.
    #[must_use]
    pub fn sorted_module_weights(&self) -> Vec<(ModuleId, Duration)> {
        let mut modules: Vec<(ModuleId, Duration)> =
            self.module_weights.iter().map(|(module, weight)| (*module, *weight)).collect();
        modules.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        modules
    }

    #[must_use]
    pub fn module_counters(&self, module: ModuleId) -> Option<&PerformanceCounterSet> {
        self.module_counters.get(&module)
    }

    /// Fraction of the total weight.
    #[must_use]
    pub fn scale_module_weight(&self, weight: Duration) -> f64 {
        scale(weight, self.total_weight)
    }

    /// Display name of a module, from the load report.
    #[must_use]
    pub fn module_name(&self, module: ModuleId) -> &str {
        self.module_report
            .find(module)
            .map_or("<unknown>", |status| status.binary.image_name.as_str())
    }

    #[must_use]
    pub fn module_report(&self) -> &ModuleReport {
        &self.module_report
    }

    pub fn set_module_report(&mut self, report: ModuleReport) {
        self.module_report = report;
    }

    // === COUNTERS ===

    /// Register a counter definition. Its `number` becomes its position in
    /// registration order; re-registering an id replaces the definition.
    pub fn register_performance_counter(&mut self, mut counter: PerformanceCounterInfo) {
        match self.performance_counters.binary_search_by_key(&counter.id, |known| known.id) {
            Ok(index) => {
                counter.number = self.performance_counters[index].number;
                self.performance_counters[index] = counter;
            }
            Err(index) => {
                counter.number = self.performance_counters.len();
                self.performance_counters.insert(index, counter);
            }
        }
    }

    #[must_use]
    pub fn get_performance_counter(&self, id: i16) -> Option<&PerformanceCounterInfo> {
        self.performance_counters
            .binary_search_by_key(&id, |counter| counter.id)
            .ok()
            .map(|index| &self.performance_counters[index])
    }

    /// Counter definitions sorted by id.
    #[must_use]
    pub fn sorted_performance_counters(&self) -> &[PerformanceCounterInfo] {
        &self.performance_counters
    }

    // === CALL TREE ===

    #[must_use]
    pub fn call_tree(&self) -> &CallTree {
        &self.call_tree
    }

    // === PERSISTENCE ===

    /// Snapshot for persistence, with every collection in a fixed order.
    #[must_use]
    pub fn to_state(&self) -> ProfileDataState {
        let mut functions: Vec<FunctionEntry> = self
            .functions
            .iter()
            .map(|(function, profile)| FunctionEntry {
                function: *function,
                profile: profile.clone(),
            })
            .collect();
        functions.sort_by_key(|entry| entry.function);

        ProfileDataState {
            profile_weight: self.profile_weight,
            total_weight: self.total_weight,
            functions,
            module_weights: self.module_weights.clone(),
            module_counters: self.module_counters.clone(),
            performance_counters: self.performance_counters.clone(),
            call_tree: self.call_tree.to_state(),
            modules: self.module_report.clone(),
        }
    }

    /// # Errors
    /// Returns `CorruptProfile` if the call tree state is inconsistent or a
    /// function appears twice.
    pub fn from_state(state: ProfileDataState) -> Result<Self, ExportError> {
        let mut functions = FxHashMap::default();
        for entry in state.functions {
            if functions.insert(entry.function, entry.profile).is_some() {
                return Err(ExportError::CorruptProfile(format!("duplicate {}", entry.function)));
            }
        }

        Ok(Self {
            profile_weight: state.profile_weight,
            total_weight: state.total_weight,
            functions,
            module_weights: state.module_weights,
            module_counters: state.module_counters,
            performance_counters: state.performance_counters,
            call_tree: CallTree::from_state(state.call_tree)?,
            module_report: state.modules,
        })
    }
}

fn scale(weight: Duration, total: Duration) -> f64 {
    if total.is_zero() {
        0.0
    } else {
        weight.0 as f64 / total.0 as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub function: FunctionId,
    pub profile: FunctionProfileData,
}

/// Persisted form of a [`ProfileData`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDataState {
    pub profile_weight: Duration,
    pub total_weight: Duration,
    pub functions: Vec<FunctionEntry>,
    #[serde(with = "map_as_pairs")]
    pub module_weights: BTreeMap<ModuleId, Duration>,
    #[serde(with = "map_as_pairs")]
    pub module_counters: BTreeMap<ModuleId, PerformanceCounterSet>,
    pub performance_counters: Vec<PerformanceCounterInfo>,
    pub call_tree: CallTreeState,
    pub modules: ModuleReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(id: i16, name: &str) -> PerformanceCounterInfo {
        PerformanceCounterInfo {
            id,
            number: 0,
            name: name.to_string(),
            description: String::new(),
            frequency: 1000,
        }
    }

    #[test]
    fn test_sorted_functions_by_exclusive_weight() {
        let mut profile = ProfileData::new();
        let info = Arc::new(FunctionDebugInfo::new("f", 0, 1));
        let a = FunctionId::new(ModuleId(1), 0);
        let b = FunctionId::new(ModuleId(1), 1);

        profile.get_or_create_function_profile(a, &info).exclusive_weight = Duration(1);
        profile.get_or_create_function_profile(b, &info).exclusive_weight = Duration(5);
        profile.get_or_create_function_profile(a, &info).weight = Duration(9);

        let sorted: Vec<FunctionId> = profile.get_sorted_functions().iter().map(|e| e.0).collect();
        assert_eq!(sorted, vec![b, a]);
        let by_weight: Vec<FunctionId> =
            profile.get_sorted_functions_by_weight().iter().map(|e| e.0).collect();
        assert_eq!(by_weight, vec![a, b]);
        assert_eq!(profile.function_count(), 2);
    }

    #[test]
    fn test_register_counters_numbers_in_order() {
        let mut profile = ProfileData::new();
        profile.register_performance_counter(counter(5, "BranchMispredictions"));
        profile.register_performance_counter(counter(2, "CacheMisses"));
        profile.register_performance_counter(counter(5, "Mispredicts"));

        let ids: Vec<i16> = profile.sorted_performance_counters().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 5]);
        assert_eq!(profile.get_performance_counter(5).unwrap().number, 0);
        assert_eq!(profile.get_performance_counter(5).unwrap().name, "Mispredicts");
        assert_eq!(profile.get_performance_counter(2).unwrap().number, 1);
        assert!(profile.get_performance_counter(3).is_none());
    }

    #[test]
    fn test_module_accounting() {
        let mut profile = ProfileData::new();
        profile.total_weight = Duration(10);
        profile.add_module_sample(ModuleId(2), Duration(3));
        profile.add_module_sample(ModuleId(1), Duration(7));
        profile.add_module_sample(ModuleId(2), Duration(1));
        profile.add_module_counter(ModuleId(1), 4, 1);

        assert_eq!(profile.sorted_module_weights(), vec![
            (ModuleId(1), Duration(7)),
            (ModuleId(2), Duration(4))
        ]);
        assert!((profile.scale_module_weight(Duration(5)) - 0.5).abs() < f64::EPSILON);
        assert_eq!(profile.module_counters(ModuleId(1)).unwrap().find_counter_value(4), 1);
        assert_eq!(profile.module_name(ModuleId(1)), "<unknown>");
    }
}

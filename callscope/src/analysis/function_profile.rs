//! Per-function aggregate: the "hot line / hot instruction" view.
//!
//! One [`FunctionProfileData`] per resolved function, filled from the same
//! sample walk that builds the call tree. Every map is a `BTreeMap` so a
//! persisted profile serializes the same way every time.

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{Duration, FunctionId};
use crate::symbolization::{DebugInfoProvider, FunctionDebugInfo};

// =============================================================================
// PERFORMANCE COUNTERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterValue {
    pub counter_id: i16,
    pub value: u64,
}

/// Counter values kept sorted by counter id, in step with the sorted list
/// of counter definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerformanceCounterSet {
    counters: Vec<CounterValue>,
}

impl PerformanceCounterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_counter_sample(&mut self, counter_id: i16, value: u64) {
        match self.counters.binary_search_by_key(&counter_id, |counter| counter.counter_id) {
            Ok(index) => self.counters[index].value += value,
            Err(index) => self.counters.insert(index, CounterValue { counter_id, value }),
        }
    }

    /// Value of `counter_id`, zero if never sampled.
    #[must_use]
    pub fn find_counter_value(&self, counter_id: i16) -> u64 {
        self.counters
            .binary_search_by_key(&counter_id, |counter| counter.counter_id)
            .map_or(0, |index| self.counters[index].value)
    }

    /// Add every value of `other` into this set.
    pub fn add(&mut self, other: &PerformanceCounterSet) {
        for counter in &other.counters {
            self.add_counter_sample(counter.counter_id, counter.value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CounterValue> {
        self.counters.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

// =============================================================================
// FUNCTION PROFILE
// =============================================================================

/// Aggregated samples of one function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionProfileData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    pub weight: Duration,
    pub exclusive_weight: Duration,
    /// Line number → weight.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_line_weight: BTreeMap<u32, Duration>,
    /// Offset from the function start → weight.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instruction_weight: BTreeMap<u64, Duration>,
    #[serde(default, with = "map_as_pairs", skip_serializing_if = "BTreeMap::is_empty")]
    pub callee_weights: BTreeMap<FunctionId, Duration>,
    #[serde(default, with = "map_as_pairs", skip_serializing_if = "BTreeMap::is_empty")]
    pub caller_weights: BTreeMap<FunctionId, Duration>,
    /// Offset from the function start → counters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instruction_counters: BTreeMap<u64, PerformanceCounterSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<Arc<FunctionDebugInfo>>,
}

impl FunctionProfileData {
    #[must_use]
    pub fn new(debug_info: Arc<FunctionDebugInfo>) -> Self {
        Self {
            source_file: debug_info.source_file.clone(),
            debug_info: Some(debug_info),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.debug_info.as_ref().map_or("<unknown>", |info| info.name.as_str())
    }

    pub fn add_instruction_sample(&mut self, offset: u64, weight: Duration) {
        *self.instruction_weight.entry(offset).or_default() += weight;
    }

    pub fn add_line_sample(&mut self, line: u32, weight: Duration) {
        *self.source_line_weight.entry(line).or_default() += weight;
    }

    pub fn add_child_sample(&mut self, callee: FunctionId, weight: Duration) {
        *self.callee_weights.entry(callee).or_default() += weight;
    }

    pub fn add_caller_sample(&mut self, caller: FunctionId, weight: Duration) {
        *self.caller_weights.entry(caller).or_default() += weight;
    }

    pub fn add_counter_sample(&mut self, offset: u64, counter_id: i16, value: u64) {
        self.instruction_counters.entry(offset).or_default().add_counter_sample(counter_id, value);
    }

    /// Counters of every instruction summed into one set.
    #[must_use]
    pub fn compute_function_counters(&self) -> PerformanceCounterSet {
        let mut total = PerformanceCounterSet::new();
        for counters in self.instruction_counters.values() {
            total.add(counters);
        }
        total
    }

    /// Fold instruction weights into source-line weights. Does nothing if
    /// lines were already computed or the function has no debug record.
    pub fn process_source_lines(&mut self, provider: &dyn DebugInfoProvider) {
        if self.has_source_lines() {
            return;
        }
        let Some(function_rva) = self.debug_info.as_ref().map(|info| info.rva) else {
            return;
        };

        let lines: Vec<(u32, Duration)> = self
            .instruction_weight
            .iter()
            .filter_map(|(offset, weight)| {
                provider
                    .find_source_line_by_rva(function_rva + offset)
                    .map(|line| (line.line, *weight))
            })
            .collect();

        for (line, weight) in lines {
            self.add_line_sample(line, weight);
        }
    }

    #[must_use]
    pub fn has_source_lines(&self) -> bool {
        !self.source_line_weight.is_empty()
    }

    #[must_use]
    pub fn has_callers(&self) -> bool {
        !self.caller_weights.is_empty()
    }

    #[must_use]
    pub fn has_callees(&self) -> bool {
        !self.callee_weights.is_empty()
    }

    #[must_use]
    pub fn has_performance_counters(&self) -> bool {
        !self.instruction_counters.is_empty()
    }

    /// `weight` as a fraction of this function's inclusive weight.
    #[must_use]
    pub fn scale_weight(&self, weight: Duration) -> f64 {
        if self.weight.is_zero() {
            0.0
        } else {
            weight.0 as f64 / self.weight.0 as f64
        }
    }

    /// Source lines, heaviest first.
    #[must_use]
    pub fn hottest_lines(&self) -> Vec<(u32, Duration)> {
        sorted_by_weight(&self.source_line_weight)
    }

    /// Instruction offsets, heaviest first.
    #[must_use]
    pub fn hottest_instructions(&self) -> Vec<(u64, Duration)> {
        sorted_by_weight(&self.instruction_weight)
    }
}

fn sorted_by_weight<K: Copy + Ord>(map: &BTreeMap<K, Duration>) -> Vec<(K, Duration)> {
    let mut entries: Vec<(K, Duration)> = map.iter().map(|(key, weight)| (*key, *weight)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    entries
}

/// JSON object keys must be strings: maps with structured keys are written
/// as `[[key, value], ...]` in key order.
pub(crate) mod map_as_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
